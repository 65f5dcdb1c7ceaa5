//! Apply detection results to the archive. Confirmed pairs get
//! `is_transfer`, symmetric `paired_id` links, and the transfer category;
//! suspected pairs get only the link and the suspect reason. Pair links are
//! written to both sides in one pass so the symmetry invariant holds on
//! re-read.

use chrono::Utc;

use crate::changelog::Entry;
use crate::models::{Field, Transaction, Value};
use crate::store::LedgerData;
use crate::transfers::{DetectionResult, TransferPair};

#[derive(Debug, Default)]
pub struct ApplyResult {
    pub changed: Vec<Transaction>,
    pub log_entries: Vec<Entry>,
    pub confirmed_marked: usize,
    pub suspected_marked: usize,
}

pub struct Applier {
    transfer_category_id: i64,
}

impl Applier {
    /// `transfer_category_id` is resolved by the caller before detection
    /// starts (by title, normally "Transfer").
    pub fn new(transfer_category_id: i64) -> Applier {
        Applier {
            transfer_category_id,
        }
    }

    pub fn apply(&self, result: &DetectionResult, data: &LedgerData) -> ApplyResult {
        let mut out = ApplyResult::default();

        for pair in &result.confirmed {
            let marked = self.mark_pair(pair, data, true, &mut out);
            if marked {
                out.confirmed_marked += 1;
            }
        }
        for pair in &result.suspected {
            let marked = self.mark_pair(pair, data, false, &mut out);
            if marked {
                out.suspected_marked += 1;
            }
        }
        out
    }

    fn mark_pair(
        &self,
        pair: &TransferPair,
        data: &LedgerData,
        confirmed: bool,
        out: &mut ApplyResult,
    ) -> bool {
        let (Some(source), Some(dest)) = (
            data.transaction(pair.source_id),
            data.transaction(pair.dest_id),
        ) else {
            return false;
        };

        let mut any = false;
        for (txn, other_id) in [(source, pair.dest_id), (dest, pair.source_id)] {
            let mut updated = txn.clone();
            if confirmed {
                updated.is_transfer = true;
                updated.paired_id = Some(other_id);
                updated.suspect_reason = None;
                updated.category_id = Some(self.transfer_category_id);
            } else {
                updated.paired_id = Some(other_id);
                updated.suspect_reason = pair.reason.clone();
            }

            if updated == *txn {
                continue;
            }
            any = true;
            self.log_changes(txn, &updated, data, &mut out.log_entries);
            let now = Utc::now();
            updated.updated_at = Some(updated.updated_at.map_or(now, |prev| prev.max(now)));
            out.changed.push(updated);
        }
        any
    }

    /// One UPDATE entry per field actually changed, in declaration order.
    fn log_changes(
        &self,
        before: &Transaction,
        after: &Transaction,
        data: &LedgerData,
        entries: &mut Vec<Entry>,
    ) {
        for field in [
            Field::CategoryId,
            Field::IsTransfer,
            Field::PairedId,
            Field::SuspectReason,
        ] {
            let old = before.get(field);
            let new = after.get(field);
            if old == new {
                continue;
            }
            // Categories read better by name than by id.
            let (old_str, new_str) = if field == Field::CategoryId {
                (
                    display_category(&old, data),
                    display_category(&new, data),
                )
            } else {
                (old.to_string(), new.to_string())
            };
            entries.push(Entry::Update {
                txn_id: before.id,
                field: field.name().to_string(),
                old: Some(old_str),
                new: new_str,
            });
        }
    }
}

fn display_category(value: &Value, data: &LedgerData) -> String {
    match value {
        Value::Int(id) => data
            .category(*id)
            .map(|c| c.ledger_name())
            .unwrap_or_else(|| id.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::sample_txn;
    use crate::models::{Account, AccountType, Category};
    use crate::transfers::detector::Detector;
    use crate::transfers::DetectionCriteria;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::str::FromStr;

    fn data_with_pair() -> LedgerData {
        let mut data = LedgerData::default();
        for (id, name) in [(1, "Checking"), (2, "Savings")] {
            data.accounts.push(Account {
                id,
                display_name: name.to_string(),
                account_type: AccountType::Asset,
                currency: "AUD".to_string(),
                opening_date: None,
                opening_balance: None,
            });
        }
        data.categories.push(Category {
            id: 9,
            title: "Transfer".to_string(),
            parent_id: None,
        });

        let mut a = sample_txn(1001);
        a.account_id = 1;
        a.amount = Decimal::from_str("-500.00").unwrap();
        a.date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        a.category_id = Some(3);
        let mut b = sample_txn(1002);
        b.account_id = 2;
        b.amount = Decimal::from_str("500.00").unwrap();
        b.date = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
        data.transactions.push(a);
        data.transactions.push(b);
        data
    }

    fn account_names(data: &LedgerData) -> HashMap<i64, String> {
        data.accounts
            .iter()
            .map(|a| (a.id, a.display_name.clone()))
            .collect()
    }

    #[test]
    fn test_confirmed_pair_cross_linked_and_categorized() {
        let data = data_with_pair();
        let criteria = DetectionCriteria::default();
        let detection = Detector::new(&criteria, account_names(&data)).detect(&data.transactions);
        assert_eq!(detection.confirmed.len(), 1);

        let result = Applier::new(9).apply(&detection, &data);
        assert_eq!(result.confirmed_marked, 1);
        assert_eq!(result.changed.len(), 2);

        let source = result.changed.iter().find(|t| t.id == 1001).unwrap();
        let dest = result.changed.iter().find(|t| t.id == 1002).unwrap();
        assert!(source.is_transfer && dest.is_transfer);
        assert_eq!(source.paired_id, Some(1002));
        assert_eq!(dest.paired_id, Some(1001));
        assert_eq!(source.category_id, Some(9));
        assert_eq!(dest.category_id, Some(9));
        assert!(source.suspect_reason.is_none());
        assert!(!result.log_entries.is_empty());
    }

    #[test]
    fn test_rerun_after_apply_is_noop() {
        let mut data = data_with_pair();
        let criteria = DetectionCriteria::default();
        let detection =
            Detector::new(&criteria, account_names(&data)).detect(&data.transactions);
        let result = Applier::new(9).apply(&detection, &data);
        for changed in result.changed {
            let slot = data
                .transactions
                .iter_mut()
                .find(|t| t.id == changed.id)
                .unwrap();
            *slot = changed;
        }

        let second = Detector::new(&criteria, account_names(&data)).detect(&data.transactions);
        assert_eq!(second.total_pairs(), 0);
        let second_apply = Applier::new(9).apply(&second, &data);
        assert!(second_apply.changed.is_empty());
        assert!(second_apply.log_entries.is_empty());
    }

    #[test]
    fn test_suspected_pair_keeps_category_and_flag() {
        let mut data = data_with_pair();
        // Push the dates 3 days apart so the pair is suspected only.
        data.transactions[1].date = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        let criteria = DetectionCriteria::default();
        let detection =
            Detector::new(&criteria, account_names(&data)).detect(&data.transactions);
        assert_eq!(detection.suspected.len(), 1);

        let result = Applier::new(9).apply(&detection, &data);
        assert_eq!(result.suspected_marked, 1);
        let source = result.changed.iter().find(|t| t.id == 1001).unwrap();
        assert!(!source.is_transfer);
        assert_eq!(source.category_id, Some(3)); // untouched
        assert_eq!(source.suspect_reason.as_deref(), Some("date-delay-3d"));
        assert_eq!(source.paired_id, Some(1002));
    }

    #[test]
    fn test_log_entries_reference_category_by_name() {
        let data = data_with_pair();
        let criteria = DetectionCriteria::default();
        let detection =
            Detector::new(&criteria, account_names(&data)).detect(&data.transactions);
        let result = Applier::new(9).apply(&detection, &data);
        let category_entry = result
            .log_entries
            .iter()
            .find_map(|e| match e {
                Entry::Update { field, new, .. } if field == "category_id" => Some(new.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(category_entry, "Expenses:Transfer");
    }
}
