//! Transform application. Rule application is a local-only pass: it mutates
//! archive transactions and emits `APPLY` log entries, never the remote.
//! Re-running a rule set over an already-transformed archive is a no-op.

use std::collections::BTreeSet;

use chrono::Utc;

use crate::changelog::Entry;
use crate::dates::DateWindow;
use crate::models::Transaction;
use crate::rules::matcher::{self, CaptureMap};
use crate::rules::{Application, ApplyStatus, Rule, Transform};
use crate::store::LedgerData;

/// Result of applying a rule set over the archive.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Transactions that actually changed, ready for the store.
    pub changed: Vec<Transaction>,
    /// Every transform evaluation, including no-ops and invalid targets.
    pub applications: Vec<Application>,
    /// `APPLY` entries for the changelog (applied transforms only).
    pub log_entries: Vec<Entry>,
    pub matched: usize,
    pub unmatched: usize,
}

/// Resolve a category name from a rule. Accepts the archive title or a
/// colon path whose last segment is the title (`Expenses:Food:Coffee`).
fn resolve_category(data: &LedgerData, name: &str) -> Option<i64> {
    if let Some(category) = data.category_by_title(name) {
        return Some(category.id);
    }
    let last = name.rsplit(':').next()?;
    data.category_by_title(last).map(|c| c.id)
}

fn labels_display(labels: &BTreeSet<String>) -> String {
    let items: Vec<&str> = labels.iter().map(String::as_str).collect();
    format!("[{}]", items.join(", "))
}

fn apply_transform(
    txn: &mut Transaction,
    transform: &Transform,
    rule_id: i64,
    captures: &CaptureMap,
    data: &LedgerData,
) -> Application {
    let txn_id = txn.id;
    match transform {
        Transform::Category(name) => {
            let requested = matcher::substitute_groups(name, captures);
            let old_display = match txn.category_id.and_then(|id| data.category(id)) {
                Some(category) => category.title.clone(),
                None => "null".to_string(),
            };
            if requested.eq_ignore_ascii_case("uncategorized") {
                let status = if txn.category_id.is_none() {
                    ApplyStatus::Noop
                } else {
                    txn.category_id = None;
                    ApplyStatus::Applied
                };
                return Application {
                    rule_id,
                    txn_id,
                    field: "category_id",
                    old: old_display,
                    new: "null".to_string(),
                    status,
                    message: None,
                };
            }
            match resolve_category(data, &requested) {
                Some(category_id) => {
                    let status = if txn.category_id == Some(category_id) {
                        ApplyStatus::Noop
                    } else {
                        txn.category_id = Some(category_id);
                        ApplyStatus::Applied
                    };
                    Application {
                        rule_id,
                        txn_id,
                        field: "category_id",
                        old: old_display,
                        new: requested,
                        status,
                        message: None,
                    }
                }
                None => Application {
                    rule_id,
                    txn_id,
                    field: "category_id",
                    old: old_display,
                    new: requested.clone(),
                    status: ApplyStatus::Invalid,
                    message: Some(format!("unknown category '{requested}'")),
                },
            }
        }
        Transform::Labels(ops) => {
            let before = txn.labels.clone();
            for op in ops {
                match op {
                    crate::rules::LabelOp::Add(token) => {
                        txn.labels.insert(token.clone());
                    }
                    crate::rules::LabelOp::Remove(token) => {
                        txn.labels.remove(token);
                    }
                }
            }
            let status = if txn.labels == before {
                ApplyStatus::Noop
            } else {
                ApplyStatus::Applied
            };
            Application {
                rule_id,
                txn_id,
                field: "labels",
                old: labels_display(&before),
                new: labels_display(&txn.labels),
                status,
                message: None,
            }
        }
        Transform::Memo(text) => {
            let new_memo = matcher::substitute_groups(text, captures);
            let old = txn.narration.clone();
            if old == new_memo {
                return Application {
                    rule_id,
                    txn_id,
                    field: "narration",
                    old,
                    new: new_memo,
                    status: ApplyStatus::Noop,
                    message: None,
                };
            }
            let status = if old.is_empty() {
                ApplyStatus::Applied
            } else {
                ApplyStatus::Conflict
            };
            let message = (status == ApplyStatus::Conflict)
                .then(|| format!("overwriting existing narration '{old}'"));
            txn.narration = new_memo.clone();
            Application {
                rule_id,
                txn_id,
                field: "narration",
                old: if old.is_empty() { "null".to_string() } else { old },
                new: new_memo,
                status,
                message,
            }
        }
        Transform::Metadata(entries) => {
            let before = txn.metadata.clone();
            let mut conflicts = Vec::new();
            for (key, value) in entries {
                let rendered = matcher::substitute_groups(value, captures);
                if let Some(existing) = txn.metadata.get(key) {
                    if existing != &rendered {
                        conflicts.push(format!("{key}: {existing} → {rendered}"));
                    }
                }
                txn.metadata.insert(key.clone(), rendered);
            }
            let status = if txn.metadata == before {
                ApplyStatus::Noop
            } else if conflicts.is_empty() {
                ApplyStatus::Applied
            } else {
                ApplyStatus::Conflict
            };
            Application {
                rule_id,
                txn_id,
                field: "metadata",
                old: crate::models::Value::Map(before).to_string(),
                new: crate::models::Value::Map(txn.metadata.clone()).to_string(),
                status,
                message: (!conflicts.is_empty()).then(|| conflicts.join("; ")),
            }
        }
    }
}

/// Apply the first matching rule's transforms to one transaction.
/// A transform with an unresolvable target is reported invalid; the
/// remaining transforms still apply.
pub fn apply_to_transaction(
    rules: &[Rule],
    txn: &Transaction,
    data: &LedgerData,
) -> Option<(Transaction, Vec<Application>)> {
    let (rule, captures) = matcher::find_matching_rule(rules, txn, data)?;
    let mut updated = txn.clone();
    let applications = rule
        .transforms
        .iter()
        .map(|transform| apply_transform(&mut updated, transform, rule.id, &captures, data))
        .collect();
    Some((updated, applications))
}

/// Run the rule set over every archive transaction in scope.
pub fn run_apply(
    rules: &[Rule],
    data: &LedgerData,
    window: &DateWindow,
    id: Option<i64>,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    for txn in &data.transactions {
        if let Some(want) = id {
            if txn.id != want {
                continue;
            }
        }
        if !window.contains(txn.date) {
            continue;
        }

        let Some((mut updated, applications)) = apply_to_transaction(rules, txn, data) else {
            outcome.unmatched += 1;
            continue;
        };
        outcome.matched += 1;

        let mutated = applications
            .iter()
            .any(|a| matches!(a.status, ApplyStatus::Applied | ApplyStatus::Conflict));

        for application in &applications {
            if matches!(
                application.status,
                ApplyStatus::Applied | ApplyStatus::Conflict
            ) {
                outcome.log_entries.push(Entry::Apply {
                    txn_id: application.txn_id,
                    rule_id: application.rule_id,
                    field: application.field.to_string(),
                    old: application.old.clone(),
                    new: application.new.clone(),
                });
            }
        }
        outcome.applications.extend(applications);

        if mutated {
            // Rule application is a local write; advance the clock, never
            // backwards.
            let now = Utc::now();
            updated.updated_at = Some(updated.updated_at.map_or(now, |prev| prev.max(now)));
            outcome.changed.push(updated);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::sample_txn;
    use crate::models::{Account, AccountType, Category};
    use crate::rules::{LabelOp, Precondition};
    use regex::RegexBuilder;

    fn ci(pattern: &str) -> regex::Regex {
        RegexBuilder::new(pattern).case_insensitive(true).build().unwrap()
    }

    fn coffee_rule() -> Rule {
        Rule {
            id: 1,
            precondition: Precondition {
                merchant: Some(ci("^starbucks")),
                ..Default::default()
            },
            transforms: vec![Transform::Category("Expenses:Food:Coffee".to_string())],
            disabled: false,
            source: std::path::PathBuf::from("rules.yaml"),
        }
    }

    fn data() -> LedgerData {
        let mut data = LedgerData::default();
        data.accounts.push(Account {
            id: 1,
            display_name: "Checking".to_string(),
            account_type: AccountType::Asset,
            currency: "AUD".to_string(),
            opening_date: None,
            opening_balance: None,
        });
        data.categories.push(Category {
            id: 3,
            title: "Coffee".to_string(),
            parent_id: None,
        });
        let txn = sample_txn(55); // payee "Starbucks #42", category null
        data.transactions.push(txn);
        data
    }

    #[test]
    fn test_apply_sets_category_and_logs() {
        let data = data();
        let outcome = run_apply(&[coffee_rule()], &data, &DateWindow::default(), None);
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.changed.len(), 1);
        assert_eq!(outcome.changed[0].category_id, Some(3));
        assert_eq!(outcome.log_entries.len(), 1);
        match &outcome.log_entries[0] {
            Entry::Apply {
                txn_id,
                rule_id,
                field,
                old,
                new,
            } => {
                assert_eq!(*txn_id, 55);
                assert_eq!(*rule_id, 1);
                assert_eq!(field, "category_id");
                assert_eq!(old, "null");
                assert_eq!(new, "Expenses:Food:Coffee");
            }
            other => panic!("expected Apply entry, got {other:?}"),
        }
    }

    #[test]
    fn test_second_apply_is_noop() {
        let mut data = data();
        let first = run_apply(&[coffee_rule()], &data, &DateWindow::default(), None);
        assert_eq!(first.changed.len(), 1);
        data.transactions[0] = first.changed[0].clone();

        let second = run_apply(&[coffee_rule()], &data, &DateWindow::default(), None);
        assert!(second.changed.is_empty());
        assert!(second.log_entries.is_empty());
        assert!(second
            .applications
            .iter()
            .all(|a| a.status == ApplyStatus::Noop));
    }

    #[test]
    fn test_unknown_category_invalid_but_other_transforms_apply() {
        let mut rule = coffee_rule();
        rule.transforms = vec![
            Transform::Category("Nonexistent".to_string()),
            Transform::Labels(vec![LabelOp::Add("coffee".to_string())]),
        ];
        let data = data();
        let outcome = run_apply(&[rule], &data, &DateWindow::default(), None);

        assert_eq!(outcome.applications.len(), 2);
        assert_eq!(outcome.applications[0].status, ApplyStatus::Invalid);
        assert_eq!(outcome.applications[1].status, ApplyStatus::Applied);
        // The invalid transform is not logged; the label one is.
        assert_eq!(outcome.log_entries.len(), 1);
        assert_eq!(outcome.changed.len(), 1);
        assert!(outcome.changed[0].labels.contains("coffee"));
        assert!(outcome.changed[0].category_id.is_none());
    }

    #[test]
    fn test_label_ops_add_and_remove() {
        let mut rule = coffee_rule();
        rule.transforms = vec![Transform::Labels(vec![
            LabelOp::Add("coffee".to_string()),
            LabelOp::Remove("uncategorized".to_string()),
        ])];
        let mut data = data();
        data.transactions[0]
            .labels
            .insert("uncategorized".to_string());

        let outcome = run_apply(&[rule], &data, &DateWindow::default(), None);
        let labels = &outcome.changed[0].labels;
        assert!(labels.contains("coffee"));
        assert!(!labels.contains("uncategorized"));
    }

    #[test]
    fn test_memo_conflict_warns_but_sets() {
        let mut rule = coffee_rule();
        rule.transforms = vec![Transform::Memo("standard note".to_string())];
        let mut data = data();
        data.transactions[0].narration = "hand-written".to_string();

        let outcome = run_apply(&[rule], &data, &DateWindow::default(), None);
        assert_eq!(outcome.applications[0].status, ApplyStatus::Conflict);
        assert!(outcome.applications[0].message.is_some());
        assert_eq!(outcome.changed[0].narration, "standard note");
    }

    #[test]
    fn test_metadata_transform_merges() {
        let mut rule = coffee_rule();
        rule.transforms = vec![Transform::Metadata(
            [("vendor_type".to_string(), "coffee_shop".to_string())]
                .into_iter()
                .collect(),
        )];
        let data = data();
        let outcome = run_apply(&[rule], &data, &DateWindow::default(), None);
        assert_eq!(
            outcome.changed[0].metadata.get("vendor_type").map(String::as_str),
            Some("coffee_shop")
        );
    }

    #[test]
    fn test_capture_substitution_in_memo() {
        let mut rule = coffee_rule();
        rule.precondition.merchant = Some(ci(r"^starbucks #(\d+)"));
        rule.transforms = vec![Transform::Memo("store {merchant.1}".to_string())];
        let data = data();
        let outcome = run_apply(&[rule], &data, &DateWindow::default(), None);
        assert_eq!(outcome.changed[0].narration, "store 42");
    }

    #[test]
    fn test_window_and_id_scope() {
        let data = data();
        let outside = DateWindow {
            from: chrono::NaiveDate::from_ymd_opt(2025, 1, 1),
            to: None,
        };
        let outcome = run_apply(&[coffee_rule()], &data, &outside, None);
        assert_eq!(outcome.matched, 0);

        let outcome = run_apply(&[coffee_rule()], &data, &DateWindow::default(), Some(999));
        assert_eq!(outcome.matched, 0);
        assert_eq!(outcome.unmatched, 0);
    }

    #[test]
    fn test_updated_at_advances_on_mutation() {
        let data = data();
        let before = data.transactions[0].updated_at;
        let outcome = run_apply(&[coffee_rule()], &data, &DateWindow::default(), None);
        let after = outcome.changed[0].updated_at;
        assert!(after.is_some());
        assert!(before.is_none() || after >= before);
    }
}
