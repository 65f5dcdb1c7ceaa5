//! Pair local and remote transactions by id and compute field-level diffs.

use std::collections::BTreeMap;

use crate::models::{Field, Transaction, Value, FIELD_ORDER};
use crate::resolver::{self, Direction, Resolution};

/// `updated_at` is server bookkeeping: it never makes two transactions
/// "differ" on its own and never shows up in diffs, though the resolver
/// still advances it when real content changes.
fn identity_field(field: Field) -> bool {
    field != Field::UpdatedAt
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairClass {
    OnlyLocal,
    OnlyRemote,
    Identical,
    Differs,
}

/// One id's comparison. `resolution` is present only for matched pairs.
#[derive(Debug, Clone)]
pub struct PairedTransaction {
    pub id: i64,
    pub class: PairClass,
    pub local: Option<Transaction>,
    pub remote: Option<Transaction>,
    pub resolution: Option<Resolution>,
}

/// A single differing field, for presentation.
#[derive(Debug, Clone)]
pub struct FieldDiff {
    pub txn_id: i64,
    pub field: crate::models::Field,
    pub local: Value,
    pub remote: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub identical: usize,
    pub differs: usize,
    pub only_local: usize,
    pub only_remote: usize,
}

#[derive(Debug, Clone)]
pub struct Comparison {
    /// Ascending id order.
    pub pairs: Vec<PairedTransaction>,
    pub summary: Summary,
}

impl Comparison {
    pub fn field_diffs(&self) -> Vec<FieldDiff> {
        let mut diffs = Vec::new();
        for pair in &self.pairs {
            let (Some(local), Some(remote)) = (&pair.local, &pair.remote) else {
                continue;
            };
            for &field in FIELD_ORDER.iter().filter(|&&f| identity_field(f)) {
                let local_value = local.get(field);
                let remote_value = remote.get(field);
                if local_value != remote_value {
                    diffs.push(FieldDiff {
                        txn_id: pair.id,
                        field,
                        local: local_value,
                        remote: remote_value,
                    });
                }
            }
        }
        diffs
    }

    pub fn differing_ids(&self) -> Vec<i64> {
        self.pairs
            .iter()
            .filter(|p| p.class == PairClass::Differs)
            .map(|p| p.id)
            .collect()
    }
}

/// Scope restriction for a comparison: an explicit id narrows both sides.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope {
    pub id: Option<i64>,
}

/// Pair by id, invoke the resolver on each match, classify every id.
/// Unknown ids on either side become only-local / only-remote entries.
pub fn compare(
    local: &[Transaction],
    remote: &[Transaction],
    direction: Direction,
    scope: Scope,
) -> Comparison {
    let in_scope = |id: i64| scope.id.map_or(true, |want| want == id);

    let local_by_id: BTreeMap<i64, &Transaction> = local
        .iter()
        .filter(|t| in_scope(t.id))
        .map(|t| (t.id, t))
        .collect();
    let remote_by_id: BTreeMap<i64, &Transaction> = remote
        .iter()
        .filter(|t| in_scope(t.id))
        .map(|t| (t.id, t))
        .collect();

    let mut ids: Vec<i64> = local_by_id.keys().chain(remote_by_id.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut pairs = Vec::with_capacity(ids.len());
    let mut summary = Summary::default();

    for id in ids {
        let pair = match (local_by_id.get(&id), remote_by_id.get(&id)) {
            (Some(l), Some(r)) => {
                let resolution = resolver::resolve_pair(l, r, direction);
                let identical = FIELD_ORDER
                    .iter()
                    .filter(|&&field| identity_field(field))
                    .all(|&field| l.get(field) == r.get(field));
                let class = if identical {
                    summary.identical += 1;
                    PairClass::Identical
                } else {
                    summary.differs += 1;
                    PairClass::Differs
                };
                PairedTransaction {
                    id,
                    class,
                    local: Some((*l).clone()),
                    remote: Some((*r).clone()),
                    resolution: Some(resolution),
                }
            }
            (Some(l), None) => {
                summary.only_local += 1;
                PairedTransaction {
                    id,
                    class: PairClass::OnlyLocal,
                    local: Some((*l).clone()),
                    remote: None,
                    resolution: None,
                }
            }
            (None, Some(r)) => {
                summary.only_remote += 1;
                PairedTransaction {
                    id,
                    class: PairClass::OnlyRemote,
                    local: None,
                    remote: Some((*r).clone()),
                    resolution: None,
                }
            }
            (None, None) => unreachable!("id came from one of the maps"),
        };
        pairs.push(pair);
    }

    Comparison { pairs, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::sample_txn;
    use crate::models::Field;

    #[test]
    fn test_classification() {
        let same = sample_txn(1);
        let mut changed_local = sample_txn(2);
        changed_local.narration = "edited".to_string();
        let changed_remote = sample_txn(2);
        let local_only = sample_txn(3);
        let remote_only = sample_txn(4);

        let comparison = compare(
            &[same.clone(), changed_local, local_only],
            &[same, changed_remote, remote_only],
            Direction::Pull,
            Scope::default(),
        );

        assert_eq!(comparison.summary.identical, 1);
        assert_eq!(comparison.summary.differs, 1);
        assert_eq!(comparison.summary.only_local, 1);
        assert_eq!(comparison.summary.only_remote, 1);
        assert_eq!(comparison.differing_ids(), vec![2]);
    }

    #[test]
    fn test_pairs_are_id_ordered() {
        let locals = vec![sample_txn(30), sample_txn(10)];
        let remotes = vec![sample_txn(20)];
        let comparison = compare(&locals, &remotes, Direction::Pull, Scope::default());
        let ids: Vec<i64> = comparison.pairs.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_scope_by_id() {
        let locals = vec![sample_txn(1), sample_txn(2)];
        let remotes = vec![sample_txn(1), sample_txn(2)];
        let comparison = compare(
            &locals,
            &remotes,
            Direction::Pull,
            Scope { id: Some(2) },
        );
        assert_eq!(comparison.pairs.len(), 1);
        assert_eq!(comparison.pairs[0].id, 2);
    }

    #[test]
    fn test_field_diffs_follow_declaration_order() {
        let mut local = sample_txn(1);
        local.narration = "edited".to_string();
        local.payee = "Other".to_string();
        let remote = sample_txn(1);

        let comparison = compare(&[local], &[remote], Direction::Pull, Scope::default());
        let diffs = comparison.field_diffs();
        let fields: Vec<Field> = diffs.iter().map(|d| d.field).collect();
        assert_eq!(fields, vec![Field::Payee, Field::Narration]);
    }

    #[test]
    fn test_updated_at_alone_does_not_differ() {
        let mut local = sample_txn(1);
        local.updated_at = None;
        let mut remote = sample_txn(1);
        remote.updated_at =
            chrono::DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
                .ok()
                .map(|t| t.with_timezone(&chrono::Utc));

        let comparison = compare(&[local], &[remote], Direction::Pull, Scope::default());
        assert_eq!(comparison.summary.identical, 1);
        assert_eq!(comparison.summary.differs, 0);
        assert!(comparison.field_diffs().is_empty());
    }

    #[test]
    fn test_matched_pairs_carry_resolution() {
        let mut local = sample_txn(1);
        local.narration = "edited".to_string();
        let remote = sample_txn(1);
        let comparison = compare(&[local], &[remote], Direction::Pull, Scope::default());
        let resolution = comparison.pairs[0].resolution.as_ref().unwrap();
        assert!(resolution.remote_mutations().count() > 0);
    }
}
