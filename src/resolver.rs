//! Per-field conflict resolution.
//!
//! Each transaction field carries one resolution strategy per sync
//! direction. A strategy is a total function from `(local, remote,
//! local_updated_at, remote_updated_at)` to an optional local mutation and
//! an optional remote mutation, plus a diagnostic. The resolver does no I/O
//! and is deterministic: identical inputs always produce identical outputs.

use chrono::{DateTime, Utc};

use crate::models::{Field, Transaction, Value, FIELD_ORDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Differences are unexpected; warn, never mutate.
    Immutable,
    /// Local is authoritative; differences write back to the remote.
    LocalWins,
    /// Remote is authoritative for system-set fields; overwrite local.
    RemoteOverwrite,
    /// Remote is authoritative by policy (same mechanism, distinct intent).
    RemoteWins,
    /// Union of both sides; whichever side is missing members is updated.
    MergeSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Pull,
    Push,
}

/// Strategy table. Category is the only direction-dependent field: pull
/// defers to the remote, push promotes the local correction.
pub fn strategy_for(field: Field, direction: Direction) -> Strategy {
    match field {
        Field::Date
        | Field::Amount
        | Field::Currency
        | Field::AccountId
        | Field::ClosingBalance => Strategy::Immutable,
        Field::Payee
        | Field::Narration
        | Field::IsTransfer
        | Field::PairedId
        | Field::SuspectReason
        | Field::Metadata => Strategy::LocalWins,
        Field::UpdatedAt => Strategy::RemoteOverwrite,
        Field::CategoryId => match direction {
            Direction::Pull => Strategy::RemoteWins,
            Direction::Push => Strategy::LocalWins,
        },
        Field::NeedsReview => Strategy::RemoteWins,
        Field::Labels => Strategy::MergeSet,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    None,
    AppliedLocal,
    AppliedRemote,
    Merged,
    ConflictWarning,
}

/// Outcome for a single field: what (if anything) each side should become.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutcome {
    pub field: Field,
    pub strategy: Strategy,
    pub diagnostic: Diagnostic,
    /// New value for the local side, when it must change.
    pub local_mutation: Option<Value>,
    /// New value for the remote side, when it must change (write-back).
    pub remote_mutation: Option<Value>,
    pub local_value: Value,
    pub remote_value: Value,
}

impl FieldOutcome {
    pub fn is_noop(&self) -> bool {
        self.local_mutation.is_none()
            && self.remote_mutation.is_none()
            && self.diagnostic == Diagnostic::None
    }
}

/// Resolution of a whole (local, remote) pair, outcomes in field
/// declaration order.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub txn_id: i64,
    pub outcomes: Vec<FieldOutcome>,
}

impl Resolution {
    pub fn local_mutations(&self) -> impl Iterator<Item = &FieldOutcome> {
        self.outcomes.iter().filter(|o| o.local_mutation.is_some())
    }

    pub fn remote_mutations(&self) -> impl Iterator<Item = &FieldOutcome> {
        self.outcomes.iter().filter(|o| o.remote_mutation.is_some())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &FieldOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.diagnostic == Diagnostic::ConflictWarning)
    }

    pub fn is_noop(&self) -> bool {
        self.outcomes.iter().all(FieldOutcome::is_noop)
    }
}

/// Resolve one field. `local_ts`/`remote_ts` are the respective
/// `updated_at` values; a missing timestamp counts as the earliest
/// representable instant, making the other side newer.
pub fn resolve_field(
    field: Field,
    direction: Direction,
    local: &Value,
    remote: &Value,
    local_ts: Option<DateTime<Utc>>,
    remote_ts: Option<DateTime<Utc>>,
) -> FieldOutcome {
    let strategy = strategy_for(field, direction);
    let mut outcome = FieldOutcome {
        field,
        strategy,
        diagnostic: Diagnostic::None,
        local_mutation: None,
        remote_mutation: None,
        local_value: local.clone(),
        remote_value: remote.clone(),
    };

    if local == remote {
        return outcome;
    }

    match strategy {
        Strategy::Immutable => {
            outcome.diagnostic = Diagnostic::ConflictWarning;
        }
        Strategy::LocalWins => {
            outcome.remote_mutation = Some(local.clone());
            outcome.diagnostic = Diagnostic::AppliedLocal;
        }
        Strategy::RemoteOverwrite => {
            if field == Field::UpdatedAt && !timestamp_advances(local_ts, remote_ts) {
                // Never move updated_at backwards.
                outcome.diagnostic = Diagnostic::ConflictWarning;
            } else {
                outcome.local_mutation = Some(remote.clone());
                outcome.diagnostic = Diagnostic::AppliedRemote;
            }
        }
        Strategy::RemoteWins => {
            outcome.local_mutation = Some(remote.clone());
            outcome.diagnostic = Diagnostic::AppliedRemote;
        }
        Strategy::MergeSet => {
            let (Value::Labels(local_set), Value::Labels(remote_set)) = (local, remote) else {
                outcome.diagnostic = Diagnostic::ConflictWarning;
                return outcome;
            };
            let union: std::collections::BTreeSet<String> =
                local_set.union(remote_set).cloned().collect();
            if union != *local_set {
                outcome.local_mutation = Some(Value::Labels(union.clone()));
            }
            if union != *remote_set {
                outcome.remote_mutation = Some(Value::Labels(union));
            }
            outcome.diagnostic = Diagnostic::Merged;
        }
    }

    outcome
}

fn timestamp_advances(local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> bool {
    match (local, remote) {
        // Missing local timestamp: remote is newer by definition.
        (None, _) => true,
        (Some(_), None) => false,
        (Some(l), Some(r)) => r > l,
    }
}

/// Resolve every field of a matched pair, in declaration order.
pub fn resolve_pair(
    local: &Transaction,
    remote: &Transaction,
    direction: Direction,
) -> Resolution {
    let outcomes = FIELD_ORDER
        .iter()
        .map(|&field| {
            resolve_field(
                field,
                direction,
                &local.get(field),
                &remote.get(field),
                local.updated_at,
                remote.updated_at,
            )
        })
        .collect();
    Resolution {
        txn_id: local.id,
        outcomes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::sample_txn;
    use rust_decimal::Decimal;
    use std::collections::BTreeSet;
    use std::str::FromStr;

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identical_pair_is_noop() {
        let txn = sample_txn(1);
        let resolution = resolve_pair(&txn, &txn, Direction::Pull);
        assert!(resolution.is_noop());
    }

    #[test]
    fn test_label_merge_pull() {
        // Local ["coffee"], remote ["coffee", "morning"]: local gains the
        // union, remote already holds it.
        let mut local = sample_txn(1);
        local.labels = labels(&["coffee"]);
        let mut remote = sample_txn(1);
        remote.labels = labels(&["coffee", "morning"]);

        let resolution = resolve_pair(&local, &remote, Direction::Pull);
        let outcome = resolution
            .outcomes
            .iter()
            .find(|o| o.field == Field::Labels)
            .unwrap();
        assert_eq!(
            outcome.local_mutation,
            Some(Value::Labels(labels(&["coffee", "morning"])))
        );
        assert_eq!(outcome.remote_mutation, None);
        assert_eq!(outcome.diagnostic, Diagnostic::Merged);
    }

    #[test]
    fn test_label_merge_updates_both_sides_when_each_is_missing_members() {
        let mut local = sample_txn(1);
        local.labels = labels(&["coffee", "local-only"]);
        let mut remote = sample_txn(1);
        remote.labels = labels(&["coffee", "remote-only"]);

        let resolution = resolve_pair(&local, &remote, Direction::Pull);
        let outcome = resolution
            .outcomes
            .iter()
            .find(|o| o.field == Field::Labels)
            .unwrap();
        let union = labels(&["coffee", "local-only", "remote-only"]);
        assert_eq!(outcome.local_mutation, Some(Value::Labels(union.clone())));
        assert_eq!(outcome.remote_mutation, Some(Value::Labels(union)));
    }

    #[test]
    fn test_immutable_amount_conflict_warns_without_mutation() {
        let mut local = sample_txn(1);
        local.amount = Decimal::from_str("-10.00").unwrap();
        let mut remote = sample_txn(1);
        remote.amount = Decimal::from_str("-10.50").unwrap();

        let resolution = resolve_pair(&local, &remote, Direction::Pull);
        let outcome = resolution
            .outcomes
            .iter()
            .find(|o| o.field == Field::Amount)
            .unwrap();
        assert_eq!(outcome.diagnostic, Diagnostic::ConflictWarning);
        assert!(outcome.local_mutation.is_none());
        assert!(outcome.remote_mutation.is_none());
    }

    #[test]
    fn test_narration_local_wins_writes_back() {
        let mut local = sample_txn(1);
        local.narration = "reviewed".to_string();
        let remote = sample_txn(1);

        let resolution = resolve_pair(&local, &remote, Direction::Pull);
        let outcome = resolution
            .outcomes
            .iter()
            .find(|o| o.field == Field::Narration)
            .unwrap();
        assert_eq!(
            outcome.remote_mutation,
            Some(Value::Text("reviewed".to_string()))
        );
        assert!(outcome.local_mutation.is_none());
    }

    #[test]
    fn test_category_direction_dependent() {
        // Local corrected the category; remote still has the old one.
        let mut local = sample_txn(1);
        local.category_id = Some(7);
        let mut remote = sample_txn(1);
        remote.category_id = Some(3);

        let pull = resolve_pair(&local, &remote, Direction::Pull);
        let outcome = pull
            .outcomes
            .iter()
            .find(|o| o.field == Field::CategoryId)
            .unwrap();
        assert_eq!(outcome.local_mutation, Some(Value::Int(3)));
        assert!(outcome.remote_mutation.is_none());

        let push = resolve_pair(&local, &remote, Direction::Push);
        let outcome = push
            .outcomes
            .iter()
            .find(|o| o.field == Field::CategoryId)
            .unwrap();
        assert_eq!(outcome.remote_mutation, Some(Value::Int(7)));
        assert!(outcome.local_mutation.is_none());
    }

    #[test]
    fn test_category_push_with_equal_timestamps_prefers_local() {
        // Equal updated_at falls through to the strategy default.
        let ts = DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut local = sample_txn(1);
        local.category_id = Some(7);
        local.updated_at = Some(ts);
        let mut remote = sample_txn(1);
        remote.category_id = Some(3);
        remote.updated_at = Some(ts);

        let push = resolve_pair(&local, &remote, Direction::Push);
        let outcome = push
            .outcomes
            .iter()
            .find(|o| o.field == Field::CategoryId)
            .unwrap();
        assert_eq!(outcome.remote_mutation, Some(Value::Int(7)));
    }

    #[test]
    fn test_updated_at_overwrites_forward_only() {
        let older = DateTime::parse_from_rfc3339("2024-01-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let newer = DateTime::parse_from_rfc3339("2024-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut local = sample_txn(1);
        local.updated_at = Some(older);
        let mut remote = sample_txn(1);
        remote.updated_at = Some(newer);

        let outcome = resolve_pair(&local, &remote, Direction::Pull)
            .outcomes
            .into_iter()
            .find(|o| o.field == Field::UpdatedAt)
            .unwrap();
        assert_eq!(outcome.local_mutation, Some(Value::Timestamp(newer)));

        // Reversed: remote older than local. Never move backwards.
        local.updated_at = Some(newer);
        remote.updated_at = Some(older);
        let outcome = resolve_pair(&local, &remote, Direction::Pull)
            .outcomes
            .into_iter()
            .find(|o| o.field == Field::UpdatedAt)
            .unwrap();
        assert!(outcome.local_mutation.is_none());
        assert_eq!(outcome.diagnostic, Diagnostic::ConflictWarning);
    }

    #[test]
    fn test_missing_local_timestamp_makes_remote_newer() {
        let ts = DateTime::parse_from_rfc3339("2024-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let local = sample_txn(1);
        let mut remote = sample_txn(1);
        remote.updated_at = Some(ts);

        let outcome = resolve_pair(&local, &remote, Direction::Pull)
            .outcomes
            .into_iter()
            .find(|o| o.field == Field::UpdatedAt)
            .unwrap();
        assert_eq!(outcome.local_mutation, Some(Value::Timestamp(ts)));
    }

    #[test]
    fn test_resolver_is_deterministic() {
        let mut local = sample_txn(1);
        local.labels = labels(&["coffee"]);
        local.narration = "mine".to_string();
        let mut remote = sample_txn(1);
        remote.labels = labels(&["morning"]);
        remote.category_id = Some(3);

        let first = resolve_pair(&local, &remote, Direction::Pull);
        let second = resolve_pair(&local, &remote, Direction::Pull);
        assert_eq!(first.outcomes, second.outcomes);
    }

    #[test]
    fn test_outcomes_follow_declaration_order() {
        let local = sample_txn(1);
        let remote = sample_txn(1);
        let resolution = resolve_pair(&local, &remote, Direction::Pull);
        let fields: Vec<Field> = resolution.outcomes.iter().map(|o| o.field).collect();
        assert_eq!(fields, FIELD_ORDER.to_vec());
    }

    #[test]
    fn test_needs_review_remote_wins() {
        let mut local = sample_txn(1);
        local.needs_review = true;
        let remote = sample_txn(1);

        let outcome = resolve_pair(&local, &remote, Direction::Pull)
            .outcomes
            .into_iter()
            .find(|o| o.field == Field::NeedsReview)
            .unwrap();
        assert_eq!(outcome.local_mutation, Some(Value::Bool(false)));
        assert!(outcome.remote_mutation.is_none());
    }
}
