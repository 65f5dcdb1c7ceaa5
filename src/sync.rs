//! Reconciliation workflows: clone, pull, push, diff.
//!
//! Every workflow follows the same shape: fetch, compare, resolve, mutate,
//! log. Changelog entries are buffered and appended as one batch when the
//! workflow's mutations have succeeded, so the header always precedes its
//! records and the watermark only advances on success. An interrupted
//! workflow flushes its header only if at least one mutation completed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::changelog::{Changelog, Entry};
use crate::comparator::{self, Comparison, PairClass, Scope};
use crate::dates::DateWindow;
use crate::error::{FinchError, Result};
use crate::models::{Field, Transaction, Value};
use crate::remote::{render_note, RemoteClient, TransactionPatch};
use crate::resolver::{Diagnostic, Direction, Resolution};
use crate::store::{Archive, LedgerData};

/// Cooperative cancellation, honored at I/O boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub quiet: bool,
    pub verbose: bool,
    /// Ceiling for parallel PATCH dispatch during push.
    pub concurrency: usize,
}

impl SyncOptions {
    fn patch_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Fields whose UPDATE entries are logged. `updated_at` is system
/// bookkeeping: it is applied but never logged, so replaying the log stays
/// meaningful and a push followed by a pull is entry-free.
fn loggable(field: Field) -> bool {
    field != Field::UpdatedAt
}

fn display_value(field: Field, value: &Value, data: &LedgerData) -> String {
    match (field, value) {
        (Field::CategoryId, Value::Int(id)) => data
            .category(*id)
            .map(|c| c.ledger_name())
            .unwrap_or_else(|| id.to_string()),
        (Field::CategoryId, Value::Null) => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Pending work for one transaction: the resolved local copy, the entries
/// to log (split by which side's mutation they record, so a failed
/// write-back never drops the log of a store write that already landed),
/// and the write-back patch if the remote must change.
struct PlannedMutation {
    txn_id: i64,
    local_after: Option<Transaction>,
    patch: Option<TransactionPatch>,
    local_entries: Vec<Entry>,
    remote_entries: Vec<Entry>,
    warnings: Vec<String>,
}

impl PlannedMutation {
    fn all_entries(&self) -> Vec<Entry> {
        let mut out = self.local_entries.clone();
        out.extend(self.remote_entries.iter().cloned());
        out
    }
}

/// Apply a resolution to the local copy and derive the remote patch.
fn plan_mutation(
    local: &Transaction,
    resolution: &Resolution,
    data: &LedgerData,
    direction: Direction,
) -> PlannedMutation {
    let mut planned = PlannedMutation {
        txn_id: resolution.txn_id,
        local_after: None,
        patch: None,
        local_entries: Vec::new(),
        remote_entries: Vec::new(),
        warnings: Vec::new(),
    };

    let mut updated = local.clone();
    let mut local_changed = false;
    let mut note_changed = false;
    let mut patch = TransactionPatch::default();

    for outcome in &resolution.outcomes {
        if outcome.diagnostic == Diagnostic::ConflictWarning {
            planned.warnings.push(format!(
                "transaction {}: {} differs (local {} vs remote {}) and will not be changed",
                resolution.txn_id,
                outcome.field.name(),
                display_value(outcome.field, &outcome.local_value, data),
                display_value(outcome.field, &outcome.remote_value, data),
            ));
        }

        if let Some(new_value) = &outcome.local_mutation {
            // Pull applies local mutations; push leaves the archive alone.
            if direction == Direction::Pull {
                if loggable(outcome.field) {
                    planned.local_entries.push(Entry::Update {
                        txn_id: resolution.txn_id,
                        field: outcome.field.name().to_string(),
                        old: Some(display_value(outcome.field, &outcome.local_value, data)),
                        new: display_value(outcome.field, new_value, data),
                    });
                }
                updated.set(outcome.field, new_value.clone());
                local_changed = true;
            }
        }

        if let Some(new_value) = &outcome.remote_mutation {
            if loggable(outcome.field) {
                planned.remote_entries.push(Entry::Update {
                    txn_id: resolution.txn_id,
                    field: outcome.field.name().to_string(),
                    old: Some(display_value(outcome.field, &outcome.remote_value, data)),
                    new: display_value(outcome.field, new_value, data),
                });
            }
            match outcome.field {
                Field::Payee => {
                    patch.payee = Some(match new_value {
                        Value::Text(s) => s.clone(),
                        _ => String::new(),
                    });
                }
                Field::Labels => {
                    if let Value::Labels(set) = new_value {
                        patch.labels = Some(set.iter().cloned().collect());
                    }
                }
                Field::NeedsReview => {
                    if let Value::Bool(b) = new_value {
                        patch.needs_review = Some(*b);
                    }
                }
                Field::IsTransfer => {
                    if let Value::Bool(b) = new_value {
                        patch.is_transfer = Some(*b);
                    }
                }
                Field::CategoryId => {
                    patch.category_id = Some(match new_value {
                        Value::Int(id) => Some(*id),
                        _ => None,
                    });
                }
                Field::Narration
                | Field::PairedId
                | Field::SuspectReason
                | Field::Metadata => {
                    note_changed = true;
                }
                _ => {}
            }
        }
    }

    if note_changed {
        // The note carries narration plus the [key:value] annotations; any
        // of them changing rewrites the whole field. The local side already
        // holds the desired values under local-wins.
        patch.note = Some(render_note(&updated));
    }
    if local_changed {
        planned.local_after = Some(updated);
    }
    if !patch.is_empty() {
        planned.patch = Some(patch);
    }
    planned
}

fn print_intended(entries: &[Entry]) {
    for entry in entries {
        if let Entry::Update {
            txn_id,
            field,
            old,
            new,
        } = entry
        {
            match old {
                Some(old) => println!("UPDATE {txn_id} {field} {old} → {new}"),
                None => println!("UPDATE {txn_id} {field} {new}"),
            }
        }
    }
}

fn watermark_to_utc(ts: chrono::NaiveDateTime) -> chrono::NaiveDateTime {
    use chrono::{Local, TimeZone};
    Local
        .from_local_datetime(&ts)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
        .unwrap_or(ts)
}

fn check_cancel(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        Err(FinchError::Interrupted)
    } else {
        Ok(())
    }
}

/// Flush a workflow batch. Completed workflows always write their header;
/// interrupted or failed ones only when at least one mutation landed.
fn flush_log(
    changelog: &Changelog,
    header: Entry,
    entries: &[Entry],
    completed: bool,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        return Ok(());
    }
    if completed || !entries.is_empty() {
        changelog.append_batch(&header, entries)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CloneReport {
    pub accounts: usize,
    pub categories: usize,
    pub transactions: usize,
}

/// Materialize a fresh archive from the remote. Account opening dates are
/// the earlier of the service's opening date and the earliest observed
/// transaction for the account.
pub fn clone_archive(
    remote: &dyn RemoteClient,
    archive: &Archive,
    window: DateWindow,
    options: SyncOptions,
    cancel: &CancelFlag,
) -> Result<CloneReport> {
    check_cancel(cancel)?;
    let mut accounts = remote.get_accounts()?;
    check_cancel(cancel)?;
    let categories = remote.get_categories()?;
    check_cancel(cancel)?;
    let transactions = remote.get_transactions(&window, None)?;
    check_cancel(cancel)?;

    for account in &mut accounts {
        let earliest = transactions
            .iter()
            .filter(|t| t.account_id == account.id)
            .map(|t| t.date)
            .min();
        account.opening_date = match (account.opening_date, earliest) {
            (Some(service), Some(observed)) => Some(service.min(observed)),
            (None, observed) => observed,
            (service, None) => service,
        };
    }

    let mut data = LedgerData {
        accounts,
        categories,
        ..Default::default()
    };
    for txn in &transactions {
        data.commodities.insert(txn.currency.clone());
    }
    for account in &data.accounts {
        data.commodities.insert(account.currency.clone());
    }
    data.transactions = transactions;

    let report = CloneReport {
        accounts: data.accounts.len(),
        categories: data.categories.len(),
        transactions: data.transactions.len(),
    };

    if options.dry_run {
        println!(
            "clone would write {} transactions across {} accounts (dry run)",
            report.transactions, report.accounts
        );
        return Ok(report);
    }

    let _lock = archive.lock()?;
    archive.write_all(&data)?;
    Changelog::new(archive.changelog_path()).append_batch(&Entry::Clone { window }, &[])?;
    info!(transactions = report.transactions, "clone complete");
    Ok(report)
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PullReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub write_backs: usize,
    pub warnings: Vec<String>,
}

pub fn pull(
    remote: &dyn RemoteClient,
    archive: &Archive,
    explicit_window: Option<DateWindow>,
    id: Option<i64>,
    options: SyncOptions,
    cancel: &CancelFlag,
) -> Result<PullReport> {
    let _lock = archive.lock()?;
    let changelog = Changelog::new(archive.changelog_path());
    let Some(last_sync) = changelog.last_sync_info()? else {
        return Err(FinchError::Store(
            "no previous clone or pull found in changelog".to_string(),
        ));
    };

    // An explicit window refetches that range in full; otherwise the
    // watermark drives a delta fetch over the last window. Changelog
    // timestamps are local-zone; the wire wants UTC.
    let (window, updated_since) = match explicit_window {
        Some(window) => (window, None),
        None => (
            last_sync.window,
            Some(watermark_to_utc(last_sync.timestamp)),
        ),
    };

    check_cancel(cancel)?;
    let remote_txns = remote.get_transactions(&window, updated_since)?;
    let mut data = archive.read()?;
    let comparison = comparator::compare(
        &data.transactions,
        &remote_txns,
        Direction::Pull,
        Scope { id },
    );

    let mut report = PullReport {
        fetched: remote_txns.len(),
        ..Default::default()
    };
    let mut completed_entries: Vec<Entry> = Vec::new();
    let header = Entry::Pull {
        since: updated_since,
        window,
    };

    // Plan everything first; the execution loop below only does I/O.
    let mut planned: Vec<PlannedMutation> = Vec::new();
    let mut creations: Vec<Transaction> = Vec::new();
    for pair in &comparison.pairs {
        match pair.class {
            PairClass::OnlyRemote => {
                creations.push(pair.remote.clone().expect("only-remote has remote"));
            }
            PairClass::Differs => {
                let resolution = pair.resolution.as_ref().expect("matched pair resolves");
                let local = pair.local.as_ref().expect("matched pair has local");
                let plan = plan_mutation(local, resolution, &data, Direction::Pull);
                if plan.local_after.is_some() || plan.patch.is_some() || !plan.warnings.is_empty()
                {
                    planned.push(plan);
                }
            }
            _ => {}
        }
    }

    // Creations first, ascending id, then per-transaction mutations.
    creations.sort_by_key(|t| t.id);
    for txn in creations {
        if let Err(e) = check_cancel(cancel) {
            flush_log(&changelog, header.clone(), &completed_entries, false, options.dry_run)?;
            return Err(e);
        }
        let entry = Entry::Update {
            txn_id: txn.id,
            field: "transaction".to_string(),
            old: None,
            new: "created".to_string(),
        };
        if options.dry_run {
            print_intended(std::slice::from_ref(&entry));
        } else {
            archive.upsert_transactions(&mut data, std::slice::from_ref(&txn))?;
            completed_entries.push(entry);
        }
        report.created += 1;
    }

    for plan in planned {
        if let Err(e) = check_cancel(cancel) {
            flush_log(&changelog, header.clone(), &completed_entries, false, options.dry_run)?;
            return Err(e);
        }
        report.warnings.extend(plan.warnings.iter().cloned());
        for warning in &plan.warnings {
            warn!("{warning}");
        }

        if options.dry_run {
            print_intended(&plan.all_entries());
            if !plan.local_entries.is_empty() {
                report.updated += 1;
            }
            if plan.patch.is_some() {
                report.write_backs += 1;
            }
            continue;
        }

        if let Some(local_after) = &plan.local_after {
            archive.upsert_transactions(&mut data, std::slice::from_ref(local_after))?;
            // updated_at-only advances are bookkeeping, not updates.
            if !plan.local_entries.is_empty() {
                report.updated += 1;
            }
            completed_entries.extend(plan.local_entries.iter().cloned());
        }
        if let Some(patch) = &plan.patch {
            match remote.patch_transaction(plan.txn_id, patch) {
                Ok(()) => {
                    report.write_backs += 1;
                    completed_entries.extend(plan.remote_entries.iter().cloned());
                }
                Err(e) => {
                    flush_log(&changelog, header.clone(), &completed_entries, false, false)?;
                    return Err(e);
                }
            }
        }
    }

    flush_log(&changelog, header, &completed_entries, true, options.dry_run)?;
    info!(
        fetched = report.fetched,
        created = report.created,
        updated = report.updated,
        "pull complete"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PushReport {
    pub examined: usize,
    pub patched: usize,
    pub local_only: Vec<i64>,
    pub warnings: Vec<String>,
}

pub fn push(
    remote: &dyn RemoteClient,
    archive: &Archive,
    window: DateWindow,
    id: Option<i64>,
    options: SyncOptions,
    cancel: &CancelFlag,
) -> Result<PushReport> {
    let _lock = archive.lock()?;
    let changelog = Changelog::new(archive.changelog_path());
    if !changelog.exists() {
        return Err(FinchError::Store(
            "no changelog beside the archive; clone first".to_string(),
        ));
    }
    let data = archive.read()?;

    // Working set: an explicit id, or every local transaction in the window.
    let working: Vec<&Transaction> = data
        .transactions
        .iter()
        .filter(|t| id.map_or(true, |want| t.id == want))
        .filter(|t| window.contains(t.date))
        .collect();
    if let Some(want) = id {
        if working.is_empty() {
            return Err(FinchError::UserInput(format!(
                "transaction {want} not found in the archive"
            )));
        }
    }

    check_cancel(cancel)?;
    let remote_txns: Vec<Transaction> = match id {
        Some(want) => remote.get_transaction(want)?.into_iter().collect(),
        None => remote.get_transactions(&window, None)?,
    };

    let locals: Vec<Transaction> = working.into_iter().cloned().collect();
    let comparison = comparator::compare(&locals, &remote_txns, Direction::Push, Scope { id });

    let mut report = PushReport {
        examined: comparison.pairs.len(),
        ..Default::default()
    };
    let header = Entry::Push { window };

    // Plan patches in ascending id order.
    let mut planned: Vec<PlannedMutation> = Vec::new();
    for pair in &comparison.pairs {
        match pair.class {
            PairClass::OnlyLocal => {
                // Push never creates on the remote; surface the discrepancy.
                report.local_only.push(pair.id);
            }
            PairClass::Differs => {
                let resolution = pair.resolution.as_ref().expect("matched pair resolves");
                let local = pair.local.as_ref().expect("matched pair has local");
                let mut plan = plan_mutation(local, resolution, &data, Direction::Push);
                report.warnings.extend(plan.warnings.drain(..));
                if plan.patch.is_some() {
                    planned.push(plan);
                }
            }
            _ => {}
        }
    }
    for warning in &report.warnings {
        warn!("{warning}");
    }

    if options.dry_run {
        for plan in &planned {
            print_intended(&plan.remote_entries);
        }
        report.patched = planned.len();
        return Ok(report);
    }

    // Bounded-parallel PATCH dispatch in id-ordered waves; entries are
    // logged in id order once their wave has been acknowledged.
    let mut completed_entries: Vec<Entry> = Vec::new();
    let mut failure: Option<FinchError> = None;
    for wave in planned.chunks(options.patch_concurrency()) {
        if check_cancel(cancel).is_err() {
            failure = Some(FinchError::Interrupted);
            break;
        }
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .iter()
                .map(|plan| {
                    let patch = plan.patch.as_ref().expect("planned push has patch");
                    let txn_id = plan.txn_id;
                    scope.spawn(move || remote.patch_transaction(txn_id, patch))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| {
                    Err(FinchError::Remote("PATCH worker panicked".to_string()))
                }))
                .collect()
        });

        for (plan, result) in wave.iter().zip(results) {
            match result {
                Ok(()) => {
                    report.patched += 1;
                    completed_entries.extend(plan.remote_entries.iter().cloned());
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if failure.is_some() {
            break;
        }
    }

    match failure {
        Some(e) => {
            flush_log(&changelog, header, &completed_entries, false, false)?;
            Err(e)
        }
        None => {
            flush_log(&changelog, header, &completed_entries, true, false)?;
            info!(patched = report.patched, "push complete");
            Ok(report)
        }
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Read-only comparison; the resolver runs but every mutation is discarded.
pub fn diff(
    remote: &dyn RemoteClient,
    archive: &Archive,
    window: DateWindow,
    id: Option<i64>,
    cancel: &CancelFlag,
) -> Result<(Comparison, LedgerData)> {
    let _lock = archive.lock()?;
    let data = archive.read()?;
    check_cancel(cancel)?;
    let remote_txns: Vec<Transaction> = match id {
        Some(want) => remote.get_transaction(want)?.into_iter().collect(),
        None => remote.get_transactions(&window, None)?,
    };

    let locals: Vec<Transaction> = data
        .transactions
        .iter()
        .filter(|t| window.contains(t.date))
        .cloned()
        .collect();
    let comparison = comparator::compare(&locals, &remote_txns, Direction::Pull, Scope { id });
    Ok((comparison, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::sample_txn;
    use crate::models::{Account, AccountType, Category};
    use crate::notes;
    use crate::store::Archive;
    use chrono::{Duration, NaiveDate};
    use std::sync::Mutex;

    /// Scripted stand-in for the remote service. Patches are applied to the
    /// stored transactions the way the service would, including the
    /// server-side `updated_at` bump.
    struct FakeRemote {
        accounts: Vec<Account>,
        categories: Vec<Category>,
        transactions: Mutex<Vec<Transaction>>,
        patches: Mutex<Vec<(i64, TransactionPatch)>>,
    }

    impl FakeRemote {
        fn new(transactions: Vec<Transaction>) -> FakeRemote {
            FakeRemote {
                accounts: vec![Account {
                    id: 1,
                    display_name: "Checking".to_string(),
                    account_type: AccountType::Asset,
                    currency: "AUD".to_string(),
                    opening_date: NaiveDate::from_ymd_opt(2024, 1, 20),
                    opening_balance: None,
                }],
                categories: vec![
                    Category {
                        id: 3,
                        title: "Uncategorized".to_string(),
                        parent_id: None,
                    },
                    Category {
                        id: 7,
                        title: "Groceries".to_string(),
                        parent_id: None,
                    },
                ],
                transactions: Mutex::new(transactions),
                patches: Mutex::new(Vec::new()),
            }
        }

        fn patch_count(&self) -> usize {
            self.patches.lock().unwrap().len()
        }
    }

    impl RemoteClient for FakeRemote {
        fn get_accounts(&self) -> Result<Vec<Account>> {
            Ok(self.accounts.clone())
        }

        fn get_categories(&self) -> Result<Vec<Category>> {
            Ok(self.categories.clone())
        }

        fn get_transactions(
            &self,
            window: &DateWindow,
            updated_since: Option<chrono::NaiveDateTime>,
        ) -> Result<Vec<Transaction>> {
            let txns = self.transactions.lock().unwrap();
            Ok(txns
                .iter()
                .filter(|t| window.contains(t.date))
                .filter(|t| match updated_since {
                    None => true,
                    Some(since) => t
                        .updated_at
                        .map(|u| u.naive_utc() > since)
                        .unwrap_or(false),
                })
                .cloned()
                .collect())
        }

        fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
            Ok(self
                .transactions
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.id == id)
                .cloned())
        }

        fn patch_transaction(&self, id: i64, patch: &TransactionPatch) -> Result<()> {
            self.patches.lock().unwrap().push((id, patch.clone()));
            let mut txns = self.transactions.lock().unwrap();
            let Some(txn) = txns.iter_mut().find(|t| t.id == id) else {
                return Err(FinchError::Remote(format!("HTTP 404 for {id}")));
            };
            if let Some(payee) = &patch.payee {
                txn.payee = payee.clone();
            }
            if let Some(labels) = &patch.labels {
                txn.labels = labels.iter().cloned().collect();
            }
            if let Some(category) = patch.category_id {
                txn.category_id = category;
            }
            if let Some(needs_review) = patch.needs_review {
                txn.needs_review = needs_review;
            }
            if let Some(is_transfer) = patch.is_transfer {
                txn.is_transfer = is_transfer;
            }
            if let Some(note) = &patch.note {
                let parsed = notes::parse(note);
                txn.narration = parsed.text;
                let mut annotations = parsed.annotations;
                txn.paired_id = annotations.remove("paired").and_then(|v| v.parse().ok());
                txn.suspect_reason = annotations.remove("suspect_reason");
                txn.metadata = annotations;
            }
            // The service stamps writes.
            txn.updated_at = Some(
                txn.updated_at
                    .map_or(Utc::now(), |u| u.max(Utc::now()) + Duration::seconds(1)),
            );
            Ok(())
        }
    }

    fn remote_txn(id: i64) -> Transaction {
        let mut txn = sample_txn(id);
        txn.updated_at = Some(Utc::now() - Duration::days(1));
        txn
    }

    fn cloned_archive(remote: &FakeRemote, dir: &std::path::Path) -> Archive {
        let archive = Archive::create(&dir.join("books")).unwrap();
        clone_archive(
            remote,
            &archive,
            DateWindow::default(),
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        archive
    }

    fn log_operations(archive: &Archive) -> Vec<String> {
        Changelog::new(archive.changelog_path())
            .read_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.operation)
            .collect()
    }

    #[test]
    fn test_clone_writes_archive_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1), remote_txn(2)]);
        let archive = cloned_archive(&remote, dir.path());

        let data = archive.read().unwrap();
        assert_eq!(data.transactions.len(), 2);
        assert_eq!(log_operations(&archive), vec!["CLONE".to_string()]);
    }

    #[test]
    fn test_clone_derives_opening_date_from_earliest_transaction() {
        let dir = tempfile::tempdir().unwrap();
        // Earliest transaction (Jan 15) predates the service's opening date
        // (Jan 20), so the observed date wins.
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());
        let data = archive.read().unwrap();
        assert_eq!(
            data.accounts[0].opening_date,
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
    }

    #[test]
    fn test_pull_without_clone_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::create(&dir.path().join("books")).unwrap();
        archive.write_all(&LedgerData::default()).unwrap();
        let remote = FakeRemote::new(vec![]);
        let err = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FinchError::Store(_)));
    }

    #[test]
    fn test_pull_label_merge_updates_local_only() {
        // S1: local ["coffee"], remote ["coffee", "morning"]. One UPDATE
        // entry sets local labels to the union; no write-back (local is a
        // subset of remote).
        let dir = tempfile::tempdir().unwrap();
        let mut seed = remote_txn(1);
        seed.labels = ["coffee"].iter().map(|s| s.to_string()).collect();
        let remote = FakeRemote::new(vec![seed]);
        let archive = cloned_archive(&remote, dir.path());

        {
            let mut txns = remote.transactions.lock().unwrap();
            txns[0].labels.insert("morning".to_string());
            txns[0].updated_at = Some(Utc::now());
        }

        let report = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.write_backs, 0);
        assert_eq!(remote.patch_count(), 0);

        let data = archive.read().unwrap();
        assert!(data.transaction(1).unwrap().labels.contains("morning"));

        let entries = Changelog::new(archive.changelog_path()).read_entries().unwrap();
        let updates: Vec<_> = entries.iter().filter(|e| e.operation == "UPDATE").collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].details[1], "labels");
    }

    #[test]
    fn test_pull_immutable_conflict_warns_without_update() {
        // S2: amounts differ; a conflict warning surfaces and nothing is
        // written.
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());

        {
            let mut txns = remote.transactions.lock().unwrap();
            txns[0].amount = rust_decimal::Decimal::from_str_exact("-10.50").unwrap();
            txns[0].updated_at = Some(Utc::now());
        }

        let report = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("amount"));

        let data = archive.read().unwrap();
        assert_eq!(
            data.transaction(1).unwrap().amount,
            rust_decimal::Decimal::from_str_exact("-10.00").unwrap()
        );
        let ops = log_operations(&archive);
        assert_eq!(ops, vec!["CLONE".to_string(), "PULL".to_string()]);
    }

    #[test]
    fn test_pull_creates_only_remote_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());

        {
            let mut txns = remote.transactions.lock().unwrap();
            let mut new_txn = remote_txn(5);
            new_txn.updated_at = Some(Utc::now());
            txns.push(new_txn);
        }

        let report = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.created, 1);
        assert!(archive.read().unwrap().transaction(5).is_some());
    }

    #[test]
    fn test_pull_empty_delta_still_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());

        let report = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(
            log_operations(&archive),
            vec!["CLONE".to_string(), "PULL".to_string()]
        );
    }

    #[test]
    fn test_pull_local_narration_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());

        // Local edit, then a remote touch so the delta fetch sees the txn.
        let mut data = archive.read().unwrap();
        let mut txn = data.transaction(1).unwrap().clone();
        txn.narration = "my note".to_string();
        archive.upsert_transactions(&mut data, &[txn]).unwrap();
        {
            let mut txns = remote.transactions.lock().unwrap();
            txns[0].updated_at = Some(Utc::now());
        }

        let report = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.write_backs, 1);
        assert_eq!(remote.patch_count(), 1);
        assert_eq!(
            remote.transactions.lock().unwrap()[0].narration,
            "my note"
        );
    }

    #[test]
    fn test_push_category_local_wins_then_pull_is_noop() {
        // S6 + the push-then-pull law.
        let dir = tempfile::tempdir().unwrap();
        let mut seed = remote_txn(1);
        seed.category_id = Some(3); // Uncategorized
        let remote = FakeRemote::new(vec![seed]);
        let archive = cloned_archive(&remote, dir.path());

        let mut data = archive.read().unwrap();
        let mut txn = data.transaction(1).unwrap().clone();
        txn.category_id = Some(7); // Groceries
        archive.upsert_transactions(&mut data, &[txn]).unwrap();

        let report = push(
            &remote,
            &archive,
            DateWindow::default(),
            None,
            SyncOptions {
                concurrency: 4,
                ..Default::default()
            },
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.patched, 1);
        assert_eq!(remote.transactions.lock().unwrap()[0].category_id, Some(7));

        let entries = Changelog::new(archive.changelog_path()).read_entries().unwrap();
        let update = entries
            .iter()
            .find(|e| e.operation == "UPDATE")
            .expect("push logged its update");
        assert_eq!(update.details[1], "category_id");
        assert!(update.details.contains(&"Expenses:Groceries".to_string()));

        // Pull right after: no transaction-level changes, header only.
        let before_ops = log_operations(&archive).len();
        let report = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.created, 0);
        assert_eq!(report.write_backs, 0);
        let ops = log_operations(&archive);
        assert_eq!(ops.len(), before_ops + 1);
        assert_eq!(ops.last().map(String::as_str), Some("PULL"));
    }

    #[test]
    fn test_push_never_creates_remotely() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());

        let mut data = archive.read().unwrap();
        let mut local_only = sample_txn(99);
        local_only.date = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
        archive.upsert_transactions(&mut data, &[local_only]).unwrap();

        let report = push(
            &remote,
            &archive,
            DateWindow::default(),
            None,
            SyncOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.local_only, vec![99]);
        assert_eq!(remote.patch_count(), 0);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());

        {
            let mut txns = remote.transactions.lock().unwrap();
            txns[0].labels.insert("morning".to_string());
            txns[0].updated_at = Some(Utc::now());
        }
        let log_before = std::fs::read_to_string(archive.changelog_path()).unwrap();

        let report = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions {
                dry_run: true,
                ..Default::default()
            },
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(report.updated, 1); // intended, not performed

        let data = archive.read().unwrap();
        assert!(!data.transaction(1).unwrap().labels.contains("morning"));
        let log_after = std::fs::read_to_string(archive.changelog_path()).unwrap();
        assert_eq!(log_before, log_after);
        assert_eq!(remote.patch_count(), 0);
    }

    #[test]
    fn test_diff_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());
        {
            let mut txns = remote.transactions.lock().unwrap();
            txns[0].amount = rust_decimal::Decimal::from_str_exact("-10.50").unwrap();
        }

        let (comparison, _) = diff(
            &remote,
            &archive,
            DateWindow::default(),
            None,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(comparison.summary.differs, 1);
        assert_eq!(remote.patch_count(), 0);
        assert_eq!(log_operations(&archive), vec!["CLONE".to_string()]);
    }

    #[test]
    fn test_cancelled_pull_before_any_mutation_logs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(vec![remote_txn(1)]);
        let archive = cloned_archive(&remote, dir.path());

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = pull(
            &remote,
            &archive,
            None,
            None,
            SyncOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, FinchError::Interrupted));
        assert_eq!(log_operations(&archive), vec!["CLONE".to_string()]);
    }
}
