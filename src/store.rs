//! The local archive: a plain-text double-entry ledger the store exclusively
//! owns. Two layouts are supported:
//!
//! - hierarchical: `main.ledger` (accounts, categories, commodities, opening
//!   balances, includes) plus one transaction file per calendar month under
//!   `YYYY/YYYY-MM.ledger`, with a sibling `main.log` changelog;
//! - single-file: everything in `<name>.ledger` with `<name>.log` beside it.
//!
//! Transactions render as a header line, indented metadata, and two
//! postings:
//!
//! ```text
//! 2024-01-15 ! "Starbucks #42" "morning coffee" #coffee
//!     id: 1001
//!     account: 5
//!     category: 3
//!     updated: 2024-01-15T10:00:00+00:00
//!   Assets:BofA-Checking   -10.00 AUD
//!   Expenses:Coffee         10.00 AUD
//! ```
//!
//! The posting flag is `!` when the transaction needs review. Account and
//! category references are carried in metadata so renames never break
//! identity; postings are regenerated on write.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::{FinchError, Result};
use crate::fmt::plain_amount;
use crate::models::{
    Account, AccountType, BalanceAssertion, Category, Transaction,
};

pub const PRIMARY_NAME: &str = "main.ledger";
pub const LEDGER_EXT: &str = "ledger";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    SingleFile,
    Hierarchical,
}

/// Everything the archive knows, in memory. Returned transactions are
/// values; callers mutate copies and hand them back through `upsert`.
#[derive(Debug, Clone, Default)]
pub struct LedgerData {
    pub accounts: Vec<Account>,
    pub categories: Vec<Category>,
    pub commodities: BTreeSet<String>,
    pub balances: Vec<BalanceAssertion>,
    pub transactions: Vec<Transaction>,
}

impl LedgerData {
    pub fn account(&self, id: i64) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn category(&self, id: i64) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// Case-insensitive title lookup; the rule engine and transfer applier
    /// resolve category names through this.
    pub fn category_by_title(&self, title: &str) -> Option<&Category> {
        let want = title.to_lowercase();
        self.categories.iter().find(|c| c.title.to_lowercase() == want)
    }

    pub fn transaction(&self, id: i64) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.id == id)
    }

    /// Rendered name for a category id; used in postings and log entries.
    pub fn category_display(&self, id: Option<i64>) -> String {
        match id.and_then(|i| self.category(i)) {
            Some(category) => category.ledger_name(),
            None => "Expenses:Uncategorized".to_string(),
        }
    }

    /// Reject parent cycles; categories must form a forest.
    fn validate_category_forest(&self) -> Result<()> {
        for category in &self.categories {
            let mut seen = BTreeSet::new();
            let mut current = category.parent_id;
            seen.insert(category.id);
            while let Some(parent) = current {
                if !seen.insert(parent) {
                    return Err(FinchError::Store(format!(
                        "category cycle involving id {}",
                        category.id
                    )));
                }
                current = self.category(parent).and_then(|c| c.parent_id);
            }
        }
        Ok(())
    }
}

pub struct Archive {
    layout: Layout,
    /// The primary ledger file (single file, or `main.ledger`).
    primary: PathBuf,
}

impl Archive {
    /// Open an existing archive. A directory must contain `main.ledger`; a
    /// file is taken as a single-file archive.
    pub fn open(path: &Path) -> Result<Archive> {
        if path.is_dir() {
            let primary = path.join(PRIMARY_NAME);
            if !primary.exists() {
                return Err(FinchError::Store(format!(
                    "no {PRIMARY_NAME} in {}",
                    path.display()
                )));
            }
            Ok(Archive {
                layout: Layout::Hierarchical,
                primary,
            })
        } else if path.is_file() {
            Ok(Archive {
                layout: Layout::SingleFile,
                primary: path.to_path_buf(),
            })
        } else {
            Err(FinchError::Store(format!(
                "archive not found: {}",
                path.display()
            )))
        }
    }

    /// Create a fresh archive for clone. A `.ledger` path means single-file;
    /// anything else becomes a hierarchical directory.
    pub fn create(path: &Path) -> Result<Archive> {
        let single = path.extension().is_some_and(|e| e == LEDGER_EXT);
        if single {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Archive {
                layout: Layout::SingleFile,
                primary: path.to_path_buf(),
            })
        } else {
            std::fs::create_dir_all(path)?;
            Ok(Archive {
                layout: Layout::Hierarchical,
                primary: path.join(PRIMARY_NAME),
            })
        }
    }

    /// Locate an archive under `start`: `main.ledger` first, then any
    /// `*.ledger` file with a sibling `.log`.
    pub fn auto_detect(start: &Path) -> Result<Archive> {
        if start.join(PRIMARY_NAME).exists() {
            return Archive::open(start);
        }
        if start.is_dir() {
            let mut candidates: Vec<PathBuf> = std::fs::read_dir(start)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.extension().is_some_and(|e| e == LEDGER_EXT)
                        && p.with_extension("log").exists()
                })
                .collect();
            candidates.sort();
            if let Some(first) = candidates.into_iter().next() {
                return Archive::open(&first);
            }
        }
        Err(FinchError::UserInput(format!(
            "no archive found under {} (expected {PRIMARY_NAME} or a .ledger file with a sibling .log)",
            start.display()
        )))
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn root(&self) -> &Path {
        self.primary.parent().unwrap_or(Path::new("."))
    }

    pub fn changelog_path(&self) -> PathBuf {
        match self.layout {
            Layout::SingleFile => self.primary.with_extension("log"),
            Layout::Hierarchical => self.root().join("main.log"),
        }
    }

    /// Acquire the single-writer lock for the duration of a workflow.
    pub fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(self.primary.with_extension("lock"))
    }

    fn month_path(&self, date: NaiveDate) -> PathBuf {
        self.root()
            .join(format!("{}", date.year()))
            .join(format!("{}-{:02}.{LEDGER_EXT}", date.year(), date.month()))
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    pub fn read(&self) -> Result<LedgerData> {
        let mut data = LedgerData::default();
        let primary_text = std::fs::read_to_string(&self.primary)
            .map_err(|e| FinchError::Store(format!("{}: {e}", self.primary.display())))?;

        let mut includes = Vec::new();
        parse_primary(&primary_text, &mut data, &mut includes)
            .map_err(|e| FinchError::Store(format!("{}: {e}", self.primary.display())))?;

        if self.layout == Layout::SingleFile {
            parse_transactions(&primary_text, &mut data.transactions)
                .map_err(|e| FinchError::Store(format!("{}: {e}", self.primary.display())))?;
        } else {
            for include in includes {
                let path = self.root().join(&include);
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| FinchError::Store(format!("{}: {e}", path.display())))?;
                parse_transactions(&text, &mut data.transactions)
                    .map_err(|e| FinchError::Store(format!("{}: {e}", path.display())))?;
            }
        }

        data.validate_category_forest()?;
        data.transactions.sort_by_key(|t| (t.date, t.id));
        debug!(
            accounts = data.accounts.len(),
            transactions = data.transactions.len(),
            "archive read"
        );
        Ok(data)
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Materialize the full archive (clone, or any wholesale rewrite).
    pub fn write_all(&self, data: &LedgerData) -> Result<()> {
        data.validate_category_forest()?;
        let mut txns = data.transactions.clone();
        txns.sort_by_key(|t| (t.date, t.id));

        match self.layout {
            Layout::SingleFile => {
                let mut out = render_primary(data, &[]);
                out.push('\n');
                for txn in &txns {
                    out.push_str(&render_transaction(txn, data));
                    out.push('\n');
                }
                std::fs::write(&self.primary, out)?;
            }
            Layout::Hierarchical => {
                let mut by_month: BTreeMap<(i32, u32), Vec<&Transaction>> = BTreeMap::new();
                for txn in &txns {
                    by_month
                        .entry((txn.date.year(), txn.date.month()))
                        .or_default()
                        .push(txn);
                }
                let mut includes = Vec::new();
                for ((year, month), group) in &by_month {
                    let rel = format!("{year}/{year}-{month:02}.{LEDGER_EXT}");
                    let path = self.root().join(&rel);
                    std::fs::create_dir_all(path.parent().unwrap())?;
                    let mut out = String::new();
                    for txn in group {
                        out.push_str(&render_transaction(txn, data));
                        out.push('\n');
                    }
                    std::fs::write(&path, out)?;
                    includes.push(rel);
                }
                std::fs::write(&self.primary, render_primary(data, &includes))?;
            }
        }
        Ok(())
    }

    /// Insert or replace transactions by id, rewriting only what changed.
    /// Declarations (accounts, categories, balances) are refreshed when the
    /// caller updated them in `data`.
    pub fn upsert_transactions(&self, data: &mut LedgerData, changed: &[Transaction]) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        let mut touched_months: BTreeSet<(i32, u32)> = BTreeSet::new();
        for incoming in changed {
            touched_months.insert((incoming.date.year(), incoming.date.month()));
            match data.transactions.iter_mut().find(|t| t.id == incoming.id) {
                Some(existing) => {
                    // A move across months must rewrite both sides.
                    touched_months.insert((existing.date.year(), existing.date.month()));
                    *existing = incoming.clone();
                }
                None => data.transactions.push(incoming.clone()),
            }
        }
        data.transactions.sort_by_key(|t| (t.date, t.id));

        match self.layout {
            Layout::SingleFile => self.write_all(data),
            Layout::Hierarchical => {
                for &(year, month) in &touched_months {
                    let group: Vec<&Transaction> = data
                        .transactions
                        .iter()
                        .filter(|t| t.date.year() == year && t.date.month() == month)
                        .collect();
                    let rel = format!("{year}/{year}-{month:02}.{LEDGER_EXT}");
                    let path = self.root().join(&rel);
                    std::fs::create_dir_all(path.parent().unwrap())?;
                    let mut out = String::new();
                    for txn in group {
                        out.push_str(&render_transaction(txn, data));
                        out.push('\n');
                    }
                    std::fs::write(&path, out)?;
                }
                // Refresh the primary so new months are included.
                let months: Vec<String> = data
                    .transactions
                    .iter()
                    .map(|t| format!("{}/{}-{:02}.{LEDGER_EXT}", t.date.year(), t.date.year(), t.date.month()))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                std::fs::write(&self.primary, render_primary(data, &months))?;
                Ok(())
            }
        }
    }
}

/// Exclusive lockfile; removed on drop so the store is released on success,
/// failure, and interrupt alike.
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(path: PathBuf) -> Result<StoreLock> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(StoreLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(FinchError::Store(
                format!("archive is locked by another process ({})", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn render_primary(data: &LedgerData, includes: &[String]) -> String {
    let mut out = String::from("; finch archive\n\n");

    for commodity in &data.commodities {
        out.push_str(&format!("commodity {commodity}\n"));
    }
    if !data.commodities.is_empty() {
        out.push('\n');
    }

    let mut accounts = data.accounts.clone();
    accounts.sort_by_key(|a| a.id);
    for account in &accounts {
        out.push_str(&format!(
            "account {} {} {} {}",
            account.id,
            quote(&account.display_name),
            account.account_type.as_str(),
            account.currency
        ));
        if let Some(date) = account.opening_date {
            out.push_str(&format!(" open {}", date.format("%Y-%m-%d")));
        }
        if let Some(balance) = account.opening_balance {
            out.push_str(&format!(" balance {}", plain_amount(balance)));
        }
        out.push('\n');
    }
    if !accounts.is_empty() {
        out.push('\n');
    }

    let mut categories = data.categories.clone();
    categories.sort_by_key(|c| c.id);
    for category in &categories {
        out.push_str(&format!("category {} {}", category.id, quote(&category.title)));
        if let Some(parent) = category.parent_id {
            out.push_str(&format!(" parent {parent}"));
        }
        out.push('\n');
    }
    if !categories.is_empty() {
        out.push('\n');
    }

    let mut balances = data.balances.clone();
    balances.sort_by_key(|b| (b.account_id, b.date));
    for balance in &balances {
        out.push_str(&format!(
            "balance {} {} {}\n",
            balance.account_id,
            balance.date.format("%Y-%m-%d"),
            plain_amount(balance.amount)
        ));
    }
    if !balances.is_empty() {
        out.push('\n');
    }

    for include in includes {
        out.push_str(&format!("include {}\n", quote(include)));
    }

    out
}

fn render_transaction(txn: &Transaction, data: &LedgerData) -> String {
    let flag = if txn.needs_review { '!' } else { '*' };
    let mut out = format!(
        "{} {} {} {}",
        txn.date.format("%Y-%m-%d"),
        flag,
        quote(&txn.payee),
        quote(&txn.narration)
    );
    for label in &txn.labels {
        out.push_str(&format!(" #{label}"));
    }
    out.push('\n');

    out.push_str(&format!("    id: {}\n", txn.id));
    out.push_str(&format!("    account: {}\n", txn.account_id));
    if let Some(category) = txn.category_id {
        out.push_str(&format!("    category: {category}\n"));
    }
    if let Some(updated) = txn.updated_at {
        out.push_str(&format!("    updated: {}\n", updated.to_rfc3339()));
    }
    if txn.is_transfer {
        out.push_str("    transfer: true\n");
    }
    if let Some(paired) = txn.paired_id {
        out.push_str(&format!("    paired: {paired}\n"));
    }
    if let Some(reason) = &txn.suspect_reason {
        out.push_str(&format!("    suspect-reason: {}\n", quote(reason)));
    }
    if let Some(closing) = txn.closing_balance {
        out.push_str(&format!("    closing-balance: {}\n", plain_amount(closing)));
    }
    for (key, value) in &txn.metadata {
        out.push_str(&format!("    meta-{key}: {}\n", quote(value)));
    }

    let account_name = data
        .account(txn.account_id)
        .map(|a| a.ledger_name())
        .unwrap_or_else(|| format!("Assets:Account-{}", txn.account_id));
    let counter_name = data.category_display(txn.category_id);
    out.push_str(&format!(
        "  {}  {} {}\n",
        account_name,
        plain_amount(txn.amount),
        txn.currency
    ));
    out.push_str(&format!(
        "  {}  {} {}\n",
        counter_name,
        plain_amount(-txn.amount),
        txn.currency
    ));
    out
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

type ParseResult<T> = std::result::Result<T, String>;

fn unquote(s: &str) -> ParseResult<(String, &str)> {
    let rest = s.trim_start();
    let Some(stripped) = rest.strip_prefix('"') else {
        return Err(format!("expected quoted string at '{rest}'"));
    };
    let mut out = String::new();
    let mut chars = stripped.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
            }
            '"' => return Ok((out, &stripped[i + 1..])),
            _ => out.push(c),
        }
    }
    Err(format!("unterminated string at '{rest}'"))
}

fn parse_primary(
    text: &str,
    data: &mut LedgerData,
    includes: &mut Vec<String>,
) -> ParseResult<()> {
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        if line.starts_with(' ') || line.is_empty() || line.starts_with(';') {
            continue;
        }
        let mut words = line.splitn(2, ' ');
        let keyword = words.next().unwrap_or("");
        let rest = words.next().unwrap_or("");
        let context = |msg: &str| format!("line {}: {msg}", lineno + 1);

        match keyword {
            "commodity" => {
                data.commodities.insert(rest.trim().to_string());
            }
            "account" => {
                let mut parts = rest.splitn(2, ' ');
                let id: i64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| context("bad account id"))?;
                let (name, tail) = unquote(parts.next().unwrap_or("")).map_err(|e| context(&e))?;
                let tokens: Vec<&str> = tail.split_whitespace().collect();
                let kind = tokens
                    .first()
                    .copied()
                    .and_then(AccountType::parse)
                    .ok_or_else(|| context("bad account type"))?;
                let currency = tokens
                    .get(1)
                    .map(|s| s.to_uppercase())
                    .ok_or_else(|| context("missing account currency"))?;
                let mut opening_date = None;
                let mut opening_balance = None;
                let mut i = 2;
                while i < tokens.len() {
                    match tokens[i] {
                        "open" => {
                            opening_date = tokens
                                .get(i + 1)
                                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
                            i += 2;
                        }
                        "balance" => {
                            opening_balance =
                                tokens.get(i + 1).and_then(|s| Decimal::from_str(s).ok());
                            i += 2;
                        }
                        _ => break,
                    }
                }
                data.accounts.push(Account {
                    id,
                    display_name: name,
                    account_type: kind,
                    currency,
                    opening_date,
                    opening_balance,
                });
            }
            "category" => {
                let mut parts = rest.splitn(2, ' ');
                let id: i64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| context("bad category id"))?;
                let (title, tail) = unquote(parts.next().unwrap_or("")).map_err(|e| context(&e))?;
                let tokens: Vec<&str> = tail.split_whitespace().collect();
                let parent_id = match tokens.as_slice() {
                    ["parent", id] => id.parse().ok(),
                    _ => None,
                };
                data.categories.push(Category {
                    id,
                    title,
                    parent_id,
                });
            }
            "balance" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                if tokens.len() < 3 {
                    return Err(context("balance needs <account> <date> <amount>"));
                }
                let account_id = tokens[0].parse().map_err(|_| context("bad account id"))?;
                let date = NaiveDate::parse_from_str(tokens[1], "%Y-%m-%d")
                    .map_err(|_| context("bad balance date"))?;
                let amount =
                    Decimal::from_str(tokens[2]).map_err(|_| context("bad balance amount"))?;
                data.balances.push(BalanceAssertion {
                    account_id,
                    date,
                    amount,
                });
            }
            "include" => {
                let (path, _) = unquote(rest).map_err(|e| context(&e))?;
                includes.push(path);
            }
            _ => {
                // Transaction headers (they start with a date) and anything
                // unknown are left for parse_transactions.
            }
        }
    }
    Ok(())
}

fn parse_transactions(text: &str, out: &mut Vec<Transaction>) -> ParseResult<()> {
    let mut lines = text.lines().enumerate().peekable();

    while let Some((lineno, raw)) = lines.next() {
        let line = raw.trim_end();
        if line.is_empty() || line.starts_with(';') || line.starts_with(' ') {
            continue;
        }
        let Some(date) = line
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };

        let context = |msg: &str| format!("line {}: {msg}", lineno + 1);
        let rest = line[10..].trim_start();
        let (flag, rest) = if let Some(tail) = rest.strip_prefix('*') {
            (false, tail)
        } else if let Some(tail) = rest.strip_prefix('!') {
            (true, tail)
        } else {
            continue; // a dated directive, not a transaction
        };
        let (payee, rest) = unquote(rest).map_err(|e| context(&e))?;
        let (narration, rest) = unquote(rest).map_err(|e| context(&e))?;
        let labels: BTreeSet<String> = rest
            .split_whitespace()
            .filter_map(|t| t.strip_prefix('#'))
            .filter_map(crate::models::normalize_label)
            .collect();

        let mut txn = Transaction {
            id: 0,
            date,
            amount: Decimal::ZERO,
            currency: String::new(),
            account_id: 0,
            category_id: None,
            payee,
            narration,
            labels,
            needs_review: flag,
            is_transfer: false,
            paired_id: None,
            suspect_reason: None,
            closing_balance: None,
            updated_at: None,
            metadata: BTreeMap::new(),
        };
        let mut saw_id = false;
        let mut saw_posting = false;

        while let Some((_, peeked)) = lines.peek() {
            if !peeked.starts_with(' ') {
                break;
            }
            let (meta_lineno, body) = lines.next().unwrap();
            let body = body.trim_end();
            let mcontext = |msg: &str| format!("line {}: {msg}", meta_lineno + 1);

            if let Some(meta) = body.strip_prefix("    ") {
                // Metadata line: `key: value`.
                let Some((key, value)) = meta.split_once(':') else {
                    return Err(mcontext("expected 'key: value' metadata"));
                };
                let key = key.trim();
                let value = value.trim();
                match key {
                    "id" => {
                        txn.id = value.parse().map_err(|_| mcontext("bad transaction id"))?;
                        saw_id = true;
                    }
                    "account" => {
                        txn.account_id =
                            value.parse().map_err(|_| mcontext("bad account id"))?;
                    }
                    "category" => {
                        txn.category_id = value.parse().ok();
                    }
                    "updated" => {
                        txn.updated_at = DateTime::parse_from_rfc3339(value)
                            .map(|t| t.with_timezone(&Utc))
                            .ok();
                    }
                    "transfer" => {
                        txn.is_transfer = value == "true";
                    }
                    "paired" => {
                        txn.paired_id = value.parse().ok();
                    }
                    "suspect-reason" => {
                        let (reason, _) = unquote(value).map_err(|e| mcontext(&e))?;
                        if !reason.is_empty() {
                            txn.suspect_reason = Some(reason);
                        }
                    }
                    "closing-balance" => {
                        txn.closing_balance = Decimal::from_str(value).ok();
                    }
                    _ => {
                        if let Some(custom) = key.strip_prefix("meta-") {
                            let (parsed, _) = unquote(value).map_err(|e| mcontext(&e))?;
                            txn.metadata.insert(custom.to_string(), parsed);
                        }
                    }
                }
            } else if let Some(posting) = body.strip_prefix("  ") {
                // First posting carries the account amount; the counter
                // posting is derived and ignored on read.
                let tokens: Vec<&str> = posting.split_whitespace().collect();
                if tokens.len() >= 3 && !saw_posting {
                    txn.amount = Decimal::from_str(tokens[1])
                        .map_err(|_| mcontext("bad posting amount"))?;
                    txn.currency = tokens[2].to_uppercase();
                    saw_posting = true;
                }
            }
        }

        if !saw_id {
            return Err(context("transaction missing id metadata"));
        }
        out.push(txn);
    }
    Ok(())
}
