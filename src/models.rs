use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

/// The mutable transaction fields, in declaration order. Resolver iteration,
/// mutation emission, and changelog entries all follow this order so that
/// replaying a log is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Date,
    Amount,
    Currency,
    AccountId,
    CategoryId,
    Payee,
    Narration,
    Labels,
    NeedsReview,
    IsTransfer,
    PairedId,
    SuspectReason,
    ClosingBalance,
    UpdatedAt,
    Metadata,
}

pub const FIELD_ORDER: &[Field] = &[
    Field::Date,
    Field::Amount,
    Field::Currency,
    Field::AccountId,
    Field::CategoryId,
    Field::Payee,
    Field::Narration,
    Field::Labels,
    Field::NeedsReview,
    Field::IsTransfer,
    Field::PairedId,
    Field::SuspectReason,
    Field::ClosingBalance,
    Field::UpdatedAt,
    Field::Metadata,
];

impl Field {
    /// Name used in changelog entries and diff output.
    pub fn name(&self) -> &'static str {
        match self {
            Field::Date => "date",
            Field::Amount => "amount",
            Field::Currency => "currency",
            Field::AccountId => "account_id",
            Field::CategoryId => "category_id",
            Field::Payee => "payee",
            Field::Narration => "narration",
            Field::Labels => "labels",
            Field::NeedsReview => "needs_review",
            Field::IsTransfer => "is_transfer",
            Field::PairedId => "paired_id",
            Field::SuspectReason => "suspect_reason",
            Field::ClosingBalance => "closing_balance",
            Field::UpdatedAt => "updated_at",
            Field::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed snapshot of one transaction field, used by the comparator and
/// resolver so they can treat all fields uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    Text(String),
    Decimal(Decimal),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Labels(BTreeSet<String>),
    Map(BTreeMap<String, String>),
}

impl Value {
    pub fn opt_text(v: &Option<String>) -> Value {
        match v {
            Some(s) if !s.is_empty() => Value::Text(s.clone()),
            _ => Value::Null,
        }
    }

    pub fn opt_int(v: Option<i64>) -> Value {
        v.map(Value::Int).unwrap_or(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    /// Rendering used by changelog `UPDATE`/`APPLY`/`DIFF` entries: scalars
    /// literal, lists as `[a, b]`, absent values as `null`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Labels(set) => {
                let items: Vec<&str> = set.iter().map(String::as_str).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Map(map) => {
                let items: Vec<String> = map.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

/// The canonical transaction record shared by the store, the remote client,
/// and every engine. Consumers receive values and mutate copies; the store
/// owns the on-disk representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub account_id: i64,
    pub category_id: Option<i64>,
    pub payee: String,
    pub narration: String,
    pub labels: BTreeSet<String>,
    pub needs_review: bool,
    pub is_transfer: bool,
    pub paired_id: Option<i64>,
    pub suspect_reason: Option<String>,
    pub closing_balance: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl Transaction {
    pub fn get(&self, field: Field) -> Value {
        match field {
            Field::Date => Value::Date(self.date),
            Field::Amount => Value::Decimal(self.amount),
            Field::Currency => Value::Text(self.currency.clone()),
            Field::AccountId => Value::Int(self.account_id),
            Field::CategoryId => Value::opt_int(self.category_id),
            Field::Payee => Value::opt_text(&Some(self.payee.clone())),
            Field::Narration => Value::opt_text(&Some(self.narration.clone())),
            Field::Labels => Value::Labels(self.labels.clone()),
            Field::NeedsReview => Value::Bool(self.needs_review),
            Field::IsTransfer => Value::Bool(self.is_transfer),
            Field::PairedId => Value::opt_int(self.paired_id),
            Field::SuspectReason => Value::opt_text(&self.suspect_reason),
            Field::ClosingBalance => self
                .closing_balance
                .map(Value::Decimal)
                .unwrap_or(Value::Null),
            Field::UpdatedAt => self.updated_at.map(Value::Timestamp).unwrap_or(Value::Null),
            Field::Metadata => Value::Map(self.metadata.clone()),
        }
    }

    /// Write a resolved value back into the record. Shapes the field cannot
    /// hold are ignored; the resolver only produces values it previously read
    /// with `get`.
    pub fn set(&mut self, field: Field, value: Value) {
        match (field, value) {
            (Field::Date, Value::Date(d)) => self.date = d,
            (Field::Amount, Value::Decimal(d)) => self.amount = d,
            (Field::Currency, Value::Text(s)) => self.currency = s,
            (Field::AccountId, Value::Int(n)) => self.account_id = n,
            (Field::CategoryId, Value::Int(n)) => self.category_id = Some(n),
            (Field::CategoryId, Value::Null) => self.category_id = None,
            (Field::Payee, Value::Text(s)) => self.payee = s,
            (Field::Payee, Value::Null) => self.payee.clear(),
            (Field::Narration, Value::Text(s)) => self.narration = s,
            (Field::Narration, Value::Null) => self.narration.clear(),
            (Field::Labels, Value::Labels(set)) => self.labels = set,
            (Field::NeedsReview, Value::Bool(b)) => self.needs_review = b,
            (Field::IsTransfer, Value::Bool(b)) => self.is_transfer = b,
            (Field::PairedId, Value::Int(n)) => self.paired_id = Some(n),
            (Field::PairedId, Value::Null) => self.paired_id = None,
            (Field::SuspectReason, Value::Text(s)) => self.suspect_reason = Some(s),
            (Field::SuspectReason, Value::Null) => self.suspect_reason = None,
            (Field::ClosingBalance, Value::Decimal(d)) => self.closing_balance = Some(d),
            (Field::ClosingBalance, Value::Null) => self.closing_balance = None,
            (Field::UpdatedAt, Value::Timestamp(t)) => self.updated_at = Some(t),
            (Field::Metadata, Value::Map(m)) => self.metadata = m,
            _ => {}
        }
    }
}

/// Accounts are asset or liability; income/expense legs live on categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    Asset,
    Liability,
}

impl AccountType {
    pub fn root(&self) -> &'static str {
        match self {
            AccountType::Asset => "Assets",
            AccountType::Liability => "Liabilities",
        }
    }

    pub fn parse(s: &str) -> Option<AccountType> {
        match s.to_ascii_lowercase().as_str() {
            "asset" | "assets" | "bank" | "checking" | "savings" | "investment" => {
                Some(AccountType::Asset)
            }
            "liability" | "liabilities" | "credit_card" | "credits" | "loan" | "mortgage" => {
                Some(AccountType::Liability)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub display_name: String,
    pub account_type: AccountType,
    pub currency: String,
    pub opening_date: Option<NaiveDate>,
    pub opening_balance: Option<Decimal>,
}

impl Account {
    /// Ledger account name: `Assets:BofA-Checking` style.
    pub fn ledger_name(&self) -> String {
        format!("{}:{}", self.account_type.root(), slug(&self.display_name))
    }
}

/// Categories form a forest; `parent_id` cycles are rejected by the store.
#[derive(Debug, Clone)]
pub struct Category {
    pub id: i64,
    pub title: String,
    pub parent_id: Option<i64>,
}

impl Category {
    pub fn ledger_name(&self) -> String {
        format!("Expenses:{}", slug(&self.title))
    }
}

#[derive(Debug, Clone)]
pub struct BalanceAssertion {
    pub account_id: i64,
    pub date: NaiveDate,
    pub amount: Decimal,
}

/// Capitalized-hyphenated form used inside ledger account names.
fn slug(name: &str) -> String {
    name.split_whitespace()
        .filter_map(|word| {
            let cleaned: String = word.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            if cleaned.is_empty() {
                return None;
            }
            let mut chars = cleaned.chars();
            let first = chars.next().unwrap().to_ascii_uppercase();
            Some(format!("{first}{}", chars.as_str()))
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Normalize a label token: lowercase, internal separators collapsed to a
/// single hyphen, anything outside `[a-z0-9-]` dropped. Returns None when
/// nothing valid remains.
pub fn normalize_label(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_hyphen = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else if c == '-' || c == '_' || c.is_whitespace() {
            pending_hyphen = true;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Valid label tokens match `[a-z0-9][a-z0-9-]*`.
pub fn is_valid_label(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
