//! Declarative transaction rules: a precondition (conjunction of regex
//! predicates) and an ordered list of transforms, loaded from YAML.

pub mod loader;
pub mod matcher;
pub mod transformer;

use std::collections::BTreeMap;

use regex::Regex;

/// The `if` half of a rule. All present predicates must match.
#[derive(Debug, Clone, Default)]
pub struct Precondition {
    /// Against `payee`.
    pub merchant: Option<Regex>,
    /// Against the account's display name (asset/liability accounts only).
    pub account: Option<Regex>,
    /// Against the category title (income/expense categories only).
    pub category: Option<Regex>,
    /// key → pattern, all required, against transaction-level metadata.
    pub metadata: BTreeMap<String, Regex>,
}

impl Precondition {
    pub fn is_empty(&self) -> bool {
        self.merchant.is_none()
            && self.account.is_none()
            && self.category.is_none()
            && self.metadata.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelOp {
    Add(String),
    Remove(String),
}

/// The `then` half: one per-key mutation. Multiple transforms in a rule
/// compose in the order given.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Resolve a category name to its id and set it.
    Category(String),
    Labels(Vec<LabelOp>),
    /// Set the narration.
    Memo(String),
    /// Structured annotations, carried to the remote note as `[key:value]`.
    Metadata(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub precondition: Precondition,
    pub transforms: Vec<Transform>,
    pub disabled: bool,
    /// File the rule came from; used in diagnostics and `rule rm`.
    pub source: std::path::PathBuf,
}

/// Outcome of one transform on one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Applied,
    /// Already satisfied; nothing changed, nothing logged.
    Noop,
    /// Target could not be resolved (e.g. unknown category name); the rest
    /// of the rule still applies.
    Invalid,
    /// Applied over a conflicting existing value.
    Conflict,
}

#[derive(Debug, Clone)]
pub struct Application {
    pub rule_id: i64,
    pub txn_id: i64,
    pub field: &'static str,
    pub old: String,
    pub new: String,
    pub status: ApplyStatus,
    pub message: Option<String>,
}
