//! Transfer-pair detection: find the two sides of internal money movements
//! between the user's own accounts and mark them in the archive.

pub mod applier;
pub mod detector;

use regex::{Regex, RegexBuilder};
use rust_decimal::Decimal;

use crate::models::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Confirmed,
    Suspected,
}

/// A matched pair. Source is the outflow side (negative amount) when signs
/// differ; otherwise the lower id.
#[derive(Debug, Clone)]
pub struct TransferPair {
    pub source_id: i64,
    pub dest_id: i64,
    pub confidence: Confidence,
    /// Comma-separated reason tokens for suspected pairs.
    pub reason: Option<String>,
    pub amount: Decimal,
    pub currency: String,
}

/// Detection thresholds. Defaults match the documented behavior; everything
/// is overridable from the command line.
#[derive(Debug, Clone)]
pub struct DetectionCriteria {
    /// Confirmed pairs must be within this many days.
    pub max_confirmed_days: i64,
    /// Suspected pairs may stretch this far.
    pub max_suspected_days: i64,
    /// Exact-match tolerance on absolute amounts.
    pub amount_tolerance: Decimal,
    /// Percentage tolerance for FX-account amount mismatches.
    pub fx_tolerance_percent: Decimal,
    /// Account display-name fragments that mark FX-enabled accounts.
    pub fx_account_fragments: Vec<String>,
    /// Account-holder name variations for description-based matching.
    /// Empty disables the `description-based` reason.
    pub name_variations: Vec<String>,
    /// Bucket size above which the detector falls back to a date-sorted scan.
    pub degeneracy_threshold: usize,
    /// Minimum count of a shared suspect reason worth reporting.
    pub pattern_threshold: usize,
}

impl Default for DetectionCriteria {
    fn default() -> Self {
        DetectionCriteria {
            max_confirmed_days: 2,
            max_suspected_days: 4,
            amount_tolerance: Decimal::ZERO,
            fx_tolerance_percent: Decimal::new(5, 0),
            fx_account_fragments: vec!["wise".to_string()],
            name_variations: Vec::new(),
            degeneracy_threshold: 1000,
            pattern_threshold: 1,
        }
    }
}

impl DetectionCriteria {
    /// Alternation over the configured name variations, or None when
    /// description-based matching is disabled.
    pub fn name_regex(&self) -> Option<Regex> {
        if self.name_variations.is_empty() {
            return None;
        }
        let alternatives: Vec<String> = self
            .name_variations
            .iter()
            .map(|v| regex::escape(v.trim()))
            .filter(|v| !v.is_empty())
            .collect();
        if alternatives.is_empty() {
            return None;
        }
        RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
            .case_insensitive(true)
            .build()
            .ok()
    }
}

/// An aggregate of suspected pairs sharing a reason, surfaced so the user
/// can adjust criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternNotice {
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Default)]
pub struct DetectionResult {
    pub confirmed: Vec<TransferPair>,
    pub suspected: Vec<TransferPair>,
    pub unmatched: Vec<i64>,
    pub notices: Vec<PatternNotice>,
}

impl DetectionResult {
    pub fn total_pairs(&self) -> usize {
        self.confirmed.len() + self.suspected.len()
    }
}

pub(crate) fn order_pair(a: &Transaction, b: &Transaction) -> (i64, i64) {
    if a.amount.is_sign_negative() && !b.amount.is_sign_negative() {
        (a.id, b.id)
    } else if b.amount.is_sign_negative() && !a.amount.is_sign_negative() {
        (b.id, a.id)
    } else {
        (a.id.min(b.id), a.id.max(b.id))
    }
}
