//! Candidate search and pair classification.
//!
//! Candidates come from a two-dimensional spatial hash keyed on
//! `(bucket_date, bucket_amount)`: date buckets are
//! `floor(days_since_epoch / max_suspected_days)` (one bucket width covers
//! the widest window, so ±1 neighbor buckets suffice), amounts are bucketed
//! at two decimal places for the exact path and at whole units for the FX
//! fuzzy path. If any bucket grows past the degeneracy threshold the
//! detector falls back to a date-sorted scan with a binary-searched window,
//! which is slower but insensitive to pathological clustering.

use std::collections::{BTreeSet, HashMap};

use chrono::Datelike;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::Transaction;
use crate::transfers::{
    order_pair, Confidence, DetectionCriteria, DetectionResult, PatternNotice, TransferPair,
};

fn bucket_date(txn: &Transaction, width_days: i64) -> i64 {
    let days = txn.date.num_days_from_ce() as i64;
    days.div_euclid(width_days.max(1))
}

fn cents(amount: Decimal) -> i64 {
    (amount.abs() * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .unwrap_or(i64::MAX)
}

fn whole_units(amount: Decimal) -> i64 {
    amount.abs().round().to_i64().unwrap_or(i64::MAX)
}

enum Index<'t> {
    /// (date bucket, amount bucket) → transaction indices.
    Spatial {
        exact: HashMap<(i64, i64), Vec<usize>>,
        fx: HashMap<(i64, i64), Vec<usize>>,
        txns: &'t [Transaction],
        date_width: i64,
    },
    /// Fallback: indices sorted by date, binary-searched per lookup.
    Scan {
        by_date: Vec<usize>,
        txns: &'t [Transaction],
    },
}

impl<'t> Index<'t> {
    fn build(txns: &'t [Transaction], eligible: &[usize], criteria: &DetectionCriteria) -> Index<'t> {
        let date_width = criteria.max_suspected_days.max(1);
        let mut exact: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        let mut fx: HashMap<(i64, i64), Vec<usize>> = HashMap::new();

        for &i in eligible {
            let txn = &txns[i];
            let db = bucket_date(txn, date_width);
            exact.entry((db, cents(txn.amount))).or_default().push(i);
            fx.entry((db, whole_units(txn.amount))).or_default().push(i);
        }

        let degenerate = exact
            .values()
            .chain(fx.values())
            .any(|bucket| bucket.len() > criteria.degeneracy_threshold);
        if degenerate {
            debug!("bucket degeneracy detected, falling back to sorted scan");
            let mut by_date: Vec<usize> = eligible.to_vec();
            by_date.sort_by_key(|&i| (txns[i].date, txns[i].id));
            return Index::Scan { by_date, txns };
        }

        Index::Spatial {
            exact,
            fx,
            txns,
            date_width,
        }
    }

    /// Candidate indices for `txn` within `max_days` whose absolute amount
    /// is within `tolerance` of the transaction's.
    fn candidates(&self, txn: &Transaction, max_days: i64, tolerance: Decimal) -> Vec<usize> {
        match self {
            Index::Spatial {
                exact,
                fx,
                txns,
                date_width,
            } => {
                let center = bucket_date(txn, *date_width);
                let mut seen = BTreeSet::new();

                for db in [center - 1, center, center + 1] {
                    if tolerance.is_zero() {
                        if let Some(bucket) = exact.get(&(db, cents(txn.amount))) {
                            seen.extend(bucket.iter().copied());
                        }
                    } else {
                        let amount = txn.amount.abs();
                        let low = whole_units((amount - tolerance).max(Decimal::ZERO));
                        let high = whole_units(amount + tolerance);
                        for ab in low..=high {
                            if let Some(bucket) = fx.get(&(db, ab)) {
                                seen.extend(bucket.iter().copied());
                            }
                        }
                    }
                }

                seen.into_iter()
                    .filter(|&i| {
                        let candidate = &txns[i];
                        candidate.id != txn.id
                            && date_diff_days(txn, candidate) <= max_days
                            && (candidate.amount.abs() - txn.amount.abs()).abs() <= tolerance
                    })
                    .collect()
            }
            Index::Scan { by_date, txns } => {
                let low_date = txn.date - chrono::Duration::days(max_days);
                let high_date = txn.date + chrono::Duration::days(max_days);
                let start = by_date.partition_point(|&i| txns[i].date < low_date);
                let end = by_date.partition_point(|&i| txns[i].date <= high_date);
                by_date[start..end]
                    .iter()
                    .copied()
                    .filter(|&i| {
                        let candidate = &txns[i];
                        candidate.id != txn.id
                            && (candidate.amount.abs() - txn.amount.abs()).abs() <= tolerance
                    })
                    .collect()
            }
        }
    }
}

fn date_diff_days(a: &Transaction, b: &Transaction) -> i64 {
    (a.date - b.date).num_days().abs()
}

fn opposite_signs(a: &Transaction, b: &Transaction) -> bool {
    (a.amount.is_sign_negative() && b.amount.is_sign_positive())
        || (a.amount.is_sign_positive() && b.amount.is_sign_negative())
}

pub struct Detector<'d> {
    criteria: &'d DetectionCriteria,
    fx_fragments: Vec<String>,
    name_regex: Option<Regex>,
    transfer_payee: Regex,
    account_names: HashMap<i64, String>,
}

impl<'d> Detector<'d> {
    pub fn new(
        criteria: &'d DetectionCriteria,
        account_names: HashMap<i64, String>,
    ) -> Detector<'d> {
        Detector {
            fx_fragments: criteria
                .fx_account_fragments
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
            name_regex: criteria.name_regex(),
            transfer_payee: Regex::new(r"(?i)transfer").unwrap(),
            account_names,
            criteria,
        }
    }

    fn is_fx_account(&self, account_id: i64) -> bool {
        let Some(name) = self.account_names.get(&account_id) else {
            return false;
        };
        let lowered = name.to_lowercase();
        self.fx_fragments.iter().any(|f| lowered.contains(f))
    }

    fn amount_mismatch_within_fx(&self, a: &Transaction, b: &Transaction) -> bool {
        if !self.is_fx_account(a.account_id) && !self.is_fx_account(b.account_id) {
            return false;
        }
        let (abs_a, abs_b) = (a.amount.abs(), b.amount.abs());
        let diff = (abs_a - abs_b).abs();
        if diff.is_zero() {
            return false;
        }
        let avg = (abs_a + abs_b) / Decimal::TWO;
        if avg.is_zero() {
            return false;
        }
        (diff / avg) * Decimal::ONE_HUNDRED <= self.criteria.fx_tolerance_percent
    }

    fn description_suggests_transfer(&self, txn: &Transaction) -> bool {
        let Some(name_regex) = &self.name_regex else {
            return false;
        };
        let haystack = format!("{} {}", txn.payee, txn.narration);
        self.transfer_payee.is_match(&haystack) && name_regex.is_match(&haystack)
    }

    fn is_confirmed(&self, a: &Transaction, b: &Transaction) -> bool {
        a.account_id != b.account_id
            && opposite_signs(a, b)
            && (a.amount.abs() - b.amount.abs()).abs() <= self.criteria.amount_tolerance
            && date_diff_days(a, b) <= self.criteria.max_confirmed_days
    }

    /// All suspect reasons that apply, in stable order. Empty means no pair.
    fn suspect_reasons(&self, a: &Transaction, b: &Transaction) -> Vec<String> {
        if a.account_id == b.account_id {
            return Vec::new();
        }
        let days = date_diff_days(a, b);
        if days > self.criteria.max_suspected_days {
            return Vec::new();
        }
        let amounts_equal = (a.amount.abs() - b.amount.abs()).abs() <= self.criteria.amount_tolerance;
        let fx_mismatch = self.amount_mismatch_within_fx(a, b);
        if !amounts_equal && !fx_mismatch {
            // Differing amounts are only pairable through the FX allowance.
            return Vec::new();
        }

        let mut reasons = Vec::new();
        if !opposite_signs(a, b) {
            reasons.push("same-direction".to_string());
        }
        if fx_mismatch {
            reasons.push("amount-mismatch-fx".to_string());
        }
        if days > self.criteria.max_confirmed_days {
            reasons.push(format!("date-delay-{days}d"));
        }
        if self.description_suggests_transfer(a) || self.description_suggests_transfer(b) {
            reasons.push("description-based".to_string());
        }
        reasons
    }

    /// Detect pairs among `txns`. Transactions already carrying a symmetric
    /// `paired_id` to a still-present counterpart are skipped entirely, so
    /// re-running the detector never re-annotates.
    pub fn detect(&self, txns: &[Transaction]) -> DetectionResult {
        let by_id: HashMap<i64, &Transaction> = txns.iter().map(|t| (t.id, t)).collect();
        let mut paired: BTreeSet<i64> = txns
            .iter()
            .filter(|t| {
                t.paired_id
                    .and_then(|p| by_id.get(&p))
                    .is_some_and(|other| other.paired_id == Some(t.id))
            })
            .map(|t| t.id)
            .collect();
        let prepaired = paired.len();

        let mut eligible: Vec<usize> = (0..txns.len())
            .filter(|&i| !paired.contains(&txns[i].id))
            .collect();
        eligible.sort_by_key(|&i| txns[i].id);

        let index = Index::build(txns, &eligible, self.criteria);
        let mut result = DetectionResult::default();

        // Pass 1: confirmed pairs, exact amounts, narrow window. Greedy with
        // smallest |Δdate| then smallest id.
        for &i in &eligible {
            let txn = &txns[i];
            if paired.contains(&txn.id) {
                continue;
            }
            let mut candidates = index.candidates(
                txn,
                self.criteria.max_confirmed_days,
                self.criteria.amount_tolerance,
            );
            candidates.sort_by_key(|&c| (date_diff_days(txn, &txns[c]), txns[c].id));

            for c in candidates {
                let candidate = &txns[c];
                if paired.contains(&candidate.id) {
                    continue;
                }
                if self.is_confirmed(txn, candidate) {
                    let (source_id, dest_id) = order_pair(txn, candidate);
                    result.confirmed.push(TransferPair {
                        source_id,
                        dest_id,
                        confidence: Confidence::Confirmed,
                        reason: None,
                        amount: txn.amount.abs(),
                        currency: txn.currency.clone(),
                    });
                    paired.insert(txn.id);
                    paired.insert(candidate.id);
                    break;
                }
            }
        }

        // Pass 2: suspected pairs, FX amount allowance, wide window.
        for &i in &eligible {
            let txn = &txns[i];
            if paired.contains(&txn.id) {
                continue;
            }
            let fx_tolerance = txn.amount.abs() * self.criteria.fx_tolerance_percent
                / Decimal::ONE_HUNDRED;
            let mut candidates = index.candidates(
                txn,
                self.criteria.max_suspected_days,
                fx_tolerance.max(self.criteria.amount_tolerance),
            );
            candidates.sort_by_key(|&c| (date_diff_days(txn, &txns[c]), txns[c].id));

            for c in candidates {
                let candidate = &txns[c];
                if paired.contains(&candidate.id) {
                    continue;
                }
                let reasons = self.suspect_reasons(txn, candidate);
                if !reasons.is_empty() {
                    let (source_id, dest_id) = order_pair(txn, candidate);
                    result.suspected.push(TransferPair {
                        source_id,
                        dest_id,
                        confidence: Confidence::Suspected,
                        reason: Some(reasons.join(",")),
                        amount: txn.amount.abs(),
                        currency: txn.currency.clone(),
                    });
                    paired.insert(txn.id);
                    paired.insert(candidate.id);
                    break;
                }
            }
        }

        result.unmatched = txns
            .iter()
            .filter(|t| !paired.contains(&t.id))
            .map(|t| t.id)
            .collect();
        result.notices = self.pattern_notices(&result.suspected);
        debug!(
            confirmed = result.confirmed.len(),
            suspected = result.suspected.len(),
            skipped = prepaired,
            "transfer detection complete"
        );
        result
    }

    /// Aggregate suspected reasons so systematic patterns surface.
    fn pattern_notices(&self, suspected: &[TransferPair]) -> Vec<PatternNotice> {
        let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
        for pair in suspected {
            let Some(reason) = &pair.reason else { continue };
            for token in reason.split(',') {
                *counts.entry(token.to_string()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count >= self.criteria.pattern_threshold.max(1))
            .map(|(reason, count)| PatternNotice { reason, count })
            .collect()
    }
}
