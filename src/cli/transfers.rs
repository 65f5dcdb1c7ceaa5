use std::collections::HashMap;

use colored::Colorize;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::changelog::Changelog;
use crate::cli::{resolve_archive, CommonOpts, WindowOpts};
use crate::config::Config;
use crate::dates::DateWindow;
use crate::error::{FinchError, Result};
use crate::fmt::money;
use crate::sync::CancelFlag;
use crate::transfers::applier::Applier;
use crate::transfers::detector::Detector;
use crate::transfers::{DetectionCriteria, TransferPair};

#[allow(clippy::too_many_arguments)]
pub fn run(
    common: &CommonOpts,
    window: &WindowOpts,
    transfer_category: &str,
    max_days: i64,
    max_suspected_days: i64,
    fx_tolerance: f64,
    fx_accounts: &[String],
    name_variations: &[String],
    config: &Config,
    cancel: &CancelFlag,
) -> Result<()> {
    let archive = resolve_archive(&common.destination, config)?;
    let window = window.resolve()?;

    let mut criteria = DetectionCriteria {
        max_confirmed_days: max_days,
        max_suspected_days: max_suspected_days.max(max_days),
        ..Default::default()
    };
    if let Some(tolerance) = Decimal::from_f64(fx_tolerance) {
        criteria.fx_tolerance_percent = tolerance;
    }
    if !fx_accounts.is_empty() {
        criteria.fx_account_fragments = fx_accounts.to_vec();
    }
    if !name_variations.is_empty() {
        criteria.name_variations = name_variations.to_vec();
    }

    let _lock = archive.lock()?;
    let mut data = archive.read()?;

    let transfer_category_id = data
        .category_by_title(transfer_category)
        .map(|c| c.id)
        .ok_or_else(|| {
            FinchError::Validation(format!(
                "transfer category '{transfer_category}' not found in the archive"
            ))
        })?;

    let in_window: Vec<_> = data
        .transactions
        .iter()
        .filter(|t| window.contains(t.date))
        .cloned()
        .collect();
    let account_names: HashMap<i64, String> = data
        .accounts
        .iter()
        .map(|a| (a.id, a.display_name.clone()))
        .collect();

    if cancel.is_cancelled() {
        return Err(FinchError::Interrupted);
    }

    let detection = Detector::new(&criteria, account_names).detect(&in_window);
    let result = Applier::new(transfer_category_id).apply(&detection, &data);

    if !common.quiet {
        print_pairs("Confirmed", &detection.confirmed, &window);
        print_pairs("Suspected", &detection.suspected, &window);
    }

    if common.dry_run {
        println!(
            "{} confirmed and {} suspected pair(s) would be marked (dry run)",
            detection.confirmed.len(),
            detection.suspected.len()
        );
    } else {
        archive.upsert_transactions(&mut data, &result.changed)?;
        Changelog::new(archive.changelog_path()).append_records(&result.log_entries)?;
        if !common.quiet {
            println!(
                "{} {} confirmed and {} suspected pair(s)",
                "Marked".green(),
                result.confirmed_marked,
                result.suspected_marked
            );
        }
    }

    for notice in &detection.notices {
        println!(
            "{} {} suspected pair(s) share reason '{}'; consider adjusting detection criteria",
            "pattern:".yellow(),
            notice.count,
            notice.reason
        );
    }
    Ok(())
}

fn print_pairs(kind: &str, pairs: &[TransferPair], _window: &DateWindow) {
    if pairs.is_empty() {
        return;
    }
    println!("{kind} transfers:");
    for pair in pairs {
        match &pair.reason {
            Some(reason) => println!(
                "  {} → {}  {}  ({reason})",
                pair.source_id,
                pair.dest_id,
                money(pair.amount, &pair.currency)
            ),
            None => println!(
                "  {} → {}  {}",
                pair.source_id,
                pair.dest_id,
                money(pair.amount, &pair.currency)
            ),
        }
    }
}
