use colored::Colorize;

use crate::cli::{build_remote, resolve_archive, CommonOpts, WindowOpts};
use crate::config::Config;
use crate::error::Result;
use crate::sync::{self, CancelFlag, SyncOptions};

pub fn run(
    common: &CommonOpts,
    window: &WindowOpts,
    id: Option<i64>,
    config: &Config,
    cancel: &CancelFlag,
) -> Result<()> {
    let archive = resolve_archive(&common.destination, config)?;
    let explicit_window = if window.was_given() {
        Some(window.resolve()?)
    } else {
        None
    };
    let remote = build_remote(config)?;

    let report = sync::pull(
        &remote,
        &archive,
        explicit_window,
        id,
        SyncOptions {
            dry_run: common.dry_run,
            quiet: common.quiet,
            verbose: common.verbose,
            concurrency: config.concurrency,
        },
        cancel,
    )?;

    for warning in &report.warnings {
        eprintln!("{} {warning}", "warning:".yellow());
    }
    if !common.quiet {
        if common.dry_run {
            println!("Archive and changelog not updated (dry run).");
        }
        println!(
            "{} transactions fetched; {} created, {} updated locally, {} written back",
            report.fetched, report.created, report.updated, report.write_backs
        );
    }
    Ok(())
}
