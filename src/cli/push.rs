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
    let window = window.resolve()?;
    let remote = build_remote(config)?;

    let report = sync::push(
        &remote,
        &archive,
        window,
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
    for id in &report.local_only {
        eprintln!(
            "{} transaction {id} exists only locally; push never creates remotely",
            "note:".cyan()
        );
    }
    if !common.quiet {
        if common.dry_run {
            println!("Remote and changelog not updated (dry run).");
        }
        println!(
            "{} transactions examined; {} patched",
            report.examined, report.patched
        );
    }
    Ok(())
}
