use colored::Colorize;

use crate::cli::{build_remote, CommonOpts, WindowOpts};
use crate::config::Config;
use crate::error::{FinchError, Result};
use crate::store::Archive;
use crate::sync::{self, CancelFlag, SyncOptions};

pub fn run(
    common: &CommonOpts,
    window: &WindowOpts,
    config: &Config,
    cancel: &CancelFlag,
) -> Result<()> {
    let window = window.resolve()?;
    let destination = common
        .destination
        .clone()
        .or_else(|| config.output_dir.clone())
        .ok_or_else(|| {
            FinchError::UserInput(
                "clone needs a destination (argument or output-directory setting)".to_string(),
            )
        })?;

    let archive = Archive::create(&destination)?;
    let remote = build_remote(config)?;

    if !common.quiet {
        println!("Cloning into {}", destination.display());
    }
    let report = sync::clone_archive(
        &remote,
        &archive,
        window,
        SyncOptions {
            dry_run: common.dry_run,
            quiet: common.quiet,
            verbose: common.verbose,
            concurrency: config.concurrency,
        },
        cancel,
    )?;

    if !common.quiet && !common.dry_run {
        println!(
            "{} {} transactions, {} accounts, {} categories",
            "Cloned".green(),
            report.transactions,
            report.accounts,
            report.categories
        );
        println!("Changelog: {}", archive.changelog_path().display());
    }
    Ok(())
}
