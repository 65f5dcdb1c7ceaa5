mod changelog;
mod cli;
mod comparator;
mod config;
mod dates;
mod error;
mod fmt;
mod models;
mod notes;
mod remote;
mod resolver;
mod rules;
mod store;
mod sync;
mod transfers;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, RuleCommands};
use config::Config;
use sync::CancelFlag;

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        // A second Ctrl-C falls through to the default handler.
        let _ = ctrlc::set_handler(move || cancel.cancel());
    }

    let config = Config::load();
    if let Err(e) = dispatch(cli.command, &config, &cancel) {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn init_tracing(command: &Commands) {
    let verbose = match command {
        Commands::Clone { common, .. }
        | Commands::Pull { common, .. }
        | Commands::Push { common, .. }
        | Commands::Diff { common, .. }
        | Commands::DetectTransfers { common, .. } => common.verbose,
        Commands::Rule {
            command: RuleCommands::Apply { common, .. },
        } => common.verbose,
        Commands::Rule { .. } => false,
    };
    let default_filter = if verbose { "finch=debug" } else { "finch=warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(command: Commands, config: &Config, cancel: &CancelFlag) -> error::Result<()> {
    match command {
        Commands::Clone { common, window } => cli::clone::run(&common, &window, config, cancel),
        Commands::Pull { common, window, id } => {
            cli::pull::run(&common, &window, id, config, cancel)
        }
        Commands::Push { common, window, id } => {
            cli::push::run(&common, &window, id, config, cancel)
        }
        Commands::Diff {
            common,
            window,
            id,
            format,
        } => cli::diff::run(&common, &window, id, format, config, cancel),
        Commands::Rule { command } => match command {
            RuleCommands::Add {
                id,
                merchant,
                account,
                category,
                set_category,
                labels,
                memo,
                rules,
                destination,
            } => cli::rules::add(
                id,
                merchant.as_deref(),
                account.as_deref(),
                category.as_deref(),
                set_category.as_deref(),
                &labels,
                memo.as_deref(),
                &rules,
                &destination,
                config,
            ),
            RuleCommands::Rm {
                id,
                rules,
                destination,
            } => cli::rules::rm(id, &rules, &destination, config),
            RuleCommands::Apply {
                common,
                window,
                id,
                rules,
            } => cli::rules::apply(&common, &window, id, &rules, config, cancel),
            RuleCommands::List {
                rules,
                all,
                destination,
            } => cli::rules::list(&rules, all, &destination, config),
            RuleCommands::Lookup {
                id,
                rules,
                destination,
            } => cli::rules::lookup(id, &rules, &destination, config),
        },
        Commands::DetectTransfers {
            common,
            window,
            transfer_category,
            max_days,
            max_suspected_days,
            fx_tolerance,
            fx_accounts,
            name_variations,
        } => cli::transfers::run(
            &common,
            &window,
            &transfer_category,
            max_days,
            max_suspected_days,
            fx_tolerance,
            &fx_accounts,
            &name_variations,
            config,
            cancel,
        ),
    }
}
