pub mod clone;
pub mod diff;
pub mod pull;
pub mod push;
pub mod rules;
pub mod transfers;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::Config;
use crate::dates::{self, DateWindow, WindowArgs};
use crate::error::Result;
use crate::remote::HttpRemoteClient;
use crate::store::Archive;

#[derive(Parser)]
#[command(
    name = "finch",
    version,
    about = "Mirror a remote ledger service into a plain-text ledger archive."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every workflow command.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonOpts {
    /// Archive path (auto-detected when omitted)
    pub destination: Option<PathBuf>,
    /// Print intended operations without writing anything
    #[arg(long)]
    pub dry_run: bool,
    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
    /// Extra diagnostics
    #[arg(short, long)]
    pub verbose: bool,
}

/// Date window group: `--from/--to` or one convenience flag, never both.
#[derive(Args, Debug, Clone, Default)]
pub struct WindowOpts {
    /// Start date: YYYY-MM-DD, YYYYMMDD, YYYY-MM, or YYYY
    #[arg(long)]
    pub from: Option<String>,
    /// End date (inclusive), same formats
    #[arg(long)]
    pub to: Option<String>,
    /// The current calendar month
    #[arg(long)]
    pub this_month: bool,
    /// The previous calendar month
    #[arg(long)]
    pub last_month: bool,
    /// The current calendar year
    #[arg(long)]
    pub this_year: bool,
    /// The previous calendar year
    #[arg(long)]
    pub last_year: bool,
}

impl WindowOpts {
    pub fn was_given(&self) -> bool {
        self.from.is_some()
            || self.to.is_some()
            || self.this_month
            || self.last_month
            || self.this_year
            || self.last_year
    }

    pub fn resolve(&self) -> Result<DateWindow> {
        dates::resolve_window(&WindowArgs {
            from: self.from.clone(),
            to: self.to.clone(),
            this_month: self.this_month,
            last_month: self.last_month,
            this_year: self.this_year,
            last_year: self.last_year,
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mirror the remote into a fresh archive.
    Clone {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        window: WindowOpts,
    },
    /// Fetch remote changes since the last sync and reconcile them in.
    Pull {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        window: WindowOpts,
        /// Target a single transaction
        #[arg(long)]
        id: Option<i64>,
    },
    /// Promote local corrections to the remote.
    Push {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        window: WindowOpts,
        /// Target a single transaction
        #[arg(long)]
        id: Option<i64>,
    },
    /// Compare local and remote without changing either.
    Diff {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        window: WindowOpts,
        /// Target a single transaction
        #[arg(long)]
        id: Option<i64>,
        /// Presentation mode
        #[arg(long, value_enum, default_value = "summary")]
        format: DiffFormat,
    },
    /// Manage classification rules.
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },
    /// Detect and mark transfer pairs between accounts.
    DetectTransfers {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        window: WindowOpts,
        /// Category assigned to confirmed pairs
        #[arg(long, default_value = "Transfer")]
        transfer_category: String,
        /// Confirmed-pair date window in days
        #[arg(long, default_value_t = 2)]
        max_days: i64,
        /// Suspected-pair date window in days
        #[arg(long, default_value_t = 4)]
        max_suspected_days: i64,
        /// FX amount tolerance percent
        #[arg(long, default_value_t = 5.0)]
        fx_tolerance: f64,
        /// FX-enabled account name fragment (repeatable)
        #[arg(long = "fx-account")]
        fx_accounts: Vec<String>,
        /// Account-holder name variation for description matching (repeatable)
        #[arg(long = "name-variation")]
        name_variations: Vec<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffFormat {
    /// Counts of identical / differs / only-local / only-remote
    Summary,
    /// The differing transaction ids
    Ids,
    /// DIFF lines in the changelog grammar (stdout only)
    Changelog,
    /// Two-column field rendering
    Diff,
}

#[derive(Subcommand)]
pub enum RuleCommands {
    /// Append a rule to the local rules file.
    Add {
        /// Rule id (defaults to one past the highest loaded id)
        #[arg(long)]
        id: Option<i64>,
        /// Merchant (payee) regex precondition
        #[arg(long)]
        merchant: Option<String>,
        /// Account display-name regex precondition
        #[arg(long)]
        account: Option<String>,
        /// Category title regex precondition
        #[arg(long)]
        category: Option<String>,
        /// Category name to assign
        #[arg(long = "set-category")]
        set_category: Option<String>,
        /// Label operations, e.g. "+coffee" or "-uncategorized" (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Narration to set
        #[arg(long)]
        memo: Option<String>,
        /// Rules directory or file (default: <archive>/rules)
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Archive path (auto-detected when omitted)
        destination: Option<PathBuf>,
    },
    /// Remove a rule by id.
    Rm {
        id: i64,
        #[arg(long)]
        rules: Option<PathBuf>,
        destination: Option<PathBuf>,
    },
    /// Apply the rule set to archive transactions (local-only).
    Apply {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        window: WindowOpts,
        /// Target a single transaction
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// List loaded rules.
    List {
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Include disabled rules
        #[arg(long)]
        all: bool,
        destination: Option<PathBuf>,
    },
    /// Show which rule would match a transaction.
    Lookup {
        /// Transaction id
        id: i64,
        #[arg(long)]
        rules: Option<PathBuf>,
        destination: Option<PathBuf>,
    },
}

/// Open the archive named on the command line, or auto-detect one under
/// the configured output directory (falling back to the working directory).
pub fn resolve_archive(destination: &Option<PathBuf>, config: &Config) -> Result<Archive> {
    match destination {
        Some(path) => Archive::open(path),
        None => {
            let start = match &config.output_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir()?,
            };
            Archive::auto_detect(&start)
        }
    }
}

/// Rules location: explicit flag, else `<archive root>/rules`.
pub fn resolve_rules_path(rules: &Option<PathBuf>, archive: &Archive) -> PathBuf {
    rules
        .clone()
        .unwrap_or_else(|| archive.root().join("rules"))
}

pub fn build_remote(config: &Config) -> Result<HttpRemoteClient> {
    let token = config.require_token()?;
    HttpRemoteClient::new(&config.base_url, token)
}
