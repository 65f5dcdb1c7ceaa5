use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FinchError, Result};

pub const TOKEN_VAR: &str = "FINCH_API_TOKEN";
pub const BASE_URL_VAR: &str = "FINCH_BASE_URL";
pub const OUTPUT_DIR_VAR: &str = "FINCH_OUTPUT_DIR";

const DEFAULT_BASE_URL: &str = "https://api.pocketsmith.com/v2";
const SETTINGS_FILE: &str = ".config/finch/settings.json";

/// On-disk settings. Every key is optional; the environment overrides any
/// of them at load time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Concurrency ceiling for push PATCH dispatch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

/// Settings are optional: a missing or unparseable file must not block
/// local-only commands, so any failure falls back to defaults.
fn read_settings(path: &Path) -> Option<Settings> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Effective runtime configuration: `~/.config/finch/settings.json`
/// overlaid per-key by `FINCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_token: Option<String>,
    pub base_url: String,
    pub output_dir: Option<PathBuf>,
    pub concurrency: usize,
}

impl Config {
    pub fn load() -> Config {
        let settings = dirs::home_dir()
            .map(|home| home.join(SETTINGS_FILE))
            .and_then(|path| read_settings(&path))
            .unwrap_or_default();
        Config::resolve(settings)
    }

    fn resolve(settings: Settings) -> Config {
        let api_token = std::env::var(TOKEN_VAR).ok().or(settings.api_token);
        let base_url = std::env::var(BASE_URL_VAR)
            .ok()
            .or(settings.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let output_dir = std::env::var(OUTPUT_DIR_VAR)
            .ok()
            .or(settings.output_dir)
            .map(PathBuf::from);
        let concurrency = settings.concurrency.max(1);
        Config {
            api_token,
            base_url,
            output_dir,
            concurrency,
        }
    }

    /// Token for remote commands; absent for purely local ones.
    pub fn require_token(&self) -> Result<&str> {
        self.api_token.as_deref().ok_or_else(|| {
            FinchError::UserInput(format!("{TOKEN_VAR} is not set (remote API token required)"))
        })
    }
}
