//! Engine and user configuration.
//!
//! Project settings live in `.tally/config.toml` under the project root;
//! per-user defaults (actor, device, output mode) live in
//! `<config_dir>/tally/config.toml`. Every field has a default, so both files
//! are optional and may be partial.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::diff::DiffOptions;

/// Directory under the project root holding the store and project config.
pub const TALLY_DIR: &str = ".tally";

/// Environment variable overriding the store path.
pub const DB_ENV: &str = "TALLY_DB";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub append: AppendConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store file, relative to the project root unless absolute.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendConfig {
    /// Attempts after the first before giving up with `TooManyConflicts`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff step: attempt `n` sleeps `n * backoff_ms`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for AppendConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl AppendConfig {
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Timestamps this close on an overlapping path are a conflict, not a
    /// last-write-wins decision. `0` means only identical timestamps tie.
    #[serde(default)]
    pub clock_tolerance_ms: u64,
    /// Array field → element key, e.g. `splits = "id"`.
    #[serde(default)]
    pub merge_keys: BTreeMap<String, String>,
}

impl SyncConfig {
    #[must_use]
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            merge_keys: self.merge_keys.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Events older than this many days are pruned by `prune --all`.
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub engine: EngineConfig,
    pub user: UserConfig,
    pub store_path: PathBuf,
    pub resolved_output: String,
}

/// Load `.tally/config.toml` under `project_root`, or defaults if absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_engine_config(project_root: &Path) -> Result<EngineConfig> {
    let path = project_root.join(TALLY_DIR).join("config.toml");
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load the per-user config, or defaults if there is none.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("tally/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Merge project config, user config and environment.
///
/// # Errors
///
/// Returns an error if either config file is unreadable or invalid.
pub fn resolve_config(project_root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let engine = load_engine_config(project_root)?;
    let user = load_user_config()?;

    let store_path = resolve_store_path(project_root, &engine, env::var(DB_ENV).ok());
    let resolved_output = resolve_output(cli_json, user.output.as_deref(), env::var("FORMAT").ok());

    Ok(EffectiveConfig {
        engine,
        user,
        store_path,
        resolved_output,
    })
}

/// `TALLY_DB` wins; otherwise the configured path, anchored at the root.
#[must_use]
pub fn resolve_store_path(
    project_root: &Path,
    engine: &EngineConfig,
    env_override: Option<String>,
) -> PathBuf {
    if let Some(raw) = env_override.filter(|s| !s.trim().is_empty()) {
        return PathBuf::from(raw);
    }
    if engine.store.path.is_absolute() {
        engine.store.path.clone()
    } else {
        project_root.join(&engine.store.path)
    }
}

fn resolve_output(cli_json: bool, user_output: Option<&str>, env_format: Option<String>) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "plain" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(TALLY_DIR).join("events.sqlite3")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_backoff_ms() -> u64 {
    10
}
