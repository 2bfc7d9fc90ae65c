pub mod audit;
pub mod delete;
pub mod init;
pub mod prune;
pub mod pull;
pub mod push;
pub mod record;
pub mod replay;
pub mod verify;

use std::io::Read as _;
use std::path::Path;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::Value;
use tally_core::Ledger;
use tally_core::config::EffectiveConfig;

/// Who is writing, shared by every mutating command.
#[derive(Args, Debug, Clone, Default)]
pub struct IdentityArgs {
    /// Actor recorded on written events. Falls back to the user config,
    /// then `$USER`.
    #[arg(long)]
    pub actor: Option<String>,

    /// Device the write originates from. Falls back to the user config.
    #[arg(long)]
    pub device: Option<String>,
}

impl IdentityArgs {
    pub fn actor(&self, config: &EffectiveConfig) -> String {
        self.actor
            .clone()
            .or_else(|| config.user.actor.clone())
            .or_else(|| std::env::var("USER").ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "tally".to_string())
    }

    pub fn device(&self, config: &EffectiveConfig) -> Option<String> {
        self.device
            .clone()
            .or_else(|| config.user.device_id.clone())
    }
}

/// Open the ledger the effective config points at.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or migrated.
pub fn open_ledger(config: &EffectiveConfig) -> Result<Ledger> {
    Ledger::from_config(config)
}

/// Read an entity state given inline, as `@path`, or as `-` for stdin.
///
/// # Errors
///
/// Returns an error if the source cannot be read or is not a JSON object.
pub fn read_state(raw: &str, cwd: &Path) -> Result<Value> {
    let text = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read state from stdin")?;
        buf
    } else if let Some(file) = raw.strip_prefix('@') {
        let path = cwd.join(file);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?
    } else {
        raw.to_string()
    };

    let value: Value = serde_json::from_str(&text).context("state is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("state must be a JSON object");
    }
    Ok(value)
}

/// Parse an RFC 3339 timestamp flag.
///
/// # Errors
///
/// Returns an error naming the flag if parsing fails.
pub fn parse_time(flag: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("--{flag} expects an RFC 3339 timestamp, got '{raw}'"))
}
