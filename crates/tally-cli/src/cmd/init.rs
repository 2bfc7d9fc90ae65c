use std::path::Path;

use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use tally_core::config::{EffectiveConfig, EngineConfig, TALLY_DIR};

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing `.tally/config.toml`.
    #[arg(long)]
    pub force: bool,
}

const GITIGNORE: &str = "*.sqlite3\n*.sqlite3-wal\n*.sqlite3-shm\n";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitOutput {
    success: bool,
    config: String,
    store: String,
}

/// Execute `tally init`. Creates the project skeleton:
///
/// ```text
/// .tally/
///   config.toml       (engine defaults)
///   .gitignore        (store files)
///   events.sqlite3    (migrated, empty)
/// ```
///
/// # Errors
///
/// Returns an error if the config exists and `--force` is not set, or if any
/// filesystem or store operation fails.
pub fn run_init(
    args: &InitArgs,
    output: OutputMode,
    config: &EffectiveConfig,
    project_root: &Path,
) -> Result<()> {
    let tally_dir = project_root.join(TALLY_DIR);
    let config_path = tally_dir.join("config.toml");

    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists. Use `tally init --force` to overwrite.",
            config_path.display()
        );
    }

    std::fs::create_dir_all(&tally_dir)
        .with_context(|| format!("Failed to create {}", tally_dir.display()))?;

    let defaults = toml::to_string_pretty(&EngineConfig::default())
        .context("Failed to render default config")?;
    std::fs::write(&config_path, defaults)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    let gitignore = tally_dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE)
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }

    // Opening runs the migrations.
    crate::cmd::open_ledger(config)?;
    tracing::info!(store = %config.store_path.display(), "initialized tally project");

    let result = InitOutput {
        success: true,
        config: config_path.display().to_string(),
        store: config.store_path.display().to_string(),
    };
    render_mode(
        output,
        &result,
        |r, w| writeln!(w, "initialized {}", r.store),
        |r, w| {
            pretty_section(w, "Initialized tally project")?;
            pretty_kv(w, "config", &r.config)?;
            pretty_kv(w, "store", &r.store)
        },
    )
}
