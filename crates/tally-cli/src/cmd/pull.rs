
use anyhow::Result;
use clap::Args;
use tally_core::api::SyncDeltaResponse;
use tally_core::config::EffectiveConfig;
use tally_core::sync::{DEFAULT_PULL_LIMIT, PullRequest, UNKNOWN_DEVICE};

use crate::cmd::open_ledger;
use crate::output::{OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Account the device syncs for.
    #[arg(long)]
    pub user: String,

    /// Feed position already consumed (the `v` of the previous pull).
    #[arg(long, default_value_t = 0)]
    pub since: i64,

    /// Maximum number of changes to return.
    #[arg(long, default_value_t = DEFAULT_PULL_LIMIT)]
    pub limit: usize,

    /// Device pulling. Falls back to the user config.
    #[arg(long)]
    pub device: Option<String>,
}

/// Execute `tally pull`: every change after `--since`, oldest first.
///
/// # Errors
///
/// Returns an error for a rejected request or a storage failure.
pub fn run_pull(args: &PullArgs, output: OutputMode, config: &EffectiveConfig) -> Result<()> {
    let device = args
        .device
        .clone()
        .or_else(|| config.user.device_id.clone())
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
    let req = PullRequest::new(&args.user, device, args.since).with_limit(args.limit);

    let mut ledger = open_ledger(config)?;
    let outcome = ledger.pull(&req).map_err(|e| fail(output, e))?;

    render_mode(
        output,
        &SyncDeltaResponse::from(outcome),
        |r, w| {
            for change in &r.changes {
                writeln!(
                    w,
                    "{}\t{}\tv{}\t{}",
                    change.position,
                    change.event.entity_id,
                    change.event.version,
                    change.event.label()
                )?;
            }
            writeln!(w, "v\t{}", r.v)
        },
        |r, w| {
            pretty_section(w, "Pull")?;
            for change in &r.changes {
                writeln!(
                    w,
                    "#{:<6} {} v{} {}",
                    change.position,
                    change.event.entity_id,
                    change.event.version,
                    change.event.label()
                )?;
            }
            pretty_kv(w, "changes", r.count.to_string())?;
            pretty_kv(w, "next since", r.v.to_string())
        },
    )
}
