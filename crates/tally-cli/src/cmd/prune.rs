use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use tally_core::config::EffectiveConfig;
use tally_core::retention::{self, PruneReport};

use crate::cmd::{open_ledger, parse_time};
use crate::output::{OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Only prune this entity. Prunes every entity when omitted.
    #[arg(long)]
    pub entity: Option<String>,

    /// Collapse events older than this RFC 3339 timestamp. Defaults to
    /// `retention.max_age_days` from the project config.
    #[arg(long, value_name = "RFC3339")]
    pub older_than: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PruneOutput {
    success: bool,
    cutoff: DateTime<Utc>,
    reports: Vec<PruneReport>,
}

fn report_line(w: &mut dyn Write, report: &PruneReport) -> std::io::Result<()> {
    match report.snapshot_version {
        Some(version) => writeln!(
            w,
            "{}\tsnapshot v{version}\tremoved {}",
            report.entity_id, report.removed_events
        ),
        None => writeln!(w, "{}\tuntouched", report.entity_id),
    }
}

/// Execute `tally prune`.
///
/// # Errors
///
/// Returns an error if no cutoff can be determined or a prune transaction fails.
pub fn run_prune(args: &PruneArgs, output: OutputMode, config: &EffectiveConfig) -> Result<()> {
    let cutoff = match &args.older_than {
        Some(raw) => Some(parse_time("older-than", raw)?),
        None => retention::cutoff(&config.engine.retention, Utc::now()),
    };
    let Some(cutoff) = cutoff else {
        anyhow::bail!(
            "no cutoff: pass --older-than or set retention.max_age_days in .tally/config.toml"
        );
    };

    let mut ledger = open_ledger(config)?;
    let reports = match &args.entity {
        Some(id) => vec![ledger.prune(id, cutoff).map_err(|e| fail(output, e))?],
        None => ledger.prune_all(cutoff).map_err(|e| fail(output, e))?,
    };
    tracing::info!(
        %cutoff,
        entities = reports.len(),
        pruned = reports.iter().filter(|r| r.snapshot_version.is_some()).count(),
        "retention pass complete"
    );

    let result = PruneOutput {
        success: true,
        cutoff,
        reports,
    };
    render_mode(
        output,
        &result,
        |r, w| {
            for report in &r.reports {
                report_line(w, report)?;
            }
            Ok(())
        },
        |r, w| {
            pretty_section(w, "Retention")?;
            pretty_kv(w, "cutoff", cutoff.to_rfc3339())?;
            for report in &r.reports {
                report_line(w, report)?;
            }
            let removed: u64 = r.reports.iter().map(|p| p.removed_events).sum();
            pretty_kv(w, "removed", removed.to_string())
        },
    )
}
