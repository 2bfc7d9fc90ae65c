
use anyhow::Result;
use clap::Args;
use tally_core::api::AuditResponse;
use tally_core::config::EffectiveConfig;
use tally_core::replay::{AuditEntry, ChangeSummary, FULL_SNAPSHOT};

use crate::cmd::open_ledger;
use crate::output::{OutputMode, fail, pretty_rule, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Entity ID.
    pub entity_id: String,
}

fn summary(entry: &AuditEntry) -> String {
    match &entry.change_summary {
        ChangeSummary::FullSnapshot => FULL_SNAPSHOT.to_string(),
        ChangeSummary::Paths(paths) => paths.join(","),
    }
}

/// Execute `tally audit <id>`: one line per retained event, oldest first.
///
/// # Errors
///
/// Returns an error if the trail cannot be read.
pub fn run_audit(args: &AuditArgs, output: OutputMode, config: &EffectiveConfig) -> Result<()> {
    let ledger = open_ledger(config)?;
    let entries = ledger
        .audit_trail(&args.entity_id)
        .map_err(|e| fail(output, e))?;

    render_mode(
        output,
        &AuditResponse::new(entries),
        |r, w| {
            for entry in &r.data {
                writeln!(
                    w,
                    "{}\t{}\t{}\t{}\t{}",
                    entry.version,
                    entry.event_type,
                    entry.timestamp.to_rfc3339(),
                    entry.actor,
                    summary(entry)
                )?;
            }
            Ok(())
        },
        |r, w| {
            pretty_section(w, &format!("Audit trail for {}", args.entity_id))?;
            if r.data.is_empty() {
                return writeln!(w, "(no events)");
            }
            for entry in &r.data {
                writeln!(
                    w,
                    "v{:<4} {:<26} {} by {}",
                    entry.version,
                    entry.event_type,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    entry.actor
                )?;
                writeln!(w, "      {}", summary(entry))?;
                for lost in &entry.superseded {
                    let value = lost
                        .value
                        .as_ref()
                        .map_or_else(|| "(removed)".to_string(), ToString::to_string);
                    writeln!(w, "      superseded {} = {value} by {}", lost.path, lost.actor)?;
                }
            }
            pretty_rule(w)
        },
    )
}
