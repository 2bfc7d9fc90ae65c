use std::io::Write;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tally_core::api::VerifyResponse;
use tally_core::config::EffectiveConfig;
use tally_core::event::EventId;
use tally_core::verify::{BreakReason, VerifyReport};

use crate::cmd::open_ledger;
use crate::output::{OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Entity to check. Checks every entity when omitted.
    pub entity_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyAllOutput {
    success: bool,
    valid: bool,
    reports: Vec<VerifyReport>,
}

fn reason_text(reason: &BreakReason) -> String {
    match reason {
        BreakReason::ChecksumMismatch { stored, computed } => {
            format!("checksum mismatch (stored {stored}, computed {computed})")
        }
        BreakReason::BrokenLink { expected, found } => format!(
            "broken link (expected {}, found {})",
            expected.as_ref().map_or("none", EventId::as_str),
            found.as_ref().map_or("none", EventId::as_str)
        ),
        BreakReason::VersionGap { expected, found } => {
            format!("version gap (expected {expected}, found {found})")
        }
        BreakReason::UnexpectedOrigin => "chain does not start at an origin".to_string(),
        BreakReason::StrayPruneMarker => "prune marker past the chain origin".to_string(),
    }
}

fn report_line(w: &mut dyn Write, report: &VerifyReport) -> std::io::Result<()> {
    match (report.broken_at_version, &report.reason) {
        (Some(version), Some(reason)) => writeln!(
            w,
            "FAIL {} at v{version}: {}",
            report.entity_id,
            reason_text(reason)
        ),
        (Some(version), None) => writeln!(w, "FAIL {} at v{version}", report.entity_id),
        _ => writeln!(w, "OK   {} ({} events)", report.entity_id, report.checked),
    }
}

/// Execute `tally verify [id]`.
///
/// # Errors
///
/// Returns an error when any checked chain is broken, the entity does not
/// exist, or the store cannot be read.
pub fn run_verify(args: &VerifyArgs, output: OutputMode, config: &EffectiveConfig) -> Result<()> {
    let ledger = open_ledger(config)?;

    let reports = match &args.entity_id {
        Some(id) => {
            let report = ledger.verify(id).map_err(|e| fail(output, e))?;
            render_mode(
                output,
                &VerifyResponse::from(&report),
                |_, w| report_line(w, &report),
                |r, w| {
                    pretty_section(w, &format!("Verify {}", report.entity_id))?;
                    pretty_kv(w, "valid", r.valid.to_string())?;
                    pretty_kv(w, "checked", report.checked.to_string())?;
                    if let Some(reason) = &report.reason {
                        pretty_kv(w, "reason", reason_text(reason))?;
                    }
                    Ok(())
                },
            )?;
            vec![report]
        }
        None => {
            let reports = ledger.verify_all().map_err(|e| fail(output, e))?;
            let result = VerifyAllOutput {
                success: true,
                valid: reports.iter().all(|r| r.valid),
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
                    pretty_section(w, "Verify all entities")?;
                    for report in &r.reports {
                        report_line(w, report)?;
                    }
                    pretty_kv(w, "entities", r.reports.len().to_string())
                },
            )?;
            result.reports
        }
    };

    let broken = reports.iter().filter(|r| !r.valid).count();
    if broken == 0 {
        Ok(())
    } else {
        anyhow::bail!("verify: {broken} broken chain(s)");
    }
}
