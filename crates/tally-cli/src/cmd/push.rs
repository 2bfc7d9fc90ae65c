//! `tally push`: submit a device's view of an entity through the sync path.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tally_core::EntityType;
use tally_core::api::PushResponse;
use tally_core::config::EffectiveConfig;
use tally_core::sync::{PushOutcome, PushRequest, UNKNOWN_DEVICE};

use crate::cmd::{IdentityArgs, open_ledger, parse_time, read_state};
use crate::output::{OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Entity type: transaction, budget or workspace.
    pub entity_type: EntityType,

    /// Entity ID.
    pub entity_id: String,

    /// Device's full state as JSON, `@file`, or `-` for stdin.
    #[arg(long)]
    pub data: String,

    /// Account the device syncs for.
    #[arg(long)]
    pub user: String,

    /// Version the data was edited from.
    #[arg(long, value_name = "N")]
    pub base: Option<u64>,

    /// Device clock time of the edit (RFC 3339). Defaults to now.
    #[arg(long, value_name = "RFC3339")]
    pub at: Option<String>,

    /// Fail instead of parking conflicting paths.
    #[arg(long)]
    pub strict: bool,

    #[arg(long)]
    pub correlation: Option<String>,

    #[command(flatten)]
    pub identity: IdentityArgs,
}

impl PushArgs {
    fn request(&self, config: &EffectiveConfig, project_root: &Path) -> Result<PushRequest> {
        let data = read_state(&self.data, project_root)?;
        let device = self
            .identity
            .device(config)
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
        let mut req = PushRequest::new(
            &self.user,
            device,
            self.identity.actor(config),
            self.entity_type,
            &self.entity_id,
            data,
        );
        if let Some(base) = self.base {
            req = req.based_on(base);
        }
        if let Some(raw) = &self.at {
            req = req.at(parse_time("at", raw)?);
        }
        if let Some(correlation) = &self.correlation {
            req = req.with_correlation(correlation);
        }
        Ok(req)
    }
}

/// # Errors
///
/// Returns an error for unreadable input, a rejected request, a strict push
/// with conflicts, or a storage failure.
pub fn run_push(
    args: &PushArgs,
    output: OutputMode,
    config: &EffectiveConfig,
    project_root: &Path,
) -> Result<()> {
    let req = args.request(config, project_root)?;
    let mut ledger = open_ledger(config)?;
    let outcome: PushOutcome = if args.strict {
        ledger.push_strict(&req)
    } else {
        ledger.push(&req)
    }
    .map_err(|e| fail(output, e))?;

    let response = PushResponse::from(outcome);
    render_mode(
        output,
        &response,
        |r, w| {
            writeln!(w, "{}\t{}\tv{}", args.entity_id, r.action, r.version)?;
            for conflict in &r.conflicts {
                let count = conflict.candidates.len();
                writeln!(w, "conflict\t{}\t{count} candidates", conflict.path)?;
            }
            Ok(())
        },
        |r, w| {
            pretty_section(w, &format!("Push {}", args.entity_id))?;
            pretty_kv(w, "action", r.action.as_str())?;
            pretty_kv(w, "version", r.version.to_string())?;
            for conflict in &r.conflicts {
                pretty_kv(w, "conflict", &conflict.path)?;
                for candidate in &conflict.candidates {
                    let value = candidate
                        .value
                        .as_ref()
                        .map_or_else(|| "(removed)".to_string(), ToString::to_string);
                    writeln!(
                        w,
                        "             {value} from {}",
                        candidate.device_id.as_deref().unwrap_or(UNKNOWN_DEVICE)
                    )?;
                }
            }
            let entity = serde_json::to_string_pretty(&r.entity).map_err(std::io::Error::other)?;
            writeln!(w, "{entity}")
        },
    )
}
