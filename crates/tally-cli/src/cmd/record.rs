//! `tally record`: write a full entity state to the ledger.
//!
//! The first write of an entity is stored as a snapshot; later writes are
//! diffed against the replayed head and stored as deltas.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tally_core::config::EffectiveConfig;
use tally_core::replay::AuditEntry;
use tally_core::{EntityType, EventMetadata, StateChange};

use crate::cmd::{IdentityArgs, open_ledger, read_state};
use crate::output::{OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Entity type: transaction, budget or workspace.
    pub entity_type: EntityType,

    /// Entity ID.
    pub entity_id: String,

    /// New full state as JSON, `@file`, or `-` for stdin.
    #[arg(long)]
    pub data: String,

    /// Correlation ID stored on the event.
    #[arg(long)]
    pub correlation: Option<String>,

    #[command(flatten)]
    pub identity: IdentityArgs,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordOutput {
    success: bool,
    changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<AuditEntry>,
}

/// # Errors
///
/// Returns an error if the state is unreadable or the append fails.
pub fn run_record(
    args: &RecordArgs,
    output: OutputMode,
    config: &EffectiveConfig,
    project_root: &Path,
) -> Result<()> {
    let state = read_state(&args.data, project_root)?;
    let mut ledger = open_ledger(config)?;

    let mut metadata = EventMetadata::at(chrono::Utc::now());
    metadata.device_id = args.identity.device(config);
    metadata.correlation_id.clone_from(&args.correlation);

    let change = StateChange {
        entity_type: args.entity_type,
        entity_id: args.entity_id.clone(),
        state,
        actor: args.identity.actor(config),
        metadata,
    };
    let event = ledger.record_state(change).map_err(|e| fail(output, e))?;

    let result = RecordOutput {
        success: true,
        changed: event.is_some(),
        log: event.as_ref().map(AuditEntry::from),
    };
    render_mode(
        output,
        &result,
        |r, w| match &r.log {
            Some(log) => writeln!(w, "{}\t{}\t{}", args.entity_id, log.version, log.event_type),
            None => writeln!(w, "{}\tunchanged", args.entity_id),
        },
        |r, w| {
            pretty_section(w, &format!("Record {}", args.entity_id))?;
            match &r.log {
                Some(log) => {
                    pretty_kv(w, "version", log.version.to_string())?;
                    pretty_kv(w, "event", &log.event_type)?;
                    pretty_kv(w, "actor", &log.actor)
                }
                None => pretty_kv(w, "status", "unchanged"),
            }
        },
    )
}
