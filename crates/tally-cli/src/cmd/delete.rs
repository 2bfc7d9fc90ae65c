
use anyhow::Result;
use clap::Args;
use tally_core::EntityType;
use tally_core::config::EffectiveConfig;
use tally_core::replay::AuditEntry;
use tally_core::sync::{DeleteRequest, UNKNOWN_DEVICE};

use crate::cmd::{IdentityArgs, open_ledger};
use crate::output::{OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Entity type: transaction, budget or workspace.
    pub entity_type: EntityType,

    /// Entity ID.
    pub entity_id: String,

    /// Account the device syncs for.
    #[arg(long)]
    pub user: String,

    #[command(flatten)]
    pub identity: IdentityArgs,
}

/// Execute `tally delete`: append a soft-delete marker. History is kept.
///
/// # Errors
///
/// Returns an error if the entity does not exist or the append fails.
pub fn run_delete(args: &DeleteArgs, output: OutputMode, config: &EffectiveConfig) -> Result<()> {
    let device = args
        .identity
        .device(config)
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
    let req = DeleteRequest::new(
        &args.user,
        device,
        args.identity.actor(config),
        args.entity_type,
        &args.entity_id,
    );

    let mut ledger = open_ledger(config)?;
    let event = ledger.delete(&req).map_err(|e| fail(output, e))?;
    let log = AuditEntry::from(&event);

    render_mode(
        output,
        &serde_json::json!({ "success": true, "log": log }),
        |_, w| writeln!(w, "{}\tv{}\t{}", args.entity_id, log.version, log.event_type),
        |_, w| {
            pretty_section(w, &format!("Delete {}", args.entity_id))?;
            pretty_kv(w, "version", log.version.to_string())?;
            pretty_kv(w, "event", &log.event_type)
        },
    )
}
