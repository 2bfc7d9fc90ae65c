
use anyhow::Result;
use clap::Args;
use tally_core::api::{ReplayQuery, ReplayResponse};
use tally_core::config::EffectiveConfig;
use tally_core::store::Bound;

use crate::cmd::open_ledger;
use crate::output::{OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Entity ID.
    pub entity_id: String,

    /// Rebuild the state as of this version.
    #[arg(long, value_name = "N")]
    pub at_version: Option<u64>,

    /// Rebuild the state as of this RFC 3339 timestamp.
    #[arg(long, value_name = "RFC3339")]
    pub at: Option<String>,
}

impl ReplayArgs {
    fn query(&self) -> Option<ReplayQuery> {
        if self.at.is_none() && self.at_version.is_none() {
            return None;
        }
        Some(ReplayQuery {
            time: self.at.clone(),
            v: self.at_version,
        })
    }
}

/// Execute `tally replay <id>`. Without a boundary the head state is shown.
///
/// # Errors
///
/// Returns an error for an invalid boundary, pruned history, or a chain that
/// cannot be folded.
pub fn run_replay(args: &ReplayArgs, output: OutputMode, config: &EffectiveConfig) -> Result<()> {
    let bound = match args.query() {
        Some(query) => query.boundary().map_err(|e| fail(output, e))?,
        None => Bound::Latest,
    };
    let ledger = open_ledger(config)?;
    let state = ledger
        .replay(&args.entity_id, bound)
        .map_err(|e| fail(output, e))?;

    let response = ReplayResponse::new(state);
    render_mode(
        output,
        &response,
        |r, w| match &r.data {
            Some(state) => writeln!(w, "{state}"),
            None => writeln!(w, "null"),
        },
        |r, w| {
            pretty_section(w, &format!("Replay {}", args.entity_id))?;
            pretty_kv(w, "boundary", describe(bound))?;
            match &r.data {
                Some(state) => {
                    let body = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;
                    writeln!(w, "{body}")
                }
                None => pretty_kv(w, "state", "(did not exist)"),
            }
        },
    )
}

fn describe(bound: Bound) -> String {
    match bound {
        Bound::Latest => "latest".to_string(),
        Bound::Version(v) => format!("version {v}"),
        Bound::Time(t) => t.to_rfc3339(),
    }
}
