#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{OutputMode, resolve_output_mode};
use std::env;
use tally_core::config;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tally: tamper-evident event ledger for multi-device finance data",
    long_about = None
)]
struct Cli {
    /// Emit JSON output (the API envelopes) instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Output format. Overrides `--json`, `FORMAT` and the user config.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a tally project",
        long_about = "Create .tally/ with a default config and an empty, migrated event store.",
        after_help = "EXAMPLES:\n    # Initialize in the current directory\n    tally init\n\n    # Rewrite the config with defaults\n    tally init --force"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Write",
        about = "Record a full entity state",
        long_about = "Record a new full state for an entity. The first write is a snapshot; later writes are stored as deltas against the head.",
        after_help = "EXAMPLES:\n    # Create a transaction\n    tally record transaction tx-1 --data '{\"amount\": 100}'\n\n    # Update from a file\n    tally record transaction tx-1 --data @tx-1.json"
    )]
    Record(cmd::record::RecordArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Push a device's view of an entity",
        long_about = "Merge a device's view of an entity with concurrent changes from other devices. Disjoint edits merge; overlapping edits resolve by last-write-wins or are reported as conflicts.",
        after_help = "EXAMPLES:\n    # Push an edit made from version 3\n    tally push transaction tx-2 --user u1 --device phone --base 3 --data @tx-2.json\n\n    # Refuse to park conflicts\n    tally push transaction tx-2 --user u1 --device phone --data @tx-2.json --strict"
    )]
    Push(cmd::push::PushArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Pull changes since a feed position",
        long_about = "List every change after --since in commit order. Pass the returned `v` as --since next time.",
        after_help = "EXAMPLES:\n    # Full feed\n    tally pull --user u1 --device phone\n\n    # Incremental\n    tally pull --user u1 --device phone --since 42 --json"
    )]
    Pull(cmd::pull::PullArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Soft-delete an entity",
        long_about = "Append a DELETED event that sets /isDeleted. History is kept and remains replayable.",
        after_help = "EXAMPLES:\n    tally delete transaction tx-1 --user u1 --device phone"
    )]
    Delete(cmd::delete::DeleteArgs),

    #[command(
        next_help_heading = "Read",
        about = "Rebuild an entity's state",
        long_about = "Rebuild an entity's state at its head, at a version, or at a point in time.",
        after_help = "EXAMPLES:\n    # Current state\n    tally replay tx-1\n\n    # As of version 3\n    tally replay tx-1 --at-version 3\n\n    # As of a timestamp\n    tally replay tx-1 --at 2024-06-01T12:00:00Z --json"
    )]
    Replay(cmd::replay::ReplayArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show an entity's audit trail",
        long_about = "List every retained event for an entity: who changed what, when.",
        after_help = "EXAMPLES:\n    tally audit tx-1\n    tally audit tx-1 --format text"
    )]
    Audit(cmd::audit::AuditArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Verify checksum chains",
        long_about = "Recompute every checksum and check chain links. Exits non-zero if any chain is broken.",
        after_help = "EXAMPLES:\n    # Every entity\n    tally verify\n\n    # One entity\n    tally verify tx-1 --json"
    )]
    Verify(cmd::verify::VerifyArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Collapse old history into snapshots",
        long_about = "Replace events older than the cutoff with one snapshot per entity. Replays at or after the snapshot are unchanged.",
        after_help = "EXAMPLES:\n    # Use retention.max_age_days from .tally/config.toml\n    tally prune\n\n    # Explicit cutoff for one entity\n    tally prune --entity tx-1 --older-than 2024-01-01T00:00:00Z"
    )]
    Prune(cmd::prune::PruneArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "tally=debug,tally_core=debug,info"
        } else {
            "tally=info,tally_core=info,warn"
        })
    });

    let format = env::var("TALLY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // Logs go to stderr so stdout stays parseable.
    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let project_root = env::current_dir()?;
    let effective = config::resolve_config(&project_root, cli.json)?;
    let output = resolve_output_mode(cli.format, &effective.resolved_output);
    debug!(store = %effective.store_path.display(), ?output, "resolved config");

    match cli.command {
        Commands::Init(ref args) => cmd::init::run_init(args, output, &effective, &project_root),
        Commands::Record(ref args) => {
            cmd::record::run_record(args, output, &effective, &project_root)
        }
        Commands::Push(ref args) => cmd::push::run_push(args, output, &effective, &project_root),
        Commands::Pull(ref args) => cmd::pull::run_pull(args, output, &effective),
        Commands::Delete(ref args) => cmd::delete::run_delete(args, output, &effective),
        Commands::Replay(ref args) => cmd::replay::run_replay(args, output, &effective),
        Commands::Audit(ref args) => cmd::audit::run_audit(args, output, &effective),
        Commands::Verify(ref args) => cmd::verify::run_verify(args, output, &effective),
        Commands::Prune(ref args) => cmd::prune::run_prune(args, output, &effective),
    }
}
