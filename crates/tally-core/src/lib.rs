//! tally-core: a tamper-evident, replayable event ledger.
//!
//! Every mutation of a tracked entity (transaction, budget, workspace) is an
//! immutable [`Event`] in a per-entity, BLAKE3-linked chain. On top of the
//! chain sit point-in-time [`replay`], [`verify`]ication, multi-device
//! [`sync`] with per-path conflict resolution, and [`retention`] pruning.
//!
//! # Conventions
//!
//! - **Errors**: [`LedgerError`] inside the engine; `anyhow::Result` at the
//!   configuration and open boundary.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod api;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod event;
pub mod ledger;
pub mod replay;
pub mod retention;
pub mod store;
pub mod sync;
pub mod verify;

pub use error::{ErrorCode, LedgerError, Result};
pub use event::{EntityType, Event, EventId, EventMetadata, EventType, NewEvent, Payload};
pub use ledger::{Ledger, StateChange};
pub use store::{Bound, EventStore};
