//! Multi-device sync: concurrency detection, conflict resolution and the
//! push/pull/delete flows built on them.

pub mod clock;
pub mod record;
pub mod resolve;
pub mod service;

pub use clock::{Causality, UNKNOWN_DEVICE, VersionVector};
pub use record::SyncRecord;
pub use resolve::{Candidate, Conflict, PendingDelta, Resolution, resolve};
pub use service::{
    DEFAULT_PULL_LIMIT, DELETED_FLAG, DeleteRequest, PullOutcome, PullRequest, PushOutcome,
    PushRequest, SyncAction, delete, pull, push, push_strict,
};
