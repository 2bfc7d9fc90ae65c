use std::fmt;

use chrono::{DateTime, Utc};

use crate::diff::DiffError;
use crate::sync::resolve::Conflict;

/// Machine-readable error codes for API mapping and operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    EntityNotFound,
    HistoryPruned,
    ConcurrentVersionConflict,
    TooManyConflicts,
    UnresolvedConflict,
    MalformedDelta,
    IntegrityViolation,
    StorageFailure,
    SerializationFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "E1001",
            Self::EntityNotFound => "E2001",
            Self::HistoryPruned => "E2002",
            Self::ConcurrentVersionConflict => "E3001",
            Self::TooManyConflicts => "E3002",
            Self::UnresolvedConflict => "E3003",
            Self::MalformedDelta => "E4001",
            Self::IntegrityViolation => "E4002",
            Self::StorageFailure => "E5001",
            Self::SerializationFailure => "E5002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::BadRequest => "Invalid request",
            Self::EntityNotFound => "Entity not found",
            Self::HistoryPruned => "History pruned before requested boundary",
            Self::ConcurrentVersionConflict => "Concurrent version conflict",
            Self::TooManyConflicts => "Too many append conflicts",
            Self::UnresolvedConflict => "Unresolved sync conflict",
            Self::MalformedDelta => "Malformed delta",
            Self::IntegrityViolation => "Event chain integrity violation",
            Self::StorageFailure => "Event store failure",
            Self::SerializationFailure => "Payload serialization failure",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and clients.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::BadRequest => Some("Supply exactly one of `v` or `time`."),
            Self::EntityNotFound => None,
            Self::HistoryPruned => {
                Some("Query a version or time at or after the earliest retained snapshot.")
            }
            Self::ConcurrentVersionConflict => Some("Re-read the entity head and retry."),
            Self::TooManyConflicts => {
                Some("Another writer is hammering this entity. Retry after it settles.")
            }
            Self::UnresolvedConflict => {
                Some("Pick a value for each conflicting path and push again.")
            }
            Self::MalformedDelta => Some("The delta references paths missing from its base."),
            Self::IntegrityViolation => {
                Some("Do not write to this entity until an operator inspects the chain.")
            }
            Self::StorageFailure => Some("Check disk space and database permissions."),
            Self::SerializationFailure => {
                Some("Retry once. If persistent, report a bug with logs.")
            }
        }
    }

    /// HTTP status the surrounding API layer should answer with.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::BadRequest | Self::MalformedDelta => 400,
            Self::EntityNotFound => 404,
            Self::ConcurrentVersionConflict | Self::UnresolvedConflict => 409,
            Self::HistoryPruned => 410,
            Self::IntegrityViolation => 422,
            Self::TooManyConflicts => 503,
            Self::StorageFailure | Self::SerializationFailure => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the ledger engine.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The request shape was rejected before touching the store.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No events exist for the entity.
    #[error("no events recorded for entity {entity_id}")]
    NotFound { entity_id: String },

    /// The requested boundary predates the retained chain.
    #[error(
        "history for {entity_id} was pruned; earliest available is version {earliest_version} at {earliest_timestamp}"
    )]
    HistoryPruned {
        entity_id: String,
        earliest_version: u64,
        earliest_timestamp: DateTime<Utc>,
    },

    /// Another writer claimed the version this append was going to take.
    #[error("version {attempted_version} of {entity_id} was claimed concurrently")]
    ConcurrentVersionConflict {
        entity_id: String,
        attempted_version: u64,
    },

    /// Append retries were exhausted.
    #[error("gave up appending to {entity_id} after {attempts} conflicting attempts")]
    TooManyConflicts { entity_id: String, attempts: u32 },

    /// A sync push left paths that need a manual decision.
    #[error("{} unresolved conflict(s) on {entity_id}", conflicts.len())]
    UnresolvedConflict {
        entity_id: String,
        conflicts: Vec<Conflict>,
    },

    /// A delta could not be applied to its base.
    #[error(transparent)]
    MalformedDelta(#[from] DiffError),

    /// The checksum chain is broken.
    #[error("integrity violation in {entity_id} at version {version}")]
    IntegrityViolation { entity_id: String, version: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::NotFound { .. } => ErrorCode::EntityNotFound,
            Self::HistoryPruned { .. } => ErrorCode::HistoryPruned,
            Self::ConcurrentVersionConflict { .. } => ErrorCode::ConcurrentVersionConflict,
            Self::TooManyConflicts { .. } => ErrorCode::TooManyConflicts,
            Self::UnresolvedConflict { .. } => ErrorCode::UnresolvedConflict,
            Self::MalformedDelta(_) => ErrorCode::MalformedDelta,
            Self::IntegrityViolation { .. } => ErrorCode::IntegrityViolation,
            Self::Storage(_) => ErrorCode::StorageFailure,
            Self::Serialization(_) => ErrorCode::SerializationFailure,
        }
    }

    /// Stable kind name, matching the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound { .. } => "NotFound",
            Self::HistoryPruned { .. } => "HistoryPruned",
            Self::ConcurrentVersionConflict { .. } => "ConcurrentVersionConflict",
            Self::TooManyConflicts { .. } => "TooManyConflicts",
            Self::UnresolvedConflict { .. } => "UnresolvedConflict",
            Self::MalformedDelta(_) => "MalformedDelta",
            Self::IntegrityViolation { .. } => "IntegrityViolation",
            Self::Storage(_) => "Storage",
            Self::Serialization(_) => "Serialization",
        }
    }

    /// Optional remediation hint for operators and clients.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Returns `true` when the failure is a single version race worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentVersionConflict { .. })
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
