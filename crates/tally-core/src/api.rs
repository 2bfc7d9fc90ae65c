//! JSON envelopes for the HTTP surface.
//!
//! Every response carries `success`. Failures use [`ErrorEnvelope`], whose
//! HTTP status comes from the error's [`ErrorCode`](crate::error::ErrorCode).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LedgerError, Result};
use crate::event::Event;
use crate::replay::AuditEntry;
use crate::store::{Bound, FeedEntry};
use crate::sync::{Conflict, PullOutcome, PushOutcome, SyncAction};
use crate::verify::VerifyReport;

/// Query string of a replay request: exactly one of `time` or `v`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub v: Option<u64>,
}

impl ReplayQuery {
    /// The replay boundary this query names.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::BadRequest`] unless exactly one parameter is
    /// present, or if `time` is not RFC 3339.
    pub fn boundary(&self) -> Result<Bound> {
        match (&self.time, self.v) {
            (Some(_), Some(_)) => Err(LedgerError::BadRequest(
                "give either `time` or `v`, not both".into(),
            )),
            (None, None) => Err(LedgerError::BadRequest(
                "one of `time` or `v` is required".into(),
            )),
            (None, Some(v)) => Ok(Bound::Version(v)),
            (Some(raw), None) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Bound::Time(t.with_timezone(&Utc)))
                .map_err(|err| LedgerError::BadRequest(format!("invalid `time` '{raw}': {err}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayResponse {
    pub success: bool,
    /// `null` when nothing existed at the boundary.
    pub data: Option<Value>,
}

impl ReplayResponse {
    #[must_use]
    pub const fn new(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditResponse {
    pub success: bool,
    pub data: Vec<AuditEntry>,
}

impl AuditResponse {
    #[must_use]
    pub const fn new(data: Vec<AuditEntry>) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    pub valid: bool,
    pub broken_at_version: Option<u64>,
}

impl From<&VerifyReport> for VerifyResponse {
    fn from(report: &VerifyReport) -> Self {
        Self {
            success: true,
            valid: report.valid,
            broken_at_version: report.broken_at_version,
        }
    }
}

/// One feed entry: the event plus its cursor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeView {
    pub position: i64,
    #[serde(flatten)]
    pub event: Event,
}

impl From<FeedEntry> for ChangeView {
    fn from(entry: FeedEntry) -> Self {
        Self {
            position: entry.position,
            event: entry.event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncDeltaResponse {
    pub success: bool,
    /// Feed cursor for the next pull.
    pub v: i64,
    pub count: usize,
    pub changes: Vec<ChangeView>,
}

impl From<PullOutcome> for SyncDeltaResponse {
    fn from(outcome: PullOutcome) -> Self {
        Self {
            success: true,
            v: outcome.position,
            count: outcome.changes.len(),
            changes: outcome.changes.into_iter().map(ChangeView::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushResponse {
    pub success: bool,
    pub action: SyncAction,
    pub entity: Value,
    pub version: u64,
    /// Audit entries of the events this push committed.
    pub logs: Vec<AuditEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
}

impl From<PushOutcome> for PushResponse {
    fn from(outcome: PushOutcome) -> Self {
        Self {
            success: true,
            action: outcome.action,
            entity: outcome.entity,
            version: outcome.version,
            logs: outcome.committed.iter().map(AuditEntry::from).collect(),
            conflicts: outcome.conflicts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
    /// Carried for the transport; not part of the body.
    #[serde(skip)]
    pub status: u16,
}

impl From<&LedgerError> for ErrorEnvelope {
    fn from(err: &LedgerError) -> Self {
        let code = err.code();
        Self {
            success: false,
            error: ErrorBody {
                code: code.code(),
                kind: err.kind(),
                message: err.to_string(),
                hint: err.hint(),
            },
            status: code.http_status(),
        }
    }
}
