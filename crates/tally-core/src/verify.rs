//! Chain integrity verification.
//!
//! Walks an entity's retained chain from its origin and checks, per event:
//!
//! - the stored checksum matches one recomputed from the stored fields and
//!   the preceding event's chain digest;
//! - `previous_event_id` names the preceding event;
//! - versions are contiguous;
//! - only the origin carries a prune marker.
//!
//! The first failing version is reported. Verification never writes.

use serde::Serialize;
use tracing::warn;

use crate::error::{LedgerError, Result};
use crate::event::{Event, EventId};
use crate::store::EventStore;

/// Why the chain broke at [`VerifyReport::broken_at_version`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BreakReason {
    /// Stored checksum differs from the recomputed one.
    ChecksumMismatch { stored: String, computed: String },
    /// `previous_event_id` does not name the preceding event.
    BrokenLink {
        expected: Option<EventId>,
        found: Option<EventId>,
    },
    /// A version is missing or repeated.
    VersionGap { expected: u64, found: u64 },
    /// The first retained event is neither version 1 nor a prune snapshot.
    UnexpectedOrigin,
    /// A prune marker on an event past the origin.
    StrayPruneMarker,
}

/// Outcome of verifying one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub entity_id: String,
    pub valid: bool,
    pub broken_at_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BreakReason>,
    /// Events checked before stopping.
    pub checked: usize,
}

/// Verify one entity's chain.
///
/// # Errors
///
/// Returns [`LedgerError::NotFound`] for an unknown entity, or a storage
/// error if the chain cannot be read.
pub fn verify(store: &EventStore, entity_id: &str) -> Result<VerifyReport> {
    let events = store.events(entity_id)?;
    let report = verify_chain(entity_id, &events)?;
    if let (Some(version), Some(reason)) = (report.broken_at_version, &report.reason) {
        warn!(entity_id, version, ?reason, "event chain integrity broken");
    }
    Ok(report)
}

/// Verify every entity in the store, sorted by entity id.
///
/// # Errors
///
/// Returns a storage error if any chain cannot be read.
pub fn verify_all(store: &EventStore) -> Result<Vec<VerifyReport>> {
    store
        .entity_ids()?
        .iter()
        .map(|id| verify(store, id))
        .collect()
}

/// Fail with [`LedgerError::IntegrityViolation`] if the chain is broken.
///
/// # Errors
///
/// Also propagates the errors of [`verify`].
pub fn ensure_intact(store: &EventStore, entity_id: &str) -> Result<()> {
    let report = verify(store, entity_id)?;
    match report.broken_at_version {
        Some(version) => Err(LedgerError::IntegrityViolation {
            entity_id: entity_id.to_string(),
            version,
        }),
        None => Ok(()),
    }
}

/// Verify an ascending chain already in memory.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be re-encoded for
/// hashing.
pub fn verify_chain(entity_id: &str, events: &[Event]) -> Result<VerifyReport> {
    let mut previous: Option<&Event> = None;
    for (checked, event) in events.iter().enumerate() {
        if let Some(reason) = check_event(previous, event)? {
            return Ok(VerifyReport {
                entity_id: entity_id.to_string(),
                valid: false,
                broken_at_version: Some(event.version),
                reason: Some(reason),
                checked: checked + 1,
            });
        }
        previous = Some(event);
    }

    Ok(VerifyReport {
        entity_id: entity_id.to_string(),
        valid: true,
        broken_at_version: None,
        reason: None,
        checked: events.len(),
    })
}

fn check_event(previous: Option<&Event>, event: &Event) -> Result<Option<BreakReason>> {
    match previous {
        None => {
            let legit_origin = event.version == 1 || event.metadata.pruned.is_some();
            if !legit_origin {
                return Ok(Some(BreakReason::UnexpectedOrigin));
            }
            if event.previous_event_id.is_some() {
                return Ok(Some(BreakReason::BrokenLink {
                    expected: None,
                    found: event.previous_event_id.clone(),
                }));
            }
        }
        Some(prev) => {
            if event.version != prev.version + 1 {
                return Ok(Some(BreakReason::VersionGap {
                    expected: prev.version + 1,
                    found: event.version,
                }));
            }
            if event.previous_event_id.as_ref() != Some(&prev.event_id) {
                return Ok(Some(BreakReason::BrokenLink {
                    expected: Some(prev.event_id.clone()),
                    found: event.previous_event_id.clone(),
                }));
            }
            if event.metadata.pruned.is_some() {
                return Ok(Some(BreakReason::StrayPruneMarker));
            }
        }
    }

    let computed = event.recompute_checksum(previous)?;
    if computed != event.checksum {
        return Ok(Some(BreakReason::ChecksumMismatch {
            stored: event.checksum.clone(),
            computed,
        }));
    }
    Ok(None)
}
