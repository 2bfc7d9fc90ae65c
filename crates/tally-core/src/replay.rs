//! State reconstruction and audit trails.
//!
//! # Algorithm
//!
//! 1. Read the retained chain up to the boundary (see [`Bound`]).
//! 2. Start from the last full snapshot in that prefix, or `{}`.
//! 3. Fold each later delta with [`apply_delta_lenient`], so a malformed legacy
//!    path is logged and skipped instead of aborting the replay.
//!
//! Replay is read-only and deterministic: the same (entity, boundary) always
//! yields the same state, and replaying `v` then applying event `v + 1` equals
//! replaying `v + 1`.
//!
//! A boundary before the retained origin of a pruned entity fails with
//! [`LedgerError::HistoryPruned`] rather than pretending the entity did not
//! exist yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::diff::{apply_delta_lenient, apply_snapshot};
use crate::error::{LedgerError, Result};
use crate::event::{Event, Payload, SupersededChange};
use crate::store::{Bound, EventStore};

/// Literal change summary of snapshot events.
pub const FULL_SNAPSHOT: &str = "FULL_SNAPSHOT";

/// A reconstructed state and the event it ends at.
#[derive(Debug, Clone, PartialEq)]
pub struct Replayed {
    pub state: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// State at `version <= v`, or `None` if nothing exists at or below `v`.
///
/// An unknown entity replays to `None` as well.
///
/// # Errors
///
/// Returns [`LedgerError::HistoryPruned`] if `v` predates the retained chain.
pub fn replay_to_version(store: &EventStore, entity_id: &str, v: u64) -> Result<Option<Value>> {
    Ok(reconstruct(store, entity_id, Bound::Version(v))?.map(|r| r.state))
}

/// State as of wall-clock time `t`.
///
/// # Errors
///
/// Same as [`replay_to_version`].
pub fn replay_to_time(
    store: &EventStore,
    entity_id: &str,
    t: DateTime<Utc>,
) -> Result<Option<Value>> {
    Ok(reconstruct(store, entity_id, Bound::Time(t))?.map(|r| r.state))
}

/// Reconstruct the state at `bound`.
///
/// # Errors
///
/// Same as [`replay_to_version`].
pub fn reconstruct(store: &EventStore, entity_id: &str, bound: Bound) -> Result<Option<Replayed>> {
    let events = match store.events_up_to(entity_id, bound) {
        Err(LedgerError::NotFound { .. }) => return Ok(None),
        other => other?,
    };
    if events.is_empty() {
        ensure_not_pruned(store, entity_id)?;
        return Ok(None);
    }
    Ok(fold(&events))
}

/// Fold an ascending event prefix into the state at its last event.
#[must_use]
pub fn fold(events: &[Event]) -> Option<Replayed> {
    let last = events.last()?;
    let start = events
        .iter()
        .rposition(|e| !e.is_delta())
        .unwrap_or(0);

    let mut state = Value::Object(Map::new());
    for event in &events[start..] {
        state = match &event.payload {
            Payload::Snapshot(snapshot) => apply_snapshot(&state, snapshot),
            Payload::Delta(delta) => {
                let applied = apply_delta_lenient(&state, delta);
                if !applied.skipped.is_empty() {
                    warn!(
                        entity_id = %event.entity_id,
                        version = event.version,
                        skipped = applied.skipped.len(),
                        "replayed delta with paths missing from base"
                    );
                }
                applied.state
            }
        };
    }

    Some(Replayed {
        state,
        version: last.version,
        timestamp: last.timestamp(),
    })
}

fn ensure_not_pruned(store: &EventStore, entity_id: &str) -> Result<()> {
    match store.origin(entity_id)? {
        Some(origin) if origin.metadata.pruned.is_some() => Err(LedgerError::HistoryPruned {
            entity_id: entity_id.to_string(),
            earliest_version: origin.version,
            earliest_timestamp: origin.timestamp(),
        }),
        _ => Ok(()),
    }
}

/// What an event changed, as shown in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSummary {
    /// A full-state event.
    FullSnapshot,
    /// Changed paths of a delta event, in canonical order.
    Paths(Vec<String>),
}

impl Serialize for ChangeSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::FullSnapshot => serializer.serialize_str(FULL_SNAPSHOT),
            Self::Paths(paths) => paths.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ChangeSummary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Literal(String),
            Paths(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Literal(s) if s == FULL_SNAPSHOT => Ok(Self::FullSnapshot),
            Raw::Literal(other) => Err(serde::de::Error::custom(format!(
                "unknown change summary '{other}'"
            ))),
            Raw::Paths(paths) => Ok(Self::Paths(paths)),
        }
    }
}

/// One row of an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub version: u64,
    /// External label, e.g. `TRANSACTION_UPDATED`.
    pub event_type: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub change_summary: ChangeSummary,
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Losing writes decided by last-write-wins on this event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<SupersededChange>,
}

impl From<&Event> for AuditEntry {
    fn from(event: &Event) -> Self {
        let change_summary = match &event.payload {
            Payload::Snapshot(_) => ChangeSummary::FullSnapshot,
            Payload::Delta(delta) => ChangeSummary::Paths(delta.paths()),
        };
        Self {
            version: event.version,
            event_type: event.label(),
            actor: event.actor.clone(),
            timestamp: event.timestamp(),
            change_summary,
            correlation_id: event.metadata.correlation_id.clone(),
            device_id: event.metadata.device_id.clone(),
            superseded: event.metadata.superseded.clone(),
        }
    }
}

/// The retained history of an entity, ascending by version. Empty for an
/// unknown entity.
///
/// # Errors
///
/// Returns a storage error if the chain cannot be read.
pub fn audit_trail(store: &EventStore, entity_id: &str) -> Result<Vec<AuditEntry>> {
    match store.events(entity_id) {
        Ok(events) => Ok(events.iter().map(AuditEntry::from).collect()),
        Err(LedgerError::NotFound { .. }) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Delta, FieldChange, compute_delta};
    use crate::event::{EntityType, EventType, NewEvent};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, secs).single().expect("valid")
    }

    fn seeded() -> EventStore {
        let mut store = EventStore::open_in_memory().expect("store");
        let states = [
            json!({"amount": 100, "memo": "rent"}),
            json!({"amount": 120, "memo": "rent"}),
            json!({"amount": 120, "memo": "rent (june)"}),
        ];
        store
            .append(
                NewEvent::new(
                    EntityType::Transaction,
                    "tx-1",
                    EventType::Created,
                    Payload::Snapshot(states[0].clone()),
                    "ana",
                )
                .at(at(0))
                .with_correlation("req-1"),
            )
            .expect("v1");
        for (i, pair) in states.windows(2).enumerate() {
            let secs = u32::try_from(i + 1).expect("small") * 10;
            store
                .append(
                    NewEvent::new(
                        EntityType::Transaction,
                        "tx-1",
                        EventType::Updated,
                        Payload::Delta(compute_delta(&pair[0], &pair[1])),
                        "ana",
                    )
                    .at(at(secs)),
                )
                .expect("update");
        }
        store
    }

    #[test]
    fn replay_each_version() {
        let store = seeded();
        assert_eq!(
            replay_to_version(&store, "tx-1", 1).expect("v1"),
            Some(json!({"amount": 100, "memo": "rent"}))
        );
        assert_eq!(
            replay_to_version(&store, "tx-1", 3).expect("v3"),
            Some(json!({"amount": 120, "memo": "rent (june)"}))
        );
        assert_eq!(
            replay_to_version(&store, "tx-1", 99).expect("past head"),
            replay_to_version(&store, "tx-1", 3).expect("head")
        );
        assert_eq!(replay_to_version(&store, "tx-1", 0).expect("v0"), None);
    }

    #[test]
    fn replay_by_time_includes_boundary() {
        let store = seeded();
        assert_eq!(
            replay_to_time(&store, "tx-1", at(9)).expect("t9"),
            Some(json!({"amount": 100, "memo": "rent"}))
        );
        assert_eq!(
            replay_to_time(&store, "tx-1", at(10)).expect("t10"),
            Some(json!({"amount": 120, "memo": "rent"}))
        );
        let long_ago = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().expect("valid");
        assert_eq!(replay_to_time(&store, "tx-1", long_ago).expect("before"), None);
    }

    #[test]
    fn unknown_entity_replays_to_nothing() {
        let store = seeded();
        assert_eq!(replay_to_version(&store, "tx-404", 1).expect("replay"), None);
        assert!(audit_trail(&store, "tx-404").expect("trail").is_empty());
    }

    #[test]
    fn fold_starts_from_latest_snapshot() {
        let mut store = seeded();
        store
            .append(
                NewEvent::new(
                    EntityType::Transaction,
                    "tx-1",
                    EventType::Snapshot,
                    Payload::Snapshot(json!({"amount": 5})),
                    "ops",
                )
                .at(at(40)),
            )
            .expect("snapshot");
        let events = store.events("tx-1").expect("events");
        let replayed = fold(&events).expect("state");
        assert_eq!(replayed.state, json!({"amount": 5}));
        assert_eq!(replayed.version, 4);
    }

    #[test]
    fn malformed_delta_is_skipped_during_replay() {
        let mut store = seeded();
        let mut delta = Delta::new();
        delta.insert("/ghost/deep", FieldChange::replace(json!(1), json!(2)));
        delta.insert("/amount", FieldChange::replace(json!(120), json!(130)));
        store
            .append(
                NewEvent::new(
                    EntityType::Transaction,
                    "tx-1",
                    EventType::Updated,
                    Payload::Delta(delta),
                    "legacy",
                )
                .at(at(50)),
            )
            .expect("legacy");
        let state = replay_to_version(&store, "tx-1", 4).expect("replay").expect("state");
        assert_eq!(state, json!({"amount": 130, "memo": "rent (june)"}));
    }

    #[test]
    fn audit_trail_summarizes_changes() {
        let store = seeded();
        let trail = audit_trail(&store, "tx-1").expect("trail");
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].event_type, "TRANSACTION_CREATED");
        assert_eq!(trail[0].change_summary, ChangeSummary::FullSnapshot);
        assert_eq!(trail[0].correlation_id.as_deref(), Some("req-1"));
        assert_eq!(trail[1].change_summary, ChangeSummary::Paths(vec!["/amount".into()]));
        assert_eq!(trail[2].change_summary, ChangeSummary::Paths(vec!["/memo".into()]));

        let wire = serde_json::to_value(&trail[0]).expect("ser");
        assert_eq!(wire["changeSummary"], json!("FULL_SNAPSHOT"));
        assert_eq!(wire["correlationId"], json!("req-1"));
        let back: AuditEntry = serde_json::from_value(wire).expect("de");
        assert_eq!(back, trail[0]);
    }
}
