//! Event data model for the tally ledger.
//!
//! An [`Event`] is one committed mutation to one entity. Events for the same
//! entity form a singly linked chain: each event names its predecessor in
//! `previous_event_id` and carries a BLAKE3 checksum over its payload, its
//! position in the chain and that link (see [`checksum`]).
//!
//! Provenance (`actor`, [`EventMetadata`]) rides alongside the chain but is
//! not hashed, so a device clock skew never invalidates history.

pub mod canonical;
pub mod checksum;
pub mod types;

pub use canonical::canonical_json;
pub use checksum::{compute_checksum, mint_event_id};
pub use types::{EntityType, EventType, InvalidEventType, UnknownEntityType};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diff::Delta;

/// Opaque event identifier, `evt-<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The body of an event: either the full state or the changed paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Snapshot(Value),
    Delta(Delta),
}

impl Payload {
    #[must_use]
    pub const fn is_delta(&self) -> bool {
        matches!(self, Self::Delta(_))
    }
}

/// Left on the snapshot written by retention pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneMarker {
    pub pruned_at: DateTime<Utc>,
    /// Version of the chain origin before this prune.
    pub collapsed_from: u64,
    /// Number of events folded into the snapshot.
    pub collapsed_events: u64,
    /// Checksum of the event this snapshot replaced. The next version was
    /// chained to it, so it stays the snapshot's chain digest.
    pub replaced_checksum: String,
}

/// A losing write recorded on the event that won a last-write-wins race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupersededChange {
    pub path: String,
    /// The value the loser wanted. Absent when it wanted the field removed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::diff::present"
    )]
    pub value: Option<Value>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Provenance attached to every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pruned: Option<PruneMarker>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<SupersededChange>,
    /// Caller-defined keys, preserved verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl EventMetadata {
    #[must_use]
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: None,
            correlation_id: None,
            timestamp,
            pruned: None,
            superseded: Vec::new(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn now() -> Self {
        Self::at(Utc::now())
    }
}

/// A single committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: EventId,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// 1-based, contiguous per entity.
    pub version: u64,
    pub event_type: EventType,
    pub payload: Payload,
    /// `None` for the chain origin (version 1 or a retention snapshot).
    pub previous_event_id: Option<EventId>,
    /// `blake3:<hex>`.
    pub checksum: String,
    pub actor: String,
    pub metadata: EventMetadata,
}

impl Event {
    #[must_use]
    pub const fn is_delta(&self) -> bool {
        self.payload.is_delta()
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }

    /// Returns `true` if this event starts the retained chain.
    #[must_use]
    pub const fn is_origin(&self) -> bool {
        self.previous_event_id.is_none()
    }

    /// External kind label, e.g. `TRANSACTION_UPDATED`.
    #[must_use]
    pub fn label(&self) -> String {
        self.event_type.label(self.entity_type)
    }

    /// Digest the next version chains to: the replaced event's checksum for
    /// a retention snapshot, otherwise this event's own.
    #[must_use]
    pub fn chain_digest(&self) -> &str {
        self.metadata
            .pruned
            .as_ref()
            .map_or(self.checksum.as_str(), |marker| marker.replaced_checksum.as_str())
    }

    /// Recompute the checksum from the stored fields and the predecessor.
    ///
    /// An origin has no predecessor; a retention snapshot then chains to its
    /// own anchor.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn recompute_checksum(&self, previous: Option<&Self>) -> Result<String, serde_json::Error> {
        let previous_digest = match previous {
            Some(prev) => Some(prev.chain_digest()),
            None => self.metadata.pruned.as_ref().map(|m| m.replaced_checksum.as_str()),
        };
        compute_checksum(
            &self.entity_id,
            self.version,
            self.previous_event_id.as_ref(),
            previous_digest,
            &self.payload,
        )
    }
}

/// An event before the store has assigned its version, id and checksum.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub event_type: EventType,
    pub payload: Payload,
    pub actor: String,
    pub metadata: EventMetadata,
}

impl NewEvent {
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        event_type: EventType,
        payload: Payload,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            event_type,
            payload,
            actor: actor.into(),
            metadata: EventMetadata::now(),
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.metadata.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{FieldChange, compute_delta};
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).single().expect("valid")
    }

    #[test]
    fn payload_serializes_with_lowercase_tag() {
        let snap = Payload::Snapshot(json!({"amount": 1}));
        assert_eq!(
            serde_json::to_value(&snap).expect("ser"),
            json!({"snapshot": {"amount": 1}})
        );

        let delta = Payload::Delta(compute_delta(&json!({"a": 1}), &json!({"a": 2})));
        assert_eq!(
            serde_json::to_value(&delta).expect("ser"),
            json!({"delta": {"/a": {"old": 1, "new": 2}}})
        );
        assert!(delta.is_delta());
    }

    #[test]
    fn metadata_omits_empty_optionals() {
        let meta = EventMetadata::at(ts());
        let value = serde_json::to_value(&meta).expect("ser");
        assert_eq!(value, json!({"timestamp": "2024-03-01T09:30:00Z"}));
    }

    #[test]
    fn superseded_value_keeps_null_distinct_from_removal() {
        let change = SupersededChange {
            path: "/memo".into(),
            value: Some(Value::Null),
            actor: "ana".into(),
            device_id: Some("phone".into()),
            timestamp: ts(),
        };
        let wire = serde_json::to_string(&change).expect("ser");
        let back: SupersededChange = serde_json::from_str(&wire).expect("de");
        assert_eq!(back.value, Some(Value::Null));

        let removal: SupersededChange = serde_json::from_value(json!({
            "path": "/memo",
            "actor": "ana",
            "timestamp": "2024-03-01T09:30:00Z"
        }))
        .expect("de");
        assert_eq!(removal.value, None);
    }

    fn origin() -> Event {
        let payload = Payload::Snapshot(json!({"amount": 10}));
        Event {
            event_id: EventId::new("evt-0"),
            entity_type: EntityType::Transaction,
            entity_id: "tx-1".into(),
            version: 1,
            event_type: EventType::Created,
            checksum: compute_checksum("tx-1", 1, None, None, &payload).expect("checksum"),
            payload,
            previous_event_id: None,
            actor: "ana".into(),
            metadata: EventMetadata::at(ts()),
        }
    }

    #[test]
    fn event_round_trips_through_json() {
        let v1 = origin();
        let mut delta = Delta::new();
        delta.insert("/amount", FieldChange::replace(json!(10), json!(12)));
        let payload = Payload::Delta(delta);
        let event = Event {
            event_id: EventId::new("evt-1"),
            entity_type: EntityType::Transaction,
            entity_id: "tx-1".into(),
            version: 2,
            event_type: EventType::Updated,
            checksum: compute_checksum(
                "tx-1",
                2,
                Some(&v1.event_id),
                Some(v1.chain_digest()),
                &payload,
            )
            .expect("checksum"),
            payload,
            previous_event_id: Some(v1.event_id.clone()),
            actor: "ana".into(),
            metadata: EventMetadata::at(ts()),
        };

        let wire = serde_json::to_string(&event).expect("ser");
        assert!(wire.contains("\"previousEventId\":\"evt-0\""));
        let back: Event = serde_json::from_str(&wire).expect("de");
        assert_eq!(back, event);
        assert_eq!(back.recompute_checksum(Some(&v1)).expect("checksum"), event.checksum);
        assert_ne!(back.recompute_checksum(None).expect("checksum"), event.checksum);
        assert_eq!(back.label(), "TRANSACTION_UPDATED");
    }

    #[test]
    fn pruned_snapshot_chains_to_its_anchor() {
        let mut snapshot = origin();
        assert_eq!(snapshot.chain_digest(), snapshot.checksum);
        snapshot.metadata.pruned = Some(PruneMarker {
            pruned_at: ts(),
            collapsed_from: 1,
            collapsed_events: 2,
            replaced_checksum: "blake3:replaced".into(),
        });
        assert_eq!(snapshot.chain_digest(), "blake3:replaced");
        let wire = serde_json::to_value(&snapshot.metadata).expect("ser");
        assert_eq!(wire["pruned"]["replacedChecksum"], json!("blake3:replaced"));
    }

    #[test]
    fn new_event_builder_sets_provenance() {
        let ev = NewEvent::new(
            EntityType::Budget,
            "b-1",
            EventType::Created,
            Payload::Snapshot(json!({})),
            "ana",
        )
        .at(ts())
        .with_device("laptop")
        .with_correlation("req-9");
        assert_eq!(ev.metadata.timestamp, ts());
        assert_eq!(ev.metadata.device_id.as_deref(), Some("laptop"));
        assert_eq!(ev.metadata.correlation_id.as_deref(), Some("req-9"));
    }
}
