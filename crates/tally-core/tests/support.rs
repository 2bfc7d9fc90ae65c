#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use tally_core::diff::compute_delta;
use tally_core::{EntityType, Event, EventStore, EventType, NewEvent, Payload};

/// Fixed epoch the scenarios count seconds from.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().expect("valid") + Duration::seconds(secs)
}

pub fn created(entity_id: &str, state: Value, ts: DateTime<Utc>) -> NewEvent {
    NewEvent::new(
        EntityType::Transaction,
        entity_id,
        EventType::Created,
        Payload::Snapshot(state),
        "ana",
    )
    .at(ts)
}

pub fn updated(entity_id: &str, old: &Value, new: &Value, ts: DateTime<Utc>) -> NewEvent {
    NewEvent::new(
        EntityType::Transaction,
        entity_id,
        EventType::Updated,
        Payload::Delta(compute_delta(old, new)),
        "ana",
    )
    .at(ts)
}

/// Append `states` as one chain: a snapshot, then a delta per later state,
/// one second apart.
pub fn record_states(store: &mut EventStore, entity_id: &str, states: &[Value]) -> Vec<Event> {
    let mut out = Vec::with_capacity(states.len());
    let mut ts = 0;
    for (i, state) in states.iter().enumerate() {
        let new = if i == 0 {
            created(entity_id, state.clone(), at(ts))
        } else {
            updated(entity_id, &states[i - 1], state, at(ts))
        };
        out.push(store.append(new).expect("append"));
        ts += 1;
    }
    out
}
