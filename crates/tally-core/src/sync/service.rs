//! Push, pull and delete flows for multi-device sync.
//!
//! A push carries a device's full view of one entity plus the version that
//! view was based on. The service diffs it against the base state, resolves
//! it against whatever other devices committed since, and appends the result
//! as one event. All of it happens inside an `IMMEDIATE` transaction, so the
//! head cannot move between the read and the append.

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::diff::{Delta, FieldChange, apply_delta_lenient, compute_delta_with, path};
use crate::error::{LedgerError, Result};
use crate::event::{EntityType, Event, EventType, NewEvent, Payload, SupersededChange};
use crate::replay::fold;
use crate::store::{self, Bound, EventStore, FeedEntry};
use crate::sync::clock::{VersionVector, device_key};
use crate::sync::record::{self, SyncRecord};
use crate::sync::resolve::{Conflict, PendingDelta, Resolution, resolve};

/// Path set by a soft delete.
pub const DELETED_FLAG: &str = "/isDeleted";

/// How a push was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// The entity did not exist; the push became its first snapshot.
    Created,
    /// Nothing concurrent; fast-forward.
    Updated,
    /// Concurrent edits on disjoint paths.
    Merged,
    /// At least one path was decided by last-write-wins.
    Resolved,
    /// At least one path needs a manual decision.
    Conflict,
}

impl SyncAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Merged => "merged",
            Self::Resolved => "resolved",
            Self::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub user_id: String,
    pub device_id: String,
    pub actor: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// The device's full view of the entity.
    pub data: Value,
    /// Version `data` was edited from. Falls back to the device's sync
    /// record, then to the current head.
    pub base_version: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl PushRequest {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        actor: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            actor: actor.into(),
            entity_type,
            entity_id: entity_id.into(),
            data,
            base_version: None,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    #[must_use]
    pub const fn based_on(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn seen(&self, version: u64, now: DateTime<Utc>) -> SyncRecord {
        seen_at(&self.user_id, &self.device_id, &self.entity_id, version, now)
    }
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    pub action: SyncAction,
    /// Server state after the push.
    pub entity: Value,
    /// Head version after the push.
    pub version: u64,
    /// The event the push committed, if it committed one.
    pub committed: Option<Event>,
    pub conflicts: Vec<Conflict>,
    pub superseded: Vec<SupersededChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub user_id: String,
    pub device_id: String,
    /// Feed position the device has already consumed.
    pub since: i64,
    pub limit: usize,
}

impl PullRequest {
    #[must_use]
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>, since: i64) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            since,
            limit: DEFAULT_PULL_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Page size of a pull when the caller names none.
pub const DEFAULT_PULL_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct PullOutcome {
    /// Cursor to pass as `since` next time.
    pub position: i64,
    pub changes: Vec<FeedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub user_id: String,
    pub device_id: String,
    pub actor: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl DeleteRequest {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        actor: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            actor: actor.into(),
            entity_type,
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Push a device's view of an entity.
///
/// Unresolved conflicts are reported as [`SyncAction::Conflict`]; the
/// disjoint part of the push is still committed and the conflicting part is
/// parked on the device's sync record.
///
/// # Errors
///
/// Returns [`LedgerError::BadRequest`] for missing identifiers,
/// [`LedgerError::HistoryPruned`] if the base predates the retained chain, or
/// a storage error.
pub fn push(store: &mut EventStore, config: &SyncConfig, req: &PushRequest) -> Result<PushOutcome> {
    push_inner(store, config, req, false)
}

/// Like [`push`], but any unresolved conflict aborts the whole push with
/// [`LedgerError::UnresolvedConflict`] and nothing is written.
///
/// # Errors
///
/// See [`push`].
pub fn push_strict(
    store: &mut EventStore,
    config: &SyncConfig,
    req: &PushRequest,
) -> Result<PushOutcome> {
    push_inner(store, config, req, true)
}

fn push_inner(
    store: &mut EventStore,
    config: &SyncConfig,
    req: &PushRequest,
    strict: bool,
) -> Result<PushOutcome> {
    require("user id", &req.user_id)?;
    require("device id", &req.device_id)?;
    require("entity id", &req.entity_id)?;
    require("actor", &req.actor)?;
    let timestamp = store::truncate_to_micros(req.timestamp);

    let tx = store
        .conn_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;

    let chain = match store::load_events(&tx, &req.entity_id, Bound::Latest) {
        Err(LedgerError::NotFound { .. }) => Vec::new(),
        other => other?,
    };

    let Some(head_version) = chain.last().map(|e| e.version) else {
        let payload = Payload::Snapshot(req.data.clone());
        let new = new_event(req, EventType::Created, payload, timestamp);
        let event = store::insert_next(&tx, &new, Some(0))?;
        save_record(&tx, req.seen(event.version, timestamp))?;
        tx.commit()?;
        info!(entity_id = %req.entity_id, device_id = %req.device_id, "sync push created entity");
        return Ok(PushOutcome {
            action: SyncAction::Created,
            entity: req.data.clone(),
            version: event.version,
            committed: Some(event),
            conflicts: Vec::new(),
            superseded: Vec::new(),
        });
    };

    let stored = record::load(&tx, &req.user_id, &req.device_id, &req.entity_id)?;
    let base = req
        .base_version
        .or_else(|| stored.as_ref().map(|r| r.last_seen_version))
        .unwrap_or(head_version)
        .min(head_version);
    let base_state = state_at(&req.entity_id, &chain, base)?;
    let head_state = state_at(&req.entity_id, &chain, head_version)?;

    let incoming = PendingDelta {
        delta: compute_delta_with(&base_state, &req.data, &config.diff_options()),
        actor: req.actor.clone(),
        device_id: Some(req.device_id.clone()),
        timestamp,
        version: None,
    };
    let remote = concurrent_changes(&chain, base, &req.device_id);
    let mut resolution = resolve(&incoming, &req.data, &remote, config.clock_tolerance_ms);

    if strict && resolution.has_conflicts() {
        return Err(LedgerError::UnresolvedConflict {
            entity_id: req.entity_id.clone(),
            conflicts: resolution.conflicts,
        });
    }

    let to_apply = resolution.resolved_delta.rebase_onto(&head_state);
    let entity = apply_delta_lenient(&head_state, &to_apply).state;
    // A losing write whose value survives anyway was not superseded.
    resolution
        .superseded
        .retain(|loser| path::lookup(&entity, &loser.path) != loser.value.as_ref());
    let no_op = to_apply.is_empty() && resolution.superseded.is_empty();
    let action = classify(&remote, &resolution, no_op);

    let committed = if no_op {
        None
    } else {
        let event_type = if resolution.decided_paths.is_empty() {
            match action {
                SyncAction::Updated => EventType::Updated,
                _ => EventType::Merged,
            }
        } else {
            EventType::Resolved
        };
        let mut new = new_event(req, event_type, Payload::Delta(to_apply), timestamp);
        new.metadata.superseded.clone_from(&resolution.superseded);
        Some(store::insert_next(&tx, &new, Some(head_version))?)
    };
    let version = committed.as_ref().map_or(head_version, |e| e.version);

    let mut seen = req.seen(version, timestamp);
    seen.pending_delta = resolution
        .has_conflicts()
        .then(|| resolution.unresolved_delta(&incoming));
    save_record(&tx, seen)?;
    tx.commit()?;

    info!(
        entity_id = %req.entity_id,
        device_id = %req.device_id,
        %action,
        base,
        version,
        conflicts = resolution.conflicts.len(),
        superseded = resolution.superseded.len(),
        "sync push applied"
    );
    Ok(PushOutcome {
        action,
        entity,
        version,
        committed,
        conflicts: resolution.conflicts,
        superseded: resolution.superseded,
    })
}

/// Fold the chain prefix up to `version`. A base older than the retained
/// origin of a pruned chain cannot be reconstructed.
fn state_at(entity_id: &str, chain: &[Event], version: u64) -> Result<Value> {
    if let Some(origin) = chain.first()
        && version < origin.version
        && origin.metadata.pruned.is_some()
    {
        return Err(LedgerError::HistoryPruned {
            entity_id: entity_id.to_string(),
            earliest_version: origin.version,
            earliest_timestamp: origin.timestamp(),
        });
    }
    let upto = chain.partition_point(|e| e.version <= version);
    Ok(fold(&chain[..upto]).map_or_else(|| Value::Object(Map::new()), |r| r.state))
}

/// Events after `base` written by devices the pushing device had not seen.
fn concurrent_changes(chain: &[Event], base: u64, device_id: &str) -> Vec<PendingDelta> {
    let server = VersionVector::from_events(chain);
    let mut client = VersionVector::from_events(chain.iter().filter(|e| e.version <= base));
    // A device has always seen its own writes.
    client.observe(device_id, server.get(device_id));

    let ahead = server.devices_ahead_of(&client);
    if ahead.is_empty() {
        return Vec::new();
    }
    chain
        .iter()
        .filter(|e| e.version > base && ahead.contains(&device_key(e)))
        .map(PendingDelta::from_event)
        .collect()
}

fn classify(remote: &[PendingDelta], resolution: &Resolution, no_op: bool) -> SyncAction {
    if resolution.has_conflicts() {
        SyncAction::Conflict
    } else if no_op {
        SyncAction::Updated
    } else if !resolution.decided_paths.is_empty() {
        SyncAction::Resolved
    } else if remote.is_empty() {
        SyncAction::Updated
    } else {
        SyncAction::Merged
    }
}

/// Changes committed after feed position `since`, recording what the
/// device has now seen.
///
/// # Errors
///
/// Returns [`LedgerError::BadRequest`] for missing identifiers or a storage
/// error.
pub fn pull(store: &mut EventStore, req: &PullRequest) -> Result<PullOutcome> {
    require("user id", &req.user_id)?;
    require("device id", &req.device_id)?;
    let changes = store.changes_since(req.since, req.limit)?;
    let position = match changes.last() {
        Some(entry) => entry.position,
        None => store.latest_position()?.max(req.since),
    };

    let now = Utc::now();
    let tx = store.conn_mut().transaction()?;
    for entry in &changes {
        let event = &entry.event;
        let mut seen = record::load(&tx, &req.user_id, &req.device_id, &event.entity_id)?
            .unwrap_or_else(|| {
                SyncRecord::new(&req.user_id, &req.device_id, &event.entity_id, now)
            });
        if event.version > seen.last_seen_version {
            seen.last_seen_version = event.version;
        }
        seen.updated_at = now;
        record::save(&tx, &seen)?;
    }
    tx.commit()?;

    debug!(
        device_id = %req.device_id,
        since = req.since,
        position,
        count = changes.len(),
        "sync pull"
    );
    Ok(PullOutcome { position, changes })
}

/// Soft-delete an entity by setting [`DELETED_FLAG`].
///
/// Deleting an already deleted entity writes nothing and returns the head.
///
/// # Errors
///
/// Returns [`LedgerError::NotFound`] for an unknown entity, or a storage
/// error.
pub fn delete(store: &mut EventStore, req: &DeleteRequest) -> Result<Event> {
    require("user id", &req.user_id)?;
    require("device id", &req.device_id)?;
    require("entity id", &req.entity_id)?;
    require("actor", &req.actor)?;
    let timestamp = store::truncate_to_micros(req.timestamp);

    let tx = store
        .conn_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;
    let chain = store::load_events(&tx, &req.entity_id, Bound::Latest)?;
    let Some(current) = fold(&chain) else {
        return Err(LedgerError::NotFound {
            entity_id: req.entity_id.clone(),
        });
    };
    let flag = path::lookup(&current.state, DELETED_FLAG).cloned();
    if flag == Some(Value::Bool(true))
        && let Some(head) = chain.last()
    {
        return Ok(head.clone());
    }

    let mut delta = Delta::new();
    delta.insert(
        DELETED_FLAG,
        FieldChange {
            old: flag,
            new: Some(Value::Bool(true)),
        },
    );
    let mut new = NewEvent::new(
        req.entity_type,
        &req.entity_id,
        EventType::Deleted,
        Payload::Delta(delta),
        &req.actor,
    )
    .at(timestamp)
    .with_device(&req.device_id);
    new.metadata.correlation_id.clone_from(&req.correlation_id);

    let event = store::insert_next(&tx, &new, Some(current.version))?;
    save_record(
        &tx,
        seen_at(&req.user_id, &req.device_id, &req.entity_id, event.version, timestamp),
    )?;
    tx.commit()?;
    info!(entity_id = %req.entity_id, version = event.version, "entity soft-deleted");
    Ok(event)
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::BadRequest(format!("{name} must not be empty")));
    }
    Ok(())
}

fn new_event(
    req: &PushRequest,
    event_type: EventType,
    payload: Payload,
    ts: DateTime<Utc>,
) -> NewEvent {
    let mut new = NewEvent::new(req.entity_type, &req.entity_id, event_type, payload, &req.actor)
        .at(ts)
        .with_device(&req.device_id);
    new.metadata.correlation_id.clone_from(&req.correlation_id);
    new
}

fn save_record(conn: &rusqlite::Connection, seen: SyncRecord) -> Result<()> {
    record::save(conn, &seen)
}

fn seen_at(
    user_id: &str,
    device_id: &str,
    entity_id: &str,
    version: u64,
    now: DateTime<Utc>,
) -> SyncRecord {
    let mut seen = SyncRecord::new(user_id, device_id, entity_id, now);
    seen.last_seen_version = version;
    seen
}
