//! One handle over the store and its configuration.
//!
//! [`Ledger`] is what the CLI (and any embedding service) holds. It owns the
//! [`EventStore`] and routes each operation to its module with the right
//! slice of [`EngineConfig`].

use std::path::Path;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::config::{EffectiveConfig, EngineConfig};
use crate::diff::compute_delta_with;
use crate::error::{LedgerError, Result};
use crate::event::{EntityType, Event, EventMetadata, EventType, NewEvent, Payload};
use crate::replay::{self, AuditEntry, Replayed};
use crate::retention::{self, PruneReport};
use crate::store::{Bound, EventStore};
use crate::sync::{self, DeleteRequest, PullOutcome, PullRequest, PushOutcome, PushRequest};
use crate::verify::{self, VerifyReport};

pub struct Ledger {
    store: EventStore,
    config: EngineConfig,
}

/// A full-state write for [`Ledger::record_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub state: Value,
    pub actor: String,
    pub metadata: EventMetadata,
}

impl Ledger {
    /// Open the store at `path` with `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or migrated.
    pub fn open(path: &Path, config: EngineConfig) -> anyhow::Result<Self> {
        let store = EventStore::open(path, &config)
            .with_context(|| format!("failed to open event store at {}", path.display()))?;
        Ok(Self { store, config })
    }

    /// Open the store an effective configuration points at.
    ///
    /// # Errors
    ///
    /// Same as [`Ledger::open`].
    pub fn from_config(effective: &EffectiveConfig) -> anyhow::Result<Self> {
        Self::open(&effective.store_path, effective.engine.clone())
    }

    /// Private in-memory ledger with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            store: EventStore::open_in_memory()?,
            config: EngineConfig::default(),
        })
    }

    #[must_use]
    pub const fn store(&self) -> &EventStore {
        &self.store
    }

    pub const fn store_mut(&mut self) -> &mut EventStore {
        &mut self.store
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Append a prepared event.
    ///
    /// # Errors
    ///
    /// See [`EventStore::append`].
    pub fn record(&mut self, new: NewEvent) -> Result<Event> {
        self.store.append(new)
    }

    /// Record a full new state: `CREATED` snapshot for a new entity, an
    /// `UPDATED` delta against the head otherwise. An unchanged state writes
    /// nothing and returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::TooManyConflicts`] if the head keeps moving
    /// under the diff, or a storage error.
    pub fn record_state(&mut self, change: StateChange) -> Result<Option<Event>> {
        let options = self.config.sync.diff_options();
        let mut conflicts = 0_u32;
        loop {
            let head = replay::reconstruct(&self.store, &change.entity_id, Bound::Latest)?;
            let (expected, event_type, payload) = match &head {
                None => (0, EventType::Created, Payload::Snapshot(change.state.clone())),
                Some(Replayed { state, version, .. }) => {
                    let delta = compute_delta_with(state, &change.state, &options);
                    if delta.is_empty() {
                        return Ok(None);
                    }
                    (*version, EventType::Updated, Payload::Delta(delta))
                }
            };
            let new = NewEvent::new(
                change.entity_type,
                &change.entity_id,
                event_type,
                payload,
                &change.actor,
            )
            .with_metadata(change.metadata.clone());

            match self.store.append_at(new, expected) {
                Err(err) if err.is_retryable() => {
                    conflicts += 1;
                    if conflicts > self.config.append.max_retries {
                        return Err(LedgerError::TooManyConflicts {
                            entity_id: change.entity_id,
                            attempts: conflicts,
                        });
                    }
                    warn!(
                        entity_id = %change.entity_id,
                        attempt = conflicts,
                        "head moved during diff, retrying"
                    );
                    std::thread::sleep(self.config.append.backoff(conflicts));
                }
                other => return other.map(Some),
            }
        }
    }

    /// # Errors
    ///
    /// See [`replay::reconstruct`].
    pub fn replay(&self, entity_id: &str, bound: Bound) -> Result<Option<Value>> {
        Ok(replay::reconstruct(&self.store, entity_id, bound)?.map(|r| r.state))
    }

    /// # Errors
    ///
    /// See [`replay::replay_to_version`].
    pub fn replay_to_version(&self, entity_id: &str, v: u64) -> Result<Option<Value>> {
        replay::replay_to_version(&self.store, entity_id, v)
    }

    /// # Errors
    ///
    /// See [`replay::replay_to_time`].
    pub fn replay_to_time(&self, entity_id: &str, t: DateTime<Utc>) -> Result<Option<Value>> {
        replay::replay_to_time(&self.store, entity_id, t)
    }

    /// # Errors
    ///
    /// See [`replay::audit_trail`].
    pub fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEntry>> {
        replay::audit_trail(&self.store, entity_id)
    }

    /// # Errors
    ///
    /// See [`verify::verify`].
    pub fn verify(&self, entity_id: &str) -> Result<VerifyReport> {
        verify::verify(&self.store, entity_id)
    }

    /// # Errors
    ///
    /// See [`verify::verify_all`].
    pub fn verify_all(&self) -> Result<Vec<VerifyReport>> {
        verify::verify_all(&self.store)
    }

    /// # Errors
    ///
    /// See [`retention::prune`].
    pub fn prune(&mut self, entity_id: &str, older_than: DateTime<Utc>) -> Result<PruneReport> {
        retention::prune(&mut self.store, entity_id, older_than)
    }

    /// # Errors
    ///
    /// See [`retention::prune_all`].
    pub fn prune_all(&mut self, older_than: DateTime<Utc>) -> Result<Vec<PruneReport>> {
        retention::prune_all(&mut self.store, older_than)
    }

    /// Prune everything past `retention.max_age_days`. A no-op when unset.
    ///
    /// # Errors
    ///
    /// See [`retention::prune_all`].
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<PruneReport>> {
        match retention::cutoff(&self.config.retention, now) {
            Some(cutoff) => self.prune_all(cutoff),
            None => Ok(Vec::new()),
        }
    }

    /// # Errors
    ///
    /// See [`sync::push`].
    pub fn push(&mut self, req: &PushRequest) -> Result<PushOutcome> {
        sync::push(&mut self.store, &self.config.sync, req)
    }

    /// # Errors
    ///
    /// See [`sync::push_strict`].
    pub fn push_strict(&mut self, req: &PushRequest) -> Result<PushOutcome> {
        sync::push_strict(&mut self.store, &self.config.sync, req)
    }

    /// # Errors
    ///
    /// See [`sync::pull`].
    pub fn pull(&mut self, req: &PullRequest) -> Result<PullOutcome> {
        sync::pull(&mut self.store, req)
    }

    /// # Errors
    ///
    /// See [`sync::delete`].
    pub fn delete(&mut self, req: &DeleteRequest) -> Result<Event> {
        sync::delete(&mut self.store, req)
    }
}
