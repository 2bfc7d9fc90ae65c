//! Retention pruning.
//!
//! Pruning collapses the oldest part of an entity's chain into one snapshot
//! event. The snapshot takes the place of the last collapsed version `k`: it
//! keeps event `k`'s id and records `k`'s checksum as its anchor, so `k + 1`
//! still links and chains to it, and becomes the new chain origin with no
//! previous event. Replays at or after `k` are unchanged; earlier boundaries
//! fail with [`LedgerError::HistoryPruned`].
//!
//! A chain that fails verification is never pruned.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::{LedgerError, Result};
use crate::event::{Event, EventType, Payload, PruneMarker, compute_checksum};
use crate::replay::fold;
use crate::store::{self, Bound, EventStore};
use crate::verify::verify_chain;

/// Outcome of pruning one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub entity_id: String,
    /// Version of the snapshot written, `None` if nothing was old enough.
    pub snapshot_version: Option<u64>,
    /// Events deleted in favour of the snapshot.
    pub removed_events: u64,
}

impl PruneReport {
    fn untouched(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            snapshot_version: None,
            removed_events: 0,
        }
    }
}

/// Cutoff implied by `retention.max_age_days`, if set.
#[must_use]
pub fn cutoff(config: &RetentionConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    config
        .max_age_days
        .map(|days| now - Duration::days(i64::from(days)))
}

/// Collapse every event strictly older than `older_than` into a snapshot.
///
/// Only the longest version prefix whose timestamps are all older than the
/// cutoff is collapsed, so a late event with a skewed clock stops the prune
/// where it sits.
///
/// # Errors
///
/// Returns [`LedgerError::NotFound`] for an unknown entity,
/// [`LedgerError::IntegrityViolation`] if the chain is broken, or a storage
/// error. On error nothing is changed.
pub fn prune(
    store: &mut EventStore,
    entity_id: &str,
    older_than: DateTime<Utc>,
) -> Result<PruneReport> {
    let tx = store
        .conn_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;
    let chain = store::load_events(&tx, entity_id, Bound::Latest)?;
    if let Some(version) = verify_chain(entity_id, &chain)?.broken_at_version {
        warn!(entity_id, version, "refusing to prune a broken chain");
        return Err(LedgerError::IntegrityViolation {
            entity_id: entity_id.to_string(),
            version,
        });
    }

    let old_enough = chain
        .iter()
        .position(|e| e.timestamp() >= older_than)
        .unwrap_or(chain.len());
    let (Some(origin), Some(last)) = (chain.first(), old_enough.checked_sub(1).map(|i| &chain[i]))
    else {
        debug!(entity_id, "nothing old enough to prune");
        return Ok(PruneReport::untouched(entity_id));
    };
    if last.version == origin.version {
        debug!(entity_id, version = last.version, "prune cutoff is already the origin");
        return Ok(PruneReport::untouched(entity_id));
    }

    let snapshot = collapse(&chain[..old_enough], origin, last, Utc::now())?;
    let removed = tx.execute(
        "DELETE FROM events WHERE entity_id = ?1 AND version < ?2",
        params![entity_id, i64::try_from(snapshot.version).unwrap_or(i64::MAX)],
    )?;
    store::overwrite_row(&tx, &snapshot)?;
    tx.commit()?;

    let removed_events = u64::try_from(removed).unwrap_or(u64::MAX);
    info!(
        entity_id,
        snapshot_version = snapshot.version,
        removed_events,
        "pruned event history"
    );
    Ok(PruneReport {
        entity_id: entity_id.to_string(),
        snapshot_version: Some(snapshot.version),
        removed_events,
    })
}

/// Prune every entity, one transaction each.
///
/// # Errors
///
/// Stops at the first entity that fails; earlier prunes stay committed.
pub fn prune_all(store: &mut EventStore, older_than: DateTime<Utc>) -> Result<Vec<PruneReport>> {
    let ids = store.entity_ids()?;
    let mut reports = Vec::with_capacity(ids.len());
    for id in &ids {
        reports.push(prune(store, id, older_than)?);
    }
    Ok(reports)
}

fn collapse(prefix: &[Event], origin: &Event, last: &Event, now: DateTime<Utc>) -> Result<Event> {
    let state = fold(prefix)
        .ok_or_else(|| LedgerError::NotFound {
            entity_id: last.entity_id.clone(),
        })?
        .state;

    let mut metadata = last.metadata.clone();
    metadata.pruned = Some(PruneMarker {
        pruned_at: store::truncate_to_micros(now),
        collapsed_from: origin.version,
        collapsed_events: last.version - origin.version + 1,
        replaced_checksum: last.chain_digest().to_string(),
    });
    let payload = Payload::Snapshot(state);
    Ok(Event {
        event_id: last.event_id.clone(),
        entity_type: last.entity_type,
        entity_id: last.entity_id.clone(),
        version: last.version,
        event_type: EventType::Snapshot,
        checksum: compute_checksum(
            &last.entity_id,
            last.version,
            None,
            Some(last.chain_digest()),
            &payload,
        )?,
        payload,
        previous_event_id: None,
        actor: last.actor.clone(),
        metadata,
    })
}
