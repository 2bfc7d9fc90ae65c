//! Append-only event store backed by SQLite.
//!
//! Every entity owns a contiguous version sequence starting at 1. An append
//! reads the current head and inserts `head + 1` inside one transaction; the
//! `UNIQUE(entity_id, version)` constraint turns a lost race into
//! [`LedgerError::ConcurrentVersionConflict`], which [`EventStore::append`]
//! retries with linear backoff up to `append.max_retries` times.
//!
//! Reads never mutate, and `seq` (the insertion counter) is exposed only as a
//! feed cursor for pull-style sync. Per-entity ordering is always `version`.

use std::path::Path;

use chrono::{DateTime, Timelike, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, warn};

use crate::config::{AppendConfig, EngineConfig};
use crate::db;
use crate::error::{LedgerError, Result};
use crate::event::{
    Event, EventId, EventMetadata, NewEvent, Payload, compute_checksum, mint_event_id,
};

const EVENT_COLUMNS: &str = "seq, event_id, entity_type, entity_id, version, event_type, \
    is_delta, payload_json, previous_event_id, checksum, actor, metadata_json";

/// Upper bound for a read of one entity's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// The whole retained chain.
    Latest,
    /// Events with `version <= v`.
    Version(u64),
    /// The longest version prefix whose timestamps are all `<= t`.
    Time(DateTime<Utc>),
}

/// One event on the store-wide change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    /// Feed cursor. Monotone across the store, not an ordering authority.
    pub position: i64,
    pub event: Event,
}

pub struct EventStore {
    conn: Connection,
    append: AppendConfig,
}

impl EventStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, config: &EngineConfig) -> anyhow::Result<Self> {
        let conn = db::open_store(path, config.store.busy_timeout())?;
        Ok(Self {
            conn,
            append: config.append,
        })
    }

    /// Open a private in-memory store with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            conn: db::open_in_memory()?,
            append: AppendConfig::default(),
        })
    }

    #[must_use]
    pub const fn with_append_config(mut self, append: AppendConfig) -> Self {
        self.append = append;
        self
    }

    #[cfg(test)]
    pub(crate) const fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) const fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Append `new` at the entity's next version, retrying version races.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::TooManyConflicts`] once retries are exhausted,
    /// [`LedgerError::BadRequest`] for an empty entity id, or a storage error.
    pub fn append(&mut self, new: NewEvent) -> Result<Event> {
        let new = normalize(new)?;
        let mut conflicts = 0_u32;
        loop {
            match self.try_append(&new, None) {
                Err(err) if err.is_retryable() => {
                    conflicts += 1;
                    if conflicts > self.append.max_retries {
                        warn!(
                            entity_id = %new.entity_id,
                            attempts = conflicts,
                            "append retries exhausted"
                        );
                        return Err(LedgerError::TooManyConflicts {
                            entity_id: new.entity_id,
                            attempts: conflicts,
                        });
                    }
                    warn!(
                        entity_id = %new.entity_id,
                        attempt = conflicts,
                        error = %err,
                        "version race on append, retrying"
                    );
                    std::thread::sleep(self.append.backoff(conflicts));
                }
                other => return other,
            }
        }
    }

    /// Append only if the entity head is still `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ConcurrentVersionConflict`] without retrying if
    /// the head moved.
    pub fn append_at(&mut self, new: NewEvent, expected_version: u64) -> Result<Event> {
        let new = normalize(new)?;
        self.try_append(&new, Some(expected_version))
    }

    fn try_append(&mut self, new: &NewEvent, expected: Option<u64>) -> Result<Event> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        let event = insert_next(&tx, new, expected)?;
        tx.commit()
            .map_err(|err| classify(err, &event.entity_id, event.version))?;
        Ok(event)
    }

    /// The entity's whole retained chain.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the entity has no events.
    pub fn events(&self, entity_id: &str) -> Result<Vec<Event>> {
        self.events_up_to(entity_id, Bound::Latest)
    }

    /// Events up to `bound`, ascending by version.
    ///
    /// An entity that exists but has nothing at or below the bound yields an
    /// empty list.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the entity has no events at all.
    pub fn events_up_to(&self, entity_id: &str, bound: Bound) -> Result<Vec<Event>> {
        load_events(&self.conn, entity_id, bound)
    }

    /// The latest event of an entity, if it exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn head(&self, entity_id: &str) -> Result<Option<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE entity_id = ?1 \
             ORDER BY version DESC LIMIT 1"
        );
        let head = self
            .conn
            .query_row(&sql, [entity_id], row_to_entry)
            .optional()?;
        Ok(head.map(|entry| entry.event))
    }

    /// The first retained event: version 1, or the snapshot left by pruning.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn origin(&self, entity_id: &str) -> Result<Option<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE entity_id = ?1 \
             ORDER BY version ASC LIMIT 1"
        );
        let origin = self
            .conn
            .query_row(&sql, [entity_id], row_to_entry)
            .optional()?;
        Ok(origin.map(|entry| entry.event))
    }

    /// Current head version, `0` for an unknown entity.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn head_version(&self, entity_id: &str) -> Result<u64> {
        Ok(head_link(&self.conn, entity_id)?.map_or(0, |link| link.version))
    }

    /// Every entity id with at least one event, sorted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn entity_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT entity_id FROM events ORDER BY entity_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Feed entries strictly after `position`, ascending, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn changes_since(&self, position: i64, limit: usize) -> Result<Vec<FeedEntry>> {
        let sql =
            format!("SELECT {EVENT_COLUMNS} FROM events WHERE seq > ?1 ORDER BY seq LIMIT ?2");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![position, limit], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Highest feed position handed out so far, `0` for an empty store.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn latest_position(&self) -> Result<i64> {
        let pos = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| row.get(0))?;
        Ok(pos)
    }
}

/// Insert `new` at `head + 1` on `conn`, which must be inside a transaction.
pub(crate) fn insert_next(
    conn: &Connection,
    new: &NewEvent,
    expected: Option<u64>,
) -> Result<Event> {
    let head = head_link(conn, &new.entity_id)?;
    let current = head.as_ref().map_or(0, |link| link.version);
    if let Some(expected) = expected
        && expected != current
    {
        return Err(LedgerError::ConcurrentVersionConflict {
            entity_id: new.entity_id.clone(),
            attempted_version: expected + 1,
        });
    }

    let version = current + 1;
    let (previous, previous_digest) = head.map(|link| (link.event_id, link.digest)).unzip();
    let event = Event {
        event_id: mint_event_id(&new.entity_id, version, new.metadata.timestamp, &new.actor),
        entity_type: new.entity_type,
        entity_id: new.entity_id.clone(),
        version,
        event_type: new.event_type.clone(),
        checksum: compute_checksum(
            &new.entity_id,
            version,
            previous.as_ref(),
            previous_digest.as_deref(),
            &new.payload,
        )?,
        payload: new.payload.clone(),
        previous_event_id: previous,
        actor: new.actor.clone(),
        metadata: new.metadata.clone(),
    };

    insert_row(conn, &event)?;
    debug!(
        entity_id = %event.entity_id,
        version = event.version,
        event_type = %event.event_type,
        event_id = %event.event_id,
        "appended event"
    );
    Ok(event)
}

/// Write `event` as a raw row. Callers own version assignment.
pub(crate) fn insert_row(conn: &Connection, event: &Event) -> Result<()> {
    let (is_delta, payload_json) = encode_payload(&event.payload)?;
    let metadata_json = serde_json::to_string(&event.metadata)?;
    conn.execute(
        "INSERT INTO events (event_id, entity_type, entity_id, version, event_type, is_delta,
            payload_json, previous_event_id, checksum, actor, device_id, correlation_id,
            wall_ts_us, metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            event.event_id.as_str(),
            event.entity_type.as_str(),
            event.entity_id,
            version_to_sql(event.version),
            event.event_type.as_str(),
            is_delta,
            payload_json,
            event.previous_event_id.as_ref().map(EventId::as_str),
            event.checksum,
            event.actor,
            event.metadata.device_id,
            event.metadata.correlation_id,
            event.metadata.timestamp.timestamp_micros(),
            metadata_json,
        ],
    )
    .map_err(|err| classify(err, &event.entity_id, event.version))?;
    Ok(())
}

/// Replace the row at `event.version` in place, keeping its feed position.
pub(crate) fn overwrite_row(conn: &Connection, event: &Event) -> Result<()> {
    let (is_delta, payload_json) = encode_payload(&event.payload)?;
    let metadata_json = serde_json::to_string(&event.metadata)?;
    conn.execute(
        "UPDATE events SET event_id = ?3, event_type = ?4, is_delta = ?5, payload_json = ?6,
            previous_event_id = ?7, checksum = ?8, actor = ?9, device_id = ?10,
            correlation_id = ?11, wall_ts_us = ?12, metadata_json = ?13
         WHERE entity_id = ?1 AND version = ?2",
        params![
            event.entity_id,
            version_to_sql(event.version),
            event.event_id.as_str(),
            event.event_type.as_str(),
            is_delta,
            payload_json,
            event.previous_event_id.as_ref().map(EventId::as_str),
            event.checksum,
            event.actor,
            event.metadata.device_id,
            event.metadata.correlation_id,
            event.metadata.timestamp.timestamp_micros(),
            metadata_json,
        ],
    )?;
    Ok(())
}

pub(crate) fn load_events(conn: &Connection, entity_id: &str, bound: Bound) -> Result<Vec<Event>> {
    let (filter, limit): (&str, i64) = match bound {
        Bound::Latest => ("", 0),
        Bound::Version(v) => ("AND version <= ?2", version_to_sql(v)),
        // Stop at the first event past `t`, even if later versions carry
        // earlier (skewed) timestamps.
        Bound::Time(t) => (
            "AND version < COALESCE((SELECT MIN(version) FROM events \
                WHERE entity_id = ?1 AND wall_ts_us > ?2), 9223372036854775807)",
            t.timestamp_micros(),
        ),
    };

    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE entity_id = ?1 {filter} ORDER BY version"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = if filter.is_empty() {
        stmt.query_map([entity_id], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![entity_id, limit], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    if rows.is_empty() && head_link(conn, entity_id)?.is_none() {
        return Err(LedgerError::NotFound {
            entity_id: entity_id.to_string(),
        });
    }
    Ok(rows.into_iter().map(|entry| entry.event).collect())
}

/// What the next append chains to.
struct HeadLink {
    version: u64,
    event_id: EventId,
    /// [`Event::chain_digest`] of the head.
    digest: String,
}

fn head_link(conn: &Connection, entity_id: &str) -> Result<Option<HeadLink>> {
    let head = conn
        .query_row(
            "SELECT version, event_id,
                COALESCE(json_extract(metadata_json, '$.pruned.replacedChecksum'), checksum)
             FROM events WHERE entity_id = ?1
             ORDER BY version DESC LIMIT 1",
            [entity_id],
            |row| {
                Ok(HeadLink {
                    version: version_from_sql(0, row.get(0)?)?,
                    event_id: EventId::new(row.get::<_, String>(1)?),
                    digest: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(head)
}

fn normalize(mut new: NewEvent) -> Result<NewEvent> {
    if new.entity_id.trim().is_empty() {
        return Err(LedgerError::BadRequest("entity id must not be empty".into()));
    }
    if new.actor.trim().is_empty() {
        return Err(LedgerError::BadRequest("actor must not be empty".into()));
    }
    new.metadata.timestamp = truncate_to_micros(new.metadata.timestamp);
    Ok(new)
}

/// Timestamps are stored at microsecond precision; truncating up front keeps
/// the in-memory event identical to what a later read returns.
pub(crate) fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(ts.nanosecond() / 1_000 * 1_000)
        .unwrap_or(ts)
}

/// Map a lost version race (unique violation or stale write snapshot) to a
/// retryable conflict; anything else stays a storage error.
fn classify(err: rusqlite::Error, entity_id: &str, version: u64) -> LedgerError {
    let race = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        }
        _ => false,
    };
    if race {
        LedgerError::ConcurrentVersionConflict {
            entity_id: entity_id.to_string(),
            attempted_version: version,
        }
    } else {
        LedgerError::Storage(err)
    }
}

fn encode_payload(payload: &Payload) -> Result<(bool, String)> {
    Ok(match payload {
        Payload::Snapshot(state) => (false, serde_json::to_string(state)?),
        Payload::Delta(delta) => (true, serde_json::to_string(delta)?),
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<FeedEntry> {
    let position: i64 = row.get(0)?;
    let entity_type: String = row.get(2)?;
    let event_type: String = row.get(5)?;
    let is_delta: bool = row.get(6)?;
    let payload_json: String = row.get(7)?;
    let metadata_json: String = row.get(11)?;

    let payload = if is_delta {
        Payload::Delta(serde_json::from_str(&payload_json).map_err(|e| conversion(7, e))?)
    } else {
        Payload::Snapshot(serde_json::from_str(&payload_json).map_err(|e| conversion(7, e))?)
    };
    let metadata: EventMetadata =
        serde_json::from_str(&metadata_json).map_err(|e| conversion(11, e))?;

    let event = Event {
        event_id: EventId::new(row.get::<_, String>(1)?),
        entity_type: entity_type.parse().map_err(|e| conversion(2, e))?,
        entity_id: row.get(3)?,
        version: version_from_sql(4, row.get(4)?)?,
        event_type: event_type.parse().map_err(|e| conversion(5, e))?,
        payload,
        previous_event_id: row.get::<_, Option<String>>(8)?.map(EventId::new),
        checksum: row.get(9)?,
        actor: row.get(10)?,
        metadata,
    };
    Ok(FeedEntry { position, event })
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn version_from_sql(idx: usize, raw: i64) -> rusqlite::Result<u64> {
    u64::try_from(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err)))
}

fn version_to_sql(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}
