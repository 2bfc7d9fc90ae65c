//! Persisted per-device sync state.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::diff::Delta;
use crate::error::Result;

/// What one device of one user has observed of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub user_id: String,
    pub device_id: String,
    pub entity_id: String,
    pub last_seen_version: u64,
    /// Local changes parked on unresolved conflict paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_delta: Option<Delta>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        entity_id: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            entity_id: entity_id.into(),
            last_seen_version: 0,
            pending_delta: None,
            updated_at,
        }
    }
}

/// # Errors
///
/// Returns a storage or serialization error if the row cannot be read.
pub fn load(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    entity_id: &str,
) -> Result<Option<SyncRecord>> {
    let raw = conn
        .query_row(
            "SELECT user_id, device_id, entity_id, last_seen_version, pending_delta_json,
                updated_at_us
             FROM sync_records WHERE user_id = ?1 AND device_id = ?2 AND entity_id = ?3",
            params![user_id, device_id, entity_id],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

/// Every record a device holds, sorted by entity id.
///
/// # Errors
///
/// Returns a storage or serialization error if a row cannot be read.
pub fn list_for_device(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
) -> Result<Vec<SyncRecord>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, device_id, entity_id, last_seen_version, pending_delta_json,
            updated_at_us
         FROM sync_records WHERE user_id = ?1 AND device_id = ?2 ORDER BY entity_id",
    )?;
    let raws = stmt
        .query_map(params![user_id, device_id], RawRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawRecord::into_record).collect()
}

/// Insert or replace the record for its (user, device, entity) key.
///
/// # Errors
///
/// Returns a storage or serialization error if the write fails.
pub fn save(conn: &Connection, record: &SyncRecord) -> Result<()> {
    let pending = record
        .pending_delta
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO sync_records (user_id, device_id, entity_id, last_seen_version,
            pending_delta_json, updated_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (user_id, device_id, entity_id) DO UPDATE SET
            last_seen_version = excluded.last_seen_version,
            pending_delta_json = excluded.pending_delta_json,
            updated_at_us = excluded.updated_at_us",
        params![
            record.user_id,
            record.device_id,
            record.entity_id,
            i64::try_from(record.last_seen_version).unwrap_or(i64::MAX),
            pending,
            record.updated_at.timestamp_micros(),
        ],
    )?;
    Ok(())
}

struct RawRecord {
    user_id: String,
    device_id: String,
    entity_id: String,
    last_seen_version: i64,
    pending_delta_json: Option<String>,
    updated_at_us: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            device_id: row.get(1)?,
            entity_id: row.get(2)?,
            last_seen_version: row.get(3)?,
            pending_delta_json: row.get(4)?,
            updated_at_us: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<SyncRecord> {
        let pending_delta = self
            .pending_delta_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(SyncRecord {
            user_id: self.user_id,
            device_id: self.device_id,
            entity_id: self.entity_id,
            last_seen_version: u64::try_from(self.last_seen_version).unwrap_or(0),
            pending_delta,
            updated_at: from_micros(self.updated_at_us),
        })
    }
}

fn from_micros(us: i64) -> DateTime<Utc> {
    let secs = us.div_euclid(1_000_000);
    let nanos = u32::try_from(us.rem_euclid(1_000_000) * 1_000).unwrap_or(0);
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
