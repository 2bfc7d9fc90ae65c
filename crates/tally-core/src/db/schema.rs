//! SQLite schema for the event store.
//!
//! - `events` is the append-only chain for every entity. `seq` is the
//!   insertion order across the whole store and doubles as the pull-feed
//!   cursor; per-entity ordering is `version`.
//! - `sync_records` holds one row per (user, device, entity) with the last
//!   version that device has observed and any unresolved local delta.

/// Migration v1: the event chain.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE CHECK (event_id LIKE 'evt-%'),
    entity_type TEXT NOT NULL CHECK (entity_type IN ('TRANSACTION', 'BUDGET', 'WORKSPACE')),
    entity_id TEXT NOT NULL CHECK (length(trim(entity_id)) > 0),
    version INTEGER NOT NULL CHECK (version >= 1),
    event_type TEXT NOT NULL,
    is_delta INTEGER NOT NULL CHECK (is_delta IN (0, 1)),
    payload_json TEXT NOT NULL,
    previous_event_id TEXT,
    checksum TEXT NOT NULL CHECK (checksum LIKE 'blake3:%'),
    actor TEXT NOT NULL,
    device_id TEXT,
    correlation_id TEXT,
    wall_ts_us INTEGER NOT NULL,
    metadata_json TEXT NOT NULL,
    UNIQUE (entity_id, version)
);

CREATE INDEX IF NOT EXISTS idx_events_wall_ts
    ON events(wall_ts_us);

CREATE INDEX IF NOT EXISTS idx_events_entity_wall_ts
    ON events(entity_id, wall_ts_us);
";

/// Migration v2: per-device sync state.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sync_records (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    last_seen_version INTEGER NOT NULL DEFAULT 0 CHECK (last_seen_version >= 0),
    pending_delta_json TEXT,
    updated_at_us INTEGER NOT NULL,
    PRIMARY KEY (user_id, device_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_records_entity
    ON sync_records(entity_id);
";

/// Indexes the store relies on for bounded replay and feed queries.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_events_wall_ts",
    "idx_events_entity_wall_ts",
    "idx_sync_records_entity",
];
