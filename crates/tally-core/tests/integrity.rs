use rusqlite::{Connection, params};
use serde_json::json;
use tally_core::config::EngineConfig;
use tally_core::verify::{BreakReason, ensure_intact, verify, verify_all};
use tally_core::{EventStore, LedgerError};
use tempfile::TempDir;

#[path = "support.rs"]
mod support;
use support::record_states;

fn tempstore() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.sqlite3");
    let mut store = EventStore::open(&path, &EngineConfig::default()).expect("store");
    record_states(
        &mut store,
        "tx-1",
        &(0..6).map(|n| json!({"amount": n * 10, "memo": "x"})).collect::<Vec<_>>(),
    );
    record_states(&mut store, "tx-2", &[json!({"amount": 1}), json!({"amount": 2})]);
    (dir, path)
}

fn reopen(path: &std::path::Path) -> EventStore {
    EventStore::open(path, &EngineConfig::default()).expect("reopen")
}

#[test]
fn untouched_chains_verify() {
    let (_dir, path) = tempstore();
    let store = reopen(&path);
    let reports = verify_all(&store).expect("verify");
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.valid && r.broken_at_version.is_none()));
}

#[test]
fn payload_tampering_breaks_at_that_version() {
    let (_dir, path) = tempstore();
    let raw = Connection::open(&path).expect("raw");
    raw.execute(
        "UPDATE events SET payload_json = ?1 WHERE entity_id = 'tx-1' AND version = 4",
        params![r#"{"/amount":{"old":20,"new":9999}}"#],
    )
    .expect("tamper");
    drop(raw);

    let store = reopen(&path);
    let report = verify(&store, "tx-1").expect("verify");
    assert!(!report.valid);
    assert_eq!(report.broken_at_version, Some(4));
    assert!(matches!(report.reason, Some(BreakReason::ChecksumMismatch { .. })));

    // Other entities are unaffected.
    assert!(verify(&store, "tx-2").expect("verify").valid);
    assert!(matches!(
        ensure_intact(&store, "tx-1"),
        Err(LedgerError::IntegrityViolation { version: 4, .. })
    ));
}

#[test]
fn rehashing_a_tampered_event_still_breaks_the_chain() {
    let (_dir, path) = tempstore();
    let raw = Connection::open(&path).expect("raw");
    raw.execute(
        "UPDATE events SET payload_json = ?1 WHERE entity_id = 'tx-1' AND version = 2",
        params![r#"{"/amount":{"old":0,"new":999}}"#],
    )
    .expect("tamper");
    let events = reopen(&path).events("tx-1").expect("events");
    let rehashed = events[1].recompute_checksum(Some(&events[0])).expect("rehash");
    raw.execute(
        "UPDATE events SET checksum = ?1 WHERE entity_id = 'tx-1' AND version = 2",
        params![rehashed],
    )
    .expect("rehash");
    drop(raw);

    let report = verify(&reopen(&path), "tx-1").expect("verify");
    assert!(!report.valid);
    assert_eq!(report.broken_at_version, Some(3));
    assert!(matches!(report.reason, Some(BreakReason::ChecksumMismatch { .. })));
}

#[test]
fn tampering_the_origin_snapshot_breaks_at_one() {
    let (_dir, path) = tempstore();
    let raw = Connection::open(&path).expect("raw");
    raw.execute(
        "UPDATE events SET payload_json = '{\"amount\":1000000,\"memo\":\"x\"}' \
         WHERE entity_id = 'tx-1' AND version = 1",
        [],
    )
    .expect("tamper");
    drop(raw);

    let report = verify(&reopen(&path), "tx-1").expect("verify");
    assert_eq!(report.broken_at_version, Some(1));
}

#[test]
fn deleted_row_is_a_version_gap() {
    let (_dir, path) = tempstore();
    let raw = Connection::open(&path).expect("raw");
    raw.execute("DELETE FROM events WHERE entity_id = 'tx-1' AND version = 3", [])
        .expect("delete");
    drop(raw);

    let report = verify(&reopen(&path), "tx-1").expect("verify");
    assert_eq!(report.broken_at_version, Some(4));
    assert_eq!(
        report.reason,
        Some(BreakReason::VersionGap {
            expected: 3,
            found: 4
        })
    );
}

#[test]
fn overwritten_checksum_is_detected() {
    let (_dir, path) = tempstore();
    let raw = Connection::open(&path).expect("raw");
    raw.execute(
        "UPDATE events SET checksum = 'blake3:00' WHERE entity_id = 'tx-1' AND version = 2",
        [],
    )
    .expect("tamper");
    drop(raw);

    let report = verify(&reopen(&path), "tx-1").expect("verify");
    assert_eq!(report.broken_at_version, Some(2));
    assert_eq!(report.checked, 2);
}

#[test]
fn verify_unknown_entity_is_not_found() {
    let (_dir, path) = tempstore();
    assert!(matches!(
        verify(&reopen(&path), "ghost"),
        Err(LedgerError::NotFound { .. })
    ));
}
