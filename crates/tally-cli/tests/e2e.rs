//! E2E CLI tests: each test runs the `tally` binary as a subprocess in an
//! isolated temp directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

/// Build a Command targeting the tally binary, rooted in `dir`.
fn tally_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tally"));
    cmd.current_dir(dir);
    cmd.env("TALLY_LOG", "error");
    cmd.env("XDG_CONFIG_HOME", dir.join("xdg"));
    cmd.env("HOME", dir);
    cmd.env_remove("TALLY_DB");
    cmd.env_remove("FORMAT");
    cmd.env_remove("RUST_BACKTRACE");
    cmd.env_remove("RUST_LIB_BACKTRACE");
    cmd
}

fn init_project() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    tally_cmd(dir.path()).args(["init"]).assert().success();
    dir
}

/// Run with `--json` and parse stdout.
fn json(dir: &Path, args: &[&str]) -> Value {
    let output = tally_cmd(dir)
        .args(args)
        .arg("--json")
        .output()
        .expect("command should not crash");
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

/// Run with `--json`, expect failure, and parse the error envelope on stderr.
fn json_error(dir: &Path, args: &[&str]) -> Value {
    let output = tally_cmd(dir)
        .args(args)
        .arg("--json")
        .output()
        .expect("command should not crash");
    assert!(!output.status.success(), "{args:?} unexpectedly succeeded");
    let stderr = String::from_utf8_lossy(&output.stderr);
    let start = stderr.find('{').expect("error envelope on stderr");
    let end = stderr.rfind('}').expect("error envelope on stderr");
    serde_json::from_str(&stderr[start..=end]).expect("valid error envelope")
}

fn record(dir: &Path, id: &str, data: &str) -> Value {
    json(dir, &["record", "transaction", id, "--data", data, "--actor", "ana"])
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

#[test]
fn init_creates_project_skeleton() {
    let dir = init_project();
    assert!(dir.path().join(".tally/config.toml").exists());
    assert!(dir.path().join(".tally/events.sqlite3").exists());

    tally_cmd(dir.path())
        .args(["init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    tally_cmd(dir.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn tally_db_env_overrides_store_location() {
    let dir = init_project();
    let custom = dir.path().join("elsewhere.sqlite3");
    tally_cmd(dir.path())
        .env("TALLY_DB", &custom)
        .args(["record", "transaction", "tx-1", "--data", r#"{"amount": 1}"#])
        .assert()
        .success();
    assert!(custom.exists());
}

// ---------------------------------------------------------------------------
// Record / replay / audit
// ---------------------------------------------------------------------------

#[test]
fn record_then_replay_by_version() {
    let dir = init_project();
    let first = record(dir.path(), "tx-1", r#"{"amount": 100, "category": "food"}"#);
    assert_eq!(first["log"]["version"], 1);
    assert_eq!(first["log"]["eventType"], "TRANSACTION_CREATED");

    let second = record(dir.path(), "tx-1", r#"{"amount": 120, "category": "food"}"#);
    assert_eq!(second["log"]["version"], 2);
    assert_eq!(second["log"]["changeSummary"], serde_json::json!(["/amount"]));

    let unchanged = record(dir.path(), "tx-1", r#"{"amount": 120, "category": "food"}"#);
    assert_eq!(unchanged["changed"], false);

    let v1 = json(dir.path(), &["replay", "tx-1", "--at-version", "1"]);
    assert_eq!(v1["success"], true);
    assert_eq!(v1["data"]["amount"], 100);

    let head = json(dir.path(), &["replay", "tx-1"]);
    assert_eq!(head["data"]["amount"], 120);
}

#[test]
fn replay_of_unknown_entity_is_null() {
    let dir = init_project();
    let out = json(dir.path(), &["replay", "ghost", "--at-version", "1"]);
    assert_eq!(out["success"], true);
    assert!(out["data"].is_null());
}

#[test]
fn replay_with_two_boundaries_is_a_bad_request() {
    let dir = init_project();
    record(dir.path(), "tx-1", r#"{"amount": 1}"#);
    let err = json_error(
        dir.path(),
        &["replay", "tx-1", "--at-version", "1", "--at", "2024-06-01T00:00:00Z"],
    );
    assert_eq!(err["success"], false);
    assert_eq!(err["error"]["kind"], "BadRequest");
}

#[test]
fn audit_lists_every_event() {
    let dir = init_project();
    record(dir.path(), "tx-1", r#"{"amount": 1}"#);
    record(dir.path(), "tx-1", r#"{"amount": 2}"#);

    let audit = json(dir.path(), &["audit", "tx-1"]);
    let entries = audit["data"].as_array().expect("array");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["changeSummary"], "FULL_SNAPSHOT");
    assert_eq!(entries[1]["actor"], "ana");

    tally_cmd(dir.path())
        .args(["audit", "tx-1", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TRANSACTION_UPDATED"));
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

#[test]
fn verify_detects_tampering() {
    let dir = init_project();
    for n in 1..=4 {
        record(dir.path(), "tx-1", &format!(r#"{{"amount": {n}}}"#));
    }
    let ok = json(dir.path(), &["verify", "tx-1"]);
    assert_eq!(ok["valid"], true);
    assert!(ok["brokenAtVersion"].is_null());

    let raw = rusqlite::Connection::open(dir.path().join(".tally/events.sqlite3")).expect("raw");
    raw.execute(
        "UPDATE events SET payload_json = '{\"/amount\":{\"old\":2,\"new\":999}}' \
         WHERE entity_id = 'tx-1' AND version = 3",
        [],
    )
    .expect("tamper");
    drop(raw);

    let output = tally_cmd(dir.path())
        .args(["verify", "tx-1", "--json"])
        .output()
        .expect("run");
    assert!(!output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["valid"], false);
    assert_eq!(report["brokenAtVersion"], 3);

    tally_cmd(dir.path())
        .args(["verify", "--format", "text"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAIL tx-1 at v3"));
}

#[test]
fn verify_unknown_entity_is_not_found() {
    let dir = init_project();
    let err = json_error(dir.path(), &["verify", "ghost"]);
    assert_eq!(err["error"]["kind"], "NotFound");
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

fn push(dir: &Path, device: &str, base: &str, at: &str, data: &str) -> Value {
    json(
        dir,
        &[
            "push", "transaction", "tx-2", "--user", "u1", "--device", device, "--base", base,
            "--at", at, "--data", data,
        ],
    )
}

#[test]
fn concurrent_pushes_merge() {
    let dir = init_project();
    let created = push(
        dir.path(),
        "a",
        "0",
        "2024-06-01T12:00:00Z",
        r#"{"amount": 100, "category": "food"}"#,
    );
    assert_eq!(created["action"], "created");
    assert_eq!(created["version"], 1);

    push(
        dir.path(),
        "a",
        "1",
        "2024-06-01T12:01:00Z",
        r#"{"amount": 100, "category": "dining"}"#,
    );
    let merged = push(
        dir.path(),
        "b",
        "1",
        "2024-06-01T12:00:30Z",
        r#"{"amount": 250, "category": "food"}"#,
    );
    assert_eq!(merged["action"], "merged");
    assert_eq!(merged["version"], 3);
    assert_eq!(merged["entity"]["amount"], 250);
    assert_eq!(merged["entity"]["category"], "dining");
}

#[test]
fn strict_push_refuses_conflicts() {
    let dir = init_project();
    push(dir.path(), "a", "0", "2024-06-01T12:00:00Z", r#"{"amount": 100}"#);
    push(dir.path(), "a", "1", "2024-06-01T12:05:00Z", r#"{"amount": 120}"#);

    let err = json_error(
        dir.path(),
        &[
            "push", "transaction", "tx-2", "--user", "u1", "--device", "b", "--base", "1",
            "--at", "2024-06-01T12:05:00Z", "--data", r#"{"amount": 130}"#, "--strict",
        ],
    );
    assert_eq!(err["success"], false);
    assert_eq!(err["error"]["kind"], "UnresolvedConflict");

    let head = json(dir.path(), &["replay", "tx-2"]);
    assert_eq!(head["data"]["amount"], 120);
}

#[test]
fn pull_returns_changes_and_cursor() {
    let dir = init_project();
    record(dir.path(), "tx-1", r#"{"amount": 1}"#);
    record(dir.path(), "tx-1", r#"{"amount": 2}"#);

    let all = json(dir.path(), &["pull", "--user", "u1", "--device", "phone"]);
    assert_eq!(all["success"], true);
    assert_eq!(all["count"], 2);
    let cursor = all["v"].as_i64().expect("cursor");

    record(dir.path(), "tx-1", r#"{"amount": 3}"#);
    let next = json(
        dir.path(),
        &["pull", "--user", "u1", "--device", "phone", "--since", &cursor.to_string()],
    );
    assert_eq!(next["count"], 1);
    assert_eq!(next["changes"][0]["version"], 3);
}

#[test]
fn delete_keeps_history() {
    let dir = init_project();
    record(dir.path(), "tx-1", r#"{"amount": 1}"#);

    let deleted = json(
        dir.path(),
        &["delete", "transaction", "tx-1", "--user", "u1", "--device", "phone"],
    );
    assert_eq!(deleted["log"]["eventType"], "TRANSACTION_DELETED");

    let head = json(dir.path(), &["replay", "tx-1"]);
    assert_eq!(head["data"]["isDeleted"], true);
    let v1 = json(dir.path(), &["replay", "tx-1", "--at-version", "1"]);
    assert!(v1["data"].get("isDeleted").is_none());
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[test]
fn prune_collapses_old_history() {
    let dir = init_project();
    for n in 1..=3 {
        record(dir.path(), "tx-1", &format!(r#"{{"amount": {n}}}"#));
    }

    let out = json(dir.path(), &["prune", "--older-than", "2999-01-01T00:00:00Z"]);
    assert_eq!(out["reports"][0]["entityId"], "tx-1");
    assert_eq!(out["reports"][0]["snapshotVersion"], 3);
    assert_eq!(out["reports"][0]["removedEvents"], 2);

    let head = json(dir.path(), &["replay", "tx-1"]);
    assert_eq!(head["data"]["amount"], 3);
    assert_eq!(json(dir.path(), &["verify"])["valid"], true);

    let err = json_error(dir.path(), &["replay", "tx-1", "--at-version", "1"]);
    assert_eq!(err["error"]["kind"], "HistoryPruned");
}

#[test]
fn prune_without_cutoff_fails() {
    let dir = init_project();
    tally_cmd(dir.path())
        .args(["prune"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_age_days"));
}
