//! Per-path conflict resolution for concurrent device writes.
//!
//! The resolver is pure. Given the delta a device is pushing and the remote
//! changes committed since that device's base version, it decides each
//! incoming path independently:
//!
//! 1. **Merge**: no remote change overlaps the path. The incoming change is
//!    kept as is.
//! 2. **Converged**: every overlapping remote change wrote the same value to
//!    the same path. Nothing to do.
//! 3. **Last-write-wins**: the incoming timestamp and the latest overlapping
//!    remote timestamp differ by more than the clock tolerance. The later one
//!    keeps the path; the other side's change is returned as superseded. An
//!    incoming win over a remote write to an ancestor path is taken at that
//!    ancestor, using the pushing device's full view, so the subtree ends up
//!    as the device left it.
//! 4. **Conflict**: the timestamps are within tolerance. Neither side is
//!    applied on that path and every candidate is surfaced unmodified.
//!
//! Paths overlap when one is a segment prefix of the other, so `/amount` and
//! `/amount/minor` compete while `/amount` and `/category` merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::{Delta, FieldChange, path};
use crate::event::{Event, Payload, SupersededChange};

/// A delta with the provenance the resolver ranks it by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDelta {
    pub delta: Delta,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Committed version for remote changes, `None` for the incoming push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl PendingDelta {
    /// View a committed event as a remote change. A snapshot touches the
    /// whole document (`""`).
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        let delta = match &event.payload {
            Payload::Delta(delta) => delta.clone(),
            Payload::Snapshot(state) => {
                let mut root = Delta::new();
                root.insert("", FieldChange::added(state.clone()));
                root
            }
        };
        Self {
            delta,
            actor: event.actor.clone(),
            device_id: event.metadata.device_id.clone(),
            timestamp: event.timestamp(),
            version: Some(event.version),
        }
    }
}

/// One side of an unresolved path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// The path this candidate wrote, which may be a parent or child of the
    /// conflict path.
    pub path: String,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// A path that needs a manual decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub candidates: Vec<Candidate>,
}

/// Resolver output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Incoming changes that survive: merged paths plus LWW winners.
    pub resolved_delta: Delta,
    pub conflicts: Vec<Conflict>,
    /// Losing writes, from either side.
    pub superseded: Vec<SupersededChange>,
    /// Incoming paths no remote change touched.
    pub merged_paths: Vec<String>,
    /// Incoming paths decided by last-write-wins, whichever side won.
    pub decided_paths: Vec<String>,
}

impl Resolution {
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Unresolved conflict paths as a delta of the incoming side, suitable
    /// for parking on the device's sync record.
    #[must_use]
    pub fn unresolved_delta(&self, incoming: &PendingDelta) -> Delta {
        incoming
            .delta
            .iter()
            .filter(|(p, _)| self.conflicts.iter().any(|c| &c.path == *p))
            .map(|(p, change)| (p.clone(), change.clone()))
            .collect()
    }
}

struct Competitor<'a> {
    origin: &'a PendingDelta,
    path: &'a str,
    change: &'a FieldChange,
}

/// Remote writes overlapping `needle`.
fn competitors_of<'a>(remote: &'a [PendingDelta], needle: &str) -> Vec<Competitor<'a>> {
    remote
        .iter()
        .flat_map(|origin| {
            origin
                .delta
                .iter()
                .filter(move |(p, _)| path::overlaps(p, needle))
                .map(move |(p, c)| Competitor {
                    origin,
                    path: p,
                    change: c,
                })
        })
        .collect()
}

/// Latest by timestamp; on equal timestamps the later arrival.
fn newest<'c, 'a>(competitors: &'c [Competitor<'a>]) -> Option<&'c Competitor<'a>> {
    competitors
        .iter()
        .max_by_key(|c| (c.origin.timestamp, c.origin.version))
}

/// Resolve `incoming` against `remote` changes, oldest first.
///
/// `incoming_state` is the pushing device's full view, which `incoming` was
/// diffed into.
#[must_use]
pub fn resolve(
    incoming: &PendingDelta,
    incoming_state: &Value,
    remote: &[PendingDelta],
    tolerance_ms: u64,
) -> Resolution {
    let tolerance_us = tolerance_ms.saturating_mul(1_000);
    let mut out = Resolution::default();

    for (incoming_path, change) in &incoming.delta {
        let needle = incoming_path.as_str();
        let competitors = competitors_of(remote, needle);

        let Some(latest) = newest(&competitors) else {
            out.resolved_delta.insert(incoming_path.clone(), change.clone());
            out.merged_paths.push(incoming_path.clone());
            continue;
        };

        let converged = competitors
            .iter()
            .all(|c| c.path == needle && c.change.new == change.new);
        if converged {
            continue;
        }

        let gap_us = micros_between(incoming.timestamp, latest.origin.timestamp);
        if gap_us.unsigned_abs() <= tolerance_us {
            out.conflicts.push(conflict(incoming, needle, change, &competitors));
        } else if gap_us > 0 {
            // Shallowest remote ancestor of the incoming path, if any.
            let scope = competitors
                .iter()
                .map(|c| c.path)
                .filter(|p| p.len() < needle.len())
                .min_by_key(|p| p.len());
            let Some(scope) = scope else {
                out.resolved_delta.insert(incoming_path.clone(), change.clone());
                out.decided_paths.push(incoming_path.clone());
                supersede(&mut out.superseded, &competitors);
                continue;
            };

            // The win only holds if it also beats every remote write under
            // the ancestor, and the device's view has a value there.
            let widened = competitors_of(remote, scope);
            let beats_all = newest(&widened).is_some_and(|c| {
                let gap = micros_between(incoming.timestamp, c.origin.timestamp);
                gap > 0 && gap.unsigned_abs() > tolerance_us
            });
            match path::lookup(incoming_state, scope) {
                Some(value) if beats_all => {
                    out.resolved_delta.insert(scope, FieldChange::added(value.clone()));
                    out.decided_paths.push(incoming_path.clone());
                    supersede(&mut out.superseded, &widened);
                }
                _ => out.conflicts.push(conflict(incoming, needle, change, &competitors)),
            }
        } else {
            out.decided_paths.push(incoming_path.clone());
            out.superseded.push(superseded(incoming_path, change, incoming));
        }
    }

    out
}

fn conflict(
    incoming: &PendingDelta,
    at: &str,
    change: &FieldChange,
    competitors: &[Competitor<'_>],
) -> Conflict {
    let mut candidates = vec![Candidate {
        path: at.to_string(),
        value: change.new.clone(),
        actor: incoming.actor.clone(),
        device_id: incoming.device_id.clone(),
        timestamp: incoming.timestamp,
        version: None,
    }];
    candidates.extend(competitors.iter().map(|c| Candidate {
        path: c.path.to_string(),
        value: c.change.new.clone(),
        actor: c.origin.actor.clone(),
        device_id: c.origin.device_id.clone(),
        timestamp: c.origin.timestamp,
        version: c.origin.version,
    }));
    Conflict {
        path: at.to_string(),
        candidates,
    }
}

fn supersede(out: &mut Vec<SupersededChange>, losers: &[Competitor<'_>]) {
    for c in losers {
        let loser = superseded(c.path, c.change, c.origin);
        if !out.contains(&loser) {
            out.push(loser);
        }
    }
}

fn superseded(at: &str, change: &FieldChange, origin: &PendingDelta) -> SupersededChange {
    SupersededChange {
        path: at.to_string(),
        value: change.new.clone(),
        actor: origin.actor.clone(),
        device_id: origin.device_id.clone(),
        timestamp: origin.timestamp,
    }
}

fn micros_between(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    let gap = a.signed_duration_since(b);
    gap.num_microseconds().unwrap_or(if gap > chrono::Duration::zero() {
        i64::MAX
    } else {
        i64::MIN
    })
}
