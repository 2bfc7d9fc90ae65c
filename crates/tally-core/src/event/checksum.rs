//! Chain checksums and event id minting.
//!
//! The checksum input is the UTF-8 bytes of:
//!
//! ```text
//! tally-event-v2\n{entity_id}\n{version}\n{previous_event_id}\n{previous_digest}\n{payload}\n
//! ```
//!
//! where the payload is rendered with [`canonical_json`] over its tagged serde
//! form and absent links are empty. `previous_digest` is the predecessor's
//! checksum, so rewriting one payload breaks every later digest even if its
//! own checksum is recomputed. A retention snapshot has no predecessor but
//! carries the checksum of the event it replaced, and that anchor stands in
//! as its chain digest. The digest is rendered `blake3:<hex>`.

use chrono::{DateTime, Utc};

use super::canonical::canonical_json;
use super::{EventId, Payload};

/// Prefix shared by every checksum string.
pub const CHECKSUM_PREFIX: &str = "blake3:";

const DOMAIN: &str = "tally-event-v2";

/// Compute the chain checksum for an event at `version`.
///
/// # Errors
///
/// Returns an error if the payload fails to serialize.
pub fn compute_checksum(
    entity_id: &str,
    version: u64,
    previous: Option<&EventId>,
    previous_digest: Option<&str>,
    payload: &Payload,
) -> Result<String, serde_json::Error> {
    let payload_json = canonical_json(&serde_json::to_value(payload)?);
    let previous = previous.map_or("", EventId::as_str);
    let previous_digest = previous_digest.unwrap_or("");
    let input = format!(
        "{DOMAIN}\n{entity_id}\n{version}\n{previous}\n{previous_digest}\n{payload_json}\n"
    );
    Ok(format!("{CHECKSUM_PREFIX}{}", blake3::hash(input.as_bytes())))
}

/// Mint a fresh event id for (`entity_id`, `version`).
///
/// Ids are derived from identity and provenance, not content, so a retention
/// snapshot can take over the id of the event it replaces.
#[must_use]
pub fn mint_event_id(
    entity_id: &str,
    version: u64,
    timestamp: DateTime<Utc>,
    actor: &str,
) -> EventId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tally-event-id\n");
    hasher.update(entity_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(version.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp.timestamp_micros().to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(actor.as_bytes());
    let hex = hasher.finalize().to_hex();
    EventId::new(format!("evt-{}", &hex[..32]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::compute_delta;
    use chrono::TimeZone;
    use serde_json::json;

    fn snapshot() -> Payload {
        Payload::Snapshot(json!({"amount": 1000, "payee": "Grocer"}))
    }

    #[test]
    fn checksum_has_prefix_and_is_stable() {
        let a = compute_checksum("tx-1", 1, None, None, &snapshot()).expect("checksum");
        let b = compute_checksum("tx-1", 1, None, None, &snapshot()).expect("checksum");
        assert!(a.starts_with(CHECKSUM_PREFIX));
        assert_eq!(a.len(), CHECKSUM_PREFIX.len() + 64);
        assert_eq!(a, b);
    }

    #[test]
    fn key_order_does_not_change_checksum() {
        let reordered: serde_json::Value =
            serde_json::from_str(r#"{"payee":"Grocer","amount":1000}"#).expect("json");
        assert_eq!(
            compute_checksum("tx-1", 1, None, None, &snapshot()).expect("a"),
            compute_checksum("tx-1", 1, None, None, &Payload::Snapshot(reordered)).expect("b"),
        );
    }

    #[test]
    fn every_chained_field_feeds_the_digest() {
        fn link(
            id: &str,
            version: u64,
            previous: Option<&EventId>,
            digest: Option<&str>,
        ) -> Result<String, serde_json::Error> {
            compute_checksum(id, version, previous, digest, &snapshot())
        }

        let a = EventId::new("evt-a");
        let base = link("tx-1", 2, Some(&a), Some("blake3:aa")).expect("base");
        let variants = [
            link("tx-2", 2, Some(&a), Some("blake3:aa")),
            link("tx-1", 3, Some(&a), Some("blake3:aa")),
            link("tx-1", 2, Some(&EventId::new("evt-b")), Some("blake3:aa")),
            link("tx-1", 2, Some(&a), Some("blake3:bb")),
            link("tx-1", 2, Some(&a), None),
            link("tx-1", 2, None, Some("blake3:aa")),
        ];
        for variant in variants {
            assert_ne!(variant.expect("checksum"), base);
        }
    }

    #[test]
    fn predecessor_digest_changes_when_its_payload_does() {
        let v1 = compute_checksum("tx-1", 1, None, None, &snapshot()).expect("v1");
        let forged = Payload::Snapshot(json!({"amount": 999, "payee": "Grocer"}));
        let forged_v1 = compute_checksum("tx-1", 1, None, None, &forged).expect("forged");
        let a = EventId::new("evt-a");
        let delta = Payload::Delta(compute_delta(&json!({"amount": 1000}), &json!({"amount": 5})));
        assert_ne!(
            compute_checksum("tx-1", 2, Some(&a), Some(&v1), &delta).expect("honest"),
            compute_checksum("tx-1", 2, Some(&a), Some(&forged_v1), &delta).expect("forged"),
        );
    }

    #[test]
    fn snapshot_and_delta_of_same_shape_differ() {
        let delta = Payload::Delta(compute_delta(&json!({}), &json!({"amount": 1000})));
        assert_ne!(
            compute_checksum("tx-1", 1, None, None, &snapshot()).expect("a"),
            compute_checksum("tx-1", 1, None, None, &delta).expect("b"),
        );
    }

    #[test]
    fn event_ids_are_prefixed_and_distinct_per_version() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid");
        let v1 = mint_event_id("tx-1", 1, ts, "ana");
        let v2 = mint_event_id("tx-1", 2, ts, "ana");
        assert!(v1.as_str().starts_with("evt-"));
        assert_eq!(v1.as_str().len(), 36);
        assert_ne!(v1, v2);
        assert_eq!(v1, mint_event_id("tx-1", 1, ts, "ana"));
    }
}
