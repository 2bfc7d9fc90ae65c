//! Canonical JSON encoding for checksum input.
//!
//! Two logically equal payloads must hash to the same digest no matter which
//! device produced them or how their maps were ordered in memory, so the
//! checksum never sees `serde_json`'s own output directly.
//!
//! Rules:
//! - Compact: no whitespace between tokens.
//! - Object keys sorted by their UTF-8 bytes at every depth.
//! - Array order preserved.
//! - Scalars rendered with `serde_json`'s escaping and number formatting.

use serde_json::Value;

/// Render `value` as canonical JSON.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tally_core::event::canonical::canonical_json;
///
/// let val = json!({"payee": "Grocer", "amount": {"minor": 1250, "currency": "EUR"}});
/// assert_eq!(
///     canonical_json(&val),
///     r#"{"amount":{"currency":"EUR","minor":1250},"payee":"Grocer"}"#
/// );
/// ```
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::with_capacity(64);
    push_value(value, &mut out);
    out
}

fn push_value(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                push_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                push_string(key, out);
                out.push(':');
                push_value(item, out);
            }
            out.push('}');
        }
        Value::String(s) => push_string(s, out),
        // Null, bool and number display as compact JSON already.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn push_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::canonical_json;
    use serde_json::json;

    #[test]
    fn scalars_render_compactly() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!(true)), "true");
        assert_eq!(canonical_json(&json!(-42)), "-42");
        assert_eq!(canonical_json(&json!(12.5)), "12.5");
        assert_eq!(canonical_json(&json!("caf\u{e9}")), "\"caf\u{e9}\"");
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(
            canonical_json(&json!("memo \"rent\"\n")),
            r#""memo \"rent\"\n""#
        );
    }

    #[test]
    fn keys_sorted_at_every_depth() {
        let val = json!({
            "splits": [{"id": "s2", "amount": 5}, {"amount": 7, "id": "s1"}],
            "category": {"name": "food", "code": 3},
            "amount": 12
        });
        assert_eq!(
            canonical_json(&val),
            r#"{"amount":12,"category":{"code":3,"name":"food"},"splits":[{"amount":5,"id":"s2"},{"amount":7,"id":"s1"}]}"#
        );
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(canonical_json(&json!([1, 2])), canonical_json(&json!([2, 1])));
    }

    #[test]
    fn reparse_is_stable() {
        let val = json!({"b": {"d": [1, {"z": 0, "y": 1}], "c": null}, "a": "x"});
        let first = canonical_json(&val);
        let reparsed: serde_json::Value = serde_json::from_str(&first).expect("valid json");
        assert_eq!(first, canonical_json(&reparsed));
        assert!(!first.contains(' '));
    }
}
