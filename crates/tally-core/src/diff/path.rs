//! Field paths used as delta keys.
//!
//! Paths are JSON Pointers (RFC 6901): `""` is the whole document,
//! `/amount` a top-level field, `/splits/0/amount` a field of the first
//! array element. Array elements matched by a merge key are addressed with a
//! `[key=<canonical json>]` segment, e.g. `/splits/[id="s1"]/amount`.

use std::cmp::Ordering;

use serde_json::Value;

use crate::event::canonical::canonical_json;

use super::DiffError;

/// Split a pointer into unescaped segments.
///
/// # Errors
///
/// Returns [`DiffError::InvalidPath`] if a non-empty pointer does not start
/// with `/` or contains a dangling `~` escape.
pub fn parse(pointer: &str) -> Result<Vec<String>, DiffError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(DiffError::InvalidPath {
            path: pointer.to_string(),
        });
    };
    rest.split('/')
        .map(|raw| {
            unescape(raw).ok_or_else(|| DiffError::InvalidPath {
                path: pointer.to_string(),
            })
        })
        .collect()
}

/// Append one segment to a parent pointer.
#[must_use]
pub fn join(parent: &str, segment: &str) -> String {
    let mut out = String::with_capacity(parent.len() + segment.len() + 1);
    out.push_str(parent);
    out.push('/');
    for c in segment.chars() {
        match c {
            '~' => out.push_str("~0"),
            '/' => out.push_str("~1"),
            other => out.push(other),
        }
    }
    out
}

/// Segment addressing the array element whose `key` field equals `value`.
#[must_use]
pub fn keyed_segment(key: &str, value: &Value) -> String {
    format!("[{key}={}]", canonical_json(value))
}

/// Inverse of [`keyed_segment`].
#[must_use]
pub fn parse_keyed(segment: &str) -> Option<(&str, Value)> {
    let inner = segment.strip_prefix('[')?.strip_suffix(']')?;
    let (key, raw) = inner.split_once('=')?;
    let value = serde_json::from_str(raw).ok()?;
    Some((key, value))
}

/// Two paths overlap when one is a segment-wise prefix of the other.
///
/// `/amount` overlaps `/amount` and `/amount/minor`, but not `/amountNote`.
#[must_use]
pub fn overlaps(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long.strip_prefix(short)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Order paths segment by segment, comparing numeric segments as numbers so
/// `/items/2` sorts before `/items/10`.
#[must_use]
pub fn cmp_paths(a: &str, b: &str) -> Ordering {
    let mut left = a.split('/');
    let mut right = b.split('/');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Read the value at `pointer`, following keyed segments.
#[must_use]
pub fn lookup<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
    let segments = parse(pointer).ok()?;
    let mut current = root;
    for segment in &segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(element_index(items, segment)?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve an array segment (numeric index or keyed) to a position.
pub(crate) fn element_index(items: &[Value], segment: &str) -> Option<usize> {
    if let Some((key, wanted)) = parse_keyed(segment) {
        return items.iter().position(|item| item.get(key) == Some(&wanted));
    }
    segment
        .parse::<usize>()
        .ok()
        .filter(|idx| *idx < items.len())
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next()? {
                '0' => out.push('~'),
                '1' => out.push('/'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}
