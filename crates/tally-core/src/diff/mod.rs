//! Structural deltas between two entity states.
//!
//! A [`Delta`] maps changed field paths (see [`path`]) to `{old, new}`
//! pairs. Only changed paths appear. An absent side means the field did not
//! exist, which is distinct from the field holding JSON `null`.
//!
//! # Diff rules
//!
//! - Objects are diffed key by key, recursively.
//! - Arrays are diffed by index: common indices recurse, extra trailing
//!   elements become additions or removals.
//! - Arrays stored under a field listed in [`DiffOptions::merge_keys`] are
//!   matched by that key instead when every element is an object carrying a
//!   unique key value. Element order is not tracked under a merge key.
//! - Any other difference (scalar change, type change) replaces the value at
//!   that path wholesale.
//!
//! # Folding
//!
//! [`apply_delta`] is strict and fails with [`DiffError`] on the first path
//! that does not fit the base. [`apply_delta_lenient`] is what replay uses:
//! it logs and skips bad paths so legacy histories still reconstruct.

pub mod path;

use std::collections::BTreeMap;
use std::collections::btree_map;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::event::canonical::canonical_json;

/// Why a delta path could not be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffError {
    #[error("malformed delta: invalid path '{path}'")]
    InvalidPath { path: String },

    #[error("malformed delta: '{path}' is absent from the base state")]
    MissingPath { path: String },

    #[error("malformed delta: parent of '{path}' is not an object or array")]
    NotAContainer { path: String },
}

impl DiffError {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::InvalidPath { path }
            | Self::MissingPath { path }
            | Self::NotAContainer { path } => path,
        }
    }
}

/// One changed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub new: Option<Value>,
}

impl FieldChange {
    #[must_use]
    pub const fn replace(old: Value, new: Value) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    #[must_use]
    pub const fn added(new: Value) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    #[must_use]
    pub const fn removed(old: Value) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    #[must_use]
    pub const fn is_removal(&self) -> bool {
        self.new.is_none()
    }
}

// A field that is present always deserializes to `Some`, even when it holds
// `null`; a missing field falls back to `#[serde(default)]`.
pub(crate) fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Changed paths between two states, keyed by JSON Pointer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta {
    changes: BTreeMap<String, FieldChange>,
}

impl Delta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn insert(&mut self, path: impl Into<String>, change: FieldChange) {
        self.changes.insert(path.into(), change);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FieldChange> {
        self.changes.get(path)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, FieldChange> {
        self.changes.iter()
    }

    /// Changed paths in canonical order.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.changes.keys().cloned().collect();
        paths.sort_by(|a, b| path::cmp_paths(a, b));
        paths
    }

    /// Returns `true` if any changed path overlaps `pointer`.
    #[must_use]
    pub fn touches(&self, pointer: &str) -> bool {
        self.changes.keys().any(|p| path::overlaps(p, pointer))
    }

    /// Keep only the changes for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &FieldChange) -> bool) {
        self.changes.retain(|p, change| keep(p, change));
    }

    /// Rewrite every `old` side against `state`, dropping changes that are
    /// already satisfied there.
    #[must_use]
    pub fn rebase_onto(&self, state: &Value) -> Self {
        let mut rebased = Self::new();
        for (pointer, change) in &self.changes {
            let current = path::lookup(state, pointer).cloned();
            if current == change.new {
                continue;
            }
            rebased.insert(
                pointer.clone(),
                FieldChange {
                    old: current,
                    new: change.new.clone(),
                },
            );
        }
        rebased
    }
}

impl IntoIterator for Delta {
    type Item = (String, FieldChange);
    type IntoIter = btree_map::IntoIter<String, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a Delta {
    type Item = (&'a String, &'a FieldChange);
    type IntoIter = btree_map::Iter<'a, String, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl FromIterator<(String, FieldChange)> for Delta {
    fn from_iter<I: IntoIterator<Item = (String, FieldChange)>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

/// Knobs for [`compute_delta_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Array field name → element key used to match elements, e.g.
    /// `splits → id`.
    #[serde(default)]
    pub merge_keys: BTreeMap<String, String>,
}

impl DiffOptions {
    #[must_use]
    pub fn with_merge_key(mut self, field: impl Into<String>, key: impl Into<String>) -> Self {
        self.merge_keys.insert(field.into(), key.into());
        self
    }
}

/// Compute the delta that turns `old` into `new`, diffing arrays by index.
#[must_use]
pub fn compute_delta(old: &Value, new: &Value) -> Delta {
    compute_delta_with(old, new, &DiffOptions::default())
}

/// Compute the delta that turns `old` into `new` under `options`.
#[must_use]
pub fn compute_delta_with(old: &Value, new: &Value, options: &DiffOptions) -> Delta {
    let mut delta = Delta::new();
    diff_value("", None, old, new, options, &mut delta);
    delta
}

fn diff_value(
    at: &str,
    field: Option<&str>,
    old: &Value,
    new: &Value,
    options: &DiffOptions,
    out: &mut Delta,
) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(a), Value::Object(b)) => diff_objects(at, a, b, options, out),
        (Value::Array(a), Value::Array(b)) => {
            let keyed = field
                .and_then(|f| options.merge_keys.get(f))
                .and_then(|key| Some((key_elements(a, key)?, key_elements(b, key)?)));
            match keyed {
                Some((old_elems, new_elems)) => {
                    diff_keyed(at, &old_elems, &new_elems, options, out);
                }
                None => diff_indexed(at, a, b, options, out),
            }
        }
        _ => out.insert(at, FieldChange::replace(old.clone(), new.clone())),
    }
}

fn diff_objects(
    at: &str,
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    options: &DiffOptions,
    out: &mut Delta,
) {
    for (key, old_val) in a {
        let child = path::join(at, key);
        match b.get(key) {
            Some(new_val) => diff_value(&child, Some(key), old_val, new_val, options, out),
            None => out.insert(child, FieldChange::removed(old_val.clone())),
        }
    }
    for (key, new_val) in b {
        if !a.contains_key(key) {
            out.insert(path::join(at, key), FieldChange::added(new_val.clone()));
        }
    }
}

fn diff_indexed(at: &str, a: &[Value], b: &[Value], options: &DiffOptions, out: &mut Delta) {
    let common = a.len().min(b.len());
    for idx in 0..common {
        diff_value(&path::join(at, &idx.to_string()), None, &a[idx], &b[idx], options, out);
    }
    for (idx, old_val) in a.iter().enumerate().skip(common) {
        out.insert(path::join(at, &idx.to_string()), FieldChange::removed(old_val.clone()));
    }
    for (idx, new_val) in b.iter().enumerate().skip(common) {
        out.insert(path::join(at, &idx.to_string()), FieldChange::added(new_val.clone()));
    }
}

fn diff_keyed(
    at: &str,
    old_elems: &[(String, &Value)],
    new_elems: &[(String, &Value)],
    options: &DiffOptions,
    out: &mut Delta,
) {
    for (segment, old_val) in old_elems {
        let child = path::join(at, segment);
        match new_elems.iter().find(|(s, _)| s == segment) {
            Some((_, new_val)) => diff_value(&child, None, old_val, new_val, options, out),
            None => out.insert(child, FieldChange::removed((*old_val).clone())),
        }
    }
    for (segment, new_val) in new_elems {
        if !old_elems.iter().any(|(s, _)| s == segment) {
            out.insert(path::join(at, segment), FieldChange::added((*new_val).clone()));
        }
    }
}

/// Pair each element with its keyed segment, or `None` when the array is not
/// cleanly keyed (non-object element, missing key, duplicate key value).
fn key_elements<'a>(items: &'a [Value], key: &str) -> Option<Vec<(String, &'a Value)>> {
    let mut seen = std::collections::HashSet::with_capacity(items.len());
    items
        .iter()
        .map(|item| {
            let key_value = item.as_object()?.get(key)?;
            seen.insert(canonical_json(key_value))
                .then(|| (path::keyed_segment(key, key_value), item))
        })
        .collect()
}

/// Replace the state wholesale. Snapshots ignore whatever came before.
#[must_use]
pub fn apply_snapshot(_base: &Value, snapshot: &Value) -> Value {
    snapshot.clone()
}

/// Apply `delta` to `base`, failing on the first path that does not fit.
///
/// # Errors
///
/// Returns [`DiffError`] when a referenced path is absent from `base`, is not
/// a valid pointer, or runs through a scalar.
pub fn apply_delta(base: &Value, delta: &Delta) -> Result<Value, DiffError> {
    let mut state = base.clone();
    for (pointer, change) in ordered(delta) {
        apply_change(&mut state, pointer, change)?;
    }
    Ok(state)
}

/// Result of a lenient fold.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub state: Value,
    pub skipped: Vec<DiffError>,
}

/// Apply `delta` to `base`, skipping and logging paths that do not fit.
#[must_use]
pub fn apply_delta_lenient(base: &Value, delta: &Delta) -> Applied {
    let mut state = base.clone();
    let mut skipped = Vec::new();
    for (pointer, change) in ordered(delta) {
        if let Err(err) = apply_change(&mut state, pointer, change) {
            warn!(path = pointer, error = %err, "skipping malformed delta path");
            skipped.push(err);
        }
    }
    Applied { state, skipped }
}

/// Removals deepest/highest index first so trailing array removals do not
/// shift each other, then everything else in ascending path order.
fn ordered(delta: &Delta) -> Vec<(&str, &FieldChange)> {
    let (mut removals, mut rest): (Vec<_>, Vec<_>) = delta
        .iter()
        .map(|(p, c)| (p.as_str(), c))
        .partition(|(_, c)| c.is_removal());
    removals.sort_by(|(a, _), (b, _)| path::cmp_paths(b, a));
    rest.sort_by(|(a, _), (b, _)| path::cmp_paths(a, b));
    removals.extend(rest);
    removals
}

fn apply_change(state: &mut Value, pointer: &str, change: &FieldChange) -> Result<(), DiffError> {
    let mut segments = path::parse(pointer)?;
    let missing = || DiffError::MissingPath {
        path: pointer.to_string(),
    };

    let Some(last) = segments.pop() else {
        *state = change.new.clone().unwrap_or(Value::Null);
        return Ok(());
    };

    let parent = navigate(state, &segments).ok_or_else(missing)?;
    match parent {
        Value::Object(map) => match &change.new {
            Some(value) => {
                if change.old.is_some() && !map.contains_key(&last) {
                    return Err(missing());
                }
                map.insert(last, value.clone());
            }
            None => {
                map.remove(&last).ok_or_else(missing)?;
            }
        },
        Value::Array(items) => {
            let position = path::element_index(items, &last);
            match (&change.new, position) {
                (Some(value), Some(idx)) => items[idx] = value.clone(),
                (Some(value), None) if change.old.is_none() && appends_at_end(items, &last) => {
                    items.push(value.clone());
                }
                (None, Some(idx)) => {
                    items.remove(idx);
                }
                _ => return Err(missing()),
            }
        }
        _ => {
            return Err(DiffError::NotAContainer {
                path: pointer.to_string(),
            });
        }
    }
    Ok(())
}

fn appends_at_end(items: &[Value], segment: &str) -> bool {
    path::parse_keyed(segment).is_some() || segment.parse::<usize>().ok() == Some(items.len())
}

fn navigate<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => {
                let idx = path::element_index(items, segment)?;
                items.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_states_have_empty_delta() {
        let s = json!({"amount": 10, "tags": ["a"]});
        let delta = compute_delta(&s, &s);
        assert!(delta.is_empty());
        assert_eq!(apply_delta(&s, &delta).expect("apply"), s);
    }

    #[test]
    fn scalar_change_records_old_and_new() {
        let delta = compute_delta(&json!({"amount": 10}), &json!({"amount": 20}));
        assert_eq!(delta.paths(), ["/amount"]);
        assert_eq!(
            delta.get("/amount"),
            Some(&FieldChange::replace(json!(10), json!(20)))
        );
    }

    #[test]
    fn nested_objects_diff_by_path() {
        let old = json!({"amount": {"minor": 1000, "currency": "EUR"}, "memo": "x"});
        let new = json!({"amount": {"minor": 1250, "currency": "EUR"}, "memo": "x"});
        let delta = compute_delta(&old, &new);
        assert_eq!(delta.paths(), ["/amount/minor"]);
    }

    #[test]
    fn null_is_distinct_from_absent() {
        let delta = compute_delta(&json!({}), &json!({"note": null}));
        assert_eq!(delta.get("/note"), Some(&FieldChange::added(Value::Null)));

        let wire = serde_json::to_string(&delta).expect("ser");
        assert_eq!(wire, r#"{"/note":{"new":null}}"#);
        let back: Delta = serde_json::from_str(&wire).expect("de");
        assert_eq!(back, delta);
    }

    #[test]
    fn arrays_diff_by_index_with_trailing_changes() {
        let old = json!({"tags": ["rent", "home", "fixed"]});
        let new = json!({"tags": ["rent", "house"]});
        let delta = compute_delta(&old, &new);
        assert_eq!(delta.paths(), ["/tags/1", "/tags/2"]);
        assert!(delta.get("/tags/2").expect("removal").is_removal());
        assert_eq!(apply_delta(&old, &delta).expect("apply"), new);
    }

    #[test]
    fn many_trailing_removals_apply_high_index_first() {
        let old = json!({"xs": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]});
        let new = json!({"xs": [0]});
        let delta = compute_delta(&old, &new);
        assert_eq!(delta.len(), 11);
        assert_eq!(apply_delta(&old, &delta).expect("apply"), new);
    }

    #[test]
    fn trailing_additions_past_nine_apply_in_numeric_order() {
        let old = json!([]);
        let new = json!([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        let delta = compute_delta(&old, &new);
        assert_eq!(apply_delta(&old, &delta).expect("apply"), new);
    }

    #[test]
    fn merge_key_matches_elements_by_id() {
        let options = DiffOptions::default().with_merge_key("splits", "id");
        let old = json!({"splits": [{"id": "a", "amount": 5}, {"id": "b", "amount": 7}]});
        let new = json!({"splits": [{"id": "b", "amount": 8}, {"id": "c", "amount": 1}]});
        let delta = compute_delta_with(&old, &new, &options);

        assert_eq!(
            delta.paths(),
            [
                "/splits/[id=\"a\"]",
                "/splits/[id=\"b\"]/amount",
                "/splits/[id=\"c\"]"
            ]
        );
        let applied = apply_delta(&old, &delta).expect("apply");
        assert_eq!(
            applied,
            json!({"splits": [{"id": "b", "amount": 8}, {"id": "c", "amount": 1}]})
        );
    }

    #[test]
    fn merge_key_falls_back_to_index_on_duplicates() {
        let options = DiffOptions::default().with_merge_key("splits", "id");
        let old = json!({"splits": [{"id": "a"}, {"id": "a"}]});
        let new = json!({"splits": [{"id": "a"}]});
        let delta = compute_delta_with(&old, &new, &options);
        assert_eq!(delta.paths(), ["/splits/1"]);
    }

    #[test]
    fn type_change_replaces_wholesale() {
        let delta = compute_delta(&json!({"payee": {"name": "x"}}), &json!({"payee": "x"}));
        assert_eq!(delta.paths(), ["/payee"]);
    }

    #[test]
    fn root_replacement_uses_empty_path() {
        let delta = compute_delta(&json!(1), &json!({"a": 1}));
        assert_eq!(delta.paths(), [""]);
        assert_eq!(apply_delta(&json!(1), &delta).expect("apply"), json!({"a": 1}));
    }

    #[test]
    fn strict_apply_rejects_missing_path() {
        let mut delta = Delta::new();
        delta.insert("/category/name", FieldChange::replace(json!("a"), json!("b")));
        let err = apply_delta(&json!({"amount": 1}), &delta).unwrap_err();
        assert_eq!(
            err,
            DiffError::MissingPath {
                path: "/category/name".into()
            }
        );
    }

    #[test]
    fn lenient_apply_skips_only_bad_paths() {
        let mut delta = Delta::new();
        delta.insert("/amount", FieldChange::replace(json!(1), json!(2)));
        delta.insert("/ghost/field", FieldChange::replace(json!(0), json!(1)));
        let applied = apply_delta_lenient(&json!({"amount": 1}), &delta);
        assert_eq!(applied.state, json!({"amount": 2}));
        assert_eq!(applied.skipped.len(), 1);
        assert_eq!(applied.skipped[0].path(), "/ghost/field");
    }

    #[test]
    fn scalar_parent_is_not_a_container() {
        let mut delta = Delta::new();
        delta.insert("/amount/minor", FieldChange::added(json!(5)));
        let err = apply_delta(&json!({"amount": 3}), &delta).unwrap_err();
        assert!(matches!(err, DiffError::NotAContainer { .. }));
    }

    #[test]
    fn snapshot_replaces_base() {
        assert_eq!(apply_snapshot(&json!({"a": 1}), &json!({"b": 2})), json!({"b": 2}));
    }

    #[test]
    fn rebase_rewrites_old_and_drops_noops() {
        let mut delta = Delta::new();
        delta.insert("/amount", FieldChange::replace(json!(10), json!(30)));
        delta.insert("/memo", FieldChange::replace(json!("a"), json!("b")));
        let head = json!({"amount": 20, "memo": "b"});

        let rebased = delta.rebase_onto(&head);
        assert_eq!(rebased.paths(), ["/amount"]);
        assert_eq!(
            rebased.get("/amount"),
            Some(&FieldChange::replace(json!(20), json!(30)))
        );
    }

    #[test]
    fn touches_uses_segment_overlap() {
        let delta =
            compute_delta(&json!({"amount": {"minor": 1}}), &json!({"amount": {"minor": 2}}));
        assert!(delta.touches("/amount"));
        assert!(!delta.touches("/amountNote"));
    }
}
