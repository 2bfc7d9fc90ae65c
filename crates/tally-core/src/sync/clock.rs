//! Per-device version vectors.
//!
//! A [`VersionVector`] maps a device id to the highest entity version that
//! device has incorporated. It answers "did this device see that write?" and
//! nothing else; ordering truth is the per-entity version sequence.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Device key for events recorded without a device id.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Causal relation between two vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    Concurrent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    entries: BTreeMap<String, u64>,
}

impl VersionVector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the devices that wrote `events`.
    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut vv = Self::new();
        for event in events {
            vv.observe(device_key(event), event.version);
        }
        vv
    }

    /// Highest version seen from `device`, `0` if never.
    #[must_use]
    pub fn get(&self, device: &str) -> u64 {
        self.entries.get(device).copied().unwrap_or(0)
    }

    /// Record that `device` has incorporated `version`. Never moves backwards.
    pub fn observe(&mut self, device: &str, version: u64) {
        let slot = self.entries.entry(device.to_string()).or_insert(0);
        *slot = (*slot).max(version);
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &Self) {
        for (device, version) in &other.entries {
            self.observe(device, *version);
        }
    }

    #[must_use]
    pub fn compare(&self, other: &Self) -> Causality {
        let mut less = false;
        let mut greater = false;
        for device in self.entries.keys().chain(other.entries.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Returns `true` if `self` has seen a write `other` has not.
    #[must_use]
    pub fn ahead_of(&self, other: &Self) -> bool {
        matches!(self.compare(other), Causality::After | Causality::Concurrent)
    }

    /// Devices whose entry in `self` exceeds the one in `other`.
    #[must_use]
    pub fn devices_ahead_of(&self, other: &Self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(device, version)| **version > other.get(device))
            .map(|(device, _)| device.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(d, v)| (d.as_str(), *v))
    }
}

/// The vector key an event's writer is tracked under.
#[must_use]
pub fn device_key(event: &Event) -> &str {
    event.metadata.device_id.as_deref().unwrap_or(UNKNOWN_DEVICE)
}
