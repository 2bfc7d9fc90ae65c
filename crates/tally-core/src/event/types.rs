//! Entity and event kind enums.
//!
//! The kind stored on an event is entity-agnostic (`UPDATED`); the label
//! shown to API callers and in audit trails prefixes it with the entity type
//! (`TRANSACTION_UPDATED`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The aggregate families the ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Transaction,
    Budget,
    Workspace,
}

/// Error returned when parsing an unknown entity type string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity type '{raw}': expected one of TRANSACTION, BUDGET, WORKSPACE")]
pub struct UnknownEntityType {
    pub raw: String,
}

impl EntityType {
    pub const ALL: [Self; 3] = [Self::Transaction, Self::Budget, Self::Workspace];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "TRANSACTION",
            Self::Budget => "BUDGET",
            Self::Workspace => "WORKSPACE",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Clients historically sent lower-case names ("transaction").
        match s.trim().to_ascii_uppercase().as_str() {
            "TRANSACTION" => Ok(Self::Transaction),
            "BUDGET" => Ok(Self::Budget),
            "WORKSPACE" => Ok(Self::Workspace),
            _ => Err(UnknownEntityType { raw: s.to_string() }),
        }
    }
}

impl Serialize for EntityType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// What kind of transition an event records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// First event of an entity, carrying a full snapshot.
    Created,
    /// A plain single-writer update.
    Updated,
    /// Soft delete.
    Deleted,
    /// Sync push whose delta merged cleanly with concurrent edits.
    Merged,
    /// Sync push where last-write-wins decided at least one path.
    Resolved,
    /// Synthetic full state written by retention pruning.
    Snapshot,
    /// Domain-specific verb, e.g. `RECONCILED`. Upper-case ASCII and `_`.
    Domain(String),
}

/// Error returned when parsing an invalid event type string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid event type '{raw}': expected an upper-case verb such as CREATED or UPDATED")]
pub struct InvalidEventType {
    pub raw: String,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
            Self::Merged => "MERGED",
            Self::Resolved => "RESOLVED",
            Self::Snapshot => "SNAPSHOT",
            Self::Domain(verb) => verb,
        }
    }

    /// External label, e.g. `TRANSACTION_DELETED`.
    #[must_use]
    pub fn label(&self, entity_type: EntityType) -> String {
        format!("{entity_type}_{}", self.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = InvalidEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let known = match s {
            "CREATED" => Some(Self::Created),
            "UPDATED" => Some(Self::Updated),
            "DELETED" => Some(Self::Deleted),
            "MERGED" => Some(Self::Merged),
            "RESOLVED" => Some(Self::Resolved),
            "SNAPSHOT" => Some(Self::Snapshot),
            _ => None,
        };
        if let Some(kind) = known {
            return Ok(kind);
        }

        let valid_verb = !s.is_empty()
            && s.starts_with(|c: char| c.is_ascii_uppercase())
            && s.chars().all(|c| c.is_ascii_uppercase() || c == '_');
        if valid_verb {
            Ok(Self::Domain(s.to_string()))
        } else {
            Err(InvalidEventType { raw: s.to_string() })
        }
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
