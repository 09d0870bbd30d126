//! Core entity types shared across the queue, stores, and wire protocol.
//!
//! Every synchronizable unit (document, folder, settings blob, session) is
//! addressed by an `EntityKey` and carries a server-assigned `Revision`.
//! Payloads stay opaque (`serde_json::Value`) below the store layer so the
//! queue and transports never depend on concrete entity shapes.

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// The four synchronizable entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Document,
    Folder,
    Settings,
    Session,
}

impl EntityKind {
    /// All kinds, in drain-independent declaration order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Document,
        EntityKind::Folder,
        EntityKind::Settings,
        EntityKind::Session,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Document => "document",
            EntityKind::Folder => "folder",
            EntityKind::Settings => "settings",
            EntityKind::Session => "session",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(EntityKind::Document),
            "folder" => Ok(EntityKind::Folder),
            "settings" => Ok(EntityKind::Settings),
            "session" => Ok(EntityKind::Session),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown entity kind: {0}")]
pub struct UnknownKind(pub String);

/// What a mutation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upsert,
    Delete,
}

/// Address of one synchronizable entity: `(kind, id)`.
///
/// Document ids are editor-assigned (the daemon uses the file path relative
/// to the watched directory); folder/settings/session ids likewise come from
/// the producing side and are opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Document, id)
    }

    pub fn folder(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Folder, id)
    }

    pub fn settings(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Settings, id)
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Session, id)
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Server-side revision of an entity.
///
/// `sync_version` is assigned by the server and only ever advances locally
/// on a server acknowledgment or when ingesting a remote event. A device
/// never invents a new `sync_version` on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Monotonic, server-assigned optimistic-concurrency token.
    pub sync_version: u64,
    /// Server timestamp of the last write (ms since epoch).
    pub updated_at: u64,
    /// Device that produced the last write.
    pub origin_device: DeviceId,
}

/// Per-entity sync status, surfaced in the UI for documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Exists only on this device; never acknowledged by the server.
    Local,
    /// Has local changes not yet pushed.
    Modified,
    /// A push for this entity is in flight.
    Syncing,
    /// Local state matches the last server acknowledgment.
    Synced,
    /// The last push failed terminally; manual action required.
    Error,
}

impl Display for DocumentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Local => "local",
            DocumentStatus::Modified => "modified",
            DocumentStatus::Syncing => "syncing",
            DocumentStatus::Synced => "synced",
            DocumentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One entity as held by the in-memory store.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub key: EntityKey,
    /// Opaque entity snapshot (whole-entity, never a diff).
    pub payload: Value,
    pub revision: Revision,
    /// Local revision stamp; bumped on every local mutation, independent of
    /// the server's `sync_version`.
    pub local_rev: u64,
    pub status: DocumentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in EntityKind::ALL {
            let parsed: EntityKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_kind_unknown() {
        assert!("tab".parse::<EntityKind>().is_err());
        assert!("".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_kind_serde_lowercase() {
        let json = serde_json::to_string(&EntityKind::Settings).unwrap();
        assert_eq!(json, "\"settings\"");
        let kind: EntityKind = serde_json::from_str("\"session\"").unwrap();
        assert_eq!(kind, EntityKind::Session);
    }

    #[test]
    fn test_operation_serde() {
        assert_eq!(
            serde_json::to_string(&Operation::Upsert).unwrap(),
            "\"upsert\""
        );
        assert_eq!(
            serde_json::to_string(&Operation::Delete).unwrap(),
            "\"delete\""
        );
    }

    #[test]
    fn test_key_display() {
        let key = EntityKey::document("notes/todo.md");
        assert_eq!(key.to_string(), "document/notes/todo.md");
    }

    #[test]
    fn test_key_equality_by_kind_and_id() {
        let a = EntityKey::document("x");
        let b = EntityKey::folder("x");
        assert_ne!(a, b);
        assert_eq!(a, EntityKey::document("x"));
    }
}
