//! Realtime channel wire protocol.
//!
//! The server pushes JSON text frames over the WebSocket, one event per
//! frame, tagged by a `type` field. Change events carry revision metadata
//! only (a [`ChangeNotice`]); the new payload travels over the entity API,
//! not the channel.
//!
//! Wire format examples:
//! `{"type":"connected","connectionId":"...","deviceId":"...","userId":"..."}`
//! `{"type":"document:updated","id":"notes/todo.md","syncVersion":7,...}`

use crate::device::DeviceId;
use crate::entity::{EntityKey, EntityKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted frame size. Events are revision metadata and stay tiny;
/// anything bigger is a protocol violation, not a big document.
pub const MAX_EVENT_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Event frame too large: {0} bytes (max {MAX_EVENT_SIZE})")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Notification that an entity changed on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    /// Entity id within its kind.
    pub id: String,
    /// Server version after the change.
    pub sync_version: u64,
    /// Server timestamp of the change (unix ms).
    pub updated_at: u64,
    /// Device that made the change; equal to ours for echoes.
    pub origin_device: DeviceId,
}

/// Server-to-client events on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    /// First event after the transport opens; confirms the session.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        connection_id: String,
        device_id: DeviceId,
        user_id: String,
    },
    /// Periodic liveness signal.
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: u64 },
    #[serde(rename = "document:updated")]
    DocumentUpdated(ChangeNotice),
    #[serde(rename = "document:deleted")]
    DocumentDeleted(ChangeNotice),
    #[serde(rename = "folder:updated")]
    FolderUpdated(ChangeNotice),
    #[serde(rename = "folder:deleted")]
    FolderDeleted(ChangeNotice),
    #[serde(rename = "settings:updated")]
    SettingsUpdated(ChangeNotice),
    #[serde(rename = "session:updated")]
    SessionUpdated(ChangeNotice),
}

impl ChannelEvent {
    /// The entity kind a change event concerns; None for lifecycle events.
    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            ChannelEvent::Connected { .. } | ChannelEvent::Heartbeat { .. } => None,
            ChannelEvent::DocumentUpdated(_) | ChannelEvent::DocumentDeleted(_) => {
                Some(EntityKind::Document)
            }
            ChannelEvent::FolderUpdated(_) | ChannelEvent::FolderDeleted(_) => {
                Some(EntityKind::Folder)
            }
            ChannelEvent::SettingsUpdated(_) => Some(EntityKind::Settings),
            ChannelEvent::SessionUpdated(_) => Some(EntityKind::Session),
        }
    }

    pub fn notice(&self) -> Option<&ChangeNotice> {
        match self {
            ChannelEvent::Connected { .. } | ChannelEvent::Heartbeat { .. } => None,
            ChannelEvent::DocumentUpdated(n)
            | ChannelEvent::DocumentDeleted(n)
            | ChannelEvent::FolderUpdated(n)
            | ChannelEvent::FolderDeleted(n)
            | ChannelEvent::SettingsUpdated(n)
            | ChannelEvent::SessionUpdated(n) => Some(n),
        }
    }

    /// Address of the changed entity, for change events.
    pub fn key(&self) -> Option<EntityKey> {
        Some(EntityKey::new(self.kind()?, self.notice()?.id.clone()))
    }

    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            ChannelEvent::DocumentDeleted(_) | ChannelEvent::FolderDeleted(_)
        )
    }

    /// Serialize for sending as one WebSocket text frame.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a received text frame.
    pub fn from_text(text: &str) -> Result<Self> {
        if text.len() > MAX_EVENT_SIZE {
            return Err(ProtocolError::TooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(id: &str) -> ChangeNotice {
        ChangeNotice {
            id: id.to_string(),
            sync_version: 7,
            updated_at: 1000,
            origin_device: DeviceId::from(0xabc),
        }
    }

    // ==================== Wire format ====================

    #[test]
    fn test_change_event_wire_tag() {
        let text = ChannelEvent::DocumentUpdated(notice("a.md")).to_text().unwrap();

        assert!(text.contains("\"type\":\"document:updated\""));
        assert!(text.contains("\"syncVersion\":7"));
        assert!(text.contains("\"originDevice\":\"0000000000000abc\""));
    }

    #[test]
    fn test_parse_server_frame() {
        let text = r#"{
            "type": "folder:deleted",
            "id": "projects",
            "syncVersion": 12,
            "updatedAt": 99,
            "originDevice": "00000000000000ff"
        }"#;

        let event = ChannelEvent::from_text(text).unwrap();
        assert_eq!(event, ChannelEvent::FolderDeleted(ChangeNotice {
            id: "projects".into(),
            sync_version: 12,
            updated_at: 99,
            origin_device: DeviceId::from(0xff),
        }));
    }

    #[test]
    fn test_parse_connected_event() {
        let text = r#"{"type":"connected","connectionId":"c-1","deviceId":"0000000000000abc","userId":"u-1"}"#;

        let event = ChannelEvent::from_text(text).unwrap();
        match event {
            ChannelEvent::Connected {
                connection_id,
                device_id,
                user_id,
            } => {
                assert_eq!(connection_id, "c-1");
                assert_eq!(device_id, DeviceId::from(0xabc));
                assert_eq!(user_id, "u-1");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_heartbeat() {
        let event = ChannelEvent::from_text(r#"{"type":"heartbeat","timestamp":123}"#).unwrap();
        assert_eq!(event, ChannelEvent::Heartbeat { timestamp: 123 });
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ChannelEvent::from_text(r#"{"type":"unknown:event"}"#).is_err());
        assert!(ChannelEvent::from_text("not json").is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let huge = format!(
            r#"{{"type":"heartbeat","timestamp":1,"pad":"{}"}}"#,
            "x".repeat(MAX_EVENT_SIZE)
        );
        assert!(matches!(
            ChannelEvent::from_text(&huge),
            Err(ProtocolError::TooLarge(_))
        ));
    }

    #[test]
    fn test_roundtrip_all_change_events() {
        let events = [
            ChannelEvent::DocumentUpdated(notice("a.md")),
            ChannelEvent::DocumentDeleted(notice("a.md")),
            ChannelEvent::FolderUpdated(notice("f")),
            ChannelEvent::FolderDeleted(notice("f")),
            ChannelEvent::SettingsUpdated(notice("settings")),
            ChannelEvent::SessionUpdated(notice("session")),
        ];
        for event in events {
            let parsed = ChannelEvent::from_text(&event.to_text().unwrap()).unwrap();
            assert_eq!(parsed, event);
        }
    }

    // ==================== Accessors ====================

    #[test]
    fn test_kind_and_key() {
        let event = ChannelEvent::SettingsUpdated(notice("settings"));
        assert_eq!(event.kind(), Some(EntityKind::Settings));
        assert_eq!(event.key(), Some(EntityKey::settings("settings")));

        let heartbeat = ChannelEvent::Heartbeat { timestamp: 1 };
        assert_eq!(heartbeat.kind(), None);
        assert_eq!(heartbeat.key(), None);
    }

    #[test]
    fn test_is_deletion() {
        assert!(ChannelEvent::DocumentDeleted(notice("a.md")).is_deletion());
        assert!(ChannelEvent::FolderDeleted(notice("f")).is_deletion());
        assert!(!ChannelEvent::DocumentUpdated(notice("a.md")).is_deletion());
        assert!(!ChannelEvent::SessionUpdated(notice("session")).is_deletion());
    }
}
