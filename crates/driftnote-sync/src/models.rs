//! Concrete entity payload shapes.
//!
//! The engine treats payloads as opaque JSON; these types sit at the edges
//! (editor UI, daemon watcher, tests) and convert to/from the snapshots that
//! flow through the queue and the remote API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A markdown document. The id doubles as the editor's handle for the file
/// (the daemon uses the path relative to the watched directory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            folder_id: None,
        }
    }
}

/// A folder grouping documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Editor settings blob; synchronized wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub font_size: u32,
    #[serde(default)]
    pub show_line_numbers: bool,
}

fn default_theme() -> String {
    "system".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            font_size: 14,
            show_line_numbers: true,
        }
    }
}

/// Open-tabs session state.
///
/// Merge rule is whole-state replace: the newest session wins entirely,
/// no per-field merge of the tab list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Session {
    pub open_document_ids: Vec<String>,
    #[serde(default)]
    pub active_document_id: Option<String>,
    pub updated_at: u64,
}

/// Serialize a typed payload into the opaque snapshot form.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}

/// Parse an opaque snapshot back into a typed payload.
pub fn from_payload<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(payload.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_payload_roundtrip() {
        let doc = Document::new("notes/todo.md", "todo", "- [ ] write tests\n");
        let payload = to_payload(&doc).unwrap();
        let back: Document = from_payload(&payload).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_session_defaults() {
        let payload = serde_json::json!({
            "open_document_ids": ["a.md", "b.md"],
            "updated_at": 1000
        });
        let session: Session = from_payload(&payload).unwrap();
        assert_eq!(session.open_document_ids.len(), 2);
        assert!(session.active_document_id.is_none());
    }

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: Settings = from_payload(&serde_json::json!({})).unwrap();
        assert_eq!(settings.theme, "system");
    }
}
