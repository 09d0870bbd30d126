//! Version history: labeled snapshots per document.
//!
//! An append-only log independent of the live sync path, used for manual
//! recovery. Restoring does not bypass sync: callers take the returned
//! content and apply it as a new document mutation. History is local to
//! this device and carries no `sync_version`.
//!
//! Unlike the mutation queue, history never degrades to memory-only:
//! storage failures propagate to the caller, since a snapshot that was not
//! written is worth knowing about immediately.

use crate::storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("history state unreadable: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("no version {version_id} for document {document_id}")]
    NotFound {
        document_id: String,
        version_id: String,
    },
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// One immutable snapshot of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Optional user-assigned name; the only mutable field.
    pub label: Option<String>,
    /// Content size in bytes.
    pub size: u64,
    pub created_at: u64,
}

/// Durable form: versions oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct VersionLog {
    versions: Vec<DocumentVersion>,
}

/// Per-document snapshot log over a [`Storage`] backend.
///
/// No retention cap: versions live until the user deletes them.
pub struct VersionHistoryStore<S: Storage> {
    storage: S,
}

impl<S: Storage> VersionHistoryStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    fn log_key(document_id: &str) -> String {
        format!("history/{document_id}.json")
    }

    async fn load_log(&self, document_id: &str) -> Result<VersionLog> {
        match self.storage.get(&Self::log_key(document_id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(VersionLog::default()),
        }
    }

    async fn save_log(&self, document_id: &str, log: &VersionLog) -> Result<()> {
        let key = Self::log_key(document_id);
        if log.versions.is_empty() {
            self.storage.delete(&key).await?;
        } else {
            let bytes = serde_json::to_vec_pretty(log)?;
            self.storage.put(&key, &bytes).await?;
        }
        Ok(())
    }

    /// Record a snapshot of the document's current content.
    /// Returns the new version's id.
    pub async fn snapshot(
        &self,
        document_id: &str,
        content: &str,
        label: Option<&str>,
        now_ms: u64,
    ) -> Result<String> {
        let version = DocumentVersion {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            content: content.to_string(),
            label: label.map(str::to_string),
            size: content.len() as u64,
            created_at: now_ms,
        };
        let id = version.id.clone();

        let mut log = self.load_log(document_id).await?;
        log.versions.push(version);
        self.save_log(document_id, &log).await?;

        debug!(document_id, version_id = %id, "snapshot recorded");
        Ok(id)
    }

    /// All versions of a document, newest first.
    pub async fn list(&self, document_id: &str) -> Result<Vec<DocumentVersion>> {
        let mut versions = self.load_log(document_id).await?.versions;
        versions.reverse();
        Ok(versions)
    }

    /// Content of one version. Pure read; applying it is the caller's job.
    pub async fn restore(&self, document_id: &str, version_id: &str) -> Result<String> {
        let log = self.load_log(document_id).await?;
        log.versions
            .iter()
            .find(|v| v.id == version_id)
            .map(|v| v.content.clone())
            .ok_or_else(|| HistoryError::NotFound {
                document_id: document_id.to_string(),
                version_id: version_id.to_string(),
            })
    }

    /// Change a version's label. Content and timestamps stay untouched.
    pub async fn relabel(
        &self,
        document_id: &str,
        version_id: &str,
        label: Option<&str>,
    ) -> Result<()> {
        let mut log = self.load_log(document_id).await?;
        let version = log
            .versions
            .iter_mut()
            .find(|v| v.id == version_id)
            .ok_or_else(|| HistoryError::NotFound {
                document_id: document_id.to_string(),
                version_id: version_id.to_string(),
            })?;
        version.label = label.map(str::to_string);
        self.save_log(document_id, &log).await
    }

    /// Delete one version. Removes the whole log entry once empty.
    pub async fn delete(&self, document_id: &str, version_id: &str) -> Result<()> {
        let mut log = self.load_log(document_id).await?;
        let before = log.versions.len();
        log.versions.retain(|v| v.id != version_id);
        if log.versions.len() == before {
            return Err(HistoryError::NotFound {
                document_id: document_id.to_string(),
                version_id: version_id.to_string(),
            });
        }
        self.save_log(document_id, &log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use std::sync::Arc;

    fn store() -> VersionHistoryStore<Arc<InMemoryStorage>> {
        VersionHistoryStore::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_snapshot_then_list_newest_first() {
        let history = store();

        history.snapshot("a.md", "v1", None, 1000).await.unwrap();
        history.snapshot("a.md", "v2", Some("before refactor"), 2000).await.unwrap();

        let versions = history.list("a.md").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].content, "v2");
        assert_eq!(versions[0].label.as_deref(), Some("before refactor"));
        assert_eq!(versions[1].content, "v1");
    }

    #[tokio::test]
    async fn test_list_unknown_document_is_empty() {
        assert!(store().list("never-seen.md").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_returns_content_without_removing() {
        let history = store();
        let id = history.snapshot("a.md", "old content", None, 1000).await.unwrap();
        history.snapshot("a.md", "new content", None, 2000).await.unwrap();

        assert_eq!(history.restore("a.md", &id).await.unwrap(), "old content");
        assert_eq!(history.list("a.md").await.unwrap().len(), 2);

        assert!(matches!(
            history.restore("a.md", "no-such-version").await,
            Err(HistoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_excludes_from_list() {
        let history = store();
        let id1 = history.snapshot("a.md", "v1", None, 1000).await.unwrap();
        let id2 = history.snapshot("a.md", "v2", None, 2000).await.unwrap();

        history.delete("a.md", &id1).await.unwrap();

        let versions = history.list("a.md").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id, id2);

        assert!(matches!(
            history.delete("a.md", &id1).await,
            Err(HistoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_last_version_removes_log() {
        let storage = Arc::new(InMemoryStorage::new());
        let history = VersionHistoryStore::new(storage.clone());

        let id = history.snapshot("a.md", "v1", None, 1000).await.unwrap();
        assert_eq!(storage.len(), 1);

        history.delete("a.md", &id).await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_relabel_changes_only_the_label() {
        let history = store();
        let id = history.snapshot("a.md", "content", Some("draft"), 1000).await.unwrap();

        history.relabel("a.md", &id, Some("final")).await.unwrap();

        let versions = history.list("a.md").await.unwrap();
        assert_eq!(versions[0].label.as_deref(), Some("final"));
        assert_eq!(versions[0].content, "content");
        assert_eq!(versions[0].created_at, 1000);
        assert_eq!(versions[0].size, "content".len() as u64);

        // Clearing works too
        history.relabel("a.md", &id, None).await.unwrap();
        assert!(history.list("a.md").await.unwrap()[0].label.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_propagates_storage_failure() {
        let storage = Arc::new(InMemoryStorage::new());
        let history = VersionHistoryStore::new(storage.clone());

        storage.set_fail_writes(true);
        assert!(matches!(
            history.snapshot("a.md", "content", None, 1000).await,
            Err(HistoryError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_histories_are_per_document() {
        let history = store();
        history.snapshot("a.md", "a", None, 1000).await.unwrap();
        history.snapshot("b.md", "b", None, 1000).await.unwrap();

        assert_eq!(history.list("a.md").await.unwrap().len(), 1);
        assert_eq!(history.list("b.md").await.unwrap().len(), 1);
        assert_eq!(history.list("a.md").await.unwrap()[0].content, "a");
    }
}
