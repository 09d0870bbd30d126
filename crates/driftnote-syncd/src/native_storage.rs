//! Filesystem storage backend using tokio::fs.

use async_trait::async_trait;
use driftnote_sync::storage::{Result, Storage, StorageError};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

/// Engine state persisted as files under the daemon state directory.
///
/// Keys map directly to relative paths, so the queue lives in
/// `queue.json` and history logs under `history/`.
pub struct NativeStorage {
    base_path: PathBuf,
}

impl NativeStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.full_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let full_path = self.full_path(key);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        // Write-then-rename so a crash mid-write never corrupts the value
        let tmp_path = full_path.with_extension("tmp");
        fs::write(&tmp_path, value)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &full_path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}
