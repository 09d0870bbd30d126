//! Storage trait abstraction for durable key-value persistence.
//!
//! Implementations:
//! - `InMemoryStorage` - For testing, with write-failure injection to
//!   exercise the queue's degraded mode
//! - `NativeStorage` (in driftnote-syncd) - Files under the state directory
//!
//! Keys are slash-separated relative paths ("queue.json",
//! "history/notes/todo.md.json"); values are opaque bytes, JSON in practice.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable key-value persistence for engine state.
///
/// `get` of a missing key is `Ok(None)`; `delete` of a missing key is `Ok(())`.
/// `put` must be atomic enough that a crash never leaves a half-written value
/// visible to a later `get`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value stored under a key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, creating or replacing the key.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory storage for testing.
pub struct InMemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    /// When set, mutating calls fail with an I/O error. Lets tests drive the
    /// queue into (and back out of) degraded mode.
    fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Toggle write-failure injection.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

// Implement Storage for Arc<T> where T: Storage.
// Lets the queue, history store, and device persistence share one backend.
#[async_trait]
impl<T: Storage + Send + Sync> Storage for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
