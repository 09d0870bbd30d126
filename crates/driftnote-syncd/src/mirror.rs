//! Applies remote changes to the working tree.
//!
//! Documents land as markdown files named by their id (a path relative to
//! the notes root), folders as directories. Every write is marked in an
//! [`EchoGuard`] so the watcher event it triggers can be recognized and
//! skipped instead of being pushed back as a local edit.

use anyhow::{Context, Result};
use driftnote_sync::entity::EntityKind;
use driftnote_sync::models::{from_payload, Document};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

const ECHO_TTL: Duration = Duration::from_secs(5);

/// Remembers paths the mirror just touched. A watcher event within the TTL
/// of a mark is an echo of the mirror's own write.
pub struct EchoGuard {
    ttl_ms: u64,
    marks: Mutex<HashMap<String, u64>>,
}

impl EchoGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, path: &str, now_ms: u64) {
        if let Ok(mut marks) = self.marks.lock() {
            marks.retain(|_, marked| now_ms.saturating_sub(*marked) <= self.ttl_ms);
            marks.insert(path.to_string(), now_ms);
        }
    }

    /// Take the mark for `path`. True when a fresh mark was present.
    pub fn consume(&self, path: &str, now_ms: u64) -> bool {
        let Ok(mut marks) = self.marks.lock() else {
            return false;
        };
        match marks.remove(path) {
            Some(marked) => now_ms.saturating_sub(marked) <= self.ttl_ms,
            None => false,
        }
    }
}

/// Writes synced entities into the notes directory.
pub struct Mirror {
    root: PathBuf,
    guard: EchoGuard,
}

impl Mirror {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            guard: EchoGuard::new(ECHO_TTL),
        }
    }

    /// True when the watcher event for `path` was caused by the mirror.
    pub fn consume_echo(&self, path: &str, now_ms: u64) -> bool {
        self.guard.consume(path, now_ms)
    }

    /// Write the entity's file representation. Settings and sessions have
    /// none and pass through untouched.
    pub async fn apply_update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
        now_ms: u64,
    ) -> Result<()> {
        match kind {
            EntityKind::Document => {
                let document: Document =
                    from_payload(payload).context("undecodable document payload")?;
                let path = self.resolve(id)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating parent of {id}"))?;
                }
                self.guard.mark(id, now_ms);
                fs::write(&path, document.content.as_bytes())
                    .await
                    .with_context(|| format!("writing {id}"))?;
                debug!("mirrored update: {}", id);
            }
            EntityKind::Folder => {
                let path = self.resolve(id)?;
                self.guard.mark(id, now_ms);
                fs::create_dir_all(&path)
                    .await
                    .with_context(|| format!("creating folder {id}"))?;
            }
            EntityKind::Settings | EntityKind::Session => {}
        }
        Ok(())
    }

    /// Remove the entity's file representation.
    pub async fn apply_remove(&self, kind: EntityKind, id: &str, now_ms: u64) -> Result<()> {
        match kind {
            EntityKind::Document => {
                let path = self.resolve(id)?;
                self.guard.mark(id, now_ms);
                match fs::remove_file(&path).await {
                    Ok(()) => debug!("mirrored removal: {}", id),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).with_context(|| format!("removing {id}")),
                }
            }
            EntityKind::Folder => {
                let path = self.resolve(id)?;
                self.guard.mark(id, now_ms);
                match fs::remove_dir(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    // Leave non-empty folders in place; their documents may
                    // not have been removed yet.
                    Err(e) => debug!("folder {} not removed: {}", id, e),
                }
            }
            EntityKind::Settings | EntityKind::Session => {}
        }
        Ok(())
    }

    /// Entity ids arrive from the network; never let one escape the root.
    fn resolve(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            anyhow::bail!("entity id escapes the notes root: {id}");
        }
        Ok(self.root.join(relative))
    }
}
