//! Debounced file watcher for the notes directory.
//!
//! Uses notify-debouncer-mini so a save that touches a file several times
//! in quick succession surfaces as a single event.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A change observed in the watched directory.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path relative to the notes root
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
    /// Subdirectory appeared
    FolderCreated,
    /// Subdirectory was removed
    FolderDeleted,
}

/// Watches the notes directory and emits debounced [`FileEvent`]s.
pub struct FileWatcher {
    root: PathBuf,
    /// Debouncer handle; dropping it stops the watch
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtime per relative path, used to drop events for writes that
/// did not actually change the file.
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Known subdirectories, by relative path. A deleted path cannot be
/// stat-ed, so this is what tells a folder removal from a file removal.
type DirCache = Arc<Mutex<HashSet<PathBuf>>>;

impl FileWatcher {
    /// Start watching `root` recursively with a 200ms debounce window.
    pub fn new(root: PathBuf) -> Result<Self> {
        // Canonicalize so event paths strip cleanly against the root. On
        // macOS /var/folders/... resolves to /private/var/folders/... and
        // FSEvents reports the resolved form.
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watched_root = root.clone();

        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        let cache = Arc::clone(&mtime_cache);
        let dir_cache: DirCache = Arc::new(Mutex::new(scan_dirs(&root)));
        let dirs = Arc::clone(&dir_cache);

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) =
                            Self::process_event(&event, &watched_root, &cache, &dirs)
                        {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("file watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn a debounced event into a [`FileEvent`], or drop it when it is
    /// outside the synced set.
    fn process_event(
        event: &DebouncedEvent,
        root: &Path,
        mtime_cache: &MtimeCache,
        dir_cache: &DirCache,
    ) -> Option<FileEvent> {
        let path = &event.path;

        let relative = path.strip_prefix(root).ok()?;
        let relative_str = relative.to_str()?;
        if relative_str.is_empty() {
            return None;
        }

        // The daemon's own state lives under .driftnote
        if relative_str.starts_with(".driftnote") || relative_str.contains("/.driftnote/") {
            return None;
        }

        // Skip hidden files and directories
        if relative_str.starts_with('.') || relative_str.contains("/.") {
            return None;
        }

        let relative_path = relative.to_path_buf();

        // Directories sync as folder entities
        if path.is_dir() {
            let mut dirs = dir_cache.lock().ok()?;
            if !dirs.insert(relative_path) {
                // Already known; events inside it arrive separately
                return None;
            }
            debug!("folder created: {}", relative_str);
            return Some(FileEvent {
                path: relative_str.to_string(),
                kind: FileEventKind::FolderCreated,
            });
        }
        if !path.exists() {
            if let Ok(mut dirs) = dir_cache.lock() {
                if dirs.remove(&relative_path) {
                    debug!("folder deleted: {}", relative_str);
                    return Some(FileEvent {
                        path: relative_str.to_string(),
                        kind: FileEventKind::FolderDeleted,
                    });
                }
            }
        }

        // Only markdown documents are synced
        if !relative_str.ends_with(".md") {
            return None;
        }

        // The debouncer collapses create/write/remove into a generic kind;
        // whether the path still exists tells the two outcomes apart.
        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };
        if kind == FileEventKind::Modified {
            // Unchanged mtime means the event is an echo of a write we
            // already reported.
            if let Ok(metadata) = std::fs::metadata(path) {
                if let Ok(mtime) = metadata.modified() {
                    if let Ok(mut cache) = mtime_cache.lock() {
                        if cache.get(&relative_path) == Some(&mtime) {
                            return None;
                        }
                        cache.insert(relative_path, mtime);
                    }
                }
            }
        } else if let Ok(mut cache) = mtime_cache.lock() {
            cache.remove(&relative_path);
        }

        debug!("file event: {:?} - {}", kind, relative_str);

        Some(FileEvent {
            path: relative_str.to_string(),
            kind,
        })
    }

    /// Receiver for the watcher's events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    /// The canonicalized directory being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Subdirectories present at startup, so later removals are recognized.
fn scan_dirs(root: &Path) -> HashSet<PathBuf> {
    let mut dirs = HashSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if hidden {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                dirs.insert(relative.to_path_buf());
            }
            pending.push(path);
        }
    }
    dirs
}
