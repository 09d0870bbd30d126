//! driftnote-syncd: headless sync daemon for a notes directory.
//!
//! Watches a directory of markdown files, pushes edits through the sync
//! engine, and mirrors remote changes back to disk. The same engine drives
//! the editor clients; the daemon is just another device.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use driftnote_syncd::channel::ChannelClient;
use driftnote_syncd::config::{self, DaemonConfig};
use driftnote_syncd::http::HttpRemoteApi;
use driftnote_syncd::mirror::Mirror;
use driftnote_syncd::native_storage::NativeStorage;
use driftnote_syncd::watcher::{FileEvent, FileEventKind, FileWatcher};
use driftnote_syncd::unix_now_ms;

use driftnote_sync::conflict::ConflictPolicy;
use driftnote_sync::entity::{EntityKind, Operation};
use driftnote_sync::events::{EngineEvent, EventBus};
use driftnote_sync::history::VersionHistoryStore;
use driftnote_sync::models::{to_payload, Document, Folder};
use driftnote_sync::orchestrator::{Orchestrator, SyncConfig, SyncContext, SyncHandle};
use driftnote_sync::queue::MutationQueue;

#[derive(Parser, Debug)]
#[command(name = "driftnote-syncd")]
#[command(about = "Headless document sync daemon")]
struct Args {
    /// Path to the notes directory
    #[arg(short, long)]
    dir: PathBuf,

    /// Base URL of the sync service (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Path to a config file (default: <dir>/.driftnote/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Conflict policy: ask, local, or server (overrides config)
    #[arg(long)]
    policy: Option<ConflictPolicy>,

    /// Debounce window between an edit and its push, in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Skip the drain-and-reconcile pass at startup
    #[arg(long)]
    no_sync_on_open: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Daemon state holding all components.
struct Daemon {
    /// Producer handle into the sync engine
    handle: SyncHandle,
    /// Applies remote changes to the working tree
    mirror: Mirror,
    /// File watcher
    watcher: FileWatcher,
    /// Canonicalized notes root
    root: PathBuf,
}

impl Daemon {
    /// Handle a file change event from the watcher.
    async fn on_file_event(&mut self, event: FileEvent) {
        if self.mirror.consume_echo(&event.path, unix_now_ms()) {
            debug!("skipping echo of mirrored write: {}", event.path);
            return;
        }

        match event.kind {
            FileEventKind::Modified => self.on_file_modified(&event.path).await,
            FileEventKind::Deleted => self.on_file_deleted(&event.path),
            FileEventKind::FolderCreated => self.on_folder_created(&event.path),
            FileEventKind::FolderDeleted => self.on_folder_deleted(&event.path),
        }
    }

    /// A local edit: read the file and queue an upsert.
    async fn on_file_modified(&mut self, path: &str) {
        let content = match tokio::fs::read_to_string(self.root.join(path)).await {
            Ok(content) => content,
            Err(e) => {
                warn!("unreadable file {}: {}", path, e);
                return;
            }
        };

        let title = Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(path)
            .to_string();
        let document = Document::new(path, title, content);
        let payload = match to_payload(&document) {
            Ok(payload) => payload,
            Err(e) => {
                error!("unencodable document {}: {}", path, e);
                return;
            }
        };

        if self
            .handle
            .mutate(EntityKind::Document, path, Operation::Upsert, payload)
            .is_err()
        {
            error!("sync engine stopped; dropping change for {}", path);
        }
    }

    fn on_file_deleted(&mut self, path: &str) {
        if self
            .handle
            .mutate(
                EntityKind::Document,
                path,
                Operation::Delete,
                serde_json::Value::Null,
            )
            .is_err()
        {
            error!("sync engine stopped; dropping deletion of {}", path);
        }
    }

    fn on_folder_created(&mut self, path: &str) {
        let name = Path::new(path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(path)
            .to_string();
        let parent_id = Path::new(path)
            .parent()
            .and_then(|p| p.to_str())
            .filter(|p| !p.is_empty())
            .map(String::from);
        let folder = Folder {
            id: path.to_string(),
            name,
            parent_id,
        };
        let payload = match to_payload(&folder) {
            Ok(payload) => payload,
            Err(e) => {
                error!("unencodable folder {}: {}", path, e);
                return;
            }
        };

        if self
            .handle
            .mutate(EntityKind::Folder, path, Operation::Upsert, payload)
            .is_err()
        {
            error!("sync engine stopped; dropping folder {}", path);
        }
    }

    fn on_folder_deleted(&mut self, path: &str) {
        if self
            .handle
            .mutate(
                EntityKind::Folder,
                path,
                Operation::Delete,
                serde_json::Value::Null,
            )
            .is_err()
        {
            error!("sync engine stopped; dropping folder deletion of {}", path);
        }
    }

    /// Handle an event published by the sync engine.
    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::EntityUpdated { kind, id, payload } => {
                if let Err(e) = self
                    .mirror
                    .apply_update(kind, &id, &payload, unix_now_ms())
                    .await
                {
                    error!("mirror update failed for {}: {}", id, e);
                }
            }
            EngineEvent::EntityRemoved { kind, id } => {
                if let Err(e) = self.mirror.apply_remove(kind, &id, unix_now_ms()).await {
                    error!("mirror removal failed for {}: {}", id, e);
                }
            }
            EngineEvent::StateChanged { state } => {
                info!("sync state: {}", state);
            }
            EngineEvent::DocumentStatusChanged { id, status } => {
                debug!("document {}: {:?}", id, status);
            }
            EngineEvent::ConflictDetected { kind, id, .. } => {
                // Headless: nobody to ask. Deployments that want automatic
                // resolution configure the local or server policy instead.
                warn!("conflict parked on {}/{}; waiting for a decision", kind, id);
            }
            EngineEvent::ConflictResolved { kind, id, kept } => {
                info!("conflict on {}/{} resolved: {:?}", kind, id, kept);
            }
            EngineEvent::MutationFailed {
                kind,
                id,
                retry_count,
            } => {
                error!(
                    "push for {}/{} frozen after {} attempts; retry manually",
                    kind, id, retry_count
                );
            }
            EngineEvent::StorageDegraded { degraded } => {
                if degraded {
                    warn!("queue durability lost; mutations survive in memory only");
                } else {
                    info!("queue durability restored");
                }
            }
            EngineEvent::AuthRequired => {
                error!("credentials rejected; check api_key in the config");
            }
            EngineEvent::SaveConflict { id, repo, path } => {
                warn!("external save of {} to {}:{} conflicted", id, repo, path);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,driftnote_syncd=debug"
    } else {
        "info,driftnote_syncd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting driftnote-syncd");
    info!("Notes directory: {:?}", args.dir);

    let mut config = DaemonConfig::load(args.config.as_deref(), &args.dir)?;
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(policy) = args.policy {
        config.policy = policy;
    }
    if let Some(debounce_ms) = args.debounce_ms {
        config.debounce_ms = debounce_ms;
    }
    if args.no_sync_on_open {
        config.sync_on_open = false;
    }
    info!("Sync service: {}", config.server);

    let state_dir = args.dir.join(".driftnote");
    let device_id = config::load_or_create_device_id(&state_dir)?;
    info!("Device id: {}", device_id);

    let storage = Arc::new(NativeStorage::new(state_dir));
    let queue = MutationQueue::load(storage.clone()).await;
    let history = VersionHistoryStore::new(storage.clone());
    let remote = Arc::new(HttpRemoteApi::new(
        config.server.clone(),
        device_id,
        config.api_key.clone(),
    ));

    // Bridge engine events onto the daemon's event loop
    let events = Arc::new(EventBus::new());
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let subscription = events.subscribe(move |event| {
        let _ = ui_tx.send(event);
    });

    let mut sync_config = SyncConfig {
        enabled: config.enabled,
        debounce: Duration::from_millis(config.debounce_ms),
        sync_on_open: config.sync_on_open,
        conflict_policy: config.policy,
        ..SyncConfig::default()
    };
    sync_config.retry.max_attempts = Some(config.max_push_retries);
    let context = SyncContext::with_config(device_id, sync_config);

    let (engine, handle, channel_tx) = Orchestrator::new(context, queue, remote, events.clone());
    let engine = engine.with_history(history);
    let engine_task = tokio::spawn(engine.run());

    let channel = ChannelClient::new(config.channel_url(), device_id)
        .with_heartbeat_interval(Duration::from_secs(config.heartbeat_secs));
    let channel_task = tokio::spawn(channel.run(channel_tx));
    info!("Realtime channel: {}", config.channel_url());

    let watcher = FileWatcher::new(args.dir.clone())?;
    let root = watcher.root().to_path_buf();
    info!("File watcher started");

    let mut daemon = Daemon {
        handle: handle.clone(),
        mirror: Mirror::new(root.clone()),
        watcher,
        root,
    };

    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            // Handle file watcher events
            Some(event) = daemon.watcher.event_rx().recv() => {
                daemon.on_file_event(event).await;
            }

            // Handle engine events (mirror writes, status logging)
            Some(event) = ui_rx.recv() => {
                daemon.on_engine_event(event).await;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let _ = handle.shutdown();
    channel_task.abort();
    let _ = engine_task.await;
    drop(subscription);

    info!("Shutting down");
    Ok(())
}
