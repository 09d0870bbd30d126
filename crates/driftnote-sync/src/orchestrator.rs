//! The sync engine's single-task event loop.
//!
//! One [`Orchestrator`] owns the entity store, the mutation queue and the
//! connection snapshot, and runs them from one `tokio::select!` loop over
//! three inputs: producer commands ([`SyncHandle`]), realtime channel
//! traffic ([`ChannelMessage`]) and timer deadlines (debounce, push retry).
//! Because every input funnels through the same task, a mutation arriving
//! while a drain pass is in flight simply waits in the command channel;
//! removing an item after its acknowledgment can never race a replacement
//! for the same entity.

use crate::conflict::{resolve, Conflict, ConflictDecision, ConflictPolicy, Resolution};
use crate::connection::{jittered_backoff, ConnectionInfo, ConnectionState, ReconnectConfig};
use crate::device::DeviceId;
use crate::entity::{DocumentStatus, EntityKey, EntityKind, Operation};
use crate::events::{EngineEvent, EventBus};
use crate::history::VersionHistoryStore;
use crate::models::{from_payload, Document};
use crate::protocol::ChannelEvent;
use crate::queue::{MutationQueue, QueueItem};
use crate::remote::{PushAck, PushRequest, RemoteApi, RemoteEntity, RemoteError};
use crate::save::{content_token, RemoteFileBackend, SaveError, SaveRequest, SaveTracker};
use crate::storage::Storage;
use crate::store::EntityStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Coarse engine status shown in the UI.
///
/// Derived, never set directly: offline while the channel is down, syncing
/// while a drain pass is in flight, error after an unrecoverable failure,
/// synced when the queue is empty and the channel is up, idle otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Error,
    Offline,
}

impl Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
            SyncState::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Master switch. A disabled engine still queues mutations locally but
    /// never drains them.
    pub enabled: bool,
    /// Quiet period between a mutation and the drain it triggers; restarts
    /// on every new mutation so an editing burst collapses into one pass.
    pub debounce: Duration,
    /// Drain and reconcile once at startup.
    pub sync_on_open: bool,
    pub conflict_policy: ConflictPolicy,
    /// Backoff schedule for transport-failed pushes. `max_attempts` is the
    /// freeze threshold.
    pub retry: ReconnectConfig,
    /// Most items pushed per batch within a drain pass; the pass keeps
    /// taking batches until the queue is empty or a failure stalls it.
    pub drain_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(2000),
            sync_on_open: true,
            conflict_policy: ConflictPolicy::default(),
            retry: ReconnectConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                backoff_factor: 2.0,
                max_attempts: Some(5),
                jitter: 0.1,
            },
            drain_batch: 32,
        }
    }
}

/// Identity plus configuration, handed to the engine at construction.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub device_id: DeviceId,
    pub config: SyncConfig,
}

impl SyncContext {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(device_id: DeviceId, config: SyncConfig) -> Self {
        Self { device_id, config }
    }
}

/// Producer-side requests into the engine.
#[derive(Debug)]
pub enum SyncCommand {
    /// A local change: apply optimistically, queue for push.
    Mutation {
        kind: EntityKind,
        id: String,
        operation: Operation,
        payload: Value,
    },
    /// The user's answer to an escalated version conflict.
    ResolveConflict {
        key: EntityKey,
        decision: ConflictDecision,
    },
    /// The user's answer to an external-save conflict.
    ResolveSaveConflict {
        id: String,
        decision: ConflictDecision,
    },
    /// Make a frozen item drain-eligible again and drain now.
    RetryItem { key: EntityKey },
    /// Drain immediately, skipping the debounce window.
    FlushNow,
    /// Credentials were refreshed; resume after an auth failure.
    Reauthenticated,
    Shutdown,
}

/// What the realtime channel client reports into the engine.
#[derive(Debug)]
pub enum ChannelMessage {
    /// Transport-level transition.
    Status(ConnectionState),
    /// A server event, including the session-confirming `connected`.
    Event(ChannelEvent),
}

/// The engine's run loop has exited; commands have nowhere to go.
#[derive(Debug, Error)]
#[error("sync engine stopped")]
pub struct EngineStopped;

/// Cloneable front door for feeding the engine.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::UnboundedSender<SyncCommand>,
}

impl SyncHandle {
    pub fn mutate(
        &self,
        kind: EntityKind,
        id: impl Into<String>,
        operation: Operation,
        payload: Value,
    ) -> Result<(), EngineStopped> {
        self.send(SyncCommand::Mutation {
            kind,
            id: id.into(),
            operation,
            payload,
        })
    }

    pub fn resolve_conflict(
        &self,
        key: EntityKey,
        decision: ConflictDecision,
    ) -> Result<(), EngineStopped> {
        self.send(SyncCommand::ResolveConflict { key, decision })
    }

    pub fn resolve_save_conflict(
        &self,
        id: impl Into<String>,
        decision: ConflictDecision,
    ) -> Result<(), EngineStopped> {
        self.send(SyncCommand::ResolveSaveConflict {
            id: id.into(),
            decision,
        })
    }

    pub fn retry(&self, key: EntityKey) -> Result<(), EngineStopped> {
        self.send(SyncCommand::RetryItem { key })
    }

    pub fn flush(&self) -> Result<(), EngineStopped> {
        self.send(SyncCommand::FlushNow)
    }

    pub fn reauthenticated(&self) -> Result<(), EngineStopped> {
        self.send(SyncCommand::Reauthenticated)
    }

    pub fn shutdown(&self) -> Result<(), EngineStopped> {
        self.send(SyncCommand::Shutdown)
    }

    fn send(&self, command: SyncCommand) -> Result<(), EngineStopped> {
        self.command_tx.send(command).map_err(|_| EngineStopped)
    }
}

/// An external-save conflict parked until the user decides.
struct PendingSave {
    content: String,
    current_token: Option<String>,
}

/// The sync engine. Construct with [`Orchestrator::new`], then hand it to a
/// task via [`run`](Orchestrator::run); interact through the returned
/// [`SyncHandle`] and channel sender, observe through the [`EventBus`].
pub struct Orchestrator<S: Storage, R: RemoteApi> {
    context: SyncContext,
    state: SyncState,
    store: EntityStore,
    queue: MutationQueue<S>,
    remote: Arc<R>,
    events: Arc<EventBus>,
    history: Option<VersionHistoryStore<S>>,
    save_backend: Option<Arc<dyn RemoteFileBackend>>,
    save_tracker: SaveTracker,
    connection: ConnectionInfo,
    command_rx: mpsc::UnboundedReceiver<SyncCommand>,
    channel_rx: mpsc::UnboundedReceiver<ChannelMessage>,
    channel_closed: bool,
    /// Deadline of the debounced drain (unix ms).
    debounce_at: Option<u64>,
    /// Deadline of the scheduled retry drain after a transport failure.
    retry_at: Option<u64>,
    /// Escalated conflicts awaiting a user decision.
    pending_conflicts: HashMap<EntityKey, Conflict>,
    /// Change events held back while their entity has a pending mutation.
    deferred_events: HashMap<EntityKey, ChannelEvent>,
    pending_saves: HashMap<String, PendingSave>,
    /// Set when the server rejected our credentials; drains stop until a
    /// `Reauthenticated` command arrives. The queue is retained throughout.
    auth_blocked: bool,
    /// Server-clock watermark of the last reconciliation pull.
    last_reconcile: Option<u64>,
}

impl<S: Storage, R: RemoteApi> Orchestrator<S, R> {
    pub fn new(
        context: SyncContext,
        queue: MutationQueue<S>,
        remote: Arc<R>,
        events: Arc<EventBus>,
    ) -> (Self, SyncHandle, mpsc::UnboundedSender<ChannelMessage>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let device_id = context.device_id;
        let orchestrator = Self {
            store: EntityStore::new(device_id),
            connection: ConnectionInfo::new(device_id),
            context,
            state: SyncState::Idle,
            queue,
            remote,
            events,
            history: None,
            save_backend: None,
            save_tracker: SaveTracker::new(),
            command_rx,
            channel_rx,
            channel_closed: false,
            debounce_at: None,
            retry_at: None,
            pending_conflicts: HashMap::new(),
            deferred_events: HashMap::new(),
            pending_saves: HashMap::new(),
            auth_blocked: false,
            last_reconcile: None,
        };
        (orchestrator, SyncHandle { command_tx }, channel_tx)
    }

    /// Attach version history. Documents overwritten by a keep-server
    /// conflict resolution get a safety snapshot first.
    pub fn with_history(mut self, history: VersionHistoryStore<S>) -> Self {
        self.history = Some(history);
        self
    }

    /// Attach an external file host: acknowledged document pushes are
    /// mirrored to it for every bound document.
    pub fn with_save_backend(
        mut self,
        backend: Arc<dyn RemoteFileBackend>,
        tracker: SaveTracker,
    ) -> Self {
        self.save_backend = Some(backend);
        self.save_tracker = tracker;
        self
    }

    /// Run until shutdown. Consumes the engine; spawn this on its own task.
    pub async fn run(mut self) {
        info!(device_id = %self.context.device_id, "sync engine started");

        if self.context.config.enabled && self.context.config.sync_on_open {
            let now_ms = unix_now_ms();
            self.drain(now_ms).await;
            self.reconcile().await;
        }

        loop {
            let now_ms = unix_now_ms();
            let deadline = match (self.debounce_at, self.retry_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command, unix_now_ms()).await {
                            break;
                        }
                    }
                    None => break,
                },
                message = self.channel_rx.recv(), if !self.channel_closed => match message {
                    Some(ChannelMessage::Status(status)) => self.on_connection_status(status),
                    Some(ChannelMessage::Event(event)) => {
                        self.on_channel_event(event, unix_now_ms()).await;
                    }
                    None => self.channel_closed = true,
                },
                _ = sleep_until(deadline, now_ms), if deadline.is_some() => {
                    let now_ms = unix_now_ms();
                    if self.deadline_elapsed(now_ms) {
                        self.drain(now_ms).await;
                    }
                }
            }
        }

        info!("sync engine stopped");
    }

    /// Dispatch one command. Returns `false` on shutdown.
    async fn on_command(&mut self, command: SyncCommand, now_ms: u64) -> bool {
        match command {
            SyncCommand::Mutation {
                kind,
                id,
                operation,
                payload,
            } => {
                self.on_mutation(kind, id, operation, payload, now_ms).await;
            }
            SyncCommand::ResolveConflict { key, decision } => {
                self.on_resolve_conflict(key, decision, now_ms).await;
            }
            SyncCommand::ResolveSaveConflict { id, decision } => {
                self.on_resolve_save_conflict(id, decision).await;
            }
            SyncCommand::RetryItem { key } => {
                if self.queue.reset(&key).await {
                    info!(key = %key, "manual retry");
                    self.drain(now_ms).await;
                }
            }
            SyncCommand::FlushNow => self.drain(now_ms).await,
            SyncCommand::Reauthenticated => {
                if self.auth_blocked {
                    info!("credentials refreshed, resuming sync");
                    self.auth_blocked = false;
                    self.drain(now_ms).await;
                    self.reconcile().await;
                }
            }
            SyncCommand::Shutdown => return false,
        }
        true
    }

    /// Apply a local mutation optimistically and queue it for push.
    async fn on_mutation(
        &mut self,
        kind: EntityKind,
        id: String,
        operation: Operation,
        payload: Value,
        now_ms: u64,
    ) {
        let key = EntityKey::new(kind, id.clone());
        let base_version = self.store.sync_version(&key);
        if let Some(status) = self
            .store
            .apply_local(key.clone(), operation, payload.clone(), now_ms)
        {
            self.emit_document_status(&key, status);
        }
        self.queue
            .enqueue(kind, id, operation, payload, base_version, now_ms)
            .await;
        self.emit_degradation();

        if !self.context.config.enabled || self.auth_blocked || self.state == SyncState::Offline {
            return;
        }
        // Restart the quiet period; a burst of edits drains once
        self.debounce_at = Some(now_ms + self.context.config.debounce.as_millis() as u64);
    }

    /// Send the drain-eligible queue, batch by batch in insertion order,
    /// until it is empty or the pass stalls on a failure.
    async fn drain(&mut self, now_ms: u64) {
        if !self.context.config.enabled || self.auth_blocked || self.state == SyncState::Offline {
            return;
        }
        self.debounce_at = None;
        self.retry_at = None;

        loop {
            let batch = self.queue.dequeue_batch(self.context.config.drain_batch);
            if batch.is_empty() {
                break;
            }

            debug!(items = batch.len(), "draining mutation queue");
            self.set_state(SyncState::Syncing);
            let ready_before = self.queue.ready_count();

            for item in batch {
                let key = item.key();
                if item.operation == Operation::Upsert {
                    self.store.mark_syncing(&key);
                    self.emit_document_status(&key, DocumentStatus::Syncing);
                }

                let request = PushRequest {
                    kind: item.kind,
                    id: item.id.clone(),
                    operation: item.operation,
                    payload: (item.operation == Operation::Upsert).then(|| item.payload.clone()),
                    expected_version: item.base_version,
                    origin_device: self.context.device_id,
                };
                match self.remote.push(&request).await {
                    Ok(ack) => self.on_push_acked(&item, ack).await,
                    Err(RemoteError::Conflict {
                        server_version,
                        current,
                        ..
                    }) => {
                        let conflict =
                            self.build_conflict(&item, server_version, current.map(|c| *c));
                        self.apply_resolution(&item, conflict, now_ms).await;
                    }
                    Err(RemoteError::Auth(e)) => {
                        warn!("push rejected, re-authentication required: {}", e);
                        self.auth_blocked = true;
                        self.events.emit(EngineEvent::AuthRequired);
                        break;
                    }
                    Err(RemoteError::Transport(e)) => {
                        self.on_transport_failure(&item, &e, now_ms).await;
                        // Later items share the same network; the retry covers them
                        break;
                    }
                }
            }

            // An auth rejection or a scheduled retry stalls the rest of the
            // queue; a batch that settled nothing would repeat verbatim
            if self.auth_blocked || self.retry_at.is_some() {
                break;
            }
            if self.queue.ready_count() >= ready_before {
                break;
            }
        }

        self.emit_degradation();
        self.settle_state();
    }

    async fn on_push_acked(&mut self, item: &QueueItem, ack: PushAck) {
        let key = item.key();
        debug!(key = %key, version = ack.version, "push acknowledged");
        self.queue.remove(&key).await;
        self.store.apply_ack(&key, ack.version, ack.updated_at);
        if item.operation == Operation::Upsert {
            self.emit_document_status(&key, DocumentStatus::Synced);
            self.save_after_ack(item).await;
        }
        self.release_deferred(&key).await;
    }

    async fn on_transport_failure(&mut self, item: &QueueItem, error: &str, now_ms: u64) {
        let key = item.key();
        let retry_count = self.queue.bump_retry(&key).await.unwrap_or(0);
        let max_attempts = self.context.config.retry.max_attempts;

        if max_attempts.is_some_and(|max| retry_count >= max) {
            warn!(key = %key, retry_count, "push retries exhausted, freezing item: {}", error);
            self.queue.mark_error(&key).await;
            self.store.mark_error(&key);
            self.emit_document_status(&key, DocumentStatus::Error);
            self.events.emit(EngineEvent::MutationFailed {
                kind: item.kind,
                id: item.id.clone(),
                retry_count,
            });
            // A remote change may have been waiting behind this push; its
            // entity now has two diverged sides, which is the resolver's job
            if let Some(event) = self.deferred_events.remove(&key) {
                self.resolve_deferred_after_failure(item, &event, now_ms).await;
            }
            if self.queue.ready_count() > 0 {
                let delay = jittered_backoff(1, &self.context.config.retry);
                self.retry_at = Some(now_ms + delay.as_millis() as u64);
            }
        } else {
            let delay = jittered_backoff(retry_count, &self.context.config.retry);
            debug!(
                key = %key,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "push failed, retry scheduled: {}",
                error
            );
            self.retry_at = Some(now_ms + delay.as_millis() as u64);
        }
    }

    fn build_conflict(
        &self,
        item: &QueueItem,
        server_version: u64,
        server: Option<RemoteEntity>,
    ) -> Conflict {
        Conflict {
            key: item.key(),
            local_operation: item.operation,
            local_payload: (item.operation == Operation::Upsert).then(|| item.payload.clone()),
            local_updated_at: item.enqueued_at,
            server_version,
            server,
        }
    }

    async fn apply_resolution(&mut self, item: &QueueItem, conflict: Conflict, now_ms: u64) {
        match resolve(self.context.config.conflict_policy, &conflict) {
            Resolution::KeepServer => self.adopt_server(conflict, now_ms).await,
            Resolution::KeepLocal { expected_version } => {
                self.force_push(item, expected_version, now_ms).await;
            }
            Resolution::Escalate => {
                let key = conflict.key.clone();
                info!(key = %key, server_version = conflict.server_version, "conflict escalated, awaiting decision");
                self.queue.mark_deferred(&key).await;
                self.events.emit(EngineEvent::conflict_detected(&conflict));
                self.pending_conflicts.insert(key, conflict);
            }
        }
    }

    /// Adopt the server side of a conflict: local state becomes exactly
    /// what the server holds and the pending mutation is dropped.
    async fn adopt_server(&mut self, conflict: Conflict, now_ms: u64) {
        let key = conflict.key.clone();
        self.snapshot_overwritten(&conflict, now_ms).await;
        self.queue.remove(&key).await;

        match conflict.server {
            Some(server) => {
                let revision = server.revision();
                let payload = server.payload;
                self.store.apply_remote(key.clone(), payload.clone(), revision);
                self.events.emit(EngineEvent::EntityUpdated {
                    kind: key.kind,
                    id: key.id.clone(),
                    payload,
                });
                self.emit_document_status(&key, DocumentStatus::Synced);
            }
            None => {
                self.store.remove_remote(&key);
                self.events.emit(EngineEvent::EntityRemoved {
                    kind: key.kind,
                    id: key.id.clone(),
                });
            }
        }

        self.events.emit(EngineEvent::ConflictResolved {
            kind: key.kind,
            id: key.id.clone(),
            kept: ConflictDecision::KeepServer,
        });
        self.release_deferred(&key).await;
    }

    /// Keep the overwritten local document content as a labeled history
    /// version, when history is attached. Best effort.
    async fn snapshot_overwritten(&self, conflict: &Conflict, now_ms: u64) {
        let Some(history) = &self.history else { return };
        if conflict.key.kind != EntityKind::Document {
            return;
        }
        let Some(payload) = &conflict.local_payload else { return };
        let document: Document = match from_payload(payload) {
            Ok(document) => document,
            Err(_) => return,
        };
        if let Err(e) = history
            .snapshot(
                &conflict.key.id,
                &document.content,
                Some("replaced by server version"),
                now_ms,
            )
            .await
        {
            warn!(id = %conflict.key.id, "could not snapshot overwritten content: {}", e);
        }
    }

    /// Re-push a conflicted item with the server's version as the new
    /// basis (keep-local). One attempt: if the server moved again the item
    /// stays queued and the next drain re-detects the conflict.
    async fn force_push(&mut self, item: &QueueItem, expected_version: u64, now_ms: u64) {
        let key = item.key();
        let request = PushRequest {
            kind: item.kind,
            id: item.id.clone(),
            operation: item.operation,
            payload: (item.operation == Operation::Upsert).then(|| item.payload.clone()),
            expected_version,
            origin_device: self.context.device_id,
        };
        match self.remote.push(&request).await {
            Ok(ack) => {
                self.on_push_acked(item, ack).await;
                self.events.emit(EngineEvent::ConflictResolved {
                    kind: key.kind,
                    id: key.id.clone(),
                    kept: ConflictDecision::KeepLocal,
                });
            }
            Err(RemoteError::Conflict { server_version, .. }) => {
                debug!(key = %key, server_version, "server advanced again during keep-local push");
            }
            Err(RemoteError::Auth(e)) => {
                warn!("push rejected, re-authentication required: {}", e);
                self.auth_blocked = true;
                self.events.emit(EngineEvent::AuthRequired);
            }
            Err(RemoteError::Transport(e)) => {
                // The item is still queued; the next drain re-detects the
                // conflict and resolves it again
                let retry_count = self.queue.bump_retry(&key).await.unwrap_or(0);
                let delay = jittered_backoff(retry_count, &self.context.config.retry);
                warn!(key = %key, "keep-local push failed, retry scheduled: {}", e);
                self.retry_at = Some(now_ms + delay.as_millis() as u64);
            }
        }
    }

    fn on_connection_status(&mut self, status: ConnectionState) {
        debug!(status = %status, "channel status");
        match status {
            ConnectionState::Connecting => self.connection.on_connecting(),
            ConnectionState::Reconnecting => {
                self.connection.on_reconnecting();
                self.go_offline();
            }
            ConnectionState::Disconnected => {
                self.connection.on_disconnected();
                self.go_offline();
            }
            // The server's `connected` event is the authoritative
            // transition; a bare status carries no connection id
            ConnectionState::Connected => {}
        }
    }

    /// Offline pauses draining and cancels pending timers; mutations keep
    /// queuing locally.
    fn go_offline(&mut self) {
        self.debounce_at = None;
        self.retry_at = None;
        self.set_state(SyncState::Offline);
    }

    async fn on_channel_event(&mut self, event: ChannelEvent, now_ms: u64) {
        match event {
            ChannelEvent::Connected { connection_id, .. } => {
                info!(connection_id = %connection_id, "realtime channel established");
                self.connection.on_connected(connection_id);
                self.connection.on_heartbeat(now_ms);
                if self.state == SyncState::Offline {
                    self.set_state(SyncState::Idle);
                }
                // One immediate drain and one reconciliation pull; the
                // debounce window does not apply to reconnects
                self.drain(now_ms).await;
                self.reconcile().await;
            }
            ChannelEvent::Heartbeat { .. } => self.connection.on_heartbeat(now_ms),
            event => {
                let Some(key) = event.key() else { return };
                if event
                    .notice()
                    .is_some_and(|n| n.origin_device == self.context.device_id)
                {
                    debug!(key = %key, "suppressed echo of our own change");
                    return;
                }
                if self.queue.contains(&key) {
                    // Applying it now would interleave with our optimistic
                    // local state; wait until the pending push settles
                    debug!(key = %key, "change deferred behind pending local mutation");
                    self.deferred_events.insert(key, event);
                    return;
                }
                self.apply_change_event(&key, &event).await;
            }
        }
    }

    /// Apply a remote change notice: deletions drop the record, updates
    /// pull the entity and apply it wholesale. Stale notices are no-ops.
    async fn apply_change_event(&mut self, key: &EntityKey, event: &ChannelEvent) {
        let Some(notice) = event.notice() else { return };

        if event.is_deletion() {
            if self.store.remove_remote(key) {
                debug!(key = %key, "removed by remote delete");
                self.events.emit(EngineEvent::EntityRemoved {
                    kind: key.kind,
                    id: key.id.clone(),
                });
            }
            return;
        }
        if notice.sync_version <= self.store.sync_version(key) {
            return;
        }

        match self.remote.pull(key.kind, &key.id).await {
            Ok(Some(entity)) => {
                if entity.sync_version <= self.store.sync_version(key) {
                    return;
                }
                let revision = entity.revision();
                let payload = entity.payload;
                self.store.apply_remote(key.clone(), payload.clone(), revision);
                self.events.emit(EngineEvent::EntityUpdated {
                    kind: key.kind,
                    id: key.id.clone(),
                    payload,
                });
                self.emit_document_status(key, DocumentStatus::Synced);
            }
            Ok(None) => {
                // Deleted between the notice and our pull
                if self.store.remove_remote(key) {
                    self.events.emit(EngineEvent::EntityRemoved {
                        kind: key.kind,
                        id: key.id.clone(),
                    });
                }
            }
            Err(e) => warn!(key = %key, "could not fetch changed entity: {}", e),
        }
    }

    /// Apply a change event held back while this entity had a push in
    /// flight. Usually a no-op: the acknowledgment that released it already
    /// advanced past the event's version.
    async fn release_deferred(&mut self, key: &EntityKey) {
        if let Some(event) = self.deferred_events.remove(key) {
            self.apply_change_event(key, &event).await;
        }
    }

    /// A push failed for good while a remote change waited behind it: the
    /// two sides have diverged, so build the conflict and resolve by policy.
    async fn resolve_deferred_after_failure(
        &mut self,
        item: &QueueItem,
        event: &ChannelEvent,
        now_ms: u64,
    ) {
        let Some(notice) = event.notice() else { return };
        let key = item.key();
        let server = match self.remote.pull(key.kind, &key.id).await {
            Ok(server) => server,
            Err(e) => {
                warn!(key = %key, "could not fetch server side of conflict: {}", e);
                None
            }
        };
        let server_version = server
            .as_ref()
            .map_or(notice.sync_version, |s| s.sync_version);
        let conflict = Conflict {
            key,
            local_operation: item.operation,
            local_payload: (item.operation == Operation::Upsert).then(|| item.payload.clone()),
            local_updated_at: item.enqueued_at,
            server_version,
            server,
        };
        self.apply_resolution(item, conflict, now_ms).await;
    }

    /// Pull server state changed since the last reconciliation and apply
    /// everything that does not collide with a pending local mutation.
    async fn reconcile(&mut self) {
        if !self.context.config.enabled || self.auth_blocked {
            return;
        }
        let entities = match self.remote.pull_all(self.last_reconcile).await {
            Ok(entities) => entities,
            Err(RemoteError::Auth(e)) => {
                warn!("reconciliation rejected, re-authentication required: {}", e);
                self.auth_blocked = true;
                self.events.emit(EngineEvent::AuthRequired);
                return;
            }
            Err(e) => {
                warn!("reconciliation pull failed: {}", e);
                return;
            }
        };

        debug!(count = entities.len(), "reconciling server state");
        let mut watermark = self.last_reconcile.unwrap_or(0);
        for entity in entities {
            watermark = watermark.max(entity.updated_at);
            let key = entity.key();
            if self.queue.contains(&key) {
                // A pending local mutation wins until its push settles
                continue;
            }
            if entity.sync_version <= self.store.sync_version(&key) {
                continue;
            }
            let revision = entity.revision();
            let payload = entity.payload;
            self.store.apply_remote(key.clone(), payload.clone(), revision);
            self.events.emit(EngineEvent::EntityUpdated {
                kind: key.kind,
                id: key.id.clone(),
                payload,
            });
            self.emit_document_status(&key, DocumentStatus::Synced);
        }
        if watermark > 0 {
            self.last_reconcile = Some(watermark);
        }
    }

    async fn on_resolve_conflict(
        &mut self,
        key: EntityKey,
        decision: ConflictDecision,
        now_ms: u64,
    ) {
        let Some(conflict) = self.pending_conflicts.remove(&key) else {
            debug!(key = %key, "decision for unknown conflict ignored");
            return;
        };
        info!(key = %key, ?decision, "conflict decision");
        match decision {
            ConflictDecision::KeepServer => self.adopt_server(conflict, now_ms).await,
            ConflictDecision::KeepLocal => {
                let Some(item) = self.queue.get(&key).cloned() else {
                    return;
                };
                self.queue.reset(&key).await;
                self.force_push(&item, conflict.server_version, now_ms).await;
            }
        }
        self.emit_degradation();
        self.settle_state();
    }

    /// Mirror an acknowledged document push to the external file host,
    /// when a binding exists for the document.
    async fn save_after_ack(&mut self, item: &QueueItem) {
        let Some(backend) = self.save_backend.clone() else {
            return;
        };
        let Some(binding) = self.save_tracker.get(&item.id).cloned() else {
            return;
        };
        let document: Document = match from_payload(&item.payload) {
            Ok(document) => document,
            Err(e) => {
                debug!(id = %item.id, "payload is not a document, skipping external save: {}", e);
                return;
            }
        };
        if binding.token.as_deref() == Some(content_token(&document.content).as_str()) {
            // Host already has exactly this content
            return;
        }

        let message = format!("sync: update {}", item.id);
        let request = SaveRequest {
            repo: &binding.repo,
            path: &binding.path,
            content: &document.content,
            message: &message,
            expected_token: binding.token.as_deref(),
            branch: &binding.branch,
        };
        match backend.save(&request).await {
            Ok(ack) => {
                debug!(id = %item.id, "document saved to external host");
                self.save_tracker.record_token(&item.id, ack.token);
            }
            Err(SaveError::Conflict { current_token }) => {
                warn!(id = %item.id, "external save conflicted");
                self.pending_saves.insert(
                    item.id.clone(),
                    PendingSave {
                        content: document.content,
                        current_token,
                    },
                );
                self.events.emit(EngineEvent::SaveConflict {
                    id: item.id.clone(),
                    repo: binding.repo,
                    path: binding.path,
                });
            }
            Err(e) => warn!(id = %item.id, "external save failed: {}", e),
        }
    }

    async fn on_resolve_save_conflict(&mut self, id: String, decision: ConflictDecision) {
        let Some(pending) = self.pending_saves.remove(&id) else {
            debug!(id = %id, "decision for unknown save conflict ignored");
            return;
        };
        let Some(backend) = self.save_backend.clone() else {
            return;
        };
        let Some(binding) = self.save_tracker.get(&id).cloned() else {
            return;
        };
        match decision {
            ConflictDecision::KeepLocal => {
                let message = format!("sync: update {id}");
                let request = SaveRequest {
                    repo: &binding.repo,
                    path: &binding.path,
                    content: &pending.content,
                    message: &message,
                    expected_token: pending.current_token.as_deref(),
                    branch: &binding.branch,
                };
                match backend.save(&request).await {
                    Ok(ack) => {
                        debug!(id = %id, "save conflict resolved, local content kept");
                        self.save_tracker.record_token(&id, ack.token);
                    }
                    Err(SaveError::Conflict { current_token }) => {
                        warn!(id = %id, "remote file changed again");
                        self.pending_saves.insert(
                            id.clone(),
                            PendingSave {
                                content: pending.content,
                                current_token,
                            },
                        );
                        self.events.emit(EngineEvent::SaveConflict {
                            id,
                            repo: binding.repo,
                            path: binding.path,
                        });
                    }
                    Err(e) => warn!(id = %id, "save failed: {}", e),
                }
            }
            ConflictDecision::KeepServer => {
                // Adopt the host's token; our content stays local
                if let Some(token) = pending.current_token {
                    self.save_tracker.record_token(&id, token);
                }
                debug!(id = %id, "save conflict resolved, remote content kept");
            }
        }
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "sync state");
            self.state = state;
            self.events.emit(EngineEvent::StateChanged { state });
        }
    }

    /// Recompute the resting state after a drain pass or a decision.
    fn settle_state(&mut self) {
        if self.state == SyncState::Offline {
            return;
        }
        let state = if self.auth_blocked || self.queue.frozen_count() > 0 {
            SyncState::Error
        } else if self.queue.is_empty() && self.connection.is_connected() {
            SyncState::Synced
        } else {
            SyncState::Idle
        };
        self.set_state(state);
    }

    fn emit_document_status(&self, key: &EntityKey, status: DocumentStatus) {
        if key.kind == EntityKind::Document {
            self.events.emit(EngineEvent::DocumentStatusChanged {
                id: key.id.clone(),
                status,
            });
        }
    }

    fn emit_degradation(&mut self) {
        if let Some(degraded) = self.queue.take_degradation_event() {
            self.events.emit(EngineEvent::StorageDegraded { degraded });
        }
    }

    fn deadline_elapsed(&self, now_ms: u64) -> bool {
        self.debounce_at.is_some_and(|at| now_ms >= at)
            || self.retry_at.is_some_and(|at| now_ms >= at)
    }
}

async fn sleep_until(deadline: Option<u64>, now_ms: u64) {
    let target = deadline.unwrap_or(now_ms);
    tokio::time::sleep(Duration::from_millis(target.saturating_sub(now_ms))).await;
}

/// Milliseconds since the unix epoch.
fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
