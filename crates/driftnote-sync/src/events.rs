//! Engine event signals for the UI layer.
//!
//! The orchestrator publishes [`EngineEvent`]s on an [`EventBus`]; the UI
//! (or the daemon's mirror) subscribes and renders status from them. Events
//! carry human-meaningful categories only, never raw error internals.

use crate::conflict::{Conflict, ConflictDecision};
use crate::entity::{DocumentStatus, EntityKind};
use crate::orchestrator::SyncState;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    /// Coarse sync status changed.
    StateChanged { state: SyncState },
    /// A document's per-entity status changed.
    DocumentStatusChanged { id: String, status: DocumentStatus },
    /// Authoritative state changed (remote update applied, or a conflict
    /// decision adopted the server side). Carries the new payload so
    /// subscribers need no store round-trip.
    EntityUpdated {
        kind: EntityKind,
        id: String,
        payload: Value,
    },
    /// An entity was deleted remotely.
    EntityRemoved { kind: EntityKind, id: String },
    /// Local and server versions diverged and policy is `ask`: both sides
    /// are surfaced, the queue item waits for a decision.
    ConflictDetected {
        kind: EntityKind,
        id: String,
        local_payload: Option<Value>,
        local_updated_at: u64,
        server_version: u64,
        server_payload: Option<Value>,
        server_updated_at: Option<u64>,
    },
    /// A conflict was settled, by policy or by the user.
    ConflictResolved {
        kind: EntityKind,
        id: String,
        kept: ConflictDecision,
    },
    /// A mutation exhausted its retries and is frozen awaiting manual action.
    MutationFailed {
        kind: EntityKind,
        id: String,
        retry_count: u32,
    },
    /// Queue durability lost (true) or restored (false).
    StorageDegraded { degraded: bool },
    /// Credentials rejected; sync pauses until re-authentication.
    AuthRequired,
    /// The external file host rejected a save on its concurrency token.
    SaveConflict {
        id: String,
        repo: String,
        path: String,
    },
}

impl EngineEvent {
    /// Build the UI-facing view of a detected conflict.
    pub fn conflict_detected(conflict: &Conflict) -> Self {
        EngineEvent::ConflictDetected {
            kind: conflict.key.kind,
            id: conflict.key.id.clone(),
            local_payload: conflict.local_payload.clone(),
            local_updated_at: conflict.local_updated_at,
            server_version: conflict.server_version,
            server_payload: conflict.server.as_ref().map(|s| s.payload.clone()),
            server_updated_at: conflict.server.as_ref().map(|s| s.updated_at),
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing engine events to subscribers.
///
/// Thread-safe; wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(EngineEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(EngineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: EngineEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
