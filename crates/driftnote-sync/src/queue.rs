//! Persistent mutation queue.
//!
//! Holds pending local changes until the server acknowledges them. Keyed by
//! `(kind, id)`: a new mutation for an already-queued entity replaces the
//! old one in place, keeping its original drain position while refreshing
//! the payload and timestamp. Every mutating call writes the whole queue
//! through to durable storage before returning, so in-flight items survive
//! a process crash.
//!
//! When the storage layer fails, the queue keeps running memory-only and
//! latches a degraded flag; the transition (and the later recovery) is
//! signaled exactly once via `take_degradation_event`.

use crate::entity::{EntityKey, EntityKind, Operation};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const QUEUE_KEY: &str = "queue.json";

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Eligible for the next drain pass.
    #[default]
    Ready,
    /// Parked awaiting a conflict decision; drains skip it.
    Deferred,
    /// Retries exhausted; frozen until manual retry or discard.
    Error,
}

/// One pending local mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub kind: EntityKind,
    pub id: String,
    pub operation: Operation,
    /// Whole-entity snapshot (never a diff). Meaningless for deletes.
    pub payload: Value,
    /// Server version this mutation was based on; the push carries it as
    /// its optimistic-concurrency check. Captured at enqueue time because
    /// a delete drops the store record the version would otherwise live on.
    pub base_version: u64,
    /// Insertion sequence. In-place replacement keeps the original value,
    /// so the queue always drains in first-enqueued order.
    pub seq: u64,
    /// When this mutation (or its latest replacement) was enqueued (unix ms).
    pub enqueued_at: u64,
    pub retry_count: u32,
    #[serde(default)]
    pub state: ItemState,
}

impl QueueItem {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }
}

/// The queue's durable form: items in seq order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedQueue {
    pub items: Vec<QueueItem>,
}

impl PersistedQueue {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Add or replace an item keyed by `(kind, id)`.
    ///
    /// Returns `true` if the item was newly inserted. On replacement the
    /// existing entry keeps its `seq` (drain position) and takes the
    /// incoming operation, payload, and timestamp; its retry count and
    /// state reset since the old attempt history no longer applies.
    pub fn upsert(&mut self, incoming: QueueItem) -> bool {
        if let Some(existing) = self
            .items
            .iter_mut()
            .find(|i| i.kind == incoming.kind && i.id == incoming.id)
        {
            existing.operation = incoming.operation;
            existing.payload = incoming.payload;
            existing.base_version = incoming.base_version;
            existing.enqueued_at = incoming.enqueued_at;
            existing.retry_count = 0;
            existing.state = ItemState::Ready;
            false
        } else {
            self.items.push(incoming);
            true
        }
    }

    /// Remove the item for an entity. Returns whether one was present.
    pub fn remove(&mut self, key: &EntityKey) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.kind != key.kind || i.id != key.id);
        self.items.len() < before
    }

    pub fn get(&self, key: &EntityKey) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.kind == key.kind && i.id == key.id)
    }

    fn get_mut(&mut self, key: &EntityKey) -> Option<&mut QueueItem> {
        self.items
            .iter_mut()
            .find(|i| i.kind == key.kind && i.id == key.id)
    }

    /// Items eligible for draining, in queue order.
    pub fn ready(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter().filter(|i| i.state == ItemState::Ready)
    }

    pub fn by_kind(&self, kind: EntityKind) -> impl Iterator<Item = &QueueItem> {
        self.items.iter().filter(move |i| i.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Durable mutation queue: an in-memory [`PersistedQueue`] written through
/// to a [`Storage`] backend on every mutation.
pub struct MutationQueue<S: Storage> {
    storage: S,
    queue: PersistedQueue,
    next_seq: u64,
    degraded: bool,
    /// Pending degradation signal: `Some(true)` on entering degraded mode,
    /// `Some(false)` on recovery. Consumed by `take_degradation_event`.
    transition: Option<bool>,
}

impl<S: Storage> MutationQueue<S> {
    /// Load the queue from storage.
    ///
    /// Missing or unreadable state starts an empty queue rather than
    /// failing: pending mutations are valuable but never worth refusing to
    /// start over. Items parked for a conflict decision come back as ready,
    /// since the prompt they were waiting on did not survive the restart;
    /// the next push re-detects the conflict. Frozen items stay frozen.
    pub async fn load(storage: S) -> Self {
        let mut queue = match storage.get(QUEUE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<PersistedQueue>(&bytes) {
                Ok(queue) => queue,
                Err(e) => {
                    warn!("discarding unreadable queue state: {}", e);
                    PersistedQueue::new()
                }
            },
            Ok(None) => PersistedQueue::new(),
            Err(e) => {
                warn!("failed to read queue state, starting empty: {}", e);
                PersistedQueue::new()
            }
        };

        queue.items.sort_by_key(|i| i.seq);
        for item in queue.items.iter_mut() {
            if item.state == ItemState::Deferred {
                item.state = ItemState::Ready;
            }
        }

        let next_seq = queue.items.iter().map(|i| i.seq).max().map_or(0, |s| s + 1);
        if !queue.is_empty() {
            info!("loaded {} pending mutation(s)", queue.len());
        }

        Self {
            storage,
            queue,
            next_seq,
            degraded: false,
            transition: None,
        }
    }

    /// Enqueue a mutation, collapsing onto any queued item for the same
    /// `(kind, id)`.
    pub async fn enqueue(
        &mut self,
        kind: EntityKind,
        id: impl Into<String>,
        operation: Operation,
        payload: Value,
        base_version: u64,
        now_ms: u64,
    ) {
        let id = id.into();
        debug!(kind = %kind, id = %id, ?operation, "enqueue");
        let inserted = self.queue.upsert(QueueItem {
            kind,
            id,
            operation,
            payload,
            base_version,
            seq: self.next_seq,
            enqueued_at: now_ms,
            retry_count: 0,
            state: ItemState::Ready,
        });
        if inserted {
            self.next_seq += 1;
        }
        self.persist().await;
    }

    /// Up to `max` drain-eligible items in queue order. Does not remove
    /// them: removal is explicit after the server acknowledges, so an item
    /// in flight during a crash is pushed again on the next run.
    pub fn dequeue_batch(&self, max: usize) -> Vec<QueueItem> {
        self.queue.ready().take(max).cloned().collect()
    }

    /// Remove an acknowledged (or discarded) item.
    pub async fn remove(&mut self, key: &EntityKey) -> bool {
        let removed = self.queue.remove(key);
        if removed {
            self.persist().await;
        }
        removed
    }

    pub fn get(&self, key: &EntityKey) -> Option<&QueueItem> {
        self.queue.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.queue.get(key).is_some()
    }

    pub fn list_by_kind(&self, kind: EntityKind) -> Vec<&QueueItem> {
        self.queue.by_kind(kind).collect()
    }

    /// Total queued items, including parked and frozen ones.
    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Items a drain pass would currently send.
    pub fn ready_count(&self) -> usize {
        self.queue.ready().count()
    }

    /// Items frozen after exhausting their retries.
    pub fn frozen_count(&self) -> usize {
        self.queue
            .items
            .iter()
            .filter(|i| i.state == ItemState::Error)
            .count()
    }

    pub async fn clear(&mut self) {
        self.queue.items.clear();
        self.persist().await;
    }

    /// Record a failed push attempt. Returns the new retry count.
    pub async fn bump_retry(&mut self, key: &EntityKey) -> Option<u32> {
        let count = match self.queue.get_mut(key) {
            Some(item) => {
                item.retry_count += 1;
                Some(item.retry_count)
            }
            None => None,
        };
        if count.is_some() {
            self.persist().await;
        }
        count
    }

    /// Park an item awaiting a conflict decision.
    pub async fn mark_deferred(&mut self, key: &EntityKey) -> bool {
        self.set_state(key, ItemState::Deferred).await
    }

    /// Freeze an item after its retries are exhausted.
    pub async fn mark_error(&mut self, key: &EntityKey) -> bool {
        self.set_state(key, ItemState::Error).await
    }

    /// Manual retry: make a parked or frozen item drain-eligible again.
    pub async fn reset(&mut self, key: &EntityKey) -> bool {
        let reset = match self.queue.get_mut(key) {
            Some(item) => {
                item.state = ItemState::Ready;
                item.retry_count = 0;
                true
            }
            None => false,
        };
        if reset {
            self.persist().await;
        }
        reset
    }

    async fn set_state(&mut self, key: &EntityKey, state: ItemState) -> bool {
        let changed = match self.queue.get_mut(key) {
            Some(item) => {
                item.state = state;
                true
            }
            None => false,
        };
        if changed {
            self.persist().await;
        }
        changed
    }

    /// Whether write-through is currently failing (memory-only mode).
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Consume the pending degradation signal, if any: `Some(true)` when
    /// durability was just lost, `Some(false)` when it was just restored.
    /// Each transition is reported once.
    pub fn take_degradation_event(&mut self) -> Option<bool> {
        self.transition.take()
    }

    /// Write the full queue through to storage.
    ///
    /// Failures never bubble up: mutations stay in memory and the degraded
    /// latch flips instead, once per transition in either direction.
    async fn persist(&mut self) {
        let result = match serde_json::to_vec_pretty(&self.queue) {
            Ok(bytes) => self
                .storage
                .put(QUEUE_KEY, &bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => {
                if self.degraded {
                    info!("queue storage recovered, write-through restored");
                    self.degraded = false;
                    self.transition = Some(false);
                }
            }
            Err(e) => {
                if !self.degraded {
                    warn!("queue storage unavailable, continuing memory-only: {}", e);
                    self.degraded = true;
                    self.transition = Some(true);
                }
            }
        }
    }
}
