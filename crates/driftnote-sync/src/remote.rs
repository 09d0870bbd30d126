//! Remote entity API abstraction.
//!
//! The orchestrator pushes queued mutations and pulls server state through
//! [`RemoteApi`]; the daemon provides an HTTP implementation, tests and
//! offline use get [`InMemoryRemote`] with the same optimistic-concurrency
//! semantics a real server applies.

use crate::device::DeviceId;
use crate::entity::{EntityKey, EntityKind, Operation, Revision};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

/// One queued mutation as sent to the server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub kind: EntityKind,
    pub id: String,
    pub operation: Operation,
    /// Whole-entity snapshot; None for deletes.
    pub payload: Option<Value>,
    /// Server version this mutation was based on; 0 for never-synced.
    pub expected_version: u64,
    pub origin_device: DeviceId,
}

/// Server acknowledgment of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    /// Newly assigned version for the entity.
    pub version: u64,
    /// Server timestamp of the write (unix ms).
    pub updated_at: u64,
}

/// An entity as the server holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub kind: EntityKind,
    pub id: String,
    pub payload: Value,
    pub sync_version: u64,
    pub updated_at: u64,
    pub origin_device: DeviceId,
}

impl RemoteEntity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }

    pub fn revision(&self) -> Revision {
        Revision {
            sync_version: self.sync_version,
            updated_at: self.updated_at,
            origin_device: self.origin_device,
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The server's version is ahead of the one the push was based on.
    /// Routed to the conflict resolver, never the retry path.
    #[error("version conflict on {kind}/{id}: server at version {server_version}")]
    Conflict {
        kind: EntityKind,
        id: String,
        server_version: u64,
        /// The server's current entity, when it still exists.
        current: Option<Box<RemoteEntity>>,
    },
    /// Network-level failure; retryable with backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// Credentials rejected; draining stops until re-authentication.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// The per-kind entity endpoints of the sync service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Push one mutation. The server accepts it only if `expected_version`
    /// matches its current version for the entity and answers with the new
    /// version; otherwise it answers [`RemoteError::Conflict`].
    async fn push(&self, request: &PushRequest) -> Result<PushAck>;

    /// Fetch one entity; `None` if the server does not have it.
    async fn pull(&self, kind: EntityKind, id: &str) -> Result<Option<RemoteEntity>>;

    /// Fetch all entities, or only those updated after `since` (unix ms).
    /// Used for the full reconciliation on app open and reconnect.
    async fn pull_all(&self, since: Option<u64>) -> Result<Vec<RemoteEntity>>;
}

/// A short-lived bearer token with its fetch time and lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub value: String,
    /// When the token was obtained (unix ms).
    pub fetched_at: u64,
    /// Lifetime in ms.
    pub ttl_ms: u64,
}

impl CachedToken {
    pub fn new(value: impl Into<String>, fetched_at: u64, ttl_ms: u64) -> Self {
        Self {
            value: value.into(),
            fetched_at,
            ttl_ms,
        }
    }

    /// Valid strictly before `fetched_at + ttl`; exactly at the boundary
    /// the token is already expired.
    pub fn is_valid(&self, now_ms: u64) -> bool {
        self.fetched_at + self.ttl_ms > now_ms
    }
}

/// Injectable failure for [`InMemoryRemote`]; consumed by the next call.
#[derive(Debug, Clone, Copy)]
pub enum RemoteFault {
    Transport,
    Auth,
}

impl RemoteFault {
    fn as_error(self) -> RemoteError {
        match self {
            RemoteFault::Transport => RemoteError::Transport("injected failure".to_string()),
            RemoteFault::Auth => RemoteError::Auth("injected failure".to_string()),
        }
    }
}

#[derive(Default)]
struct InMemoryState {
    entities: HashMap<EntityKey, RemoteEntity>,
    /// Last assigned version per key; survives entity deletion so versions
    /// stay monotonic across delete/recreate.
    versions: HashMap<EntityKey, u64>,
    /// Every push attempt that reached the server, accepted or conflicted.
    push_log: Vec<PushRequest>,
    pull_all_count: usize,
    faults: VecDeque<RemoteFault>,
    clock: u64,
}

/// In-process remote service with real version-check semantics.
///
/// Backs engine tests and offline runs: pushes are accepted only when the
/// expected version matches, exactly like the hosted service.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<InMemoryState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an entity on the server directly, as if another device pushed it.
    pub fn seed(&self, entity: RemoteEntity) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.clock = state.clock.max(entity.updated_at);
        state.versions.insert(entity.key(), entity.sync_version);
        state.entities.insert(entity.key(), entity);
    }

    /// Queue a failure; the next API call consumes it.
    pub fn inject_fault(&self, fault: RemoteFault) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.faults.push_back(fault);
    }

    pub fn entity(&self, key: &EntityKey) -> Option<RemoteEntity> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entities.get(key).cloned()
    }

    pub fn version(&self, key: &EntityKey) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.versions.get(key).copied().unwrap_or(0)
    }

    pub fn push_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.push_log.len()
    }

    /// How many reconciliation pulls the server has answered.
    pub fn pull_all_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pull_all_count
    }

    /// Payloads of every push attempt for one entity, in arrival order.
    pub fn pushed_payloads(&self, key: &EntityKey) -> Vec<Option<Value>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .push_log
            .iter()
            .filter(|r| r.kind == key.kind && r.id == key.id)
            .map(|r| r.payload.clone())
            .collect()
    }

    fn take_fault(state: &mut InMemoryState) -> Result<()> {
        match state.faults.pop_front() {
            Some(fault) => Err(fault.as_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn push(&self, request: &PushRequest) -> Result<PushAck> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::take_fault(&mut state)?;

        let key = EntityKey::new(request.kind, request.id.clone());
        state.push_log.push(request.clone());

        let current_version = state.versions.get(&key).copied().unwrap_or(0);
        if request.expected_version != current_version {
            return Err(RemoteError::Conflict {
                kind: request.kind,
                id: request.id.clone(),
                server_version: current_version,
                current: state.entities.get(&key).cloned().map(Box::new),
            });
        }

        let version = current_version + 1;
        state.clock += 1;
        let updated_at = state.clock;
        state.versions.insert(key.clone(), version);
        match request.operation {
            Operation::Delete => {
                state.entities.remove(&key);
            }
            Operation::Upsert => {
                state.entities.insert(
                    key,
                    RemoteEntity {
                        kind: request.kind,
                        id: request.id.clone(),
                        payload: request.payload.clone().unwrap_or(Value::Null),
                        sync_version: version,
                        updated_at,
                        origin_device: request.origin_device,
                    },
                );
            }
        }

        Ok(PushAck {
            version,
            updated_at,
        })
    }

    async fn pull(&self, kind: EntityKind, id: &str) -> Result<Option<RemoteEntity>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::take_fault(&mut state)?;
        Ok(state.entities.get(&EntityKey::new(kind, id)).cloned())
    }

    async fn pull_all(&self, since: Option<u64>) -> Result<Vec<RemoteEntity>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::take_fault(&mut state)?;
        state.pull_all_count += 1;
        let mut entities: Vec<_> = state
            .entities
            .values()
            .filter(|e| since.is_none_or(|t| e.updated_at > t))
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.updated_at);
        Ok(entities)
    }
}
