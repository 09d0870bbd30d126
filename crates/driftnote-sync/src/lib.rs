//! driftnote-sync: core engine for multi-device document synchronization.
//!
//! This crate provides:
//! - A durable mutation queue with one collapsed item per entity
//! - The orchestrator task that drains the queue against a sync service
//! - Version-check conflict detection with ask/local/server policies
//! - Realtime change-event handling with echo suppression
//! - Per-document version history and external file-host mirroring
//! - Storage, RemoteApi and RemoteFileBackend trait abstractions

pub mod conflict;
pub mod connection;
pub mod device;
pub mod entity;
pub mod events;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod remote;
pub mod save;
pub mod storage;
pub mod store;

pub use conflict::{Conflict, ConflictDecision, ConflictPolicy, Resolution};
pub use connection::{ConnectionInfo, ConnectionState, HeartbeatMonitor, ReconnectConfig};
pub use device::{DeviceId, DeviceIdError};
pub use entity::{DocumentStatus, EntityKey, EntityKind, Operation, Revision};
pub use events::{EngineEvent, EventBus, Subscription};
pub use orchestrator::{
    ChannelMessage, Orchestrator, SyncCommand, SyncConfig, SyncContext, SyncHandle, SyncState,
};
pub use protocol::{ChangeNotice, ChannelEvent};
pub use queue::MutationQueue;
pub use remote::{PushAck, PushRequest, RemoteApi, RemoteEntity, RemoteError};
pub use save::{RemoteFileBackend, SaveTracker};
pub use storage::{InMemoryStorage, Storage, StorageError};
pub use store::EntityStore;
