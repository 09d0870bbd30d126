//! driftnote-syncd library: exposes the daemon's components for testing.
//!
//! A thin library layer over the daemon internals so integration tests can
//! drive the channel client, watcher, and mirror directly.

pub mod channel;
pub mod config;
pub mod http;
pub mod mirror;
pub mod native_storage;
pub mod watcher;

// Re-export key types for convenience
pub use channel::ChannelClient;
pub use config::DaemonConfig;
pub use http::HttpRemoteApi;
pub use mirror::Mirror;
pub use native_storage::NativeStorage;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};

/// Milliseconds since the Unix epoch.
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
