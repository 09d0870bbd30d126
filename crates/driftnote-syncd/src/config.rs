//! Daemon configuration and device identity.
//!
//! Settings come from a YAML file (default `.driftnote/config.yaml` inside
//! the synced directory) with command-line flags taking precedence. The
//! device identity lives in `.driftnote/device.json` so a reinstalled
//! daemon keeps claiming the same changes as its own.

use anyhow::{Context, Result};
use driftnote_sync::conflict::ConflictPolicy;
use driftnote_sync::device::DeviceId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base URL of the sync service.
    pub server: String,
    /// WebSocket URL of the realtime channel. Derived from `server` when
    /// not set.
    pub channel: Option<String>,
    /// API key for the token endpoint. None runs unauthenticated (local
    /// or test deployments).
    pub api_key: Option<String>,
    /// Master switch. Disabled, the daemon still queues local edits but
    /// never pushes them.
    pub enabled: bool,
    /// Conflict policy; `ask` parks conflicts, which a headless daemon can
    /// only log, so deployments usually pick `local` or `server`.
    pub policy: ConflictPolicy,
    /// Quiet period between an edit and its push (milliseconds).
    pub debounce_ms: u64,
    /// Drain and reconcile once at startup.
    pub sync_on_open: bool,
    /// Failed pushes are retried this many times before freezing.
    pub max_push_retries: u32,
    /// Expected server heartbeat cadence; silence past twice this forces
    /// a channel reconnect. Zero disables the watchdog.
    pub heartbeat_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: "http://localhost:8787".to_string(),
            channel: None,
            api_key: None,
            enabled: true,
            policy: ConflictPolicy::default(),
            debounce_ms: 2000,
            sync_on_open: true,
            max_push_retries: 5,
            heartbeat_secs: 30,
        }
    }
}

impl DaemonConfig {
    /// Load configuration for a synced directory.
    ///
    /// An explicitly given path must exist; the default location may be
    /// absent, in which case defaults apply.
    pub fn load(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = dir.join(".driftnote").join("config.yaml");
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// The realtime channel URL, derived from the server URL when not
    /// configured directly.
    pub fn channel_url(&self) -> String {
        if let Some(channel) = &self.channel {
            return channel.clone();
        }
        let ws_base = if let Some(rest) = self.server.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.server.clone()
        };
        format!("{}/channel", ws_base.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDevice {
    device_id: DeviceId,
}

/// Load the device identity from the state directory, generating and
/// persisting a fresh one on first run.
pub fn load_or_create_device_id(state_dir: &Path) -> Result<DeviceId> {
    let path = state_dir.join("device.json");

    if path.exists() {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading device identity {}", path.display()))?;
        let persisted: PersistedDevice = serde_json::from_str(&contents)
            .with_context(|| format!("parsing device identity {}", path.display()))?;
        return Ok(persisted.device_id);
    }

    let device_id = DeviceId::generate();
    info!(device_id = %device_id, "generated new device identity");

    fs::create_dir_all(state_dir)
        .with_context(|| format!("creating state directory {}", state_dir.display()))?;
    let contents = serde_json::to_string_pretty(&PersistedDevice { device_id })?;
    fs::write(&path, contents)
        .with_context(|| format!("writing device identity {}", path.display()))?;
    Ok(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_default_config_falls_back_to_defaults() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = DaemonConfig::load(None, dir.path()).unwrap();

        assert_eq!(config.debounce_ms, 2000);
        assert_eq!(config.policy, ConflictPolicy::Ask);
        assert!(config.sync_on_open);
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let missing = dir.path().join("nope.yaml");

        assert!(DaemonConfig::load(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn test_config_file_parses_and_fills_defaults() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let state_dir = dir.path().join(".driftnote");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(
            state_dir.join("config.yaml"),
            "server: https://sync.example.com\npolicy: server\ndebounce_ms: 500\n",
        )
        .unwrap();

        let config = DaemonConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.server, "https://sync.example.com");
        assert_eq!(config.policy, ConflictPolicy::Server);
        assert_eq!(config.debounce_ms, 500);
        // Unspecified keys keep their defaults
        assert!(config.enabled);
        assert!(config.sync_on_open);
        assert_eq!(config.max_push_retries, 5);
        assert_eq!(config.heartbeat_secs, 30);
    }

    #[test]
    fn test_channel_url_derived_from_server() {
        let mut config = DaemonConfig::default();
        config.server = "https://sync.example.com/".to_string();
        assert_eq!(config.channel_url(), "wss://sync.example.com/channel");

        config.server = "http://localhost:8787".to_string();
        assert_eq!(config.channel_url(), "ws://localhost:8787/channel");

        config.channel = Some("wss://other.example.com/rt".to_string());
        assert_eq!(config.channel_url(), "wss://other.example.com/rt");
    }

    #[test]
    fn test_device_id_persists_across_loads() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let state_dir = dir.path().join(".driftnote");

        let first = load_or_create_device_id(&state_dir).unwrap();
        let second = load_or_create_device_id(&state_dir).unwrap();
        assert_eq!(first, second);
        assert!(state_dir.join("device.json").exists());
    }
}
