//! Connection lifecycle state and reconnect backoff.
//!
//! The realtime channel client drives these types; the orchestrator holds a
//! [`ConnectionInfo`] snapshot for the UI. Backoff and heartbeat decisions
//! are pure functions of `now_ms` so they are testable without a runtime.

use crate::device::DeviceId;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// State of the realtime channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// UI-facing snapshot of the channel connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    /// Server-assigned id for the current connection, None while down.
    pub connection_id: Option<String>,
    pub device_id: DeviceId,
    pub reconnect_attempts: u32,
    /// Last heartbeat received (unix ms).
    pub last_heartbeat: Option<u64>,
}

impl ConnectionInfo {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connection_id: None,
            device_id,
            reconnect_attempts: 0,
            last_heartbeat: None,
        }
    }

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The server confirmed the session with a fresh connection id.
    pub fn on_connected(&mut self, connection_id: String) {
        self.state = ConnectionState::Connected;
        self.connection_id = Some(connection_id);
        self.reconnect_attempts = 0;
    }

    pub fn on_heartbeat(&mut self, now_ms: u64) {
        self.last_heartbeat = Some(now_ms);
    }

    pub fn on_reconnecting(&mut self) {
        self.state = ConnectionState::Reconnecting;
        self.connection_id = None;
        self.reconnect_attempts += 1;
    }

    pub fn on_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.connection_id = None;
        self.last_heartbeat = None;
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Configuration for reconnect (and push-retry) backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first retry attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None, // Unlimited
            jitter: 0.1,
        }
    }
}

/// Calculates the delay for a retry attempt using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Backoff with the configured jitter applied, still capped at `max_delay`.
///
/// Jitter spreads simultaneous reconnects from many devices after a server
/// restart so they do not arrive in one wave.
pub fn jittered_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    use rand::Rng;

    let base = calculate_backoff(attempt, config);
    let spread = base.as_secs_f64() * config.jitter;
    if spread <= 0.0 {
        return base;
    }

    let offset: f64 = rand::rng().random_range(-spread..=spread);
    let delay = (base.as_secs_f64() + offset)
        .max(0.0)
        .min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64(delay)
}

/// Reconnection scheduling state.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    /// Number of attempts since the last successful connection
    pub attempts: u32,
    /// When to attempt the next reconnection (ms since epoch)
    pub next_attempt_at: Option<u64>,
    /// Delay chosen for the pending attempt
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next_attempt_at: None,
            current_delay: Duration::ZERO,
        }
    }

    /// Schedule the next reconnection attempt.
    pub fn schedule_reconnect(&mut self, now_ms: u64, config: &ReconnectConfig) {
        self.attempts += 1;
        self.current_delay = jittered_backoff(self.attempts, config);
        self.next_attempt_at = Some(now_ms + self.current_delay.as_millis() as u64);
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
        self.current_delay = Duration::ZERO;
    }

    /// Check if it's time to reconnect.
    pub fn should_reconnect(&self, now_ms: u64) -> bool {
        self.next_attempt_at.map(|t| now_ms >= t).unwrap_or(false)
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new()
    }
}

/// Detects silent disconnects from missing heartbeats.
///
/// The transport does not always notice a dead connection (half-open TCP,
/// NAT timeout); the server's heartbeat cadence does. Silence for longer
/// than twice the expected interval forces a reconnect.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    last_seen: Option<u64>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_seen: None,
        }
    }

    /// Record a heartbeat (or the initial connect, which counts as one).
    pub fn record(&mut self, now_ms: u64) {
        self.last_seen = Some(now_ms);
    }

    /// Forget the last heartbeat, e.g. when the transport itself drops.
    pub fn clear(&mut self) {
        self.last_seen = None;
    }

    /// Whether the connection has been silent past the threshold.
    pub fn missed(&self, now_ms: u64) -> bool {
        match self.last_seen {
            Some(last) => now_ms.saturating_sub(last) > 2 * self.interval.as_millis() as u64,
            None => false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
