//! Realtime channel client.
//!
//! Maintains the outgoing WebSocket to the sync service: decodes server
//! event frames for the engine, answers pings, watches the heartbeat
//! cadence, and reconnects with jittered backoff when the transport drops.
//! Transport transitions reach the engine as [`ChannelMessage::Status`];
//! the server's own `connected` event (not the socket opening) is what the
//! engine treats as being connected.

use driftnote_sync::connection::{jittered_backoff, HeartbeatMonitor, ReconnectConfig};
use driftnote_sync::device::DeviceId;
use driftnote_sync::orchestrator::ChannelMessage;
use driftnote_sync::protocol::ChannelEvent;
use driftnote_sync::ConnectionState;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

/// Why a channel session ended.
enum SessionEnd {
    /// The engine side of the channel is gone; stop entirely.
    EngineGone,
    /// Server closed or the stream ended.
    Closed,
    /// No heartbeat for over twice the expected interval.
    HeartbeatLost,
    /// Read error on the transport.
    TransportError,
}

/// Client for the server's realtime event channel.
pub struct ChannelClient {
    url: String,
    device_id: DeviceId,
    reconnect: ReconnectConfig,
    heartbeat_interval: Duration,
}

impl ChannelClient {
    /// Default client: unlimited reconnect attempts, 30s heartbeat cadence.
    pub fn new(url: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            url: url.into(),
            device_id,
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Expected server heartbeat cadence. Zero disables the watchdog.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Run until the engine goes away or reconnect attempts are exhausted.
    /// Spawn this on its own task.
    pub async fn run(self, tx: mpsc::UnboundedSender<ChannelMessage>) {
        let url = format!("{}?device={}", self.url, self.device_id);
        let mut first = true;
        let mut failures: u32 = 0;

        loop {
            let status = if first {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
            first = false;
            if tx.send(ChannelMessage::Status(status)).is_err() {
                return;
            }

            match connect_async(&url).await {
                Ok((ws, _)) => {
                    info!(url = %self.url, "channel transport open");
                    failures = 0;
                    match self.run_session(ws, &tx).await {
                        SessionEnd::EngineGone => return,
                        SessionEnd::Closed => debug!("channel closed by server"),
                        SessionEnd::HeartbeatLost => {
                            warn!("heartbeats stopped, forcing reconnect");
                        }
                        SessionEnd::TransportError => {}
                    }
                }
                Err(e) => {
                    warn!("channel connect failed: {}", e);
                }
            }

            failures += 1;
            if self
                .reconnect
                .max_attempts
                .is_some_and(|max| failures > max)
            {
                warn!(attempts = failures, "channel reconnect attempts exhausted");
                let _ = tx.send(ChannelMessage::Status(ConnectionState::Disconnected));
                return;
            }
            let delay = jittered_backoff(failures, &self.reconnect);
            debug!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "channel reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connected session: forward frames until the transport dies, the
    /// heartbeats stop, or the engine goes away.
    async fn run_session(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        tx: &mpsc::UnboundedSender<ChannelMessage>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let watchdog = !self.heartbeat_interval.is_zero();
        let mut monitor = HeartbeatMonitor::new(self.heartbeat_interval);
        // The open transport counts as the first sign of life
        monitor.record(crate::unix_now_ms());
        // A zero interval disables the watchdog; interval() rejects a zero period
        let mut check = tokio::time::interval(if watchdog {
            self.heartbeat_interval / 2
        } else {
            Duration::from_secs(3600)
        });

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ChannelEvent::from_text(&text) {
                        Ok(event) => {
                            if matches!(
                                event,
                                ChannelEvent::Connected { .. } | ChannelEvent::Heartbeat { .. }
                            ) {
                                monitor.record(crate::unix_now_ms());
                            }
                            if tx.send(ChannelMessage::Event(event)).is_err() {
                                return SessionEnd::EngineGone;
                            }
                        }
                        Err(e) => warn!("undecodable channel frame: {}", e),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        debug!("ignoring binary channel frame");
                    }
                    Some(Ok(Message::Close(_))) => return SessionEnd::Closed,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        match e {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                debug!("channel connection closed");
                            }
                            _ => warn!("channel transport error: {}", e),
                        }
                        return SessionEnd::TransportError;
                    }
                    None => return SessionEnd::Closed,
                },
                _ = check.tick() => {
                    if watchdog && monitor.missed(crate::unix_now_ms()) {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::HeartbeatLost;
                    }
                }
            }
        }
    }
}
