//! End-to-end tests for driftnote-syncd.
//!
//! Tests the daemon components against real transports: the channel client
//! against a local WebSocket server, the watcher against a real directory.

use std::net::SocketAddr;
use std::time::Duration;

use driftnote_sync::connection::ReconnectConfig;
use driftnote_sync::device::DeviceId;
use driftnote_sync::orchestrator::ChannelMessage;
use driftnote_sync::protocol::{ChangeNotice, ChannelEvent};
use driftnote_sync::ConnectionState;
use driftnote_syncd::channel::ChannelClient;
use driftnote_syncd::watcher::{FileEventKind, FileWatcher};
use futures::SinkExt;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

const DEVICE: u64 = 0xd1;

// ============================================================================
// Helpers
// ============================================================================

/// Stand-in for the sync service's channel endpoint.
struct TestServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TestServer {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get local addr");
        Self { listener, addr }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Accept one channel session.
    async fn accept(&self) -> WebSocketStream<TcpStream> {
        let (stream, _) = self.listener.accept().await.expect("Failed to accept");
        accept_async(stream).await.expect("WebSocket handshake failed")
    }
}

/// Send a server event frame into a session.
async fn send_event(session: &mut WebSocketStream<TcpStream>, event: &ChannelEvent) {
    let text = event.to_text().expect("Failed to encode event");
    session
        .send(Message::Text(text))
        .await
        .expect("Failed to send event");
}

fn connected(connection_id: &str) -> ChannelEvent {
    ChannelEvent::Connected {
        connection_id: connection_id.to_string(),
        device_id: DeviceId::from(DEVICE),
        user_id: "user-1".to_string(),
    }
}

fn document_updated(id: &str, sync_version: u64) -> ChannelEvent {
    ChannelEvent::DocumentUpdated(ChangeNotice {
        id: id.to_string(),
        sync_version,
        updated_at: sync_version * 100,
        origin_device: DeviceId::from(0x9999),
    })
}

/// Small delays and no jitter so reconnect tests run fast and predictably.
fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        backoff_factor: 2.0,
        max_attempts: None,
        jitter: 0.0,
    }
}

async fn recv_message(rx: &mut mpsc::UnboundedReceiver<ChannelMessage>) -> ChannelMessage {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timeout waiting for channel message")
        .expect("Channel ended unexpectedly")
}

async fn expect_status(
    rx: &mut mpsc::UnboundedReceiver<ChannelMessage>,
    expected: ConnectionState,
) {
    match recv_message(rx).await {
        ChannelMessage::Status(state) => assert_eq!(state, expected),
        other => panic!("Expected status {:?}, got {:?}", expected, other),
    }
}

async fn expect_event(rx: &mut mpsc::UnboundedReceiver<ChannelMessage>) -> ChannelEvent {
    match recv_message(rx).await {
        ChannelMessage::Event(event) => event,
        other => panic!("Expected event, got {:?}", other),
    }
}

// ============================================================================
// Channel Client Tests
// ============================================================================

#[tokio::test]
async fn test_channel_connects_and_forwards_connected() {
    let server = TestServer::bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let client = ChannelClient::new(server.url(), DeviceId::from(DEVICE));
    let task = tokio::spawn(client.run(tx));

    let mut session = server.accept().await;
    expect_status(&mut rx, ConnectionState::Connecting).await;

    send_event(&mut session, &connected("conn-1")).await;
    match expect_event(&mut rx).await {
        ChannelEvent::Connected { connection_id, .. } => {
            assert_eq!(connection_id, "conn-1");
        }
        other => panic!("Expected connected event, got {:?}", other),
    }

    task.abort();
}

#[tokio::test]
async fn test_channel_forwards_change_events_in_order() {
    let server = TestServer::bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let client = ChannelClient::new(server.url(), DeviceId::from(DEVICE));
    let task = tokio::spawn(client.run(tx));

    let mut session = server.accept().await;
    expect_status(&mut rx, ConnectionState::Connecting).await;
    send_event(&mut session, &connected("conn-1")).await;
    assert!(matches!(
        expect_event(&mut rx).await,
        ChannelEvent::Connected { .. }
    ));

    send_event(&mut session, &document_updated("a.md", 1)).await;
    send_event(&mut session, &document_updated("b.md", 2)).await;
    send_event(&mut session, &ChannelEvent::Heartbeat { timestamp: 123 }).await;

    match expect_event(&mut rx).await {
        ChannelEvent::DocumentUpdated(notice) => assert_eq!(notice.id, "a.md"),
        other => panic!("Expected document update, got {:?}", other),
    }
    match expect_event(&mut rx).await {
        ChannelEvent::DocumentUpdated(notice) => assert_eq!(notice.id, "b.md"),
        other => panic!("Expected document update, got {:?}", other),
    }
    assert!(matches!(
        expect_event(&mut rx).await,
        ChannelEvent::Heartbeat { timestamp: 123 }
    ));

    task.abort();
}

#[tokio::test]
async fn test_channel_reconnects_after_server_drop() {
    let server = TestServer::bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let client =
        ChannelClient::new(server.url(), DeviceId::from(DEVICE)).with_reconnect(fast_reconnect());
    let task = tokio::spawn(client.run(tx));

    let mut session = server.accept().await;
    expect_status(&mut rx, ConnectionState::Connecting).await;
    send_event(&mut session, &connected("conn-1")).await;
    assert!(matches!(
        expect_event(&mut rx).await,
        ChannelEvent::Connected { .. }
    ));

    // Server drops the session; the client backs off and tries again.
    drop(session);
    expect_status(&mut rx, ConnectionState::Reconnecting).await;

    let mut session = server.accept().await;
    send_event(&mut session, &connected("conn-2")).await;
    match expect_event(&mut rx).await {
        ChannelEvent::Connected { connection_id, .. } => {
            assert_eq!(connection_id, "conn-2");
        }
        other => panic!("Expected connected event, got {:?}", other),
    }

    task.abort();
}

#[tokio::test]
async fn test_channel_heartbeat_silence_forces_reconnect() {
    let server = TestServer::bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let client = ChannelClient::new(server.url(), DeviceId::from(DEVICE))
        .with_reconnect(fast_reconnect())
        .with_heartbeat_interval(Duration::from_millis(100));
    let task = tokio::spawn(client.run(tx));

    // Session stays open but the server never heartbeats after connecting.
    let mut session = server.accept().await;
    expect_status(&mut rx, ConnectionState::Connecting).await;
    send_event(&mut session, &connected("conn-1")).await;
    assert!(matches!(
        expect_event(&mut rx).await,
        ChannelEvent::Connected { .. }
    ));

    expect_status(&mut rx, ConnectionState::Reconnecting).await;

    let mut session = server.accept().await;
    send_event(&mut session, &connected("conn-2")).await;
    assert!(matches!(
        expect_event(&mut rx).await,
        ChannelEvent::Connected { .. }
    ));

    task.abort();
}

#[tokio::test]
async fn test_channel_zero_heartbeat_interval_disables_watchdog() {
    let server = TestServer::bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let client = ChannelClient::new(server.url(), DeviceId::from(DEVICE))
        .with_reconnect(fast_reconnect())
        .with_heartbeat_interval(Duration::ZERO);
    let task = tokio::spawn(client.run(tx));

    let mut session = server.accept().await;
    expect_status(&mut rx, ConnectionState::Connecting).await;
    send_event(&mut session, &connected("conn-1")).await;
    assert!(matches!(
        expect_event(&mut rx).await,
        ChannelEvent::Connected { .. }
    ));

    // A long silence must not trip a reconnect; frames still arrive after it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    send_event(&mut session, &document_updated("a.md", 4)).await;
    match expect_event(&mut rx).await {
        ChannelEvent::DocumentUpdated(notice) => {
            assert_eq!(notice.id, "a.md");
            assert_eq!(notice.sync_version, 4);
        }
        other => panic!("Expected document update, got {:?}", other),
    }

    task.abort();
}

#[tokio::test]
async fn test_channel_gives_up_after_max_attempts() {
    // Bind to learn a free port, then close it so connects are refused.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    drop(listener);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ReconnectConfig {
        max_attempts: Some(2),
        ..fast_reconnect()
    };
    let client =
        ChannelClient::new(format!("ws://{}", addr), DeviceId::from(DEVICE)).with_reconnect(config);
    let task = tokio::spawn(client.run(tx));

    expect_status(&mut rx, ConnectionState::Connecting).await;
    expect_status(&mut rx, ConnectionState::Reconnecting).await;
    expect_status(&mut rx, ConnectionState::Reconnecting).await;
    expect_status(&mut rx, ConnectionState::Disconnected).await;

    // The client stops for good; its sender side closes.
    assert!(
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timeout waiting for channel end")
            .is_none(),
        "Channel should end after giving up"
    );

    task.await.expect("Client task failed");
}

// ============================================================================
// File Watcher Tests
// ============================================================================

/// Test file watcher detects changes.
#[tokio::test]
async fn test_file_watcher_detects_changes() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let notes_path = temp_dir.path().to_path_buf();

    // Create watcher first, let it initialize
    let mut watcher = FileWatcher::new(notes_path.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize - FSEvents on macOS needs time
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Write a file using sync fs to ensure atomic write
    let test_file = notes_path.join("test.md");
    std::fs::write(&test_file, "# Hello").expect("Failed to write file");

    // Force a second modification to trigger FSEvents reliably
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&test_file, "# Hello World").expect("Failed to modify file");

    // Wait for event - FSEvents + debounce can take several seconds
    let event = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for file event")
        .expect("No event received");

    assert_eq!(event.path, "test.md");
    assert_eq!(event.kind, FileEventKind::Modified);
}

/// Test that file watcher ignores the daemon's state directory.
#[tokio::test]
async fn test_file_watcher_ignores_state_directory() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let notes_path = temp_dir.path().to_path_buf();

    // Create .driftnote directory before watcher starts
    let state_dir = notes_path.join(".driftnote");
    std::fs::create_dir_all(&state_dir).expect("Failed to create .driftnote dir");

    // Create watcher
    let mut watcher = FileWatcher::new(notes_path.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Write to .driftnote directory (should be ignored)
    let state_file = state_dir.join("queue.json");
    std::fs::write(&state_file, "{}").expect("Failed to write state file");

    // Wait a bit, then write to the notes root (should be detected)
    tokio::time::sleep(Duration::from_millis(200)).await;
    let test_file = notes_path.join("test.md");
    std::fs::write(&test_file, "# Hello").expect("Failed to write file");

    // Modify again to ensure FSEvents triggers
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&test_file, "# Hello World").expect("Failed to modify file");

    // Should only get the test.md event
    let event = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for file event")
        .expect("No event received");

    assert_eq!(event.path, "test.md", "Should detect test.md, not state file");
}

/// Test that new and removed subdirectories surface as folder events.
#[tokio::test]
async fn test_file_watcher_reports_folders() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let notes_path = temp_dir.path().to_path_buf();

    let mut watcher = FileWatcher::new(notes_path.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize
    tokio::time::sleep(Duration::from_millis(500)).await;

    let folder = notes_path.join("projects");
    std::fs::create_dir(&folder).expect("Failed to create folder");

    let event = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for folder event")
        .expect("No event received");
    assert_eq!(event.path, "projects");
    assert_eq!(event.kind, FileEventKind::FolderCreated);

    std::fs::remove_dir(&folder).expect("Failed to remove folder");

    let event = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for folder event")
        .expect("No event received");
    assert_eq!(event.path, "projects");
    assert_eq!(event.kind, FileEventKind::FolderDeleted);
}

/// Test that file watcher only processes .md files.
#[tokio::test]
async fn test_file_watcher_only_md_files() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let notes_path = temp_dir.path().to_path_buf();

    let mut watcher = FileWatcher::new(notes_path.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Write non-md file (should be ignored)
    let txt_file = notes_path.join("test.txt");
    std::fs::write(&txt_file, "text").expect("Failed to write txt file");

    // Wait a bit, then write md file (should be detected)
    tokio::time::sleep(Duration::from_millis(200)).await;
    let md_file = notes_path.join("test.md");
    std::fs::write(&md_file, "# Markdown").expect("Failed to write md file");

    // Modify again to ensure FSEvents triggers
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&md_file, "# Markdown Updated").expect("Failed to modify md file");

    // Should only get the .md event
    let event = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for file event")
        .expect("No event received");

    assert_eq!(event.path, "test.md");
}
