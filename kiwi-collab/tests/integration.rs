//! Integration tests for end-to-end WebSocket sessions.
//!
//! These tests start a real server and connect real clients,
//! verifying the full commit / push / pull pipeline.
//!
//! `DocumentManager::connect` blocks the calling thread, so every test runs
//! on the multi-threaded runtime to keep the server making progress.

use kiwi_collab::client::{ClientConfig, ClientError, ConnectionState, DocumentManager, UserEvent};
use kiwi_collab::protocol::{HandshakeMetadata, MessageType, SyncMessage};
use kiwi_collab::server::{Server, ServerConfig};
use kiwi_core::{Point, Scheduler};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return it with its port.
async fn start_test_server(dir: &TempDir) -> (Arc<Server>, u16) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::for_testing(dir.path())
    };
    let server = Arc::new(Server::new(config).unwrap());
    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    (server, port)
}

fn client(user_id: u64, scheduler: &Arc<Scheduler>) -> DocumentManager {
    DocumentManager::new(ClientConfig::for_testing(user_id), scheduler)
}

/// Run the scheduler until `condition` holds or two seconds pass.
async fn wait_until(scheduler: &Scheduler, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        scheduler.process();
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_connects_and_loads_session() {
    let dir = TempDir::new().unwrap();
    let (server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0x10).unwrap();

    assert!(alice.is_connected());
    assert!(alice.is_pulling());
    assert_eq!(alice.connection_state(), ConnectionState::Connected);
    assert_eq!(alice.connected_users(), vec![1]);
    assert_eq!(alice.document().patcher().name(), "Document_0000000000000010");
    assert_eq!(server.active_sessions().await, 1);

    alice.disconnect();
    assert!(!alice.is_connected());
    assert!(!alice.is_pulling());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_presence_between_clients() {
    let dir = TempDir::new().unwrap();
    let (_server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0x20).unwrap();
    let bob = client(2, &scheduler);
    bob.connect("127.0.0.1", port, 0x20).unwrap();

    assert_eq!(bob.connected_users(), vec![1, 2]);
    assert!(wait_until(&scheduler, || alice.connected_users() == vec![1, 2]).await);
    assert_eq!(alice.take_user_events(), vec![UserEvent::Connected(2)]);

    bob.disconnect();
    assert!(wait_until(&scheduler, || alice.connected_users() == vec![1]).await);
    assert_eq!(alice.take_user_events(), vec![UserEvent::Disconnected(2)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_reaches_other_client() {
    let dir = TempDir::new().unwrap();
    let (_server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0x30).unwrap();
    let bob = client(2, &scheduler);
    bob.connect("127.0.0.1", port, 0x30).unwrap();

    let osc = alice
        .document()
        .patcher_mut()
        .add_object_at("osc~ 440", Point::new(10.0, 10.0))
        .unwrap();
    alice.commit("add osc").unwrap();

    assert!(wait_until(&scheduler, || bob.document().patcher().object(osc).is_some()).await);
    let settled = || {
        let document = alice.document();
        !document.has_outgoing() && document.unacknowledged().next().is_none()
    };
    assert!(wait_until(&scheduler, settled).await);

    // Remote changes never enter the receiver's history
    assert!(alice.can_undo());
    assert!(!bob.can_undo());

    alice.undo().unwrap();
    assert!(wait_until(&scheduler, || bob.document().patcher().object(osc).is_none()).await);
    assert!(alice.can_redo());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gesture_sent_as_single_transaction() {
    let dir = TempDir::new().unwrap();
    let (_server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0x40).unwrap();
    let bob = client(2, &scheduler);
    bob.connect("127.0.0.1", port, 0x40).unwrap();

    let id = alice
        .document()
        .patcher_mut()
        .add_object_at("metro 100", Point::new(0.0, 0.0))
        .unwrap();
    alice.commit("add metro").unwrap();
    assert!(wait_until(&scheduler, || bob.document().patcher().object(id).is_some()).await);

    alice.start_commit_gesture().unwrap();
    for step in 1..=5 {
        let position = Point::new(step as f64 * 10.0, 0.0);
        alice.document().patcher_mut().set_position(id, position).unwrap();
        alice.commit_gesture("move").unwrap();
    }
    assert_eq!(alice.push(), 0);
    alice.end_commit_gesture().unwrap();

    let moved = || {
        bob.document()
            .patcher()
            .object(id)
            .is_some_and(|object| object.position() == Point::new(50.0, 0.0))
    };
    assert!(wait_until(&scheduler, moved).await);
    assert!(!bob.can_undo());

    // The whole gesture is one undo step
    alice.undo().unwrap();
    assert_eq!(alice.undo_label().as_deref(), Some("add metro"));
    let restored = || {
        bob.document()
            .patcher()
            .object(id)
            .is_some_and(|object| object.position() == Point::new(0.0, 0.0))
    };
    assert!(wait_until(&scheduler, restored).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_offline_edits_sent_on_connect() {
    let dir = TempDir::new().unwrap();
    let (_server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    let id = alice.document().patcher_mut().add_object("dac~").unwrap();
    alice.commit("add dac").unwrap();

    alice.connect("127.0.0.1", port, 0x50).unwrap();
    let bob = client(2, &scheduler);
    assert!(wait_until(&scheduler, || !alice.document().has_outgoing()).await);
    bob.connect("127.0.0.1", port, 0x50).unwrap();

    assert!(wait_until(&scheduler, || bob.document().patcher().object(id).is_some()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_user_reconnect_replaces_port() {
    let dir = TempDir::new().unwrap();
    let (server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let watcher = client(9, &scheduler);
    watcher.connect("127.0.0.1", port, 0x60).unwrap();

    let first = client(1, &scheduler);
    first.connect("127.0.0.1", port, 0x60).unwrap();
    let second = client(1, &scheduler);
    second.connect("127.0.0.1", port, 0x60).unwrap();

    assert_eq!(second.connected_users(), vec![1, 9]);
    assert!(
        wait_until(&scheduler, || first.connection_state() == ConnectionState::Disconnected).await,
        "Older connection of the same user should be closed"
    );
    assert!(wait_until(&scheduler, || watcher.connected_users() == vec![1, 9]).await);
    assert_eq!(watcher.take_user_events(), vec![UserEvent::Connected(1)]);
    assert_eq!(server.active_sessions().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_token_refused() {
    let dir = TempDir::new().unwrap();
    let (server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let config = ClientConfig {
        open_token: "nope".to_string(),
        ..ClientConfig::for_testing(1)
    };
    let intruder = DocumentManager::new(config, &scheduler);
    let result = intruder.connect("127.0.0.1", port, 0x70);

    assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));
    assert!(!intruder.is_connected());
    assert_eq!(server.active_sessions().await, 0);
    assert_eq!(server.stats().await.rejected_ports, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_raw_socket_handshake() {
    let dir = TempDir::new().unwrap();
    let (_server, port) = start_test_server(&dir).await;
    let url = format!("ws://127.0.0.1:{port}/0000000000000080");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let metadata = HandshakeMetadata::new(kiwi_core::MODEL_VERSION, "test-token", env!("CARGO_PKG_VERSION"));
    let hello = SyncMessage::hello(3, 0x80, &metadata).unwrap();
    ws.send(Message::Binary(hello.encode().unwrap().into())).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        let frame = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Binary(data) = frame {
            let bytes: Vec<u8> = data.into();
            received.push(SyncMessage::decode(&bytes).unwrap());
        }
    }

    assert_eq!(received[0].msg_type, MessageType::Snapshot);
    assert_eq!(received[0].snapshot_ir().unwrap().root.nodes("objects").count(), 0);
    assert_eq!(received[1].msg_type, MessageType::ConnectedUsers);
    assert_eq!(received[1].user_list().unwrap(), vec![3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_stop() {
    let dir = TempDir::new().unwrap();
    let (server, port) = start_test_server(&dir).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0x90).unwrap();
    assert!(server.is_running());

    server.stop();
    assert!(
        wait_until(&scheduler, || alice.connection_state() == ConnectionState::Disconnected).await,
        "Clients should be disconnected when the server stops"
    );
    assert!(wait_until(&scheduler, || server.session_path(0x90).exists()).await);
    assert!(!server.is_running());
}
