//! Persistence integration tests: session files written by the server,
//! reloaded by later clients, and migrated from older model versions.

use kiwi_collab::client::{ClientConfig, ClientError, DocumentManager};
use kiwi_collab::server::{Server, ServerConfig};
use kiwi_collab::storage::{read_backend, session_file_name, write_backend};
use kiwi_core::model::{IrValue, MODEL_VERSION};
use kiwi_core::{BackendIr, Patcher, Point, Scheduler};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{sleep, Duration, Instant};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server(dir: &Path) -> (Arc<Server>, u16) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::for_testing(dir)
    };
    let server = Arc::new(Server::new(config).unwrap());
    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    (server, port)
}

fn client(user_id: u64, scheduler: &Arc<Scheduler>) -> DocumentManager {
    DocumentManager::new(ClientConfig::for_testing(user_id), scheduler)
}

async fn wait_for_file(path: &Path) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    path.exists()
}

/// A document as an older release would have stored it.
fn v1_document(text: &str) -> BackendIr {
    let mut patcher = Patcher::default();
    patcher.add_object_at(text, Point::new(5.0, 5.0)).unwrap();
    let mut ir = patcher.to_ir();
    ir.version = "v1".to_string();
    ir.root.set("patcher_name", IrValue::Text("legacy".to_string()));
    ir
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_saved_after_last_disconnect() {
    let dir = TempDir::new().unwrap();
    let (server, port) = start_test_server(dir.path()).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0xab).unwrap();
    let osc = alice
        .document()
        .patcher_mut()
        .add_object_at("osc~ 220", Point::new(40.0, 40.0))
        .unwrap();
    alice.commit("add osc").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while alice.document().unacknowledged().next().is_some() && Instant::now() < deadline {
        scheduler.process();
        sleep(Duration::from_millis(10)).await;
    }
    alice.disconnect();

    let path = dir.path().join("00000000000000ab.kiwi");
    assert_eq!(server.session_path(0xab), path);
    assert!(wait_for_file(&path).await, "Session file should be written");

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.active_sessions().await > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.active_sessions().await, 0);

    let stored = read_backend(&path).unwrap();
    assert_eq!(stored.version, MODEL_VERSION);

    let bob = client(2, &scheduler);
    bob.connect("127.0.0.1", port, 0xab).unwrap();
    let document = bob.document();
    let object = document.patcher().object(osc).expect("object survives reload");
    assert_eq!(object.text(), "osc~ 220");
    assert_eq!(object.position(), Point::new(40.0, 40.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_version_fails_closed() {
    let dir = TempDir::new().unwrap();
    let mut ir = v1_document("dac~");
    ir.version = "v0".to_string();
    write_backend(&dir.path().join(session_file_name(0xd0)), &ir).unwrap();

    let (server, port) = start_test_server(dir.path()).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    let result = alice.connect("127.0.0.1", port, 0xd0);

    assert!(matches!(result, Err(ClientError::ConnectionFailed(_))), "{result:?}");
    assert!(!alice.is_connected());
    assert_eq!(server.active_sessions().await, 0);

    // The file is left as it was
    let untouched = read_backend(&server.session_path(0xd0)).unwrap();
    assert_eq!(untouched.version, "v0");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_file_fails_closed() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(session_file_name(0xc0)), b"not a kiwi file").unwrap();

    let (server, port) = start_test_server(dir.path()).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    assert!(alice.connect("127.0.0.1", port, 0xc0).is_err());
    assert_eq!(server.active_sessions().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_old_session_migrated_on_open() {
    let dir = TempDir::new().unwrap();
    write_backend(&dir.path().join(session_file_name(0x01)), &v1_document("metro 250")).unwrap();

    let (server, port) = start_test_server(dir.path()).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0x01).unwrap();
    assert_eq!(alice.document().patcher().objects()[0].text(), "metro 250");
    alice.disconnect();

    let path = server.session_path(0x01);
    let deadline = Instant::now() + Duration::from_secs(2);
    while read_backend(&path).map(|ir| ir.version != MODEL_VERSION).unwrap_or(true)
        && Instant::now() < deadline
    {
        sleep(Duration::from_millis(10)).await;
    }
    let saved = read_backend(&path).unwrap();
    assert_eq!(saved.version, MODEL_VERSION);
    assert!(saved.root.get("patcher_name").is_none());
}

#[test]
fn test_local_file_migrated_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.kiwi");
    write_backend(&path, &v1_document("print")).unwrap();

    let scheduler = Arc::new(Scheduler::new());
    let manager = client(1, &scheduler);
    manager.load(&path).unwrap();
    assert_eq!(manager.document().patcher().objects()[0].text(), "print");

    let mut ir = v1_document("print");
    ir.version = "v9".to_string();
    write_backend(&path, &ir).unwrap();
    assert!(manager.load(&path).is_err());
    assert_eq!(manager.document().patcher().objects()[0].text(), "print");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_save_keeps_session_loaded() {
    let dir = TempDir::new().unwrap();
    let (server, port) = start_test_server(dir.path()).await;
    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_thread_as_consumer();

    let alice = client(1, &scheduler);
    alice.connect("127.0.0.1", port, 0x5a).unwrap();
    let id = alice.document().patcher_mut().add_object("print").unwrap();
    alice.commit("add print").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while alice.document().unacknowledged().next().is_some() && Instant::now() < deadline {
        scheduler.process();
        sleep(Duration::from_millis(10)).await;
    }

    // A non-empty directory in place of the session file makes the save fail
    let path = server.session_path(0x5a);
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("blocker"), b"").unwrap();
    alice.disconnect();

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.stats().await.failed_saves == 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.stats().await.failed_saves, 1);
    assert_eq!(server.active_sessions().await, 1);

    let bob = client(2, &scheduler);
    bob.connect("127.0.0.1", port, 0x5a).unwrap();
    assert!(bob.document().patcher().object(id).is_some());
}
