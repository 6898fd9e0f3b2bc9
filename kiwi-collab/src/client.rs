//! Client side of a session: the transport and the document manager.
//!
//! ```text
//!  main thread (Scheduler consumer)            transport thread
//! ┌──────────────────────────────┐          ┌──────────────────────────┐
//! │ DocumentManager              │ outgoing │ Connection worker        │
//! │  commit/undo/redo ── push() ─┼────────► │  tokio current_thread    │──► WebSocket
//! │  pull timer (20ms) ─ pull() ◄┼───────── │  tokio-tungstenite       │◄── server
//! │  Document (model + History)  │ incoming └──────────────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! The model is only ever touched on the main thread. The transport never
//! calls into it; it queues decoded messages that `pull()` drains.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use kiwi_core::{Document, ModelError, Patcher, Scheduler, Timer, MODEL_VERSION};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{HandshakeMetadata, MessageType, ProtocolError, SyncMessage};
use crate::storage::{read_backend, write_backend, ConverterChain, StoreConfig, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Client errors.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Could not reach the server, or the server refused the session
    ConnectionFailed(String),
    /// Operation needs an offline document
    AlreadyConnected,
    Model(ModelError),
    Protocol(ProtocolError),
    Store(StoreError),
    IoError(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::AlreadyConnected => write!(f, "Document is connected to a session"),
            Self::Model(e) => write!(f, "Model error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Store(e) => write!(f, "Storage error: {e}"),
            Self::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ModelError> for ClientError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_id: u64,
    /// How long `connect` waits for the session to load
    pub connect_timeout: Duration,
    /// Period of the pull timer once connected
    pub pull_interval: Duration,
    pub model_version: String,
    pub open_token: String,
    pub kiwi_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: Uuid::new_v4().as_u64_pair().0,
            connect_timeout: Duration::from_secs(1),
            pull_interval: Duration::from_millis(20),
            model_version: MODEL_VERSION.to_string(),
            open_token: "kiwi".to_string(),
            kiwi_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientConfig {
    /// Create config for testing, matching `ServerConfig::for_testing`.
    pub fn for_testing(user_id: u64) -> Self {
        Self {
            user_id,
            open_token: "test-token".to_string(),
            ..Self::default()
        }
    }

    pub fn handshake(&self) -> HandshakeMetadata {
        HandshakeMetadata::new(&self.model_version, &self.open_token, &self.kiwi_version)
    }
}

enum Outgoing {
    Send(Vec<u8>),
    Close,
}

/// A WebSocket to the server, pumped by a dedicated thread.
pub struct Connection {
    url: String,
    state: Arc<Mutex<ConnectionState>>,
    error: Arc<Mutex<Option<ClientError>>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    incoming: mpsc::UnboundedReceiver<SyncMessage>,
    worker: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start connecting to `url`; `hello` is the first frame sent. Returns
    /// immediately, watch [`state`](Self::state) for the outcome.
    pub fn open(url: String, hello: &SyncMessage, connect_timeout: Duration) -> Result<Self, ClientError> {
        let hello = hello.encode()?;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let error = Arc::new(Mutex::new(None));

        let worker_state = Arc::clone(&state);
        let worker_error = Arc::clone(&error);
        let worker_url = url.clone();
        let worker = std::thread::Builder::new()
            .name("kiwi-transport".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!("Failed to start transport runtime: {e}");
                        *lock(&worker_state) = ConnectionState::Failed;
                        return;
                    }
                };
                runtime.block_on(run_transport(
                    worker_url,
                    hello,
                    connect_timeout,
                    worker_state,
                    worker_error,
                    outgoing_rx,
                    incoming_tx,
                ));
            })
            .map_err(|e| ClientError::IoError(e.to_string()))?;

        Ok(Self {
            url,
            state,
            error,
            outgoing,
            incoming,
            worker: Some(worker),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Why the connection went to [`ConnectionState::Failed`].
    pub fn error(&self) -> Option<ClientError> {
        lock(&self.error).clone()
    }

    pub fn send(&self, msg: &SyncMessage) -> Result<(), ClientError> {
        self.outgoing
            .send(Outgoing::Send(msg.encode()?))
            .map_err(|_| ClientError::Protocol(ProtocolError::ConnectionClosed))
    }

    /// Next message received, without blocking.
    pub fn try_recv(&mut self) -> Option<SyncMessage> {
        self.incoming.try_recv().ok()
    }

    /// Close the socket and wait for the transport thread to finish.
    pub fn close(&mut self) {
        let _ = self.outgoing.send(Outgoing::Close);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Transport thread for {} panicked", self.url);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_transport(
    url: String,
    hello: Vec<u8>,
    connect_timeout: Duration,
    state: Arc<Mutex<ConnectionState>>,
    error: Arc<Mutex<Option<ClientError>>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::UnboundedSender<SyncMessage>,
) {
    let fail = |e: ClientError| {
        log::warn!("Connection to {url} failed: {e}");
        *lock(&error) = Some(e);
        *lock(&state) = ConnectionState::Failed;
    };

    let ws_stream = match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(&url)).await {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => return fail(ClientError::ConnectionFailed(e.to_string())),
        Err(_) => return fail(ClientError::Protocol(ProtocolError::Timeout)),
    };
    let (mut writer, mut reader) = ws_stream.split();

    if let Err(e) = writer.send(Message::Binary(hello.into())).await {
        return fail(ClientError::ConnectionFailed(format!("handshake: {e}")));
    }
    *lock(&state) = ConnectionState::Connected;
    log::info!("Connected to {url}");

    loop {
        tokio::select! {
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => {
                                if incoming.send(sync_msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode message from {url}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if writer.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {url}: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            command = outgoing.recv() => {
                match command {
                    Some(Outgoing::Send(bytes)) => {
                        if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                            log::warn!("Send to {url} failed: {e}");
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = writer.close().await;
                        break;
                    }
                }
            }
        }
    }

    *lock(&state) = ConnectionState::Disconnected;
    log::info!("Disconnected from {url}");
}

/// Presence change in the connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    Connected(u64),
    Disconnected(u64),
}

struct Shared {
    config: ClientConfig,
    document: Mutex<Document>,
    connection: Mutex<Option<Connection>>,
    session_id: Mutex<Option<u64>>,
    users: Mutex<Vec<u64>>,
    events: Mutex<VecDeque<UserEvent>>,
    failure: Mutex<Option<String>>,
    loaded: AtomicBool,
}

impl Shared {
    /// Absorb everything the transport has received since the last call.
    fn pull(&self) -> usize {
        let messages: Vec<SyncMessage> = {
            let mut connection = lock(&self.connection);
            match connection.as_mut() {
                Some(connection) => std::iter::from_fn(|| connection.try_recv()).collect(),
                None => return 0,
            }
        };

        for msg in &messages {
            if let Err(e) = self.handle(msg) {
                log::warn!("Failed to handle {:?} message: {e}", msg.msg_type);
            }
        }
        messages.len()
    }

    fn handle(&self, msg: &SyncMessage) -> Result<(), ClientError> {
        match msg.msg_type {
            MessageType::Snapshot => {
                let ir = msg.snapshot_ir()?;
                let mut document = lock(&self.document);
                let snapshot = Patcher::from_ir(&ir, Arc::clone(document.factory()))?;
                document.load_snapshot(&snapshot);
                self.loaded.store(true, Ordering::SeqCst);
                log::debug!("Loaded session snapshot at #{}", msg.seq);
            }
            MessageType::Transaction => {
                let tx = msg.transaction_payload()?;
                lock(&self.document).receive_remote(&tx)?;
            }
            MessageType::Ack => {
                let id = msg.acked_transaction()?;
                if !lock(&self.document).acknowledge(id) {
                    log::debug!("Ack for unknown transaction {id}");
                }
            }
            MessageType::Reject => {
                let rejection = msg.rejection()?;
                log::warn!("Server rejected transaction {}: {}", rejection.transaction, rejection.reason);
                lock(&self.document).reject(rejection.transaction)?;
            }
            MessageType::ConnectedUsers => {
                *lock(&self.users) = msg.user_list()?;
            }
            MessageType::UserConnect => {
                let mut users = lock(&self.users);
                if let Err(index) = users.binary_search(&msg.user_id) {
                    users.insert(index, msg.user_id);
                }
                lock(&self.events).push_back(UserEvent::Connected(msg.user_id));
            }
            MessageType::UserDisconnect => {
                lock(&self.users).retain(|u| *u != msg.user_id);
                lock(&self.events).push_back(UserEvent::Disconnected(msg.user_id));
            }
            MessageType::Error => {
                let reason = msg.error_reason()?;
                log::error!("Session refused: {reason}");
                *lock(&self.failure) = Some(reason);
            }
            _ => {}
        }
        Ok(())
    }

    /// Send committed transactions. They stay queued while offline.
    fn push(&self) -> usize {
        let Some(session_id) = *lock(&self.session_id) else {
            return 0;
        };
        let mut document = lock(&self.document);
        let connection = lock(&self.connection);
        let Some(connection) = connection.as_ref().filter(|c| c.is_connected()) else {
            return 0;
        };
        if !self.loaded.load(Ordering::SeqCst) || !document.has_outgoing() {
            return 0;
        }

        let outgoing = document.take_outgoing();
        for tx in &outgoing {
            let sent = SyncMessage::transaction(self.config.user_id, session_id, 0, tx)
                .map_err(ClientError::from)
                .and_then(|msg| connection.send(&msg));
            if let Err(e) = sent {
                log::warn!("Failed to send transaction {}: {e}", tx.id);
            }
        }
        outgoing.len()
    }
}

/// Owns a [`Document`] and keeps it in sync with a session.
///
/// Every editing operation pushes what it committed. Once connected, a pull
/// timer on the main [`Scheduler`] absorbs remote changes; the owning thread
/// must keep calling [`Scheduler::process`].
pub struct DocumentManager {
    shared: Arc<Shared>,
    pull_timer: Timer,
}

impl DocumentManager {
    pub fn new(config: ClientConfig, scheduler: &Arc<Scheduler>) -> Self {
        let shared = Arc::new(Shared {
            config,
            document: Mutex::new(Document::default()),
            connection: Mutex::new(None),
            session_id: Mutex::new(None),
            users: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            failure: Mutex::new(None),
            loaded: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        let pull_timer = Timer::new(scheduler, move || {
            if let Some(shared) = weak.upgrade() {
                shared.pull();
                shared.push();
            }
        });

        Self { shared, pull_timer }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// The document, for reading and for editing the patcher before a commit.
    pub fn document(&self) -> MutexGuard<'_, Document> {
        lock(&self.shared.document)
    }

    pub fn commit(&self, label: &str) -> Result<Option<Uuid>, ClientError> {
        let id = self.document().commit(label)?;
        self.push();
        Ok(id)
    }

    pub fn start_commit_gesture(&self) -> Result<(), ClientError> {
        Ok(self.document().start_commit_gesture()?)
    }

    pub fn commit_gesture(&self, label: &str) -> Result<(), ClientError> {
        Ok(self.document().commit_gesture(label)?)
    }

    pub fn end_commit_gesture(&self) -> Result<(), ClientError> {
        self.document().end_commit_gesture()?;
        self.push();
        Ok(())
    }

    pub fn is_in_gesture(&self) -> bool {
        self.document().is_in_gesture()
    }

    pub fn can_undo(&self) -> bool {
        self.document().can_undo()
    }

    pub fn undo_label(&self) -> Option<String> {
        self.document().undo_label().map(str::to_string)
    }

    pub fn undo(&self) -> Result<(), ClientError> {
        self.document().undo()?;
        self.push();
        Ok(())
    }

    pub fn can_redo(&self) -> bool {
        self.document().can_redo()
    }

    pub fn redo_label(&self) -> Option<String> {
        self.document().redo_label().map(str::to_string)
    }

    pub fn redo(&self) -> Result<(), ClientError> {
        self.document().redo()?;
        self.push();
        Ok(())
    }

    /// Apply what the session sent since the last pull. Returns the number of
    /// messages handled.
    pub fn pull(&self) -> usize {
        self.shared.pull()
    }

    /// Send committed transactions. Returns how many were sent.
    pub fn push(&self) -> usize {
        self.shared.push()
    }

    /// Join session `session_id` on `host:port`, blocking until its document
    /// is loaded or the connect timeout elapses.
    pub fn connect(&self, host: &str, port: u16, session_id: u64) -> Result<(), ClientError> {
        self.disconnect();

        let config = &self.shared.config;
        let hello = SyncMessage::hello(config.user_id, session_id, &config.handshake())?;
        let url = format!("ws://{host}:{port}/{session_id:016x}");
        let connection = Connection::open(url.clone(), &hello, config.connect_timeout)?;

        *lock(&self.shared.connection) = Some(connection);
        *lock(&self.shared.session_id) = Some(session_id);
        *lock(&self.shared.failure) = None;
        lock(&self.shared.users).clear();
        self.shared.loaded.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + config.connect_timeout;
        loop {
            let state = self.connection_state();
            self.shared.pull();

            let failure = lock(&self.shared.failure).take();
            let error = match (failure, state) {
                (Some(reason), _) => Some(ClientError::ConnectionFailed(reason)),
                (None, ConnectionState::Connected) if self.shared.loaded.load(Ordering::SeqCst) => break,
                (None, ConnectionState::Failed) => Some(self.connection_error().unwrap_or_else(|| {
                    ClientError::ConnectionFailed(format!("could not reach {url}"))
                })),
                (None, ConnectionState::Disconnected) => {
                    Some(ClientError::ConnectionFailed(format!("{url} closed the connection")))
                }
                (None, _) if Instant::now() >= deadline => Some(ClientError::Protocol(ProtocolError::Timeout)),
                (None, _) => None,
            };
            if let Some(error) = error {
                self.disconnect();
                return Err(error);
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        self.pull_timer.start_timer(config.pull_interval);
        self.push();
        log::info!("Joined session {session_id:016x} as user {}", config.user_id);
        Ok(())
    }

    /// Stop pulling and close the transport. Local edits are kept and sent on
    /// the next connect.
    pub fn disconnect(&self) {
        self.pull_timer.stop_timer();
        let connection = lock(&self.shared.connection).take();
        if let Some(mut connection) = connection {
            connection.close();
        }
        *lock(&self.shared.session_id) = None;
        lock(&self.shared.users).clear();
        self.shared.loaded.store(false, Ordering::SeqCst);
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.shared.connection)
            .as_ref()
            .map_or(ConnectionState::Disconnected, Connection::state)
    }

    fn connection_error(&self) -> Option<ClientError> {
        lock(&self.shared.connection).as_ref().and_then(Connection::error)
    }

    /// Connected and holding the session's document.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected && self.shared.loaded.load(Ordering::SeqCst)
    }

    pub fn is_pulling(&self) -> bool {
        self.pull_timer.is_running()
    }

    pub fn connected_users(&self) -> Vec<u64> {
        lock(&self.shared.users).clone()
    }

    /// Presence changes since the last call.
    pub fn take_user_events(&self) -> Vec<UserEvent> {
        lock(&self.shared.events).drain(..).collect()
    }

    /// Write the document to a `.kiwi` file.
    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        StoreConfig::default().check_path(path)?;
        let ir = self.document().patcher().to_ir();
        write_backend(path, &ir)?;
        Ok(())
    }

    /// Replace the document with a `.kiwi` file, migrating old versions.
    /// History starts empty. Only allowed while offline.
    pub fn load(&self, path: &Path) -> Result<(), ClientError> {
        if lock(&self.shared.connection).is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        StoreConfig::default().check_path(path)?;
        let mut ir = read_backend(path)?;
        ConverterChain::default().process(&mut ir)?;

        let mut document = self.document();
        let patcher = Patcher::from_ir(&ir, Arc::clone(document.factory()))?;
        *document = Document::from_patcher(patcher);
        Ok(())
    }
}

impl Drop for DocumentManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::Point;

    fn manager() -> DocumentManager {
        DocumentManager::new(ClientConfig::for_testing(1), &Arc::new(Scheduler::new()))
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.pull_interval, Duration::from_millis(20));
        assert_eq!(config.handshake().model_version, MODEL_VERSION);
    }

    #[test]
    fn test_offline_commits_stay_queued() {
        let manager = manager();
        manager
            .document()
            .patcher_mut()
            .add_object_at("+ 42", Point::new(10.0, 10.0))
            .unwrap();
        manager.commit("add object").unwrap();

        assert_eq!(manager.push(), 0);
        assert!(manager.document().has_outgoing());
        assert!(manager.can_undo());
        assert_eq!(manager.undo_label().as_deref(), Some("add object"));
    }

    #[test]
    fn test_disconnect_when_offline() {
        let manager = manager();
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(!manager.is_pulling());
        assert_eq!(manager.pull(), 0);
    }

    #[test]
    fn test_connect_refused() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let manager = manager();

        let started = Instant::now();
        let result = manager.connect("127.0.0.1", port, 1);
        assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!manager.is_pulling());
    }

    #[test]
    fn test_connect_times_out() {
        // Accepted by the kernel backlog but never answered
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig {
            connect_timeout: Duration::from_millis(200),
            ..ClientConfig::for_testing(1)
        };
        let manager = DocumentManager::new(config, &Arc::new(Scheduler::new()));

        let started = Instant::now();
        let result = manager.connect("127.0.0.1", port, 1);
        assert!(matches!(result, Err(ClientError::Protocol(ProtocolError::Timeout))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        drop(listener);
    }

    #[test]
    fn test_save_load_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch.kiwi");
        let manager = manager();
        manager.document().patcher_mut().add_object("osc~ 440").unwrap();
        manager.commit("add osc").unwrap();
        manager.save(&path).unwrap();

        let reopened = DocumentManager::new(ClientConfig::for_testing(2), &Arc::new(Scheduler::new()));
        reopened.load(&path).unwrap();
        let document = reopened.document();
        assert_eq!(document.patcher().objects()[0].text(), "osc~ 440");
        assert!(!document.can_undo());
    }

    #[test]
    fn test_save_requires_kiwi_extension() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        let result = manager.save(&dir.path().join("patch.txt"));
        assert!(matches!(result, Err(ClientError::Store(StoreError::BadExtension(_)))));
        assert!(manager.load(&dir.path().join("patch.txt")).is_err());
    }
}
