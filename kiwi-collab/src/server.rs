//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── port A ──► Client A
//!            ├── Hello(session) ── Session ──────┤
//! Client B ──┘                        │          └── port B ──► Client B
//!                                     │
//!                                     ├── load: <id>.kiwi ── ConverterChain
//!                                     └── last unbind: save, evict
//! ```
//!
//! Each connection runs its own task. A connection is bound to a session by
//! its `Hello`; from then on its transactions go through the session, which
//! answers through the port channel the task drains into the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use kiwi_core::MODEL_VERSION;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{HandshakeMetadata, MessageType, SyncMessage};
use crate::session::{Port, PortCommand, Session, SessionError};
use crate::storage::StoreConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Where session files live
    pub store: StoreConfig,
    /// Shared secret clients must present
    pub open_token: String,
    /// Application version clients must match
    pub kiwi_version: String,
    /// Model version clients must match
    pub model_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            store: StoreConfig::default(),
            open_token: "kiwi".to_string(),
            kiwi_version: env!("CARGO_PKG_VERSION").to_string(),
            model_version: MODEL_VERSION.to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config for testing (ephemeral port, given directory).
    pub fn for_testing(backend_directory: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            store: StoreConfig::for_testing(backend_directory),
            open_token: "test-token".to_string(),
            ..Self::default()
        }
    }

    /// Metadata a client handshake must match.
    pub fn handshake(&self) -> HandshakeMetadata {
        HandshakeMetadata::new(&self.model_version, &self.open_token, &self.kiwi_version)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub rejected_ports: u64,
    pub saved_sessions: u64,
    pub failed_saves: u64,
}

/// Server errors.
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Backend path exists and is not a directory
    InvalidBackendDirectory(PathBuf),
    IoError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBackendDirectory(path) => {
                write!(f, "Backend path is not a directory: {}", path.display())
            }
            Self::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

type Sessions = Arc<Mutex<HashMap<u64, Session>>>;

/// State shared by the accept loop and every connection task.
#[derive(Clone)]
struct Shared {
    config: Arc<ServerConfig>,
    sessions: Sessions,
    stats: Arc<RwLock<ServerStats>>,
}

/// The session server.
pub struct Server {
    shared: Shared,
    next_port: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a server. The backend directory is created if missing; an
    /// existing path that is not a directory is an error.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let directory = &config.store.directory;
        if directory.exists() && !directory.is_dir() {
            return Err(ServerError::InvalidBackendDirectory(directory.clone()));
        }
        std::fs::create_dir_all(directory)?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Shared {
                config: Arc::new(config),
                sessions: Arc::new(Mutex::new(HashMap::new())),
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
            next_port: Arc::new(AtomicU64::new(1)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
        })
    }

    /// Accept connections until [`stop`](Self::stop) is called. Open
    /// sessions are saved and their ports closed on the way out.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!(
            "Kiwi server listening on {} (sessions in {})",
            listener.local_addr()?,
            self.shared.config.store.directory.display()
        );
        self.running.store(true, Ordering::SeqCst);

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    let port_id = self.next_port.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, port_id, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let mut sessions = self.shared.sessions.lock().await;
        for (id, mut session) in sessions.drain() {
            session.close_ports();
            if let Err(e) = session.save() {
                log::error!("Failed to save session {id:016x} on shutdown: {e}");
            }
        }
        self.shared.stats.write().await.active_sessions = 0;
        log::info!("Kiwi server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn active_sessions(&self) -> usize {
        self.shared.sessions.lock().await.len()
    }

    /// Backing file of a session.
    pub fn session_path(&self, session_id: u64) -> PathBuf {
        self.shared.config.store.session_path(session_id)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        port_id: u64,
        shared: Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr} (port {port_id})");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (port_tx, mut port_rx) = mpsc::unbounded_channel::<PortCommand>();
        let mut bound_session: Option<u64> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(sync_msg) => sync_msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::Hello if bound_session.is_none() => {
                                    let port = Port::new(port_id, sync_msg.user_id, port_tx.clone());
                                    match Self::open_port(&shared, &sync_msg, port).await {
                                        Ok(()) => bound_session = Some(sync_msg.session_id),
                                        Err(e) => {
                                            shared.stats.write().await.rejected_ports += 1;
                                            let reply = SyncMessage::error(sync_msg.session_id, &e.to_string())?;
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                            let _ = ws_sender.close().await;
                                            break;
                                        }
                                    }
                                }

                                MessageType::Transaction => {
                                    let Some(session_id) = bound_session else {
                                        log::warn!("Transaction from unbound port {port_id}");
                                        continue;
                                    };
                                    match sync_msg.transaction_payload() {
                                        Ok(tx) => {
                                            let mut sessions = shared.sessions.lock().await;
                                            if let Some(session) = sessions.get_mut(&session_id) {
                                                // Rejections are answered by the session itself
                                                let _ = session.apply_transaction(port_id, &tx);
                                            }
                                        }
                                        Err(e) => log::warn!("Bad transaction from {addr}: {e}"),
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.user_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                other => {
                                    log::debug!("Unhandled message type from port {port_id}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                command = port_rx.recv() => {
                    match command {
                        Some(PortCommand::Send(data)) => {
                            if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                                log::warn!("Send to port {port_id} failed: {e}");
                                break;
                            }
                        }
                        Some(PortCommand::Close) | None => {
                            let _ = ws_sender.close().await;
                            break;
                        }
                    }
                }
            }
        }

        if let Some(session_id) = bound_session {
            Self::close_port(&shared, session_id, port_id).await;
        }
        shared.stats.write().await.active_connections -= 1;
        Ok(())
    }

    /// Authenticate and bind a port, creating and loading the session on
    /// first use. Nothing is registered if any step fails.
    async fn open_port(shared: &Shared, hello: &SyncMessage, port: Port) -> Result<(), SessionError> {
        let session_id = hello.session_id;
        let mut sessions = shared.sessions.lock().await;

        if let Some(session) = sessions.get_mut(&session_id) {
            session.authenticate_user(hello.user_id, &hello.payload)?;
            return session.bind(port);
        }

        let mut session = Session::new(session_id, &shared.config.store, shared.config.handshake());
        session.authenticate_user(hello.user_id, &hello.payload)?;
        match session.load() {
            Ok(true) => {}
            Ok(false) => {
                log::info!("Creating new session {session_id:016x}");
                session.init_empty_document();
            }
            Err(e) => {
                log::error!("Failed to open session {session_id:016x}: {e}");
                return Err(e);
            }
        }
        session.bind(port)?;
        sessions.insert(session_id, session);
        shared.stats.write().await.active_sessions = sessions.len();
        Ok(())
    }

    /// Unbind a port; the last one out saves and evicts the session. A session
    /// that cannot be saved is kept.
    async fn close_port(shared: &Shared, session_id: u64, port_id: u64) {
        let mut sessions = shared.sessions.lock().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return;
        };
        if !session.unbind(port_id) {
            return;
        }
        if let Err(e) = session.save() {
            // Resident until a save succeeds
            log::error!("Failed to save session {session_id:016x}, keeping it open: {e}");
            shared.stats.write().await.failed_saves += 1;
            return;
        }
        shared.stats.write().await.saved_sessions += 1;
        sessions.remove(&session_id);
        shared.stats.write().await.active_sessions = sessions.len();
        log::info!("Session {session_id:016x} closed (empty)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.model_version, MODEL_VERSION);
        assert_eq!(config.handshake().open_token, "kiwi");
    }

    #[test]
    fn test_server_creates_backend_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = dir.path().join("sessions");
        let server = Server::new(ServerConfig::for_testing(&backend)).unwrap();

        assert!(backend.is_dir());
        assert_eq!(server.config().store.directory, backend);
        assert!(!server.is_running());
        assert_eq!(server.session_path(0xab), backend.join("00000000000000ab.kiwi"));
    }

    #[test]
    fn test_server_rejects_file_as_backend() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"").unwrap();

        let result = Server::new(ServerConfig::for_testing(&file));
        assert!(matches!(result, Err(ServerError::InvalidBackendDirectory(_))));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(ServerConfig::for_testing(dir.path())).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(server.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_run_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(ServerConfig::for_testing(dir.path())).unwrap());
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(server.is_running());

        server.stop();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
        assert!(!server.is_running());
    }
}
