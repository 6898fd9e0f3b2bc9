//! Server-side document sessions.
//!
//! A session owns the authoritative [`Patcher`] of one document and the ports
//! of the users editing it:
//! ```text
//!                     ┌─────────────────────────────┐
//!  port 1 (user 7) ──►│ Session 0x00000000000000ab  │──► 00000000000000ab.kiwi
//!  port 2 (user 9) ──►│  Patcher (authoritative)    │
//!                     │  seq (canonical tx order)   │
//!                     └─────────────────────────────┘
//! ```
//!
//! Sessions do no I/O on sockets themselves: every port is the sending half
//! of a channel drained by its connection task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiwi_core::{Factory, ModelError, Patcher, Transaction};
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::{HandshakeMetadata, ProtocolError, Rejection, SyncMessage};
use crate::storage::{read_backend, write_backend, ConverterChain, StoreConfig, StoreError};

/// What a connection task is asked to do with its socket.
#[derive(Debug, Clone)]
pub enum PortCommand {
    Send(Arc<Vec<u8>>),
    Close,
}

/// One client connection bound to a session.
#[derive(Debug, Clone)]
pub struct Port {
    pub id: u64,
    pub user_id: u64,
    sender: UnboundedSender<PortCommand>,
}

impl Port {
    pub fn new(id: u64, user_id: u64, sender: UnboundedSender<PortCommand>) -> Self {
        Self { id, user_id, sender }
    }

    fn send_bytes(&self, bytes: Arc<Vec<u8>>) {
        if self.sender.send(PortCommand::Send(bytes)).is_err() {
            log::debug!("Port {} already closed", self.id);
        }
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        self.send_bytes(Arc::new(msg.encode()?));
        Ok(())
    }

    fn close(&self) {
        let _ = self.sender.send(PortCommand::Close);
    }
}

/// Session errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    AuthenticationFailed { user_id: u64, reason: String },
    UnknownPort(u64),
    Store(StoreError),
    Protocol(ProtocolError),
    Model(ModelError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthenticationFailed { user_id, reason } => {
                write!(f, "Authentication failed for user {user_id}: {reason}")
            }
            Self::UnknownPort(id) => write!(f, "Unknown port {id}"),
            Self::Store(e) => write!(f, "Storage error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Model(e) => write!(f, "Model error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ModelError> for SessionError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

pub struct Session {
    id: u64,
    file_path: PathBuf,
    factory: Arc<Factory>,
    converters: ConverterChain,
    expected: HandshakeMetadata,
    patcher: Patcher,
    seq: u64,
    ports: Vec<Port>,
}

impl Session {
    /// A session backed by its file in the store directory. Nothing is read
    /// until [`load`](Self::load).
    pub fn new(id: u64, store: &StoreConfig, expected: HandshakeMetadata) -> Self {
        let factory = Arc::new(Factory::with_builtin_classes());
        Self {
            id,
            file_path: store.session_path(id),
            patcher: Patcher::new(Arc::clone(&factory)),
            factory,
            converters: ConverterChain::default(),
            expected,
            seq: 0,
            ports: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn patcher(&self) -> &Patcher {
        &self.patcher
    }

    /// Number of transactions accepted so far.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Read the backing file, migrating it to the current model version.
    ///
    /// Returns `Ok(false)` when there is no file yet. Unreadable files and
    /// versions with no converter path are errors and leave the session empty.
    pub fn load(&mut self) -> Result<bool, SessionError> {
        if !self.file_path.exists() {
            return Ok(false);
        }
        let mut ir = read_backend(&self.file_path)?;
        let stored_version = ir.version.clone();
        self.converters.process(&mut ir)?;
        self.patcher = Patcher::from_ir(&ir, Arc::clone(&self.factory)).map_err(StoreError::from)?;
        log::info!(
            "Loaded session {:016x} ({} objects, stored as {})",
            self.id,
            self.patcher.objects().len(),
            stored_version
        );
        Ok(true)
    }

    pub fn save(&self) -> Result<(), SessionError> {
        write_backend(&self.file_path, &self.patcher.to_ir())?;
        log::info!("Saved session {:016x} to {}", self.id, self.file_path.display());
        Ok(())
    }

    /// Start from an empty patcher named after the session.
    pub fn init_empty_document(&mut self) {
        let mut patcher = Patcher::new(Arc::clone(&self.factory));
        patcher.set_name(&format!("Document_{:016x}", self.id));
        patcher.take_pending();
        patcher.clear_changes();
        self.patcher = patcher;
    }

    /// Check a user's handshake metadata against this server's. Failures are
    /// logged with the user id and the raw metadata.
    pub fn authenticate_user(&self, user_id: u64, raw_metadata: &[u8]) -> Result<(), SessionError> {
        let reason = match HandshakeMetadata::from_json(raw_metadata) {
            Err(e) => e.to_string(),
            Ok(metadata) if metadata.model_version != self.expected.model_version => {
                format!("model version {} != {}", metadata.model_version, self.expected.model_version)
            }
            Ok(metadata) if metadata.kiwi_version != self.expected.kiwi_version => {
                format!("kiwi version {} != {}", metadata.kiwi_version, self.expected.kiwi_version)
            }
            Ok(metadata) if metadata.open_token != self.expected.open_token => "bad open token".to_string(),
            Ok(_) => return Ok(()),
        };
        log::warn!(
            "Rejecting user {} on session {:016x}: {} (metadata: {})",
            user_id,
            self.id,
            reason,
            String::from_utf8_lossy(raw_metadata)
        );
        Err(SessionError::AuthenticationFailed { user_id, reason })
    }

    /// Register an authenticated port. A previous port of the same user is
    /// closed first. The newcomer gets the document and the user list; the
    /// others are told the user joined.
    pub fn bind(&mut self, port: Port) -> Result<(), SessionError> {
        let snapshot = SyncMessage::snapshot(self.id, self.seq, &self.patcher.to_ir())?;
        let users = SyncMessage::connected_users(self.id, &self.users_with(port.user_id))?;

        let mut reconnected = false;
        self.ports.retain(|existing| {
            if existing.user_id != port.user_id {
                return true;
            }
            log::info!("User {} reconnected, closing port {}", existing.user_id, existing.id);
            existing.close();
            reconnected = true;
            false
        });

        port.send(&snapshot)?;
        port.send(&users)?;
        if !reconnected {
            let joined = Arc::new(SyncMessage::user_connect(port.user_id, self.id).encode()?);
            for other in &self.ports {
                other.send_bytes(Arc::clone(&joined));
            }
        }

        log::info!("User {} bound to session {:016x} on port {}", port.user_id, self.id, port.id);
        self.ports.push(port);
        Ok(())
    }

    /// Remove a port. Returns true when it was the last one.
    pub fn unbind(&mut self, port_id: u64) -> bool {
        let Some(index) = self.ports.iter().position(|p| p.id == port_id) else {
            return false;
        };
        let port = self.ports.remove(index);
        log::info!("User {} left session {:016x}", port.user_id, self.id);

        match SyncMessage::user_disconnect(port.user_id, self.id).encode() {
            Ok(bytes) => {
                let left = Arc::new(bytes);
                for other in &self.ports {
                    other.send_bytes(Arc::clone(&left));
                }
            }
            Err(e) => log::error!("Failed to encode disconnect notice: {e}"),
        }
        self.ports.is_empty()
    }

    /// Close every port, leaving the session empty.
    pub fn close_ports(&mut self) {
        for port in self.ports.drain(..) {
            port.close();
        }
    }

    pub fn connected_users(&self) -> Vec<u64> {
        let mut users: Vec<u64> = self.ports.iter().map(|p| p.user_id).collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    fn users_with(&self, user_id: u64) -> Vec<u64> {
        let mut users = self.connected_users();
        if let Err(index) = users.binary_search(&user_id) {
            users.insert(index, user_id);
        }
        users
    }

    pub fn send_connected_users(&self, port_id: u64) -> Result<(), SessionError> {
        let port = self.port(port_id)?;
        port.send(&SyncMessage::connected_users(self.id, &self.connected_users())?)?;
        Ok(())
    }

    fn port(&self, port_id: u64) -> Result<&Port, SessionError> {
        self.ports
            .iter()
            .find(|p| p.id == port_id)
            .ok_or(SessionError::UnknownPort(port_id))
    }

    /// Apply a transaction from a port in canonical order. The author gets an
    /// `Ack`, everyone else the transaction. Invalid transactions leave the
    /// document untouched and are answered with a `Reject`.
    pub fn apply_transaction(&mut self, port_id: u64, tx: &Transaction) -> Result<u64, SessionError> {
        let author = self.port(port_id)?.user_id;

        if let Err(e) = self.patcher.apply(tx) {
            log::warn!("Rejected transaction {} from user {}: {}", tx.id, author, e);
            let rejection = Rejection {
                transaction: tx.id,
                reason: e.to_string(),
            };
            self.port(port_id)?
                .send(&SyncMessage::reject(author, self.id, self.seq, &rejection)?)?;
            return Err(e.into());
        }
        self.patcher.clear_changes();
        self.seq += 1;

        let ack = SyncMessage::ack(author, self.id, self.seq, tx.id)?;
        let forward = Arc::new(SyncMessage::transaction(author, self.id, self.seq, tx)?.encode()?);
        for port in &self.ports {
            if port.id == port_id {
                port.send(&ack)?;
            } else {
                port.send_bytes(Arc::clone(&forward));
            }
        }
        log::debug!("Session {:016x} accepted transaction {} as #{}", self.id, tx.id, self.seq);
        Ok(self.seq)
    }
}
