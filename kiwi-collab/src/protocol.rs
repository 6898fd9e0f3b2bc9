//! Binary protocol between document managers and the session server.
//!
//! Wire format (bincode-encoded, one binary WebSocket frame per message):
//! ```text
//! ┌──────────┬──────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ user_id  │ session_id │ seq      │ payload  │
//! │ 1 byte   │ varint   │ varint     │ varint   │ variable │
//! └──────────┴──────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! `seq` is the server's canonical transaction order for a session. Clients
//! send 0; the server stamps every `Transaction`, `Ack` and `Reject` it emits.
//!
//! The `Hello` payload is the JSON handshake metadata, everything else is
//! bincode.

use kiwi_core::{BackendIr, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client handshake carrying [`HandshakeMetadata`]
    Hello = 1,
    /// Full document state at the current model version
    Snapshot = 2,
    /// A committed transaction
    Transaction = 3,
    /// Server accepted the sender's transaction
    Ack = 4,
    /// Server refused the sender's transaction
    Reject = 5,
    /// Users bound to the session, sent to a newcomer
    ConnectedUsers = 6,
    /// Another user joined the session
    UserConnect = 7,
    /// Another user left the session
    UserDisconnect = 8,
    /// Session could not be opened
    Error = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Handshake metadata. Every key is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMetadata {
    pub model_version: String,
    pub open_token: String,
    pub kiwi_version: String,
}

impl HandshakeMetadata {
    pub fn new(
        model_version: impl Into<String>,
        open_token: impl Into<String>,
        kiwi_version: impl Into<String>,
    ) -> Self {
        Self {
            model_version: model_version.into(),
            open_token: open_token.into(),
            kiwi_version: kiwi_version.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Fails on malformed JSON and on any missing key.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Payload of a `Reject` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub transaction: Uuid,
    pub reason: String,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub user_id: u64,
    pub session_id: u64,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, user_id: u64, session_id: u64, seq: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            user_id,
            session_id,
            seq,
            payload,
        }
    }

    /// Create the opening handshake of a client port.
    pub fn hello(user_id: u64, session_id: u64, metadata: &HandshakeMetadata) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Hello, user_id, session_id, 0, metadata.to_json()?))
    }

    /// Create a full-state message.
    pub fn snapshot(session_id: u64, seq: u64, ir: &BackendIr) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Snapshot, 0, session_id, seq, encode_payload(ir)?))
    }

    /// Create a transaction message. `user_id` is the author.
    pub fn transaction(user_id: u64, session_id: u64, seq: u64, tx: &Transaction) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Transaction, user_id, session_id, seq, encode_payload(tx)?))
    }

    pub fn ack(user_id: u64, session_id: u64, seq: u64, transaction: Uuid) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Ack, user_id, session_id, seq, encode_payload(&transaction)?))
    }

    pub fn reject(user_id: u64, session_id: u64, seq: u64, rejection: &Rejection) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Reject, user_id, session_id, seq, encode_payload(rejection)?))
    }

    pub fn connected_users(session_id: u64, users: &[u64]) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::ConnectedUsers, 0, session_id, 0, encode_payload(&users)?))
    }

    pub fn user_connect(user_id: u64, session_id: u64) -> Self {
        Self::new(MessageType::UserConnect, user_id, session_id, 0, Vec::new())
    }

    pub fn user_disconnect(user_id: u64, session_id: u64) -> Self {
        Self::new(MessageType::UserDisconnect, user_id, session_id, 0, Vec::new())
    }

    pub fn error(session_id: u64, reason: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Error, 0, session_id, 0, encode_payload(&reason)?))
    }

    pub fn ping(user_id: u64) -> Self {
        Self::new(MessageType::Ping, user_id, 0, 0, Vec::new())
    }

    pub fn pong(user_id: u64) -> Self {
        Self::new(MessageType::Pong, user_id, 0, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(())
    }

    /// Parse handshake metadata. Keeps the raw text for audit logging.
    pub fn hello_metadata(&self) -> Result<HandshakeMetadata, ProtocolError> {
        self.expect(MessageType::Hello)?;
        HandshakeMetadata::from_json(&self.payload)
    }

    pub fn snapshot_ir(&self) -> Result<BackendIr, ProtocolError> {
        self.expect(MessageType::Snapshot)?;
        decode_payload(&self.payload)
    }

    pub fn transaction_payload(&self) -> Result<Transaction, ProtocolError> {
        self.expect(MessageType::Transaction)?;
        decode_payload(&self.payload)
    }

    pub fn acked_transaction(&self) -> Result<Uuid, ProtocolError> {
        self.expect(MessageType::Ack)?;
        decode_payload(&self.payload)
    }

    pub fn rejection(&self) -> Result<Rejection, ProtocolError> {
        self.expect(MessageType::Reject)?;
        decode_payload(&self.payload)
    }

    pub fn user_list(&self) -> Result<Vec<u64>, ProtocolError> {
        self.expect(MessageType::ConnectedUsers)?;
        decode_payload(&self.payload)
    }

    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        self.expect(MessageType::Error)?;
        decode_payload(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
