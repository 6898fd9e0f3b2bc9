//! # kiwi-collab: Collaborative sessions for Kiwi patchers
//!
//! Several clients edit one patcher through a server session. Each client
//! commits transactions locally, pushes them, and pulls what others did; the
//! server applies them in arrival order and persists the session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     WebSocket      ┌─────────────────┐
//! │ DocumentManager │ ◄────────────────► │ Server          │
//! │ (per user)      │    Binary Proto    │ (central)       │
//! └────────┬────────┘                    └────────┬────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌─────────────────┐                    ┌─────────────────┐
//! │ Document        │                    │ Session         │
//! │ (model+history) │                    │ (authority)     │
//! └─────────────────┘                    └────────┬────────┘
//!                                                 │
//!                                        ┌────────┴────────┐
//!                                        │ <id>.kiwi files │
//!                                        │ ConverterChain  │
//!                                        └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`session`]: Server-side session: auth, presence, fan-out
//! - [`server`]: WebSocket session server
//! - [`client`]: Transport thread and the client DocumentManager
//! - [`storage`]: `.kiwi` files and version migration

pub mod client;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use client::{ClientConfig, ClientError, Connection, ConnectionState, DocumentManager, UserEvent};
pub use protocol::{HandshakeMetadata, MessageType, ProtocolError, Rejection, SyncMessage};
pub use server::{Server, ServerConfig, ServerError, ServerStats};
pub use session::{Port, PortCommand, Session, SessionError};
pub use storage::{ConverterChain, ConverterStep, StoreConfig, StoreError};
