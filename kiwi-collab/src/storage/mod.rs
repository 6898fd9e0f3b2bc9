//! Persistent storage for session documents.
//!
//! Layout:
//! ```text
//! backend_directory/
//! ├── 00000000000000ab.kiwi    ── one file per session id (16 lowercase hex)
//! └── 0000000000000fe2.kiwi
//!
//! .kiwi file
//! ┌────────┬────────┬───────────────────────────────────────┐
//! │ "KIWI" │ format │ lz4( bincode( BackendIr ) )           │
//! │ 4 bytes│ 1 byte │ size-prepended block                  │
//! └────────┴────────┴───────────────────────────────────────┘
//! ```
//!
//! The `BackendIr` carries the model version it was written at. Reading goes
//! through the [`ConverterChain`], which upgrades old versions step by step or
//! refuses the file.

pub mod converter;
pub mod file;

pub use converter::{ConverterChain, ConverterStep};
pub use file::{
    read_backend, session_file_name, write_backend, FILE_EXTENSION, FILE_FORMAT, FILE_MAGIC, MAX_DOCUMENT_SIZE,
};

use std::path::{Path, PathBuf};

use kiwi_core::ModelError;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding one `.kiwi` file per session
    pub directory: PathBuf,
    /// Refuse paths without the `.kiwi` extension
    pub check_extension: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("kiwi_sessions"),
            check_extension: true,
        }
    }
}

impl StoreConfig {
    /// Create config for testing rooted at `directory`.
    pub fn for_testing(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            check_extension: true,
        }
    }

    /// Backing file of a session.
    pub fn session_path(&self, session_id: u64) -> PathBuf {
        self.directory.join(session_file_name(session_id))
    }

    /// Check that `path` is usable as a document file.
    pub fn check_path(&self, path: &Path) -> Result<(), StoreError> {
        if self.check_extension && path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
            return Err(StoreError::BadExtension(path.to_path_buf()));
        }
        Ok(())
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// File does not exist
    NotFound(PathBuf),
    /// File is not a `.kiwi` document
    BadExtension(PathBuf),
    /// Bad magic, format byte or compressed block
    Corrupt(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// No converter path from the stored version to the current one
    NoMigrationPath { from: String, to: String },
    /// A converter step failed or left the document malformed
    MigrationFailed { step: String, reason: String },
    /// Document could not be materialized
    Model(ModelError),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(path) => write!(f, "Document not found: {}", path.display()),
            StoreError::BadExtension(path) => {
                write!(f, "Not a .{FILE_EXTENSION} file: {}", path.display())
            }
            StoreError::Corrupt(e) => write!(f, "Corrupt document file: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::NoMigrationPath { from, to } => {
                write!(f, "No converter from version {from} to {to}")
            }
            StoreError::MigrationFailed { step, reason } => {
                write!(f, "Converter {step} failed: {reason}")
            }
            StoreError::Model(e) => write!(f, "Invalid document: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

impl From<ModelError> for StoreError {
    fn from(e: ModelError) -> Self {
        StoreError::Model(e)
    }
}
