//! `.kiwi` document files.

use std::path::Path;

use kiwi_core::BackendIr;

use crate::storage::StoreError;

pub const FILE_MAGIC: &[u8; 4] = b"KIWI";
pub const FILE_FORMAT: u8 = 1;
pub const FILE_EXTENSION: &str = "kiwi";

/// Largest decompressed document accepted from a file.
pub const MAX_DOCUMENT_SIZE: usize = 256 * 1024 * 1024;

/// LZ4 cannot expand a block by more than this factor.
const MAX_LZ4_RATIO: usize = 255;

/// File name of a session: its id as 16 zero-padded lowercase hex digits.
pub fn session_file_name(session_id: u64) -> String {
    format!("{session_id:016x}.{FILE_EXTENSION}")
}

pub fn encode_backend(ir: &BackendIr) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(ir, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);

    let mut bytes = Vec::with_capacity(FILE_MAGIC.len() + 1 + compressed.len());
    bytes.extend_from_slice(FILE_MAGIC);
    bytes.push(FILE_FORMAT);
    bytes.extend_from_slice(&compressed);
    Ok(bytes)
}

pub fn decode_backend(bytes: &[u8]) -> Result<BackendIr, StoreError> {
    let body = bytes
        .strip_prefix(FILE_MAGIC.as_slice())
        .ok_or_else(|| StoreError::Corrupt("missing KIWI header".to_string()))?;
    let (format, compressed) = body
        .split_first()
        .ok_or_else(|| StoreError::Corrupt("truncated header".to_string()))?;
    if *format != FILE_FORMAT {
        return Err(StoreError::Corrupt(format!("unknown file format {format}")));
    }

    let declared = declared_size(compressed)?;
    let limit = MAX_DOCUMENT_SIZE.min(compressed.len().saturating_mul(MAX_LZ4_RATIO));
    if declared > limit {
        return Err(StoreError::Corrupt(format!(
            "declared size {declared} exceeds {limit} bytes"
        )));
    }

    let raw = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let (ir, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(ir)
}

/// Little-endian u32 size prefix written by `compress_prepend_size`.
fn declared_size(compressed: &[u8]) -> Result<usize, StoreError> {
    let prefix: [u8; 4] = compressed
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt("truncated size prefix".to_string()))?;
    Ok(u32::from_le_bytes(prefix) as usize)
}

/// Read a backend snapshot as stored, at whatever version it was written.
pub fn read_backend(path: &Path) -> Result<BackendIr, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    decode_backend(&bytes)
}

/// Write a snapshot through a temporary sibling, then rename over `path`.
pub fn write_backend(path: &Path, ir: &BackendIr) -> Result<(), StoreError> {
    let bytes = encode_backend(ir)?;
    let tmp = path.with_extension(format!("{FILE_EXTENSION}.tmp"));
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    log::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
