//! Error types for the Zyron buffer cache.

use crate::block::BufferKey;
use thiserror::Error;

/// Result type alias using ZyronError.
pub type Result<T> = std::result::Result<T, ZyronError>;

/// Errors that can occur in Zyron cache and store operations.
///
/// Broken cache invariants are not represented here; they panic.
#[derive(Debug, Error)]
pub enum ZyronError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Read of block {key} failed: {reason}")]
    BlockReadFailed { key: BufferKey, reason: String },

    // Lookup errors
    #[error("Block not found: {key}")]
    BlockNotFound { key: BufferKey },

    #[error("Block {key} beyond object capacity (max block id {max})")]
    BlockOutOfRange { key: BufferKey, max: u64 },

    #[error("Block {key} has no readable data")]
    NoData { key: BufferKey },

    #[error("Block {key} is not dirty in txg {txg}")]
    NotDirty { key: BufferKey, txg: u64 },

    // Layout errors
    #[error("Invalid block size: {size}")]
    InvalidBlockSize { size: usize },

    #[error("Invalid object layout: {0}")]
    InvalidLayout(String),

    #[error("Write of {len} bytes at offset {offset} exceeds block size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    // Store errors
    #[error("No block at address {addr}")]
    AddressNotFound { addr: u64 },

    #[error("Block store full")]
    StoreFull,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
