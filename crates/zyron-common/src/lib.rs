//! Zyron common types, errors, and utilities.
//!
//! This crate provides the block addressing, configuration and error
//! definitions shared by the block stores and the buffer cache.

pub mod block;
pub mod config;
pub mod error;
pub mod types;

pub use block::{
    round_up_block, BlockPtr, BufferKey, ObjectId, BLKPTR_SHIFT, BLKPTR_SIZE, BONUS_BLKID,
    BONUS_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SHIFT, MIN_BLOCK_SIZE, SPILL_BLKID,
};
pub use config::{CacheConfig, StoreConfig};
pub use error::{Result, ZyronError};
pub use types::{CachePolicy, ObjectKind, ENTRY_SIZE};
