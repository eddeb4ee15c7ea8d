//! Block stores for the Zyron buffer cache.
//!
//! This crate provides:
//! - The `BlockStore` interface the cache reads, writes and frees through
//! - An in-memory store with deferred read completion and fault injection
//! - A file-backed store with a first-fit extent allocator

mod alloc;
mod file;
mod memory;
mod store;

pub use alloc::ExtentAllocator;
pub use file::FileBlockStore;
pub use memory::MemoryStore;
pub use store::{
    BlockStore, IoFlags, IoPriority, ReadDone, ReadRequest, StoreStats, WriteCallbacks,
    WriteOutcome, WriteRequest,
};
