//! Block store interface consumed by the buffer cache.
//!
//! Reads and writes complete through callbacks. A store may run the
//! callback before `read`/`write` returns, or later from another thread;
//! callers must not hold locks the callback needs when they submit I/O.

use bytes::Bytes;
use zyron_common::{BlockPtr, BufferKey, Result, BLKPTR_SIZE};

/// Scheduling class of a block I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPriority {
    /// A caller is blocked on the read.
    SyncRead,
    /// Read issued without a waiting caller.
    AsyncRead,
    /// Speculative read ahead of predicted access.
    Prefetch,
    /// Transaction group write-out.
    AsyncWrite,
}

/// Flags attached to a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoFlags {
    /// Failure is reported to the callback instead of being fatal.
    pub can_fail: bool,
    /// The read is a prefetch that may be dropped.
    pub speculative: bool,
}

/// A block read.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub key: BufferKey,
    pub ptr: BlockPtr,
    /// Expected logical size of the block.
    pub size: usize,
    pub priority: IoPriority,
    pub flags: IoFlags,
}

/// Completion for a read.
pub type ReadDone = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// A block write.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub key: BufferKey,
    pub txg: u64,
    /// Pointer currently installed for this block (hole if none).
    pub old: BlockPtr,
    /// Block contents; `None` allocates space without writing data.
    pub data: Option<Bytes>,
    /// Logical size of the block.
    pub size: usize,
    /// Tree level of the block.
    pub level: u8,
    pub priority: IoPriority,
    /// Pointer to a block already written out of band for this txg.
    pub override_ptr: Option<BlockPtr>,
}

/// Result of a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Final pointer for the written block.
    pub ptr: BlockPtr,
    /// The store left the old block in place because its contents were
    /// identical; the old block must not be freed.
    pub rewrite: bool,
}

/// Callbacks for a write.
///
/// `ready` runs once the new pointer is assigned and may adjust it (the
/// cache fills in the fill count there). `done` runs after the write
/// completes, with the adjusted pointer.
pub struct WriteCallbacks {
    pub ready: Box<dyn FnOnce(&mut BlockPtr) + Send>,
    pub done: Box<dyn FnOnce(Result<WriteOutcome>) + Send>,
}

/// Counters kept by a block store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub speculative_reads: u64,
    pub read_failures: u64,
    pub writes: u64,
    pub rewrites: u64,
    pub overrides: u64,
    pub frees: u64,
}

/// Backing store for cached blocks.
pub trait BlockStore: Send + Sync {
    /// Reads the block named by `req.ptr`, completing through `done`.
    fn read(&self, req: ReadRequest, done: ReadDone);

    /// Writes a block, calling `callbacks.ready` then `callbacks.done`.
    fn write(&self, req: WriteRequest, callbacks: WriteCallbacks);

    /// Releases the physical space of a block superseded in `txg`.
    fn free(&self, ptr: &BlockPtr, txg: u64);

    /// Returns a snapshot of the store's counters.
    fn stats(&self) -> StoreStats;

    /// Reads the block pointer stored at `offset` of an indirect block.
    fn resolve(&self, parent: &[u8], offset: usize) -> BlockPtr {
        debug_assert!(offset + BLKPTR_SIZE <= parent.len());
        BlockPtr::read_at(parent, offset)
    }
}
