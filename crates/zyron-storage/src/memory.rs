//! In-memory block store.
//!
//! Completes I/O on the calling thread. Reads can be parked with
//! [`MemoryStore::defer_reads`] and completed later, which lets callers
//! observe a block while its read is still in flight.

use crate::store::{
    BlockStore, ReadDone, ReadRequest, StoreStats, WriteCallbacks, WriteOutcome, WriteRequest,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::trace;
use zyron_common::{BlockPtr, Result, ZyronError};

struct StoredBlock {
    data: Bytes,
    birth: u64,
}

struct MemoryInner {
    blocks: HashMap<u64, StoredBlock>,
    next_addr: u64,
    freed: Vec<(BlockPtr, u64)>,
    failing: HashSet<u64>,
    stats: StoreStats,
}

#[derive(Default)]
struct DeferredReads {
    enabled: bool,
    queue: VecDeque<(ReadRequest, ReadDone)>,
}

/// Block store backed by a hash map.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    deferred: Mutex<DeferredReads>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                blocks: HashMap::new(),
                next_addr: 1,
                freed: Vec::new(),
                failing: HashSet::new(),
                stats: StoreStats::default(),
            }),
            deferred: Mutex::new(DeferredReads::default()),
        }
    }

    /// Parks reads until [`complete_deferred_reads`](Self::complete_deferred_reads)
    /// is called. Turning deferral off does not complete parked reads.
    pub fn defer_reads(&self, enabled: bool) {
        self.deferred.lock().enabled = enabled;
    }

    /// Returns the number of parked reads.
    pub fn pending_reads(&self) -> usize {
        self.deferred.lock().queue.len()
    }

    /// Completes every parked read, returning how many ran.
    pub fn complete_deferred_reads(&self) -> usize {
        let parked: Vec<_> = self.deferred.lock().queue.drain(..).collect();
        let count = parked.len();
        for (req, done) in parked {
            self.complete_read(req, done);
        }
        count
    }

    /// Makes reads of the block at `addr` fail.
    pub fn fail_reads_at(&self, addr: u64) {
        self.inner.lock().failing.insert(addr);
    }

    /// Clears all injected read failures.
    pub fn clear_failures(&self) {
        self.inner.lock().failing.clear();
    }

    /// Returns the stored contents of a block, if it is allocated.
    pub fn block(&self, ptr: &BlockPtr) -> Option<Bytes> {
        if ptr.is_hole() {
            return None;
        }
        self.inner
            .lock()
            .blocks
            .get(&ptr.addr)
            .filter(|b| b.birth == ptr.birth)
            .map(|b| b.data.clone())
    }

    /// Returns true if the block is allocated.
    pub fn contains(&self, ptr: &BlockPtr) -> bool {
        self.block(ptr).is_some()
    }

    /// Returns the number of allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Returns every freed pointer with the txg it was freed in.
    pub fn freed(&self) -> Vec<(BlockPtr, u64)> {
        self.inner.lock().freed.clone()
    }

    /// Writes a block outside any cache write, as an external writer would
    /// before overriding a dirty record.
    pub fn write_external(&self, data: &[u8], txg: u64, level: u8) -> BlockPtr {
        let mut inner = self.inner.lock();
        let ptr = Self::allocate(&mut inner, Bytes::copy_from_slice(data), txg, level);
        inner.stats.writes += 1;
        ptr
    }

    fn allocate(inner: &mut MemoryInner, data: Bytes, txg: u64, level: u8) -> BlockPtr {
        let addr = inner.next_addr;
        inner.next_addr += 1;
        let ptr = BlockPtr {
            addr,
            birth: txg,
            fill: 1,
            size: data.len() as u32,
            level,
        };
        inner.blocks.insert(addr, StoredBlock { data, birth: txg });
        ptr
    }

    fn complete_read(&self, req: ReadRequest, done: ReadDone) {
        let result = {
            let mut inner = self.inner.lock();
            inner.stats.reads += 1;
            if req.flags.speculative {
                inner.stats.speculative_reads += 1;
            }
            Self::lookup(&mut inner, &req)
        };
        trace!(key = %req.key, ptr = %req.ptr, ok = result.is_ok(), "memory store read");
        done(result);
    }

    fn lookup(inner: &mut MemoryInner, req: &ReadRequest) -> Result<Bytes> {
        if req.ptr.is_hole() {
            return Ok(Bytes::from(vec![0u8; req.size]));
        }
        if inner.failing.contains(&req.ptr.addr) {
            inner.stats.read_failures += 1;
            return Err(ZyronError::IoError(format!(
                "injected read failure at address {}",
                req.ptr.addr
            )));
        }
        match inner.blocks.get(&req.ptr.addr) {
            Some(block) if block.birth == req.ptr.birth => Ok(block.data.clone()),
            _ => {
                inner.stats.read_failures += 1;
                Err(ZyronError::AddressNotFound {
                    addr: req.ptr.addr,
                })
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryStore {
    fn read(&self, req: ReadRequest, done: ReadDone) {
        {
            let mut deferred = self.deferred.lock();
            if deferred.enabled {
                deferred.queue.push_back((req, done));
                return;
            }
        }
        self.complete_read(req, done);
    }

    fn write(&self, req: WriteRequest, callbacks: WriteCallbacks) {
        let (mut ptr, rewrite) = {
            let mut inner = self.inner.lock();
            inner.stats.writes += 1;
            if let Some(ptr) = req.override_ptr {
                inner.stats.overrides += 1;
                (ptr, false)
            } else {
                let unchanged = match (&req.data, inner.blocks.get(&req.old.addr)) {
                    (Some(data), Some(old)) => {
                        !req.old.is_hole()
                            && old.birth == req.old.birth
                            && req.old.size as usize == req.size
                            && old.data == *data
                    }
                    _ => false,
                };
                if unchanged {
                    inner.stats.rewrites += 1;
                    (req.old, true)
                } else {
                    let data = req
                        .data
                        .clone()
                        .unwrap_or_else(|| Bytes::from(vec![0u8; req.size]));
                    (Self::allocate(&mut inner, data, req.txg, req.level), false)
                }
            }
        };
        trace!(key = %req.key, txg = req.txg, ptr = %ptr, rewrite, "memory store write");
        (callbacks.ready)(&mut ptr);
        (callbacks.done)(Ok(WriteOutcome { ptr, rewrite }));
    }

    fn free(&self, ptr: &BlockPtr, txg: u64) {
        if ptr.is_hole() {
            return;
        }
        let mut inner = self.inner.lock();
        let removed = inner.blocks.remove(&ptr.addr);
        assert!(
            removed.is_some(),
            "free of unallocated block {} in txg {}",
            ptr,
            txg
        );
        inner.stats.frees += 1;
        inner.freed.push((*ptr, txg));
    }

    fn stats(&self) -> StoreStats {
        self.inner.lock().stats
    }
}
