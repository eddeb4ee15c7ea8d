//! Read path: filling buffers from the store, holes and prefetched blocks.

use crate::buffer::{BlockOffset, Buffer, BufferInner, DbufState, ReadCallback};
use crate::cache::{CacheCounters, DbufCache, DbufHandle};
use crate::data::BlockRef;
use bytes::Bytes;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::trace;
use zyron_common::{BlockPtr, Result, ZyronError};
use zyron_storage::{IoFlags, IoPriority, ReadRequest};

/// How a read behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFlags {
    /// Block until the contents are available.
    pub wait: bool,
    /// Report store failures as errors. Without it a failed read panics.
    pub can_fail: bool,
    /// Let the access predictor read ahead.
    pub prefetch: bool,
}

impl Default for ReadFlags {
    fn default() -> Self {
        Self {
            wait: true,
            can_fail: true,
            prefetch: true,
        }
    }
}

impl ReadFlags {
    pub fn must_succeed(self) -> Self {
        Self {
            can_fail: false,
            ..self
        }
    }

    pub fn no_prefetch(self) -> Self {
        Self {
            prefetch: false,
            ..self
        }
    }

    pub fn no_wait(self) -> Self {
        Self {
            wait: false,
            ..self
        }
    }
}

impl DbufCache {
    /// Makes the block's contents available.
    ///
    /// Holes, freed blocks and blocks past the end of the object read as
    /// zeros without touching the store. With `flags.wait` unset the read
    /// is only started.
    pub fn read(&self, handle: &DbufHandle, flags: ReadFlags) -> Result<()> {
        self.read_impl(handle.buffer(), flags)
    }

    /// Starts a read and calls `done` once the contents are available, or
    /// the read failed. `done` may run before this returns.
    pub fn read_async(&self, handle: &DbufHandle, done: ReadCallback) {
        let buf = handle.buffer();
        let mut inner = buf.lock();
        match inner.state {
            DbufState::NoFill => {
                drop(inner);
                done(Err(ZyronError::NoData { key: buf.key() }));
            }
            DbufState::Cached => {
                drop(inner);
                CacheCounters::bump(&self.shared.counters.cache_hits);
                done(Ok(()));
            }
            DbufState::Reading | DbufState::Filling => inner.read_waiters.push(done),
            DbufState::Uncached => {
                inner.read_waiters.push(done);
                self.read_dispatch(buf, inner, ReadFlags::default().no_wait());
            }
            DbufState::Evicting => panic!("read of evicting buffer {}", buf.key()),
        }
    }

    pub(crate) fn read_impl(&self, buf: &Arc<Buffer>, flags: ReadFlags) -> Result<()> {
        let key = buf.key();
        let inner = buf.lock();
        assert!(inner.holds > 0, "read of unheld buffer {}", key);
        match inner.state {
            DbufState::NoFill => return Err(ZyronError::NoData { key }),
            DbufState::Cached => {
                drop(inner);
                CacheCounters::bump(&self.shared.counters.cache_hits);
            }
            DbufState::Uncached => self.read_dispatch(buf, inner, flags),
            DbufState::Reading | DbufState::Filling => drop(inner),
            DbufState::Evicting => panic!("read of evicting buffer {}", key),
        }

        if flags.prefetch
            && key.level == 0
            && !key.is_bonus()
            && !key.is_spill()
            && self.is_cacheable(buf)
        {
            self.predict(buf.object(), key.blkid);
        }

        if flags.wait {
            self.wait_read(buf, flags)
        } else {
            Ok(())
        }
    }

    /// Fills an uncached buffer, either on the spot or by issuing a store
    /// read. Consumes the buffer lock.
    fn read_dispatch(
        &self,
        buf: &Arc<Buffer>,
        mut inner: MutexGuard<'_, BufferInner>,
        flags: ReadFlags,
    ) {
        let key = buf.key();
        let obj = buf.object();
        let metadata = buf.is_metadata();
        debug_assert_eq!(inner.state, DbufState::Uncached);
        inner.read_error = None;

        if key.is_bonus() {
            inner.data = Some(BlockRef::from_bytes(&obj.bonus_bytes(), true));
            inner.state = DbufState::Cached;
            return Self::finish_immediate(buf, inner);
        }

        let bp = self.block_ptr(buf, &inner);
        let freed = key.level == 0 && !key.is_spill() && obj.block_freed(key.blkid);
        if inner.blkoff == BlockOffset::PastEof || freed || bp.is_hole() {
            inner.data = Some(BlockRef::hole(inner.size, metadata));
            inner.state = DbufState::Cached;
            CacheCounters::bump(&self.shared.counters.hole_reads);
            trace!(key = %key, freed, "hole read");
            return Self::finish_immediate(buf, inner);
        }

        if let Some(bytes) = self.shared.tier.claim_prefetched(&bp) {
            if bytes.len() == inner.size {
                inner.data = Some(BlockRef::from_bytes(&bytes, metadata));
                inner.birth = bp.birth;
                inner.state = DbufState::Cached;
                CacheCounters::bump(&self.shared.counters.prefetch_hits);
                trace!(key = %key, ptr = %bp, "prefetched block claimed");
                return Self::finish_immediate(buf, inner);
            }
        }

        inner.state = DbufState::Reading;
        // The read in flight keeps its own hold.
        inner.holds += 1;
        let size = inner.size;
        drop(inner);

        CacheCounters::bump(&self.shared.counters.reads_issued);
        trace!(key = %key, ptr = %bp, size, "read issued");
        let cache = self.clone();
        let target = buf.clone();
        self.shared.store.read(
            ReadRequest {
                key,
                ptr: bp,
                size,
                priority: if flags.wait {
                    IoPriority::SyncRead
                } else {
                    IoPriority::AsyncRead
                },
                flags: IoFlags {
                    can_fail: flags.can_fail,
                    speculative: false,
                },
            },
            Box::new(move |result| cache.read_done(&target, bp, result)),
        );
    }

    fn finish_immediate(buf: &Buffer, mut inner: MutexGuard<'_, BufferInner>) {
        buf.notify();
        let waiters = std::mem::take(&mut inner.read_waiters);
        drop(inner);
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    fn read_done(&self, buf: &Arc<Buffer>, bp: BlockPtr, result: Result<Bytes>) {
        let key = buf.key();
        let metadata = buf.is_metadata();
        let mut inner = buf.lock();
        assert_eq!(
            inner.state,
            DbufState::Reading,
            "read completed on {} in state {:?}",
            key,
            inner.state
        );

        let loaded = if inner.freed_in_flight {
            // Freed while the read was in flight: the old contents are gone.
            inner.freed_in_flight = false;
            Ok(BlockRef::hole(inner.size, metadata))
        } else {
            match result {
                Ok(bytes) if bytes.len() == inner.size => Ok(BlockRef::from_bytes(&bytes, metadata)),
                Ok(bytes) => Err(format!(
                    "expected {} bytes, store returned {}",
                    inner.size,
                    bytes.len()
                )),
                Err(e) => Err(e.to_string()),
            }
        };

        let outcome = match loaded {
            Ok(data) => {
                inner.data = Some(data);
                inner.birth = bp.birth;
                inner.state = DbufState::Cached;
                trace!(key = %key, "read done");
                Ok(())
            }
            Err(reason) => {
                inner.state = DbufState::Uncached;
                inner.read_error = Some(reason.clone());
                trace!(key = %key, reason = %reason, "read failed");
                Err(reason)
            }
        };
        buf.notify();
        let waiters = std::mem::take(&mut inner.read_waiters);
        self.rele_and_unlock(buf, inner);

        for waiter in waiters {
            waiter(
                outcome
                    .clone()
                    .map_err(|reason| ZyronError::BlockReadFailed { key, reason }),
            );
        }
    }

    /// Waits for a read or fill in progress to finish.
    fn wait_read(&self, buf: &Buffer, flags: ReadFlags) -> Result<()> {
        let key = buf.key();
        let mut inner = buf.lock();
        while matches!(inner.state, DbufState::Reading | DbufState::Filling) {
            buf.wait(&mut inner);
        }
        match inner.state {
            DbufState::Cached => Ok(()),
            DbufState::NoFill => Err(ZyronError::NoData { key }),
            DbufState::Uncached => {
                let reason = inner
                    .read_error
                    .clone()
                    .unwrap_or_else(|| "read not completed".to_string());
                if !flags.can_fail {
                    panic!("must-succeed read of {} failed: {}", key, reason);
                }
                Err(ZyronError::BlockReadFailed { key, reason })
            }
            state => panic!("read of {} ended in state {:?}", key, state),
        }
    }
}
