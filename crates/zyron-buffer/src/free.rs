//! Freeing block ranges and resizing blocks.

use crate::buffer::{Buffer, BufferInner, DbufState};
use crate::cache::{CacheCounters, DbufCache, DbufHandle};
use crate::data::BlockRef;
use crate::dirty::DirtyRecord;
use crate::object::Object;
use crate::read::ReadFlags;
use std::sync::Arc;
use tracing::{debug, trace};
use zyron_common::{
    round_up_block, Result, ZyronError, BLKPTR_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};

impl DbufCache {
    /// Frees level-0 blocks `start..=end` of `obj` in `txg`.
    ///
    /// Cached copies are dropped or replaced by holes. A block dirty in
    /// `txg` and still held by others is zeroed in place instead, and a
    /// read in flight completes as a hole. Blocks past the object's end are
    /// ignored.
    ///
    /// Waits for holders of blocks in the range that are not writing in
    /// `txg`, so the caller must not hold any of them.
    pub fn free_range(&self, obj: &Arc<Object>, start: u64, end: u64, txg: u64) {
        let end = end.min(obj.max_blkid());
        if start > end {
            return;
        }
        obj.add_free_range(txg, start, end);
        self.shared.txg.mark_object_dirty(obj, txg);
        debug!(object = %obj.id(), start, end, txg, "free range");

        let layout = *obj.layout();
        if layout.nlevels > 1 {
            let epbs = layout.epbs();
            for l1 in (start >> epbs)..=(end >> epbs) {
                self.dirty_l1_for_free(obj, l1, start, end, txg);
            }
        }

        let victims = obj.buffers_where(|b| {
            b.level() == 0 && !b.key().is_spill() && (start..=end).contains(&b.blkid())
        });
        for buf in &victims {
            self.free_one(buf, txg);
        }
    }

    /// Dirties the level-1 block `l1` so the free reaches its child
    /// pointers when it syncs.
    fn dirty_l1_for_free(&self, obj: &Arc<Object>, l1: u64, start: u64, end: u64, txg: u64) {
        let Ok(buf) = self.hold_impl(obj, 1, l1, false) else {
            return;
        };
        let already = buf.lock().head().is_some_and(|dr| dr.txg() == txg);
        if already || self.read_impl(&buf, ReadFlags::default().no_prefetch()).is_err() {
            self.release(&buf);
            return;
        }

        let epbs = obj.layout().epbs();
        let per_block = 1u64 << epbs;
        let first = l1 << epbs;
        let lo = start.max(first);
        let hi = end.min(first + per_block - 1);
        let needed = {
            let inner = buf.lock();
            !inner.dirty.is_empty()
                || inner.data.as_ref().is_some_and(|data| {
                    let bytes = data.read();
                    (lo..=hi).any(|blkid| {
                        let offset = (blkid & (per_block - 1)) as usize * BLKPTR_SIZE;
                        !self.shared.store.resolve(&bytes, offset).is_hole()
                    })
                })
        };
        if needed {
            self.dirty_impl(&buf, None, txg);
        }
        self.release(&buf);
    }

    fn free_one(&self, buf: &Arc<Buffer>, txg: u64) {
        let key = buf.key();
        let mut inner = buf.lock();
        match inner.state {
            DbufState::Evicting => return,
            DbufState::Reading | DbufState::Filling => {
                inner.freed_in_flight = true;
                trace!(key = %key, "freed in flight");
                return;
            }
            _ => {}
        }
        if inner.data.is_none() {
            return;
        }

        let dirty_now = |inner: &BufferInner| inner.head().is_some_and(|dr| dr.txg() == txg);
        let busy = |inner: &BufferInner| {
            inner.holds > inner.dirty_count as u64 + inner.writers_waiting as u64
        };
        if busy(&*inner) && !dirty_now(&*inner) {
            // Wait for holders to finish or to dirty the block in this txg.
            inner.holds += 1;
            inner.writers_waiting += 1;
            while busy(&*inner) && !dirty_now(&*inner) {
                buf.wait(&mut inner);
            }
            inner.writers_waiting -= 1;
            inner.holds -= 1;
            if inner.data.is_none() || inner.state != DbufState::Cached {
                return;
            }
        }

        if let Some(dr) = inner.head().filter(|dr| dr.txg() == txg).cloned() {
            self.unoverride(buf, &mut inner, &dr);
            if inner.holds > inner.dirty_count as u64 {
                // Still in use: the block is rewritten as zeros in this txg.
                if let Some(data) = inner.data.as_ref().filter(|d| !d.is_hole()) {
                    data.thaw();
                    data.write().fill(0);
                }
                drop(inner);
                let obj = buf.object();
                obj.clear_free_range(key.blkid, txg);
                obj.new_blkid(key.blkid);
                trace!(key = %key, txg, "zeroed in place");
                return;
            }
            self.undirty(buf, &mut inner, &dr);
        }

        if inner.holds == 0 {
            self.evict(buf, inner);
            return;
        }
        if !inner.data.as_ref().is_some_and(BlockRef::is_hole) {
            inner.data = Some(BlockRef::hole(inner.size, buf.is_metadata()));
        }
    }

    /// Drops the newest dirty record of a buffer nobody else holds, as if
    /// the block had never been dirtied in that txg.
    pub(crate) fn undirty(&self, buf: &Buffer, inner: &mut BufferInner, dr: &Arc<DirtyRecord>) {
        let key = buf.key();
        let obj = buf.object();
        assert_eq!(
            inner.holds, inner.dirty_count as u64,
            "undirty of {} with active holders",
            key
        );
        assert!(
            inner.head().is_some_and(|head| Arc::ptr_eq(head, dr)),
            "undirty of {} below its newest record",
            key
        );
        assert!(
            !inner
                .data_pending
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, dr)),
            "undirty of {} while it syncs",
            key
        );

        inner.dirty.remove(0);
        match dr.parent() {
            Some(parent) => {
                parent.remove_child(dr);
            }
            None => {
                if obj.remove_dirty_record(dr.txg(), dr) {
                    self.shared.txg.unregister_dirty(obj.id(), dr.txg());
                }
            }
        }
        inner.holds -= 1;
        inner.dirty_count -= 1;
        inner.data = if inner.holds > 0 {
            inner.head().and_then(|head| head.data())
        } else {
            None
        };
        CacheCounters::bump(&self.shared.counters.undirtied);
        debug!(key = %key, txg = dr.txg(), "undirtied");
    }

    /// Resizes a block in `txg`, keeping its leading bytes and zero
    /// filling any growth.
    pub fn new_size(&self, handle: &DbufHandle, size: usize, txg: u64) -> Result<()> {
        if size == 0 || size > MAX_BLOCK_SIZE || size % MIN_BLOCK_SIZE != 0 {
            return Err(ZyronError::InvalidBlockSize { size });
        }
        let buf = handle.buffer();
        assert!(
            buf.level() == 0 && !buf.key().is_bonus(),
            "resize of {}",
            buf.key()
        );
        let dr = self.dirty(handle, txg);

        let mut inner = buf.lock();
        let old = inner.size;
        if inner.state == DbufState::NoFill {
            inner.size = size;
        } else {
            let data = BlockRef::alloc(size, buf.is_metadata());
            if let Some(current) = &inner.data {
                let keep = old.min(size);
                data.write()[..keep].copy_from_slice(&current.read()[..keep]);
            }
            inner.data = Some(data.clone());
            inner.size = size;
            dr.set_data(Some(data));
        }
        drop(inner);

        buf.object().willuse_space(size as i64 - old as i64);
        debug!(key = %buf.key(), old, new = size, txg, "block resized");
        Ok(())
    }

    /// Sets the spill block size, clamped to the supported range and
    /// rounded up to the minimum block size.
    pub fn spill_set_blksz(&self, handle: &DbufHandle, size: usize, txg: u64) -> Result<()> {
        assert!(handle.key().is_spill(), "{} is not a spill block", handle.key());
        let size = match size {
            0 => MIN_BLOCK_SIZE,
            s if s > MAX_BLOCK_SIZE => MAX_BLOCK_SIZE,
            s => round_up_block(s),
        };
        self.new_size(handle, size, txg)
    }
}
