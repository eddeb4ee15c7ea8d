//! Transaction group sync: writing dirty records out.
//!
//! Dirty records of a txg are written children first. Each completed write
//! installs its new block pointer into the parent indirect block's data, or
//! into the object's root pointers, before the parent itself is written.

use crate::buffer::{BlockOffset, Buffer, BufferInner, DbufState};
use crate::cache::{CacheCounters, DbufCache};
use crate::dirty::{DirtyLink, DirtyRecord, OverrideState};
use crate::object::Object;
use crate::read::ReadFlags;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use zyron_common::{BlockPtr, Result, BLKPTR_SIZE};
use zyron_storage::{IoPriority, WriteCallbacks, WriteOutcome, WriteRequest};

/// What a txg sync did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub txg: u64,
    pub objects: usize,
    pub blocks_written: u64,
    /// Writes the store satisfied by keeping the old block.
    pub rewrites: u64,
    pub bonus_copied: u64,
    pub blocks_freed: u64,
}

#[derive(Default)]
struct SyncTally {
    written: AtomicU64,
    rewrites: AtomicU64,
    bonus: AtomicU64,
    freed: AtomicU64,
}

impl SyncTally {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Counts writes in flight so a caller can wait for all of them.
struct IoBatch {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl IoBatch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    fn enter(&self) {
        *self.pending.lock() += 1;
    }

    fn exit(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }
}

/// Where a written block's pointer is installed.
enum PtrSlot {
    Root(usize),
    Spill,
    Parent(Arc<Buffer>, usize),
}

struct PreparedWrite {
    slot: PtrSlot,
    request: WriteRequest,
    fill: u64,
}

/// Context carried from a write's submission to its completion.
struct WriteJob {
    buf: Arc<Buffer>,
    record: Arc<DirtyRecord>,
    slot: PtrSlot,
    old: BlockPtr,
    txg: u64,
    batch: Arc<IoBatch>,
    tally: Arc<SyncTally>,
}

impl DbufCache {
    /// Writes out everything dirtied in `txg`.
    ///
    /// Txgs sync in increasing order, and `txg` must no longer accept new
    /// changes.
    ///
    /// # Panics
    ///
    /// Panics if the store fails a write.
    pub fn sync_txg(&self, txg: u64) -> SyncSummary {
        let objects = self.shared.txg.take_dirty_objects(txg);
        let tally = Arc::new(SyncTally::default());
        for obj in &objects {
            self.sync_object(obj, txg, &tally);
        }
        self.shared.txg.txg_synced(txg);
        self.shared.tier.reclaim();

        let summary = SyncSummary {
            txg,
            objects: objects.len(),
            blocks_written: tally.written.load(Ordering::Relaxed),
            rewrites: tally.rewrites.load(Ordering::Relaxed),
            bonus_copied: tally.bonus.load(Ordering::Relaxed),
            blocks_freed: tally.freed.load(Ordering::Relaxed),
        };
        debug!(
            txg,
            objects = summary.objects,
            written = summary.blocks_written,
            freed = summary.blocks_freed,
            "txg synced"
        );
        summary
    }

    fn sync_object(&self, obj: &Arc<Object>, txg: u64, tally: &Arc<SyncTally>) {
        let records = obj.take_dirty_records(txg);
        let frees = obj.free_ranges(txg);

        // Without indirect blocks the freed pointers are the root pointers.
        if obj.layout().nlevels == 1 && !frees.is_empty() {
            let mut phys = obj.phys.write();
            let last = phys.blkptr.len() as u64 - 1;
            for (start, end) in frees.intersect(0, last) {
                for blkid in start..=end {
                    let bp = phys.blkptr[blkid as usize];
                    if bp.is_hole() {
                        continue;
                    }
                    self.shared.store.free(&bp, txg);
                    phys.used_bytes = phys.used_bytes.saturating_sub(bp.size as u64);
                    phys.blkptr[blkid as usize] = BlockPtr::HOLE;
                    SyncTally::bump(&tally.freed, 1);
                }
            }
        }

        for _ in &records {
            self.shared.txg.unregister_dirty(obj.id(), txg);
        }
        trace!(object = %obj.id(), txg, records = records.len(), "syncing object");
        let batch = IoBatch::new();
        self.sync_list(records, txg, &batch, tally);
        batch.wait();

        obj.finish_frees(txg);
        obj.settle_space();
    }

    fn sync_list(
        &self,
        links: Vec<DirtyLink>,
        txg: u64,
        batch: &Arc<IoBatch>,
        tally: &Arc<SyncTally>,
    ) {
        for link in links {
            assert_eq!(link.record.txg(), txg, "record of {} in wrong txg", link.buf.key());
            if link.buf.level() > 0 {
                self.sync_indirect(link, txg, batch, tally);
            } else {
                self.sync_leaf(link, txg, batch, tally);
            }
        }
    }

    fn sync_leaf(&self, link: DirtyLink, txg: u64, batch: &Arc<IoBatch>, tally: &Arc<SyncTally>) {
        let DirtyLink { buf, record } = link;
        let key = buf.key();
        let inner = buf.lock();
        assert!(
            inner.dirty.last().is_some_and(|dr| Arc::ptr_eq(dr, &record)),
            "{} synced out of txg order",
            key
        );

        if key.is_bonus() {
            let mut inner = inner;
            if let Some(data) = record.data() {
                buf.object().phys.write().bonus = data.to_vec();
            }
            inner.dirty.pop();
            inner.dirty_count -= 1;
            SyncTally::bump(&tally.bonus, 1);
            trace!(key = %key, txg, "bonus copied");
            self.rele_and_unlock(&buf, inner);
            return;
        }

        let mut inner = self.check_blkptr(&buf, inner);
        while record.override_state() == OverrideState::PendingExternalWrite {
            buf.wait(&mut inner);
        }
        inner.data_pending = Some(record.clone());
        let prepared = self.prepare_write(&buf, &inner, &record, txg);
        drop(inner);
        self.write(buf, record, prepared, txg, batch, tally);
    }

    fn sync_indirect(
        &self,
        link: DirtyLink,
        txg: u64,
        batch: &Arc<IoBatch>,
        tally: &Arc<SyncTally>,
    ) {
        let DirtyLink { buf, record } = link;
        let key = buf.key();
        let obj = buf.object().clone();

        let unread = buf.lock().state != DbufState::Cached;
        if unread {
            if let Err(e) = self.read_impl(&buf, ReadFlags::default().must_succeed().no_prefetch()) {
                panic!("cannot read indirect block {} for sync: {}", key, e);
            }
        }

        let inner = buf.lock();
        let mut inner = self.check_blkptr(&buf, inner);
        inner.data_pending = Some(record.clone());
        if let Some(data) = inner.data.as_mut() {
            data.make_writable(1);
        }

        if key.level == 1 {
            let released = self.free_child_ptrs(&obj, &inner, key.blkid, txg, tally);
            if released > 0 {
                let mut phys = obj.phys.write();
                phys.used_bytes = phys.used_bytes.saturating_sub(released);
            }
        }
        drop(inner);

        let children = record.take_children();
        let child_batch = IoBatch::new();
        self.sync_list(children, txg, &child_batch, tally);
        child_batch.wait();

        let inner = buf.lock();
        let prepared = self.prepare_write(&buf, &inner, &record, txg);
        drop(inner);
        self.write(buf, record, prepared, txg, batch, tally);
    }

    /// Frees the children of a level-1 block that lie in the txg's freed
    /// ranges. Returns the bytes released.
    fn free_child_ptrs(
        &self,
        obj: &Object,
        inner: &BufferInner,
        blkid: u64,
        txg: u64,
        tally: &SyncTally,
    ) -> u64 {
        let frees = obj.free_ranges(txg);
        let Some(data) = inner.data.as_ref().filter(|_| !frees.is_empty()) else {
            return 0;
        };
        let epbs = obj.layout().epbs();
        let first = blkid << epbs;
        let last = first + (1u64 << epbs) - 1;

        let mut bytes = data.write();
        let mut released = 0;
        for (start, end) in frees.intersect(first, last) {
            for child in start..=end {
                let offset = (child - first) as usize * BLKPTR_SIZE;
                let bp = self.shared.store.resolve(&bytes, offset);
                if bp.is_hole() {
                    continue;
                }
                self.shared.store.free(&bp, txg);
                BlockPtr::HOLE.write_at(&mut bytes, offset);
                released += bp.size as u64;
                SyncTally::bump(&tally.freed, 1);
            }
        }
        released
    }

    /// Resolves a block that was past the end of its object when created
    /// to the pointer slot it will be written into.
    fn check_blkptr<'a>(
        &self,
        buf: &'a Arc<Buffer>,
        mut inner: MutexGuard<'a, BufferInner>,
    ) -> MutexGuard<'a, BufferInner> {
        if inner.blkoff != BlockOffset::PastEof {
            return inner;
        }
        let key = buf.key();
        let obj = buf.object();
        let layout = obj.layout();
        if key.is_spill() {
            inner.blkoff = BlockOffset::Spill;
            return inner;
        }
        if key.level + 1 == layout.nlevels {
            inner.blkoff = BlockOffset::Root(key.blkid as usize);
            return inner;
        }

        let epbs = layout.epbs();
        if inner.parent.is_none() {
            drop(inner);
            let parent = self
                .hold_impl(obj, key.level + 1, key.blkid >> epbs, false)
                .unwrap_or_else(|e| panic!("cannot hold parent of {} for sync: {}", key, e));
            inner = buf.lock();
            if inner.parent.is_none() {
                inner.parent = Some(parent);
            } else {
                drop(inner);
                self.release(&parent);
                inner = buf.lock();
            }
        }
        let offset = (key.blkid & ((1u64 << epbs) - 1)) as usize * BLKPTR_SIZE;
        inner.blkoff = BlockOffset::Indirect(offset);
        inner
    }

    fn prepare_write(
        &self,
        buf: &Buffer,
        inner: &BufferInner,
        record: &DirtyRecord,
        txg: u64,
    ) -> PreparedWrite {
        let key = buf.key();
        let obj = buf.object();
        let slot = match inner.blkoff {
            BlockOffset::Root(i) => PtrSlot::Root(i),
            BlockOffset::Spill => PtrSlot::Spill,
            BlockOffset::Indirect(offset) => match &inner.parent {
                Some(parent) => PtrSlot::Parent(parent.clone(), offset),
                None => panic!("{} has no parent to write into", key),
            },
            other => panic!("cannot write {} at {:?}", key, other),
        };
        let old = match &slot {
            PtrSlot::Root(i) => obj.root_ptr(*i),
            PtrSlot::Spill => obj.spill_ptr().unwrap_or(BlockPtr::HOLE),
            PtrSlot::Parent(parent, offset) => self.parent_ptr(parent, *offset),
        };

        let contents = if key.level == 0 {
            record.data()
        } else {
            inner.data.clone()
        };
        let fill = match &contents {
            Some(data) if key.level > 0 => {
                let bytes = data.read();
                (0..bytes.len() / BLKPTR_SIZE)
                    .map(|i| BlockPtr::read_at(&bytes, i * BLKPTR_SIZE))
                    .filter(|bp| !bp.is_hole())
                    .map(|bp| bp.fill)
                    .sum::<u64>()
            }
            Some(data) => match obj.layout().kind.entry_size() {
                Some(entry) => data
                    .read()
                    .chunks(entry)
                    .filter(|e| e.iter().any(|&b| b != 0))
                    .count() as u64,
                None => 1,
            },
            None => 1,
        };
        let size = contents.as_ref().map_or(inner.size, |d| d.len());
        let data = contents.map(|d| Bytes::copy_from_slice(&d.read()));

        let override_ptr = match record.override_state() {
            OverrideState::Overridden(bp) => {
                record.set_override(OverrideState::NotOverridden);
                Some(bp)
            }
            _ => None,
        };

        PreparedWrite {
            slot,
            request: WriteRequest {
                key,
                txg,
                old,
                data,
                size,
                level: key.level,
                priority: IoPriority::AsyncWrite,
                override_ptr,
            },
            fill,
        }
    }

    fn write(
        &self,
        buf: Arc<Buffer>,
        record: Arc<DirtyRecord>,
        prepared: PreparedWrite,
        txg: u64,
        batch: &Arc<IoBatch>,
        tally: &Arc<SyncTally>,
    ) {
        let PreparedWrite {
            slot,
            request,
            fill,
        } = prepared;
        batch.enter();
        CacheCounters::bump(&self.shared.counters.writes);
        trace!(key = %request.key, txg, old = %request.old, fill, "write issued");

        let key = request.key;
        let obj = buf.object().clone();
        let ready = Box::new(move |bp: &mut BlockPtr| {
            if !bp.is_hole() {
                bp.fill = fill;
            }
            if key.level == 0 && !key.is_spill() {
                obj.synced_blkid(key.blkid);
            }
        });

        let cache = self.clone();
        let job = WriteJob {
            buf,
            record,
            slot,
            old: request.old,
            txg,
            batch: batch.clone(),
            tally: tally.clone(),
        };
        let done = Box::new(move |result: Result<WriteOutcome>| cache.write_done(job, result));
        self.shared
            .store
            .write(request, WriteCallbacks { ready, done });
    }

    fn write_done(&self, job: WriteJob, result: Result<WriteOutcome>) {
        let WriteJob {
            buf,
            record,
            slot,
            old,
            txg,
            batch,
            tally,
        } = job;
        let key = buf.key();
        let obj = buf.object();
        let outcome =
            result.unwrap_or_else(|e| panic!("write of {} in txg {} failed: {}", key, txg, e));
        let ptr = outcome.ptr;

        SyncTally::bump(&tally.written, 1);
        if outcome.rewrite {
            SyncTally::bump(&tally.rewrites, 1);
        } else if !old.is_hole() {
            self.shared.store.free(&old, txg);
        }

        match &slot {
            PtrSlot::Root(i) => obj.phys.write().blkptr[*i] = ptr,
            PtrSlot::Spill => obj.phys.write().spill = Some(ptr),
            PtrSlot::Parent(parent, offset) => {
                let parent_inner = parent.lock();
                let data = parent_inner
                    .data
                    .as_ref()
                    .unwrap_or_else(|| panic!("parent of {} lost its data during sync", key));
                ptr.write_at(&mut data.write(), *offset);
            }
        }
        if !outcome.rewrite {
            let mut phys = obj.phys.write();
            let old_size = if old.is_hole() { 0 } else { old.size as u64 };
            phys.used_bytes = (phys.used_bytes + ptr.size as u64).saturating_sub(old_size);
        }

        let mut inner = buf.lock();
        assert!(
            inner
                .data_pending
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, &record)),
            "write of {} completed without being pending",
            key
        );
        assert!(
            inner.dirty.last().is_some_and(|dr| Arc::ptr_eq(dr, &record)),
            "write of {} completed out of txg order",
            key
        );
        inner.dirty.pop();
        inner.dirty_count -= 1;
        inner.data_pending = None;
        inner.birth = ptr.birth;
        buf.notify();
        trace!(key = %key, txg, ptr = %ptr, rewrite = outcome.rewrite, "write done");
        self.rele_and_unlock(&buf, inner);
        batch.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_io_batch_waits_for_every_exit() {
        let batch = IoBatch::new();
        for _ in 0..3 {
            batch.enter();
        }
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let batch = batch.clone();
                thread::spawn(move || batch.exit())
            })
            .collect();
        batch.wait();
        assert_eq!(*batch.pending.lock(), 0);
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_summary_serializes() {
        let summary = SyncSummary {
            txg: 4,
            objects: 1,
            blocks_written: 2,
            ..SyncSummary::default()
        };
        let json = serde_json::to_value(summary).unwrap();
        assert_eq!(json["txg"], 4);
        assert_eq!(json["blocks_written"], 2);
        assert_eq!(json["rewrites"], 0);
    }
}
