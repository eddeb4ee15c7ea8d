//! Dirty records and the dirtying protocol.
//!
//! A buffer carries one dirty record per transaction group it has pending
//! changes in, newest first. The newest record and the buffer may share
//! one [`BlockRef`]; once a newer txg dirties the buffer the contents are
//! copied so the older txg keeps an untouched snapshot.
//!
//! Dirtying a block also dirties its ancestors in the same txg. Each child
//! record is linked under its parent's record so sync can write children
//! before the indirect block that points at them.

use crate::buffer::{Buffer, BufferInner, DbufState};
use crate::cache::{DbufCache, DbufHandle};
use crate::data::BlockRef;
use crate::read::ReadFlags;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use tracing::trace;
use zyron_common::{BlockPtr, BufferKey, Result, ZyronError};

/// Whether a record's block location was decided outside the sync path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideState {
    /// Sync chooses the location.
    NotOverridden,
    /// An out-of-band write of the record's contents is in flight.
    PendingExternalWrite,
    /// The contents already live at this pointer; sync installs it as is.
    Overridden(BlockPtr),
}

struct RecordInner {
    data: Option<BlockRef>,
    override_state: OverrideState,
    children: Vec<DirtyLink>,
    parent: Option<Weak<DirtyRecord>>,
}

/// One pending change of a buffer in one transaction group.
pub struct DirtyRecord {
    txg: u64,
    key: BufferKey,
    inner: Mutex<RecordInner>,
}

/// A dirty record together with the buffer it belongs to.
#[derive(Clone)]
pub(crate) struct DirtyLink {
    pub(crate) buf: Arc<Buffer>,
    pub(crate) record: Arc<DirtyRecord>,
}

impl DirtyRecord {
    pub(crate) fn new(key: BufferKey, txg: u64) -> Arc<Self> {
        Arc::new(Self {
            txg,
            key,
            inner: Mutex::new(RecordInner {
                data: None,
                override_state: OverrideState::NotOverridden,
                children: Vec::new(),
                parent: None,
            }),
        })
    }

    #[inline]
    pub fn txg(&self) -> u64 {
        self.txg
    }

    #[inline]
    pub fn key(&self) -> BufferKey {
        self.key
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.key.level
    }

    /// Contents as of this txg. Indirect records and placeholder blocks
    /// carry none.
    pub fn data(&self) -> Option<BlockRef> {
        self.inner.lock().data.clone()
    }

    /// Copies the record's contents out.
    pub fn read_data(&self) -> Option<Vec<u8>> {
        self.inner.lock().data.as_ref().map(BlockRef::to_vec)
    }

    pub fn override_state(&self) -> OverrideState {
        self.inner.lock().override_state
    }

    /// Number of child records linked under this record.
    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Returns true if `child` is linked under this record.
    pub fn has_child(&self, child: &Arc<DirtyRecord>) -> bool {
        self.inner
            .lock()
            .children
            .iter()
            .any(|link| Arc::ptr_eq(&link.record, child))
    }

    /// The parent buffer's record for the same txg.
    pub fn parent(&self) -> Option<Arc<DirtyRecord>> {
        self.inner.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_data(&self, data: Option<BlockRef>) {
        self.inner.lock().data = data;
    }

    /// Returns true if the record holds exactly these contents.
    #[cfg(test)]
    pub(crate) fn shares_data(&self, data: &BlockRef) -> bool {
        self.inner
            .lock()
            .data
            .as_ref()
            .is_some_and(|own| BlockRef::ptr_eq(own, data))
    }

    pub(crate) fn set_override(&self, state: OverrideState) {
        self.inner.lock().override_state = state;
    }

    pub(crate) fn add_child(&self, link: DirtyLink) {
        self.inner.lock().children.push(link);
    }

    pub(crate) fn remove_child(&self, child: &Arc<DirtyRecord>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.children.len();
        inner
            .children
            .retain(|link| !Arc::ptr_eq(&link.record, child));
        inner.children.len() != before
    }

    pub(crate) fn take_children(&self) -> Vec<DirtyLink> {
        std::mem::take(&mut self.inner.lock().children)
    }

    pub(crate) fn set_parent(&self, parent: &Arc<DirtyRecord>) {
        self.inner.lock().parent = Some(Arc::downgrade(parent));
    }
}

impl std::fmt::Debug for DirtyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DirtyRecord")
            .field("key", &self.key)
            .field("txg", &self.txg)
            .field("data", &inner.data)
            .field("override", &inner.override_state)
            .field("children", &inner.children.len())
            .finish()
    }
}

/// Gives the record of the open txg private, writable contents.
///
/// The buffer's contents are shared with `record` afterwards. If an older
/// record still shares them, the buffer and `record` move to a copy.
fn own_data(inner: &mut BufferInner, record: &DirtyRecord) {
    let Some(mut data) = inner.data.take() else {
        return;
    };
    record.set_data(None);
    data.make_writable(1);
    record.set_data(Some(data.clone()));
    inner.data = Some(data);
}

impl DbufCache {
    /// Marks the buffer dirty in `txg`, returning its record for that txg.
    ///
    /// With `assigned`, the caller's contents replace the buffer's for
    /// this txg instead of being copied from the current contents.
    pub(crate) fn dirty_impl(
        &self,
        buf: &Arc<Buffer>,
        assigned: Option<BlockRef>,
        txg: u64,
    ) -> Arc<DirtyRecord> {
        let key = buf.key();
        let obj = buf.object().clone();
        let mut assigned = assigned;
        let mut inner = buf.lock();
        assert!(inner.holds > 0, "dirtying unheld buffer {}", key);
        assert!(txg > 0, "dirtying {} in txg 0", key);

        if assigned.is_some() {
            while matches!(inner.state, DbufState::Reading | DbufState::Filling) {
                buf.wait(&mut inner);
            }
            if inner.state == DbufState::Uncached {
                inner.state = DbufState::Filling;
            }
        } else {
            while inner.state == DbufState::Reading {
                buf.wait(&mut inner);
            }
        }
        if key.level == 0 {
            assert!(
                matches!(
                    inner.state,
                    DbufState::Cached | DbufState::Filling | DbufState::NoFill
                ),
                "dirtying {} in state {:?}",
                key,
                inner.state
            );
        }
        if key.is_spill() {
            obj.mark_spill();
        }

        // Already dirty in this txg.
        if let Some(dr) = inner.head().filter(|dr| dr.txg() == txg).cloned() {
            if key.level == 0 && inner.state != DbufState::NoFill {
                self.unoverride(buf, &mut inner, &dr);
                own_data(&mut inner, &dr);
                if let (Some(src), Some(dst)) = (assigned.take(), inner.data.as_ref()) {
                    dst.write().copy_from_slice(&src.read());
                }
            }
            trace!(key = %key, txg, "already dirty");
            return dr;
        }

        if let Some(head) = inner.head() {
            assert!(
                head.txg() < txg,
                "dirtying {} in txg {} behind txg {}",
                key,
                txg,
                head.txg()
            );
        }

        let dr = DirtyRecord::new(key, txg);
        if key.level == 0 && inner.state != DbufState::NoFill {
            if let Some(data) = assigned.take() {
                assert_eq!(data.len(), inner.size, "assigned block size mismatch");
                inner.data = Some(data);
                inner.state = DbufState::Cached;
                buf.notify();
            }
            own_data(&mut inner, &dr);
        }
        if !key.is_bonus() && inner.dirty.is_empty() && inner.birth == 0 {
            obj.willuse_space(inner.size as i64);
        }
        if key.level == 0 && !key.is_bonus() && !key.is_spill() {
            obj.clear_free_range(key.blkid, txg);
        }

        inner.dirty.insert(0, dr.clone());
        inner.holds += 1;
        inner.dirty_count += 1;
        if inner.writers_waiting > 0 {
            buf.notify();
        }
        let parent = inner.parent.clone();
        drop(inner);
        trace!(key = %key, txg, "dirtied");

        let link = DirtyLink {
            buf: buf.clone(),
            record: dr.clone(),
        };

        if key.is_bonus() || key.is_spill() {
            obj.add_dirty_record(txg, link);
            self.shared.txg.register_dirty(obj.id(), txg);
            self.shared.txg.mark_object_dirty(&obj, txg);
            return dr;
        }

        if key.level == 0 {
            obj.new_blkid(key.blkid);
        }

        let layout = *obj.layout();
        if key.level + 1 < layout.nlevels {
            let (parent, temp_hold) = match parent {
                Some(parent) => (parent, false),
                None => {
                    let parent = self
                        .hold_impl(&obj, key.level + 1, key.blkid >> layout.epbs(), false)
                        .unwrap_or_else(|e| panic!("cannot hold parent of {}: {}", key, e));
                    (parent, true)
                }
            };
            let parent_dr = self.dirty_impl(&parent, None, txg);

            let inner = buf.lock();
            // A concurrent free may have undirtied the record already.
            if inner.dirty.iter().any(|d| Arc::ptr_eq(d, &dr)) {
                dr.set_parent(&parent_dr);
                parent_dr.add_child(link);
            }
            drop(inner);
            if temp_hold {
                self.release(&parent);
            }
        } else {
            obj.add_dirty_record(txg, link);
            self.shared.txg.register_dirty(obj.id(), txg);
        }

        self.shared.txg.mark_object_dirty(&obj, txg);
        dr
    }

    /// Frees an out-of-band write of `dr` so the block is written by sync
    /// again. Waits for an external write still in flight.
    pub(crate) fn unoverride(
        &self,
        buf: &Buffer,
        inner: &mut MutexGuard<'_, BufferInner>,
        dr: &DirtyRecord,
    ) {
        if buf.key().is_bonus() {
            return;
        }
        loop {
            match dr.override_state() {
                OverrideState::NotOverridden => return,
                OverrideState::PendingExternalWrite => buf.wait(inner),
                OverrideState::Overridden(bp) => {
                    assert!(
                        !inner
                            .data_pending
                            .as_ref()
                            .is_some_and(|p| std::ptr::eq(p.as_ref(), dr)),
                        "unoverride of {} while its write is in flight",
                        buf.key()
                    );
                    if !bp.is_hole() {
                        self.shared.store.free(&bp, dr.txg());
                    }
                    dr.set_override(OverrideState::NotOverridden);
                    return;
                }
            }
        }
    }

    /// Reads the block, then dirties it in `txg`.
    pub fn dirty(&self, handle: &DbufHandle, txg: u64) -> Arc<DirtyRecord> {
        match self.read_impl(
            handle.buffer(),
            ReadFlags::default().must_succeed().no_prefetch(),
        ) {
            // Placeholder blocks have nothing to read.
            Ok(()) | Err(ZyronError::NoData { .. }) => {}
            Err(e) => panic!("cannot read {} before dirtying: {}", handle.key(), e),
        }
        self.dirty_impl(handle.buffer(), None, txg)
    }

    /// Prepares a level-0 block to be overwritten in full without reading
    /// its old contents, and dirties it in `txg`.
    ///
    /// The caller fills the block through [`DbufHandle::write`] and then
    /// calls [`fill_done`](Self::fill_done).
    pub fn will_fill(&self, handle: &DbufHandle, txg: u64) -> Arc<DirtyRecord> {
        let buf = handle.buffer();
        assert!(
            buf.level() == 0 && !buf.key().is_bonus(),
            "will_fill on {}",
            buf.key()
        );
        self.noread(buf);
        self.dirty_impl(buf, None, txg)
    }

    /// Dirties a level-0 block whose contents are never read or written.
    ///
    /// Sync allocates space for the block without writing data.
    pub fn will_not_fill(&self, handle: &DbufHandle, txg: u64) -> Arc<DirtyRecord> {
        let buf = handle.buffer();
        assert!(
            buf.level() == 0 && !buf.key().is_bonus(),
            "will_not_fill on {}",
            buf.key()
        );
        {
            let mut inner = buf.lock();
            while matches!(inner.state, DbufState::Reading | DbufState::Filling) {
                buf.wait(&mut inner);
            }
            inner.state = DbufState::NoFill;
        }
        self.noread(buf);
        self.dirty_impl(buf, None, txg)
    }

    /// Sets the buffer up for a write without reading it.
    pub(crate) fn noread(&self, buf: &Buffer) {
        let mut inner = buf.lock();
        assert!(inner.holds > 0, "noread on unheld buffer {}", buf.key());
        while matches!(inner.state, DbufState::Reading | DbufState::Filling) {
            buf.wait(&mut inner);
        }
        match inner.state {
            DbufState::Uncached => {
                inner.data = Some(BlockRef::alloc(inner.size, buf.is_metadata()));
                inner.read_error = None;
                inner.state = DbufState::Filling;
            }
            DbufState::NoFill => inner.data = None,
            DbufState::Cached => {}
            state => panic!("noread of {} in state {:?}", buf.key(), state),
        }
    }

    /// Ends a fill started by [`will_fill`](Self::will_fill).
    ///
    /// A placeholder block becomes a cached hole.
    pub fn fill_done(&self, handle: &DbufHandle) {
        let buf = handle.buffer();
        let mut inner = buf.lock();
        match inner.state {
            DbufState::Filling => {
                if inner.freed_in_flight {
                    inner.freed_in_flight = false;
                    if let Some(data) = &inner.data {
                        data.write().fill(0);
                    }
                }
                inner.state = DbufState::Cached;
            }
            DbufState::NoFill => {
                inner.data = Some(BlockRef::hole(inner.size, buf.is_metadata()));
                inner.state = DbufState::Cached;
            }
            _ => {}
        }
        buf.notify();
        let waiters = std::mem::take(&mut inner.read_waiters);
        drop(inner);
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    /// Hands caller-built contents to a level-0 block as its data in `txg`.
    ///
    /// If the block is already dirty in `txg` the contents are copied in.
    /// Frozen contents are thawed, and contents the caller still shares are
    /// copied, before the buffer writes to them.
    pub fn assign(&self, handle: &DbufHandle, data: BlockRef, txg: u64) -> Arc<DirtyRecord> {
        let buf = handle.buffer();
        assert!(
            buf.level() == 0 && !buf.key().is_bonus(),
            "assign to {}",
            buf.key()
        );
        let dr = self.dirty_impl(buf, Some(data), txg);
        self.fill_done(handle);
        dr
    }

    /// Starts an out-of-band write of the block's contents in `txg`.
    ///
    /// The caller writes [`DirtyRecord::read_data`] somewhere and reports
    /// the result with [`complete_external_write`](Self::complete_external_write).
    /// Sync waits for the report.
    pub fn begin_external_write(&self, handle: &DbufHandle, txg: u64) -> Result<Arc<DirtyRecord>> {
        let buf = handle.buffer();
        let inner = buf.lock();
        let dr = inner
            .record_for(txg)
            .cloned()
            .ok_or(ZyronError::NotDirty { key: buf.key(), txg })?;
        assert!(
            buf.level() == 0 && inner.state != DbufState::NoFill,
            "external write of {}",
            buf.key()
        );
        assert!(
            inner
                .data_pending
                .as_ref()
                .map_or(true, |p| !Arc::ptr_eq(p, &dr)),
            "external write of {} while it syncs",
            buf.key()
        );
        match dr.override_state() {
            OverrideState::NotOverridden => dr.set_override(OverrideState::PendingExternalWrite),
            OverrideState::PendingExternalWrite => {
                panic!("external write of {} already in flight", buf.key())
            }
            OverrideState::Overridden(_) => {}
        }
        Ok(dr)
    }

    /// Records the outcome of an out-of-band write. `None` means it failed
    /// and sync writes the block itself.
    pub fn complete_external_write(
        &self,
        handle: &DbufHandle,
        record: &Arc<DirtyRecord>,
        ptr: Option<BlockPtr>,
    ) {
        let buf = handle.buffer();
        let _inner = buf.lock();
        assert_eq!(
            record.override_state(),
            OverrideState::PendingExternalWrite,
            "no external write pending on {}",
            buf.key()
        );
        record.set_override(match ptr {
            Some(bp) => OverrideState::Overridden(bp),
            None => OverrideState::NotOverridden,
        });
        buf.notify();
    }
}
