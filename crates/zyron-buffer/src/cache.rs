//! Buffer cache: holds, creation and eviction.
//!
//! Lock order, outermost first:
//! - an object's buffer list, then an address index bucket, then a buffer
//! - a child buffer, then its parent buffer
//! - a buffer, then its object's state and physical state
//! - an object's bonus slot, then the bonus buffer
//! - the cache tier lock is taken last and never held across callbacks
//!
//! Store I/O is submitted with no buffer lock held. Tier reclaim only runs
//! where the caller holds no lock at all.

use crate::buffer::{BlockOffset, Buffer, BufferId, BufferInner, BufferUser, DbufState};
use crate::data::BlockRef;
use crate::dirty::DirtyRecord;
use crate::index::{AddressIndex, Insertion};
use crate::object::Object;
use crate::prefetch::{AccessPredictor, SequentialPredictor};
use crate::read::ReadFlags;
use crate::tier::{CacheTier, ClockTier, EvictStatus, Reactivation};
use crate::txg::TxCoordinator;
use parking_lot::MutexGuard;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use zyron_common::{
    BlockPtr, BufferKey, CacheConfig, Result, ZyronError, BLKPTR_SIZE, BONUS_BLKID, BONUS_SIZE,
    MIN_BLOCK_SIZE, SPILL_BLKID,
};
use zyron_storage::BlockStore;

#[derive(Default)]
pub(crate) struct CacheCounters {
    pub(crate) created: AtomicU64,
    pub(crate) create_races: AtomicU64,
    pub(crate) destroyed: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) reads_issued: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) hole_reads: AtomicU64,
    pub(crate) prefetch_issued: AtomicU64,
    pub(crate) prefetch_hits: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) undirtied: AtomicU64,
}

impl CacheCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub created: u64,
    pub create_races: u64,
    pub destroyed: u64,
    pub evictions: u64,
    pub reads_issued: u64,
    pub cache_hits: u64,
    pub hole_reads: u64,
    pub prefetch_issued: u64,
    pub prefetch_hits: u64,
    pub writes: u64,
    pub undirtied: u64,
    /// Buffers in the address index, including ones being torn down.
    pub live_buffers: usize,
    pub tier_resident_bytes: usize,
}

pub(crate) struct CacheShared {
    pub(crate) config: CacheConfig,
    pub(crate) index: AddressIndex,
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) tier: Arc<dyn CacheTier>,
    pub(crate) txg: Arc<dyn TxCoordinator>,
    pub(crate) predictor: Box<dyn AccessPredictor>,
    pub(crate) counters: CacheCounters,
    next_id: AtomicU64,
}

/// Cache of block buffers over a [`BlockStore`].
///
/// Cloning is cheap; clones share one cache.
#[derive(Clone)]
pub struct DbufCache {
    pub(crate) shared: Arc<CacheShared>,
}

impl DbufCache {
    /// Creates a cache with a [`ClockTier`] sized from `config`.
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn BlockStore>,
        txg: Arc<dyn TxCoordinator>,
    ) -> Result<Self> {
        config.validate()?;
        let tier = Arc::new(ClockTier::new(
            config.tier_capacity_bytes,
            config.prefetch_slots,
        ));
        let predictor = Box::new(SequentialPredictor::new(config.prefetch_depth));
        Self::with_components(config, store, txg, tier, predictor)
    }

    /// Creates a cache with caller-supplied tier and access predictor.
    pub fn with_components(
        config: CacheConfig,
        store: Arc<dyn BlockStore>,
        txg: Arc<dyn TxCoordinator>,
        tier: Arc<dyn CacheTier>,
        predictor: Box<dyn AccessPredictor>,
    ) -> Result<Self> {
        config.validate()?;
        let index = if config.hash_buckets == 0 {
            AddressIndex::auto_sized()
        } else {
            AddressIndex::new(config.hash_buckets)
        };
        debug!(
            buckets = index.bucket_count(),
            policy = ?config.cache_policy,
            "buffer cache created"
        );
        Ok(Self {
            shared: Arc::new(CacheShared {
                config,
                index,
                store,
                tier,
                txg,
                predictor,
                counters: CacheCounters::default(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Returns the transaction coordinator the cache reports to.
    pub fn txg(&self) -> &Arc<dyn TxCoordinator> {
        &self.shared.txg
    }

    /// Acquires a hold on block `blkid` at `level` of `obj`, creating the
    /// buffer if needed. Blocks that were never written come back as holes
    /// when read.
    pub fn acquire(&self, obj: &Arc<Object>, level: u8, blkid: u64) -> Result<DbufHandle> {
        let buf = self.hold_impl(obj, level, blkid, false)?;
        Ok(DbufHandle::new(self.clone(), buf))
    }

    /// Like [`acquire`](Self::acquire), but returns
    /// [`ZyronError::BlockNotFound`] for holes, freed blocks and blocks
    /// past the end of the object.
    pub fn acquire_existing(
        &self,
        obj: &Arc<Object>,
        level: u8,
        blkid: u64,
    ) -> Result<DbufHandle> {
        let buf = self.hold_impl(obj, level, blkid, true)?;
        Ok(DbufHandle::new(self.clone(), buf))
    }

    /// Acquires the object's spill block.
    pub fn acquire_spill(&self, obj: &Arc<Object>) -> Result<DbufHandle> {
        self.acquire(obj, 0, SPILL_BLKID)
    }

    /// Acquires the object's bonus buffer.
    pub fn acquire_bonus(&self, obj: &Arc<Object>) -> DbufHandle {
        let mut slot = obj.bonus.lock();
        let buf = match slot.as_ref() {
            Some(buf) => buf.clone(),
            None => {
                let key = BufferKey::new(obj.id(), 0, BONUS_BLKID);
                let buf = Arc::new(Buffer::new(
                    self.next_id(),
                    key,
                    obj.clone(),
                    BONUS_SIZE,
                    BlockOffset::Bonus,
                    0,
                ));
                buf.lock().state = DbufState::Uncached;
                obj.add_hold();
                CacheCounters::bump(&self.shared.counters.created);
                *slot = Some(buf.clone());
                buf
            }
        };
        buf.lock().holds += 1;
        drop(slot);
        DbufHandle::new(self.clone(), buf)
    }

    fn next_id(&self) -> BufferId {
        BufferId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Takes a hold on the buffer for a block, creating it if needed.
    pub(crate) fn hold_impl(
        &self,
        obj: &Arc<Object>,
        level: u8,
        blkid: u64,
        fail_sparse: bool,
    ) -> Result<Arc<Buffer>> {
        let layout = obj.layout();
        let key = BufferKey::new(obj.id(), level, blkid);
        let in_range = if blkid == SPILL_BLKID {
            level == 0
        } else {
            level < layout.nlevels && blkid <= layout.max_blkid(level)
        };
        if !in_range {
            return Err(ZyronError::BlockOutOfRange {
                key,
                max: layout.max_blkid(level),
            });
        }

        loop {
            let (buf, parent) = match self.shared.index.find(&key) {
                Some(buf) => (buf, None),
                None => {
                    let (blkoff, parent) = self.findoff(obj, level, blkid, fail_sparse)?;
                    let buf = self.create(obj, key, blkoff, parent.as_ref());
                    (buf, parent)
                }
            };

            let mut inner = buf.lock();
            if inner.state == DbufState::Evicting {
                drop(inner);
                if let Some(parent) = parent {
                    self.release(&parent);
                }
                continue;
            }
            if inner.holds == 0 {
                if let Some(data) = inner.data.clone() {
                    if self.shared.tier.reactivate(&data) == Reactivation::Gone {
                        trace!(key = %key, "tier reclaiming buffer, retrying hold");
                        self.evict(&buf, inner);
                        if let Some(parent) = parent {
                            self.release(&parent);
                        }
                        continue;
                    }
                }
            }
            inner.holds += 1;
            if self.shared.config.verify {
                inner.verify(&key);
            }
            drop(inner);
            if let Some(parent) = parent {
                self.release(&parent);
            }
            trace!(key = %key, id = %buf.id(), "hold");
            return Ok(buf);
        }
    }

    /// Locates the block pointer slot for a block. Returns the parent
    /// buffer, with a hold the caller must release, when the pointer lives
    /// in an indirect block.
    pub(crate) fn findoff(
        &self,
        obj: &Arc<Object>,
        level: u8,
        blkid: u64,
        fail_sparse: bool,
    ) -> Result<(BlockOffset, Option<Arc<Buffer>>)> {
        let key = BufferKey::new(obj.id(), level, blkid);
        let not_found = || ZyronError::BlockNotFound { key };

        if blkid == SPILL_BLKID {
            return match obj.spill_ptr() {
                Some(_) => Ok((BlockOffset::Spill, None)),
                None if fail_sparse => Err(not_found()),
                None => Ok((BlockOffset::PastEof, None)),
            };
        }

        let layout = obj.layout();
        let epbs = layout.epbs();
        let max = obj
            .synced_max_blkid()
            .checked_shr(level as u32 * epbs)
            .unwrap_or(0);
        if level >= layout.nlevels || blkid > max {
            if fail_sparse {
                return Err(not_found());
            }
            return Ok((BlockOffset::PastEof, None));
        }
        if fail_sparse && level == 0 && obj.block_freed(blkid) {
            return Err(not_found());
        }

        if level + 1 < layout.nlevels {
            let parent = self.hold_impl(obj, level + 1, blkid >> epbs, fail_sparse)?;
            if let Err(e) = self.read_impl(&parent, ReadFlags::default().no_prefetch()) {
                self.release(&parent);
                return Err(e);
            }
            let offset = (blkid & ((1u64 << epbs) - 1)) as usize * BLKPTR_SIZE;
            if fail_sparse && self.parent_ptr(&parent, offset).is_hole() {
                self.release(&parent);
                return Err(not_found());
            }
            Ok((BlockOffset::Indirect(offset), Some(parent)))
        } else {
            if fail_sparse && obj.root_ptr(blkid as usize).is_hole() {
                return Err(not_found());
            }
            Ok((BlockOffset::Root(blkid as usize), None))
        }
    }

    /// Reads the block pointer at `offset` of a parent indirect block.
    pub(crate) fn parent_ptr(&self, parent: &Buffer, offset: usize) -> BlockPtr {
        let inner = parent.lock();
        match inner.data.as_ref() {
            Some(data) => self.shared.store.resolve(&data.read(), offset),
            None => BlockPtr::HOLE,
        }
    }

    /// Builds a buffer and publishes it, unless another thread published
    /// one for the same key first.
    fn create(
        &self,
        obj: &Arc<Object>,
        key: BufferKey,
        blkoff: BlockOffset,
        parent: Option<&Arc<Buffer>>,
    ) -> Arc<Buffer> {
        let layout = obj.layout();
        let sized = |bp: BlockPtr| {
            let size = if key.level == 0 && !bp.is_hole() {
                bp.size as usize
            } else {
                layout.block_size(key.level)
            };
            (size, bp.birth)
        };
        let (size, birth) = match blkoff {
            BlockOffset::Spill => {
                let bp = obj.spill_ptr().unwrap_or(BlockPtr::HOLE);
                if bp.is_hole() {
                    (MIN_BLOCK_SIZE, 0)
                } else {
                    (bp.size as usize, bp.birth)
                }
            }
            BlockOffset::Root(i) => sized(obj.root_ptr(i)),
            BlockOffset::Indirect(offset) => sized(
                parent.map_or(BlockPtr::HOLE, |p| self.parent_ptr(p, offset)),
            ),
            BlockOffset::PastEof if key.is_spill() => (MIN_BLOCK_SIZE, 0),
            BlockOffset::PastEof => (layout.block_size(key.level), 0),
            BlockOffset::Bonus => unreachable!("bonus buffers are created by acquire_bonus"),
        };

        let buf = Arc::new(Buffer::new(
            self.next_id(),
            key,
            obj.clone(),
            size,
            blkoff,
            birth,
        ));

        let mut list = obj.dbufs.lock();
        if let Insertion::Existing(existing) = self.shared.index.insert_or_get(buf.clone()) {
            drop(list);
            CacheCounters::bump(&self.shared.counters.create_races);
            debug!(key = %key, winner = %existing.id(), "lost buffer creation race");
            return existing;
        }
        if let Some(parent) = parent {
            self.add_ref(parent);
        }
        {
            let mut inner = buf.lock();
            inner.parent = parent.cloned();
            inner.state = DbufState::Uncached;
            inner.on_object_list = true;
        }
        Object::register_buffer(&mut list, &buf);
        drop(list);

        obj.add_hold();
        CacheCounters::bump(&self.shared.counters.created);
        trace!(key = %key, id = %buf.id(), size, "buffer created");
        buf
    }

    /// Adds a hold to a buffer that is already held.
    pub(crate) fn add_ref(&self, buf: &Buffer) {
        let mut inner = buf.lock();
        assert!(inner.holds > 0, "add_ref on unheld buffer {}", buf.key());
        inner.holds += 1;
    }

    /// Drops one hold.
    pub(crate) fn release(&self, buf: &Arc<Buffer>) {
        let inner = buf.lock();
        self.rele_and_unlock(buf, inner);
    }

    /// Drops one hold and unlocks the buffer. The last hold hands the
    /// contents to the cache tier, or evicts the buffer outright.
    pub(crate) fn rele_and_unlock(&self, buf: &Arc<Buffer>, mut inner: MutexGuard<'_, BufferInner>) {
        let key = buf.key();
        assert!(inner.holds > 0, "release of unheld buffer {}", key);
        inner.holds -= 1;
        trace!(key = %key, holds = inner.holds, "release");

        let dirty_holds = inner.dirty_count as u64;
        let floor = if key.level == 0 { dirty_holds } else { 0 };
        if inner.holds == floor {
            if let Some(data) = &inner.data {
                data.freeze();
            }
        }
        if inner.immediate_evict && key.level == 0 && inner.holds == dirty_holds {
            Self::evict_user(key, &mut inner);
        }
        if self.shared.config.verify {
            inner.verify(&key);
        }

        if inner.holds > 0 {
            if inner.writers_waiting > 0 {
                buf.notify();
            }
            return;
        }
        if key.is_bonus() {
            drop(inner);
            self.evict_bonus(buf);
            return;
        }
        match inner.data.clone() {
            Some(data) if self.is_cacheable(buf) => {
                let shared = Arc::downgrade(&self.shared);
                let target = buf.clone();
                self.shared.tier.inactivate(
                    &data,
                    Box::new(move || {
                        if let Some(shared) = shared.upgrade() {
                            DbufCache { shared }.do_evict(&target);
                        }
                    }),
                );
            }
            _ => self.evict(buf, inner),
        }
    }

    pub(crate) fn is_cacheable(&self, buf: &Buffer) -> bool {
        self.shared.config.cache_policy.allows(buf.is_metadata())
    }

    /// Tears down an unheld buffer. Finishes the job unless the tier is
    /// concurrently reclaiming its contents, in which case the tier's
    /// callback does.
    pub(crate) fn evict(&self, buf: &Arc<Buffer>, mut inner: MutexGuard<'_, BufferInner>) {
        assert_eq!(inner.holds, 0, "evicting held buffer {}", buf.key());
        assert!(
            inner.data_pending.is_none(),
            "evicting {} with a write in flight",
            buf.key()
        );
        Self::evict_user(buf.key(), &mut inner);
        let parent = inner.parent.take();
        let data = inner.data.take();
        inner.state = DbufState::Evicting;
        buf.notify();
        CacheCounters::bump(&self.shared.counters.evictions);

        let status = match &data {
            Some(data) => self.shared.tier.evict_ref(data),
            None => EvictStatus::Released,
        };
        drop(inner);
        if let Some(parent) = parent {
            self.release(&parent);
        }
        if status == EvictStatus::Released {
            self.destroy(buf);
        }
    }

    /// Eviction callback run by the cache tier.
    fn do_evict(&self, buf: &Arc<Buffer>) {
        let mut inner = buf.lock();
        assert_eq!(inner.holds, 0, "tier reclaimed held buffer {}", buf.key());
        Self::evict_user(buf.key(), &mut inner);
        inner.data = None;
        if inner.state == DbufState::Evicting {
            drop(inner);
            self.destroy(buf);
            return;
        }
        let parent = inner.parent.take();
        inner.state = DbufState::Evicting;
        buf.notify();
        CacheCounters::bump(&self.shared.counters.evictions);
        drop(inner);
        if let Some(parent) = parent {
            self.release(&parent);
        }
        self.destroy(buf);
    }

    fn destroy(&self, buf: &Arc<Buffer>) {
        let key = buf.key();
        {
            let mut inner = buf.lock();
            assert_eq!(inner.state, DbufState::Evicting, "destroying live {}", key);
            assert_eq!(inner.holds, 0, "destroying held {}", key);
            assert!(inner.data.is_none(), "destroying {} with data", key);
            assert!(inner.dirty.is_empty(), "destroying dirty {}", key);
            assert!(inner.parent.is_none(), "destroying {} with parent", key);
            inner.on_object_list = false;
        }
        let obj = buf.object();
        if !key.is_bonus() {
            self.shared.index.remove(buf);
            obj.dbufs.lock().remove(&buf.id());
        }
        obj.release_hold();
        CacheCounters::bump(&self.shared.counters.destroyed);
        debug!(key = %key, id = %buf.id(), "buffer destroyed");
    }

    fn evict_bonus(&self, buf: &Arc<Buffer>) {
        let obj = buf.object().clone();
        let mut slot = obj.bonus.lock();
        let inner = buf.lock();
        if inner.holds > 0 || inner.state == DbufState::Evicting {
            return;
        }
        if slot.as_ref().is_some_and(|b| Arc::ptr_eq(b, buf)) {
            *slot = None;
        }
        drop(slot);
        self.evict(buf, inner);
    }

    /// Notifies and detaches the user of a level-0 buffer.
    pub(crate) fn evict_user(key: BufferKey, inner: &mut BufferInner) {
        if key.level != 0 {
            return;
        }
        if let Some(user) = inner.user.take() {
            let data = inner.data.as_ref().map(BlockRef::read);
            user.on_evict(key, data.as_deref().map(Vec::as_slice));
        }
    }

    /// Evicts every unheld buffer of `obj`, children before parents.
    /// Returns the number evicted.
    pub fn evict_object(&self, obj: &Arc<Object>) -> usize {
        let mut bufs = obj.buffers_where(|_| true);
        bufs.sort_by_key(|b| b.level());
        let mut evicted = 0;
        for buf in bufs {
            let inner = buf.lock();
            if inner.holds == 0 && inner.state != DbufState::Evicting {
                self.evict(&buf, inner);
                evicted += 1;
            }
        }
        debug!(object = %obj.id(), evicted, "object evicted");
        evicted
    }

    /// Evicts everything the tier keeps. Returns the number of buffers
    /// reclaimed.
    pub fn purge_tier(&self) -> usize {
        self.shared.tier.purge()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.shared.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CacheStats {
            created: load(&c.created),
            create_races: load(&c.create_races),
            destroyed: load(&c.destroyed),
            evictions: load(&c.evictions),
            reads_issued: load(&c.reads_issued),
            cache_hits: load(&c.cache_hits),
            hole_reads: load(&c.hole_reads),
            prefetch_issued: load(&c.prefetch_issued),
            prefetch_hits: load(&c.prefetch_hits),
            writes: load(&c.writes),
            undirtied: load(&c.undirtied),
            live_buffers: self.shared.index.len(),
            tier_resident_bytes: self.shared.tier.resident_bytes(),
        }
    }

    /// Current block pointer of a buffer.
    pub(crate) fn block_ptr(&self, buf: &Buffer, inner: &BufferInner) -> BlockPtr {
        let obj = buf.object();
        match inner.blkoff {
            BlockOffset::Root(i) => obj.root_ptr(i),
            BlockOffset::Spill => obj.spill_ptr().unwrap_or(BlockPtr::HOLE),
            BlockOffset::Indirect(offset) => match &inner.parent {
                Some(parent) => self.parent_ptr(parent, offset),
                None => BlockPtr::HOLE,
            },
            BlockOffset::Bonus | BlockOffset::PastEof => BlockPtr::HOLE,
        }
    }

    /// Attaches `user` unless one is already attached. Returns the user
    /// already attached, if any.
    pub fn set_user(
        &self,
        handle: &DbufHandle,
        user: Arc<dyn BufferUser>,
    ) -> Option<Arc<dyn BufferUser>> {
        self.update_user(handle, None, Some(user))
    }

    /// Like [`set_user`](Self::set_user), and the user is detached as soon
    /// as the last non-dirty hold goes away.
    pub fn set_user_immediate_evict(
        &self,
        handle: &DbufHandle,
        user: Arc<dyn BufferUser>,
    ) -> Option<Arc<dyn BufferUser>> {
        let prev = self.update_user(handle, None, Some(user));
        if prev.is_none() {
            handle.buf.lock().immediate_evict = true;
        }
        prev
    }

    /// Replaces the attached user with `new` if the attached user is `old`.
    /// Returns the user attached before the call.
    pub fn update_user(
        &self,
        handle: &DbufHandle,
        old: Option<&Arc<dyn BufferUser>>,
        new: Option<Arc<dyn BufferUser>>,
    ) -> Option<Arc<dyn BufferUser>> {
        let buf = &handle.buf;
        assert_eq!(buf.level(), 0, "user attached to indirect {}", buf.key());
        let mut inner = buf.lock();
        assert!(inner.holds > 0, "user update on unheld {}", buf.key());
        let current = inner.user.clone();
        let matches = match (&current, old) {
            (None, None) => true,
            (Some(cur), Some(old)) => {
                Arc::as_ptr(cur) as *const () == Arc::as_ptr(old) as *const ()
            }
            _ => false,
        };
        if matches {
            if new.is_none() {
                inner.immediate_evict = false;
            }
            inner.user = new;
        }
        current
    }

    pub fn get_user(&self, handle: &DbufHandle) -> Option<Arc<dyn BufferUser>> {
        handle.buf.lock().user.clone()
    }
}

/// A hold on a buffer. Dropping the handle releases the hold.
pub struct DbufHandle {
    cache: DbufCache,
    buf: Arc<Buffer>,
}

impl DbufHandle {
    fn new(cache: DbufCache, buf: Arc<Buffer>) -> Self {
        Self { cache, buf }
    }

    #[inline]
    pub(crate) fn buffer(&self) -> &Arc<Buffer> {
        &self.buf
    }

    #[inline]
    pub fn key(&self) -> BufferKey {
        self.buf.key()
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.buf.id()
    }

    pub fn object(&self) -> &Arc<Object> {
        self.buf.object()
    }

    /// Current block size.
    pub fn size(&self) -> usize {
        self.buf.lock().size
    }

    pub fn state(&self) -> DbufState {
        self.buf.state()
    }

    pub fn hold_count(&self) -> u64 {
        self.buf.hold_count()
    }

    pub fn dirty_count(&self) -> u32 {
        self.buf.dirty_count()
    }

    /// Birth txg of the block the contents came from.
    pub fn birth(&self) -> u64 {
        self.buf.lock().birth
    }

    pub fn is_dirty(&self) -> bool {
        self.buf.lock().dirty_count > 0
    }

    /// The buffer's dirty record for `txg`.
    pub fn dirty_record(&self, txg: u64) -> Option<Arc<DirtyRecord>> {
        self.buf.lock().record_for(txg).cloned()
    }

    /// Shares the current contents. Holding on to the returned reference
    /// makes the next dirtying copy the block.
    pub fn data_ref(&self) -> Option<BlockRef> {
        self.buf.lock().data.clone()
    }

    /// Copies the current contents out.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.buf
            .lock()
            .data
            .as_ref()
            .map(BlockRef::to_vec)
            .ok_or(ZyronError::NoData { key: self.key() })
    }

    /// Writes `bytes` at `offset`.
    ///
    /// The block must be dirty in the open txg, or being filled.
    ///
    /// # Panics
    ///
    /// Panics if the contents are frozen.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let inner = self.buf.lock();
        let data = inner
            .data
            .as_ref()
            .ok_or(ZyronError::NoData { key: self.key() })?;
        if offset.checked_add(bytes.len()).map_or(true, |end| end > inner.size) {
            return Err(ZyronError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: inner.size,
            });
        }
        data.write()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Returns true if both handles hold the same buffer instance.
    pub fn same_buffer(&self, other: &DbufHandle) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    /// Releases the hold.
    pub fn release(self) {}
}

impl Clone for DbufHandle {
    fn clone(&self) -> Self {
        self.cache.add_ref(&self.buf);
        Self {
            cache: self.cache.clone(),
            buf: self.buf.clone(),
        }
    }
}

impl Drop for DbufHandle {
    fn drop(&mut self) {
        self.cache.release(&self.buf);
        self.cache.shared.tier.reclaim();
    }
}

impl std::fmt::Debug for DbufHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbufHandle")
            .field("buffer", &self.buf)
            .finish()
    }
}
