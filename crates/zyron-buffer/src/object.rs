//! Objects: the owners of block trees.
//!
//! An object carries the root block pointers of its tree, the bookkeeping
//! that ties dirty buffers to transaction groups, and the list of buffers
//! currently caching its blocks.

use crate::buffer::{Buffer, BufferId};
use crate::dirty::{DirtyLink, DirtyRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use zyron_common::{
    BlockPtr, ObjectId, ObjectKind, Result, ZyronError, BLKPTR_SHIFT, BONUS_SIZE, MAX_BLOCK_SIZE,
    MIN_BLOCK_SHIFT, MIN_BLOCK_SIZE, SPILL_BLKID,
};

/// Deepest supported block tree.
pub const MAX_LEVELS: u8 = 8;

/// Maximum number of root block pointers.
pub const MAX_ROOT_PTRS: usize = 32;

/// Shape of an object's block tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    pub kind: ObjectKind,
    /// Size of level-0 blocks.
    pub data_block_size: usize,
    /// log2 of the indirect block size.
    pub indirect_block_shift: u32,
    /// Number of levels, including level 0.
    pub nlevels: u8,
    /// Number of root block pointers.
    pub nblkptr: usize,
}

impl ObjectLayout {
    /// Creates and validates a layout.
    pub fn new(
        kind: ObjectKind,
        data_block_size: usize,
        indirect_block_shift: u32,
        nlevels: u8,
        nblkptr: usize,
    ) -> Result<Self> {
        let layout = Self {
            kind,
            data_block_size,
            indirect_block_shift,
            nlevels,
            nblkptr,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Checks that the layout is one the cache can address.
    pub fn validate(&self) -> Result<()> {
        if self.data_block_size < MIN_BLOCK_SIZE
            || self.data_block_size > MAX_BLOCK_SIZE
            || self.data_block_size % MIN_BLOCK_SIZE != 0
        {
            return Err(ZyronError::InvalidBlockSize {
                size: self.data_block_size,
            });
        }
        let max_shift = MAX_BLOCK_SIZE.trailing_zeros();
        if self.indirect_block_shift < MIN_BLOCK_SHIFT || self.indirect_block_shift > max_shift {
            return Err(ZyronError::InvalidLayout(format!(
                "indirect block shift {} outside {}..={}",
                self.indirect_block_shift, MIN_BLOCK_SHIFT, max_shift
            )));
        }
        if self.nlevels == 0 || self.nlevels > MAX_LEVELS {
            return Err(ZyronError::InvalidParameter {
                name: "nlevels".to_string(),
                value: self.nlevels.to_string(),
            });
        }
        if self.nblkptr == 0 || self.nblkptr > MAX_ROOT_PTRS {
            return Err(ZyronError::InvalidParameter {
                name: "nblkptr".to_string(),
                value: self.nblkptr.to_string(),
            });
        }
        Ok(())
    }

    /// log2 of the number of block pointers per indirect block.
    #[inline]
    pub fn epbs(&self) -> u32 {
        self.indirect_block_shift - BLKPTR_SHIFT
    }

    #[inline]
    pub fn indirect_block_size(&self) -> usize {
        1 << self.indirect_block_shift
    }

    /// Size of blocks at `level`.
    #[inline]
    pub fn block_size(&self, level: u8) -> usize {
        if level == 0 {
            self.data_block_size
        } else {
            self.indirect_block_size()
        }
    }

    /// Highest addressable block id at `level`.
    pub fn max_blkid(&self, level: u8) -> u64 {
        if level >= self.nlevels {
            return 0;
        }
        let shift = self.epbs() * (self.nlevels - 1 - level) as u32;
        if shift >= 58 {
            return SPILL_BLKID - 1;
        }
        ((self.nblkptr as u64) << shift) - 1
    }
}

/// Persistent state of an object, updated as transaction groups sync.
#[derive(Debug, Clone)]
pub struct ObjectPhys {
    /// Root block pointers.
    pub blkptr: Vec<BlockPtr>,
    /// Spill block pointer, once a spill block exists.
    pub spill: Option<BlockPtr>,
    /// Highest level-0 block id written.
    pub max_blkid: u64,
    /// Bonus area contents.
    pub bonus: Vec<u8>,
    /// Bytes of allocated blocks referenced by the tree.
    pub used_bytes: u64,
}

/// Ordered set of disjoint inclusive block ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `[start, end]`, merging with overlapping or adjacent ranges.
    pub fn add(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        let mut start = start;
        let mut end = end;
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end.saturating_add(1))
            .rev()
            .take_while(|(_, &e)| e.saturating_add(1) >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    /// Removes a single block, splitting its range if needed.
    pub fn remove(&mut self, blkid: u64) -> bool {
        let found = self
            .ranges
            .range(..=blkid)
            .next_back()
            .map(|(&s, &e)| (s, e))
            .filter(|&(_, e)| e >= blkid);
        let Some((s, e)) = found else {
            return false;
        };
        self.ranges.remove(&s);
        if s < blkid {
            self.ranges.insert(s, blkid - 1);
        }
        if blkid < e {
            self.ranges.insert(blkid + 1, e);
        }
        true
    }

    pub fn contains(&self, blkid: u64) -> bool {
        self.ranges
            .range(..=blkid)
            .next_back()
            .is_some_and(|(_, &e)| e >= blkid)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    /// Returns the parts of the set inside `[lo, hi]`.
    pub fn intersect(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        self.iter()
            .filter(|&(s, e)| s <= hi && e >= lo)
            .map(|(s, e)| (s.max(lo), e.min(hi)))
            .collect()
    }
}

pub(crate) struct ObjectState {
    /// Top-level, bonus and spill dirty records by txg.
    dirty: BTreeMap<u64, Vec<DirtyLink>>,
    /// Pending frees by txg.
    frees: BTreeMap<u64, RangeSet>,
    /// In-core highest level-0 block id, including unsynced growth.
    max_blkid: u64,
    have_spill: bool,
    /// Space estimate for unsynced size changes.
    pending_space: i64,
}

/// Owner of a block tree.
pub struct Object {
    id: ObjectId,
    layout: ObjectLayout,
    pub(crate) phys: RwLock<ObjectPhys>,
    state: Mutex<ObjectState>,
    /// Buffers caching this object's blocks. Taken before any buffer lock.
    pub(crate) dbufs: Mutex<BTreeMap<BufferId, Weak<Buffer>>>,
    /// Bonus buffer slot. Taken before the bonus buffer's lock.
    pub(crate) bonus: Mutex<Option<Arc<Buffer>>>,
    /// One hold per live buffer.
    holds: AtomicU64,
}

impl Object {
    /// Creates an empty object.
    pub fn create(id: ObjectId, layout: ObjectLayout) -> Arc<Self> {
        Arc::new(Self {
            id,
            layout,
            phys: RwLock::new(ObjectPhys {
                blkptr: vec![BlockPtr::HOLE; layout.nblkptr],
                spill: None,
                max_blkid: 0,
                bonus: vec![0u8; BONUS_SIZE],
                used_bytes: 0,
            }),
            state: Mutex::new(ObjectState {
                dirty: BTreeMap::new(),
                frees: BTreeMap::new(),
                max_blkid: 0,
                have_spill: false,
                pending_space: 0,
            }),
            dbufs: Mutex::new(BTreeMap::new()),
            bonus: Mutex::new(None),
            holds: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn layout(&self) -> &ObjectLayout {
        &self.layout
    }

    /// Returns a root block pointer.
    pub fn root_ptr(&self, index: usize) -> BlockPtr {
        self.phys.read().blkptr[index]
    }

    pub fn spill_ptr(&self) -> Option<BlockPtr> {
        self.phys.read().spill
    }

    /// Returns true if the object has, or is about to have, a spill block.
    pub fn has_spill(&self) -> bool {
        self.phys.read().spill.is_some() || self.state.lock().have_spill
    }

    /// Highest level-0 block id written in a synced txg.
    pub fn synced_max_blkid(&self) -> u64 {
        self.phys.read().max_blkid
    }

    /// Highest level-0 block id, including unsynced growth.
    pub fn max_blkid(&self) -> u64 {
        self.state.lock().max_blkid
    }

    /// Returns the synced bonus area.
    pub fn bonus_bytes(&self) -> Vec<u8> {
        self.phys.read().bonus.clone()
    }

    pub fn used_bytes(&self) -> u64 {
        self.phys.read().used_bytes
    }

    pub fn pending_space(&self) -> i64 {
        self.state.lock().pending_space
    }

    /// Number of live buffers caching this object's blocks.
    pub fn buffer_count(&self) -> usize {
        self.dbufs.lock().len()
    }

    /// Number of holds buffers keep on this object.
    pub fn hold_count(&self) -> u64 {
        self.holds.load(Ordering::Acquire)
    }

    /// Returns true if `blkid` lies in a pending free range.
    pub fn block_freed(&self, blkid: u64) -> bool {
        self.state
            .lock()
            .frees
            .values()
            .any(|ranges| ranges.contains(blkid))
    }

    /// Number of top-level dirty records queued for `txg`.
    pub fn dirty_record_count(&self, txg: u64) -> usize {
        self.state.lock().dirty.get(&txg).map_or(0, Vec::len)
    }

    /// Pending free ranges recorded for `txg`.
    pub fn free_ranges(&self, txg: u64) -> RangeSet {
        self.state
            .lock()
            .frees
            .get(&txg)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns true if anything is queued for `txg`.
    pub fn is_dirty_in(&self, txg: u64) -> bool {
        let state = self.state.lock();
        state.dirty.contains_key(&txg) || state.frees.contains_key(&txg)
    }

    pub(crate) fn add_hold(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_hold(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "object {} hold count underflow", self.id);
    }

    pub(crate) fn mark_spill(&self) {
        self.state.lock().have_spill = true;
    }

    pub(crate) fn add_dirty_record(&self, txg: u64, link: DirtyLink) {
        self.state.lock().dirty.entry(txg).or_default().push(link);
    }

    pub(crate) fn remove_dirty_record(&self, txg: u64, record: &Arc<DirtyRecord>) -> bool {
        let mut state = self.state.lock();
        let Some(list) = state.dirty.get_mut(&txg) else {
            return false;
        };
        let before = list.len();
        list.retain(|link| !Arc::ptr_eq(&link.record, record));
        let removed = list.len() != before;
        if list.is_empty() {
            state.dirty.remove(&txg);
        }
        removed
    }

    /// Takes the dirty records queued for `txg`.
    pub(crate) fn take_dirty_records(&self, txg: u64) -> Vec<DirtyLink> {
        self.state.lock().dirty.remove(&txg).unwrap_or_default()
    }

    pub(crate) fn add_free_range(&self, txg: u64, start: u64, end: u64) {
        self.state
            .lock()
            .frees
            .entry(txg)
            .or_default()
            .add(start, end);
    }

    /// Forgets a pending free of `blkid` in `txg`; the block is being
    /// rewritten in the same txg.
    pub(crate) fn clear_free_range(&self, blkid: u64, txg: u64) {
        let mut state = self.state.lock();
        if let Some(ranges) = state.frees.get_mut(&txg) {
            ranges.remove(blkid);
            if ranges.is_empty() {
                state.frees.remove(&txg);
            }
        }
    }

    /// Drops the free ranges of a synced txg.
    pub(crate) fn finish_frees(&self, txg: u64) {
        self.state.lock().frees.remove(&txg);
    }

    /// Raises the in-core max block id.
    pub(crate) fn new_blkid(&self, blkid: u64) {
        let mut state = self.state.lock();
        if blkid > state.max_blkid {
            state.max_blkid = blkid;
        }
    }

    pub(crate) fn willuse_space(&self, delta: i64) {
        self.state.lock().pending_space += delta;
    }

    /// Clears the space estimate once nothing is left to sync.
    pub(crate) fn settle_space(&self) {
        let mut state = self.state.lock();
        if state.dirty.is_empty() && state.frees.is_empty() {
            state.pending_space = 0;
        }
    }

    /// Raises the synced max block id.
    pub(crate) fn synced_blkid(&self, blkid: u64) {
        let mut phys = self.phys.write();
        if blkid > phys.max_blkid {
            phys.max_blkid = blkid;
        }
    }

    pub(crate) fn register_buffer(
        list: &mut BTreeMap<BufferId, Weak<Buffer>>,
        buf: &Arc<Buffer>,
    ) {
        list.insert(buf.id(), Arc::downgrade(buf));
    }

    /// Live buffers matching `filter`.
    pub(crate) fn buffers_where(&self, filter: impl Fn(&Buffer) -> bool) -> Vec<Arc<Buffer>> {
        self.dbufs
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|b| filter(b))
            .collect()
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("holds", &self.hold_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_validation() {
        assert!(ObjectLayout::new(ObjectKind::Data, 4096, 14, 3, 1).is_ok());
        assert!(matches!(
            ObjectLayout::new(ObjectKind::Data, 1000, 14, 3, 1),
            Err(ZyronError::InvalidBlockSize { size: 1000 })
        ));
        assert!(matches!(
            ObjectLayout::new(ObjectKind::Data, 4096, 20, 3, 1),
            Err(ZyronError::InvalidLayout(_))
        ));
        assert!(ObjectLayout::new(ObjectKind::Data, 4096, 14, 0, 1).is_err());
        assert!(ObjectLayout::new(ObjectKind::Data, 4096, 14, 2, 0).is_err());
    }

    #[test]
    fn test_layout_capacity() {
        // 4K indirect blocks hold 128 pointers.
        let layout = ObjectLayout::new(ObjectKind::Data, 4096, 12, 3, 2).unwrap();
        assert_eq!(layout.epbs(), 7);
        assert_eq!(layout.block_size(0), 4096);
        assert_eq!(layout.block_size(2), 4096);
        assert_eq!(layout.max_blkid(2), 1);
        assert_eq!(layout.max_blkid(1), 2 * 128 - 1);
        assert_eq!(layout.max_blkid(0), 2 * 128 * 128 - 1);

        let single = ObjectLayout::new(ObjectKind::Data, 512, 12, 1, 3).unwrap();
        assert_eq!(single.max_blkid(0), 2);
    }

    #[test]
    fn test_range_set_merge() {
        let mut set = RangeSet::new();
        set.add(10, 20);
        set.add(30, 40);
        set.add(21, 29);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(10, 40)]);

        set.add(5, 12);
        set.add(50, 60);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(5, 40), (50, 60)]);
        assert!(set.contains(5));
        assert!(set.contains(40));
        assert!(!set.contains(45));
    }

    #[test]
    fn test_range_set_remove_splits() {
        let mut set = RangeSet::new();
        set.add(10, 20);
        assert!(set.remove(15));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(10, 14), (16, 20)]);
        assert!(set.remove(10));
        assert!(set.remove(20));
        assert!(!set.remove(15));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(11, 14), (16, 19)]);
    }

    #[test]
    fn test_range_set_intersect() {
        let mut set = RangeSet::new();
        set.add(0, 10);
        set.add(100, 300);
        assert_eq!(set.intersect(5, 127), vec![(5, 10), (100, 127)]);
        assert_eq!(set.intersect(128, 255), vec![(128, 255)]);
        assert!(set.intersect(11, 99).is_empty());
    }

    #[test]
    fn test_free_range_tracking() {
        let layout = ObjectLayout::new(ObjectKind::Data, 512, 12, 2, 1).unwrap();
        let object = Object::create(ObjectId::new(1, 9), layout);
        object.add_free_range(7, 10, 20);
        assert!(object.block_freed(15));
        assert!(object.is_dirty_in(7));

        object.clear_free_range(15, 7);
        assert!(!object.block_freed(15));
        assert!(object.block_freed(16));

        object.finish_frees(7);
        assert!(!object.block_freed(16));
        assert!(!object.is_dirty_in(7));
    }

    #[test]
    fn test_max_blkid_tracking() {
        let layout = ObjectLayout::new(ObjectKind::Data, 512, 12, 2, 1).unwrap();
        let object = Object::create(ObjectId::new(1, 9), layout);
        object.new_blkid(40);
        object.new_blkid(12);
        assert_eq!(object.max_blkid(), 40);
        assert_eq!(object.synced_max_blkid(), 0);
        object.synced_blkid(40);
        assert_eq!(object.synced_max_blkid(), 40);
    }
}
