//! Cached block buffers.

use crate::data::BlockRef;
use crate::dirty::DirtyRecord;
use crate::object::Object;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use zyron_common::{BufferKey, Result};

/// Unique identifier for a buffer instance.
///
/// A key can be cached by several buffers over time (one evicted, the next
/// created); each instance gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dbuf:{}", self.0)
    }
}

/// Lifecycle state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbufState {
    /// No contents; a read has not been issued.
    Uncached,
    /// A store read is in flight.
    Reading,
    /// Contents are valid.
    Cached,
    /// A caller is overwriting the whole block without reading it.
    Filling,
    /// The block is dirtied with contents that are never read.
    NoFill,
    /// Being torn down; lookups skip it.
    Evicting,
}

/// Where a buffer's block pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOffset {
    /// Index into the object's root block pointers.
    Root(usize),
    /// Byte offset inside the parent indirect block.
    Indirect(usize),
    /// The object's spill pointer.
    Spill,
    /// The object's bonus area.
    Bonus,
    /// Beyond the object's synced extent; resolved at write time.
    PastEof,
}

/// Attachment notified when a level-0 buffer's contents go away.
///
/// The callback runs with the buffer's lock held and must not call back
/// into the cache.
pub trait BufferUser: Send + Sync {
    fn on_evict(&self, key: BufferKey, data: Option<&[u8]>);
}

/// Completion for an asynchronous read.
pub type ReadCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// A cached block.
///
/// Every mutable field lives in [`BufferInner`] behind the buffer's own
/// mutex. The condition variable is signalled on every state transition
/// and whenever holds drop while a free-range sweep is waiting.
pub struct Buffer {
    id: BufferId,
    key: BufferKey,
    object: Arc<Object>,
    inner: Mutex<BufferInner>,
    changed: Condvar,
}

pub(crate) struct BufferInner {
    pub(crate) state: DbufState,
    pub(crate) data: Option<BlockRef>,
    pub(crate) size: usize,
    /// Parent indirect buffer; this buffer holds one hold on it.
    pub(crate) parent: Option<Arc<Buffer>>,
    pub(crate) blkoff: BlockOffset,
    /// Dirty records, newest txg first.
    pub(crate) dirty: Vec<Arc<DirtyRecord>>,
    pub(crate) holds: u64,
    pub(crate) dirty_count: u32,
    pub(crate) writers_waiting: u32,
    /// Birth txg of the block pointer the contents came from.
    pub(crate) birth: u64,
    pub(crate) user: Option<Arc<dyn BufferUser>>,
    pub(crate) immediate_evict: bool,
    pub(crate) freed_in_flight: bool,
    /// Dirty record whose write is in flight.
    pub(crate) data_pending: Option<Arc<DirtyRecord>>,
    pub(crate) on_object_list: bool,
    pub(crate) read_error: Option<String>,
    pub(crate) read_waiters: Vec<ReadCallback>,
}

impl Buffer {
    /// Creates a buffer in the `Evicting` state so lookups ignore it until
    /// it is published.
    pub(crate) fn new(
        id: BufferId,
        key: BufferKey,
        object: Arc<Object>,
        size: usize,
        blkoff: BlockOffset,
        birth: u64,
    ) -> Self {
        Self {
            id,
            key,
            object,
            inner: Mutex::new(BufferInner {
                state: DbufState::Evicting,
                data: None,
                size,
                parent: None,
                blkoff,
                dirty: Vec::new(),
                holds: 0,
                dirty_count: 0,
                writers_waiting: 0,
                birth,
                user: None,
                immediate_evict: false,
                freed_in_flight: false,
                data_pending: None,
                on_object_list: false,
                read_error: None,
                read_waiters: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn key(&self) -> BufferKey {
        self.key
    }

    #[inline]
    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.key.level
    }

    #[inline]
    pub fn blkid(&self) -> u64 {
        self.key.blkid
    }

    /// Returns true if the block is filesystem metadata rather than user
    /// data.
    pub fn is_metadata(&self) -> bool {
        self.key.level > 0
            || self.key.is_bonus()
            || self.key.is_spill()
            || self.object.layout().kind.is_metadata()
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock()
    }

    /// Blocks until the buffer changes; callers re-check their condition.
    #[inline]
    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, BufferInner>) {
        self.changed.wait(guard);
    }

    #[inline]
    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    pub fn state(&self) -> DbufState {
        self.inner.lock().state
    }

    pub fn hold_count(&self) -> u64 {
        self.inner.lock().holds
    }

    pub fn dirty_count(&self) -> u32 {
        self.inner.lock().dirty_count
    }
}

impl BufferInner {
    /// Newest dirty record.
    #[inline]
    pub(crate) fn head(&self) -> Option<&Arc<DirtyRecord>> {
        self.dirty.first()
    }

    /// Dirty record for `txg`, if any.
    pub(crate) fn record_for(&self, txg: u64) -> Option<&Arc<DirtyRecord>> {
        self.dirty.iter().find(|dr| dr.txg() == txg)
    }

    /// Asserts the buffer's internal invariants.
    pub(crate) fn verify(&self, key: &BufferKey) {
        assert_eq!(
            self.dirty_count as usize,
            self.dirty.len(),
            "dirty count out of step with chain on {}",
            key
        );
        assert!(
            self.holds >= self.dirty_count as u64,
            "{} has {} holds but {} dirty records",
            key,
            self.holds,
            self.dirty_count
        );
        for pair in self.dirty.windows(2) {
            assert!(
                pair[0].txg() > pair[1].txg(),
                "dirty chain of {} not newest-first: {} before {}",
                key,
                pair[0].txg(),
                pair[1].txg()
            );
        }
        match self.state {
            DbufState::Cached | DbufState::Filling => assert!(
                self.data.is_some(),
                "{} is {:?} without data",
                key,
                self.state
            ),
            DbufState::Uncached | DbufState::Reading | DbufState::NoFill => assert!(
                self.data.is_none(),
                "{} is {:?} with data",
                key,
                self.state
            ),
            DbufState::Evicting => {
                assert_eq!(self.holds, 0, "evicting {} still held", key)
            }
        }
        if key.level > 0 {
            assert!(self.user.is_none(), "user attached to indirect {}", key);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("size", &inner.size)
            .field("holds", &inner.holds)
            .field("dirty_count", &inner.dirty_count)
            .finish()
    }
}
