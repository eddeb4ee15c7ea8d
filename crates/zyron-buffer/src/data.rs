//! Reference-counted block contents.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(1);

struct BlockData {
    id: u64,
    bytes: RwLock<Vec<u8>>,
    frozen: AtomicBool,
    hole: bool,
    metadata: bool,
}

/// Shared handle to the contents of one block.
///
/// Cloning a `BlockRef` shares the contents; it never copies. A buffer and
/// its newest dirty record routinely share one `BlockRef`. Before changing
/// contents that may be shared, callers go through
/// [`make_writable`](Self::make_writable), which copies when more handles
/// exist than the caller accounts for.
///
/// Frozen contents reject writes. Contents read from the store and hole
/// blocks start frozen; freshly allocated contents start thawed.
#[derive(Clone)]
pub struct BlockRef(Arc<BlockData>);

impl BlockRef {
    fn build(bytes: Vec<u8>, frozen: bool, hole: bool, metadata: bool) -> Self {
        Self(Arc::new(BlockData {
            id: NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed),
            bytes: RwLock::new(bytes),
            frozen: AtomicBool::new(frozen),
            hole,
            metadata,
        }))
    }

    /// Allocates zeroed, writable contents.
    pub fn alloc(size: usize, metadata: bool) -> Self {
        Self::build(vec![0u8; size], false, false, metadata)
    }

    /// Returns frozen all-zero contents standing for a block never written.
    pub fn hole(size: usize, metadata: bool) -> Self {
        Self::build(vec![0u8; size], true, true, metadata)
    }

    /// Wraps contents read from the store.
    pub fn from_bytes(bytes: &[u8], metadata: bool) -> Self {
        Self::build(bytes.to_vec(), true, false, metadata)
    }

    /// Unique identity of these contents.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.bytes.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_hole(&self) -> bool {
        self.0.hole
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        self.0.metadata
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::Acquire)
    }

    /// Rejects further writes until thawed.
    #[inline]
    pub fn freeze(&self) {
        self.0.frozen.store(true, Ordering::Release);
    }

    /// Allows writes again.
    pub fn thaw(&self) {
        debug_assert!(!self.0.hole, "thawing a hole block");
        self.0.frozen.store(false, Ordering::Release);
    }

    /// Number of handles sharing these contents.
    #[inline]
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Returns true if both handles share the same contents.
    #[inline]
    pub fn ptr_eq(a: &BlockRef, b: &BlockRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Read access to the contents.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.bytes.read()
    }

    /// Write access to the contents.
    ///
    /// # Panics
    ///
    /// Panics if the contents are frozen.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        assert!(
            !self.is_frozen(),
            "write to frozen block data {}",
            self.0.id
        );
        self.0.bytes.write()
    }

    /// Copies the contents into new, writable, unshared storage.
    pub fn deep_clone(&self) -> Self {
        Self::build(self.read().clone(), false, false, self.0.metadata)
    }

    /// Ensures this handle owns writable contents.
    ///
    /// `owners` is the number of handles the caller knows share the
    /// contents legitimately (for example a buffer and its dirty record).
    /// Holes and contents with other sharers are replaced by a private copy;
    /// otherwise the contents are thawed in place.
    pub fn make_writable(&mut self, owners: usize) {
        if self.is_hole() || self.share_count() > owners {
            *self = self.deep_clone();
        } else {
            self.thaw();
        }
    }

    /// Copies the contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read().clone()
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("id", &self.0.id)
            .field("len", &self.len())
            .field("hole", &self.0.hole)
            .field("frozen", &self.is_frozen())
            .field("shares", &self.share_count())
            .finish()
    }
}
