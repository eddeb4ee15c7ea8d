//! Address index mapping block keys to live buffers.

use crate::buffer::{Buffer, DbufState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use sysinfo::System;
use zyron_common::BufferKey;

/// Fewest buckets the index is built with.
const MIN_BUCKETS: usize = 1 << 10;

/// Most buckets an auto-sized index gets.
const MAX_BUCKETS: usize = 1 << 24;

/// Bytes of physical memory covered by one bucket when auto-sizing.
const BYTES_PER_BUCKET: u64 = 4096;

/// Outcome of [`AddressIndex::insert_or_get`].
pub(crate) enum Insertion {
    Inserted,
    /// A live buffer with the same key already exists.
    Existing(Arc<Buffer>),
}

/// Hash table of buffers with one lock per bucket.
///
/// A bucket lock is always taken before the lock of any buffer in that
/// bucket. Buffers in the `Evicting` state stay in their bucket until
/// destroyed but are invisible to lookups.
pub(crate) struct AddressIndex {
    buckets: Box<[Mutex<Vec<Arc<Buffer>>>]>,
    mask: usize,
    count: AtomicUsize,
}

impl AddressIndex {
    /// Creates an index with at least `buckets` buckets.
    pub(crate) fn new(buckets: usize) -> Self {
        let size = buckets.next_power_of_two().max(MIN_BUCKETS);
        let buckets: Box<[Mutex<Vec<Arc<Buffer>>>]> =
            (0..size).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            buckets,
            mask: size - 1,
            count: AtomicUsize::new(0),
        }
    }

    /// Creates an index sized from physical memory: one bucket per 4 KB,
    /// clamped to a sane range.
    pub(crate) fn auto_sized() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self::new(Self::buckets_for_memory(sys.total_memory()))
    }

    pub(crate) fn buckets_for_memory(memory_bytes: u64) -> usize {
        let wanted = (memory_bytes / BYTES_PER_BUCKET) as usize;
        wanted.clamp(MIN_BUCKETS, MAX_BUCKETS).next_power_of_two()
    }

    #[inline]
    fn bucket(&self, key: &BufferKey) -> &Mutex<Vec<Arc<Buffer>>> {
        // FxHash-style multiply chain over the key fields
        let mut hash = key.owner.wrapping_mul(0x517cc1b727220a95);
        hash = (hash.rotate_left(5) ^ key.object).wrapping_mul(0x517cc1b727220a95);
        hash = (hash.rotate_left(5) ^ key.level as u64).wrapping_mul(0x517cc1b727220a95);
        hash = (hash.rotate_left(5) ^ key.blkid).wrapping_mul(0x517cc1b727220a95);
        &self.buckets[(hash >> 16) as usize & self.mask]
    }

    /// Returns the live buffer for `key`, if any.
    pub(crate) fn find(&self, key: &BufferKey) -> Option<Arc<Buffer>> {
        let bucket = self.bucket(key).lock();
        bucket
            .iter()
            .filter(|b| b.key() == *key)
            .find(|b| b.lock().state != DbufState::Evicting)
            .cloned()
    }

    /// Publishes `buf` unless a live buffer with its key already exists.
    pub(crate) fn insert_or_get(&self, buf: Arc<Buffer>) -> Insertion {
        let key = buf.key();
        let mut bucket = self.bucket(&key).lock();
        if let Some(existing) = bucket
            .iter()
            .filter(|b| b.key() == key)
            .find(|b| b.lock().state != DbufState::Evicting)
        {
            return Insertion::Existing(existing.clone());
        }
        bucket.push(buf);
        self.count.fetch_add(1, Ordering::AcqRel);
        Insertion::Inserted
    }

    /// Removes this exact buffer instance.
    pub(crate) fn remove(&self, buf: &Arc<Buffer>) {
        let mut bucket = self.bucket(&buf.key()).lock();
        let pos = bucket
            .iter()
            .position(|b| Arc::ptr_eq(b, buf))
            .unwrap_or_else(|| panic!("{} ({}) missing from address index", buf.key(), buf.id()));
        bucket.swap_remove(pos);
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of buffers in the index, including ones being evicted.
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
