//! Backing cache tier for unreferenced buffer contents.
//!
//! When a buffer's last hold goes away its contents are handed to the tier,
//! which decides how long they stay resident. Reclaiming contents calls the
//! buffer's eviction callback.

use crate::data::BlockRef;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::trace;
use zyron_common::BlockPtr;

/// Ring slots kept beyond twice the live entries before stale slots are
/// dropped.
const RING_SLACK: usize = 64;

/// Upper bound on remembered reactivations awaiting the next inactivate.
const HOT_LIMIT: usize = 4096;

/// Runs when the tier reclaims inactive contents.
pub type EvictCallback = Box<dyn FnOnce() + Send>;

/// Result of [`CacheTier::reactivate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactivation {
    /// The contents are back in use.
    Active,
    /// The tier is reclaiming the contents; the buffer must be evicted.
    Gone,
}

/// Result of [`CacheTier::evict_ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictStatus {
    /// The tier dropped its reference; the caller finishes the eviction.
    Released,
    /// The tier's eviction callback is running and will finish it.
    InProgress,
}

/// Storage tier holding contents of unreferenced buffers.
///
/// Eviction callbacks never run while the tier holds its own lock, and only
/// from [`reclaim`](CacheTier::reclaim) or [`purge`](CacheTier::purge).
/// Callers must not hold buffer locks when calling either.
pub trait CacheTier: Send + Sync {
    /// Takes over unreferenced contents.
    fn inactivate(&self, data: &BlockRef, on_evict: EvictCallback);

    /// Reclaims contents for a new hold.
    fn reactivate(&self, data: &BlockRef) -> Reactivation;

    /// Drops the tier's interest in contents being evicted by the cache.
    fn evict_ref(&self, data: &BlockRef) -> EvictStatus;

    /// Evicts inactive contents until the tier is within capacity.
    fn reclaim(&self) -> usize;

    /// Evicts all inactive contents.
    fn purge(&self) -> usize;

    /// Keeps a speculatively read block until a real read claims it.
    fn stash_prefetched(&self, ptr: &BlockPtr, data: Bytes);

    /// Takes a stashed block matching `ptr`.
    fn claim_prefetched(&self, ptr: &BlockPtr) -> Option<Bytes>;

    /// Bytes of inactive contents currently resident.
    fn resident_bytes(&self) -> usize;
}

/// Counters kept by [`ClockTier`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub inactivations: u64,
    pub reactivations: u64,
    pub evictions: u64,
    pub prefetch_stashed: u64,
    pub prefetch_claimed: u64,
    pub entries: usize,
    pub resident_bytes: usize,
}

struct TierEntry {
    seq: u64,
    bytes: usize,
    referenced: bool,
    on_evict: EvictCallback,
}

struct ClockInner {
    entries: HashMap<u64, TierEntry>,
    /// Clock order of `(id, seq)` slots. A slot is live only while its seq
    /// matches the entry's; stale slots are skipped.
    ring: VecDeque<(u64, u64)>,
    next_seq: u64,
    /// Active contents that were reactivated; their next inactivation
    /// starts referenced.
    hot: HashSet<u64>,
    /// Contents whose eviction callback is running.
    evicting: HashSet<u64>,
    resident: usize,
    capacity: usize,
    prefetched: HashMap<u64, (BlockPtr, Bytes)>,
    prefetch_order: VecDeque<u64>,
    prefetch_slots: usize,
    stats: TierStats,
}

impl ClockInner {
    /// Selects the next entry to evict.
    ///
    /// The clock hand sweeps the ring; a referenced entry has its bit
    /// cleared and is moved to the back, giving it a second chance.
    fn next_victim(&mut self) -> Option<(u64, TierEntry)> {
        let mut budget = 2 * self.ring.len();
        while budget > 0 {
            budget -= 1;
            let (id, seq) = self.ring.pop_front()?;
            let Some(entry) = self.entries.get_mut(&id).filter(|e| e.seq == seq) else {
                continue;
            };
            if entry.referenced {
                entry.referenced = false;
                self.ring.push_back((id, seq));
                continue;
            }
            return self.take(id);
        }
        // Every remaining entry was referenced twice round; take the oldest.
        let id = self
            .ring
            .iter()
            .find(|slot| self.is_live(slot))
            .map(|&(id, _)| id)?;
        self.take(id)
    }

    fn is_live(&self, &(id, seq): &(u64, u64)) -> bool {
        self.entries.get(&id).is_some_and(|e| e.seq == seq)
    }

    /// Drops stale ring slots once they outnumber the live ones.
    fn compact_ring(&mut self) {
        if self.ring.len() <= 2 * self.entries.len() + RING_SLACK {
            return;
        }
        let ring = std::mem::take(&mut self.ring);
        self.ring = ring.into_iter().filter(|slot| self.is_live(slot)).collect();
    }

    fn remove_prefetch_order(&mut self, addr: u64) {
        if let Some(pos) = self.prefetch_order.iter().position(|a| *a == addr) {
            self.prefetch_order.remove(pos);
        }
    }

    fn take(&mut self, id: u64) -> Option<(u64, TierEntry)> {
        let entry = self.entries.remove(&id)?;
        self.resident -= entry.bytes;
        self.hot.remove(&id);
        self.evicting.insert(id);
        self.stats.evictions += 1;
        Some((id, entry))
    }
}

/// Byte-bounded clock over inactive buffer contents.
pub struct ClockTier {
    inner: Mutex<ClockInner>,
}

impl ClockTier {
    /// Creates a tier keeping up to `capacity` bytes of inactive contents
    /// and `prefetch_slots` prefetched blocks.
    pub fn new(capacity: usize, prefetch_slots: usize) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                entries: HashMap::new(),
                ring: VecDeque::new(),
                next_seq: 0,
                hot: HashSet::new(),
                evicting: HashSet::new(),
                resident: 0,
                capacity,
                prefetched: HashMap::new(),
                prefetch_order: VecDeque::new(),
                prefetch_slots,
                stats: TierStats::default(),
            }),
        }
    }

    /// Returns the configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn stats(&self) -> TierStats {
        let inner = self.inner.lock();
        TierStats {
            entries: inner.entries.len(),
            resident_bytes: inner.resident,
            ..inner.stats
        }
    }

    /// Evicts entries while `over` says the tier is too full.
    fn evict_while(&self, over: impl Fn(&ClockInner) -> bool) -> usize {
        let victims: Vec<(u64, TierEntry)> = {
            let mut inner = self.inner.lock();
            let mut victims = Vec::new();
            while over(&inner) {
                match inner.next_victim() {
                    Some(victim) => victims.push(victim),
                    None => break,
                }
            }
            victims
        };

        let count = victims.len();
        for (id, entry) in victims {
            trace!(data = id, bytes = entry.bytes, "tier evicting");
            (entry.on_evict)();
            self.inner.lock().evicting.remove(&id);
        }
        count
    }
}

impl CacheTier for ClockTier {
    fn inactivate(&self, data: &BlockRef, on_evict: EvictCallback) {
        let bytes = data.len();
        let mut inner = self.inner.lock();
        let referenced = inner.hot.remove(&data.id());
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let previous = inner.entries.insert(
            data.id(),
            TierEntry {
                seq,
                bytes,
                referenced,
                on_evict,
            },
        );
        assert!(previous.is_none(), "data {} inactivated twice", data.id());
        inner.ring.push_back((data.id(), seq));
        inner.compact_ring();
        inner.resident += bytes;
        inner.stats.inactivations += 1;
    }

    fn reactivate(&self, data: &BlockRef) -> Reactivation {
        let entry = {
            let mut inner = self.inner.lock();
            if inner.evicting.contains(&data.id()) {
                return Reactivation::Gone;
            }
            let entry = inner.entries.remove(&data.id());
            if let Some(entry) = &entry {
                inner.resident -= entry.bytes;
                // Ids whose contents were replaced while active never come
                // back; forget them all rather than grow without bound.
                if inner.hot.len() >= HOT_LIMIT {
                    inner.hot.clear();
                }
                inner.hot.insert(data.id());
                inner.stats.reactivations += 1;
            }
            entry
        };
        // The unused callback holds a buffer reference; drop it unlocked.
        drop(entry);
        Reactivation::Active
    }

    fn evict_ref(&self, data: &BlockRef) -> EvictStatus {
        let entry = {
            let mut inner = self.inner.lock();
            if inner.evicting.contains(&data.id()) {
                return EvictStatus::InProgress;
            }
            inner.hot.remove(&data.id());
            let entry = inner.entries.remove(&data.id());
            if let Some(entry) = &entry {
                inner.resident -= entry.bytes;
            }
            entry
        };
        drop(entry);
        EvictStatus::Released
    }

    fn reclaim(&self) -> usize {
        self.evict_while(|inner| inner.resident > inner.capacity)
    }

    fn purge(&self) -> usize {
        self.evict_while(|inner| !inner.entries.is_empty())
    }

    fn stash_prefetched(&self, ptr: &BlockPtr, data: Bytes) {
        let mut inner = self.inner.lock();
        if inner.prefetch_slots == 0 {
            return;
        }
        if inner.prefetched.insert(ptr.addr, (*ptr, data)).is_some() {
            inner.remove_prefetch_order(ptr.addr);
        }
        inner.prefetch_order.push_back(ptr.addr);
        inner.stats.prefetch_stashed += 1;
        while inner.prefetched.len() > inner.prefetch_slots {
            let Some(oldest) = inner.prefetch_order.pop_front() else {
                break;
            };
            inner.prefetched.remove(&oldest);
        }
    }

    fn claim_prefetched(&self, ptr: &BlockPtr) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.prefetched.get(&ptr.addr) {
            Some((stashed, _)) if stashed.same_block(ptr) => {}
            _ => return None,
        }
        let (_, data) = inner.prefetched.remove(&ptr.addr)?;
        inner.remove_prefetch_order(ptr.addr);
        inner.stats.prefetch_claimed += 1;
        Some(data)
    }

    fn resident_bytes(&self) -> usize {
        self.inner.lock().resident
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> EvictCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn ptr(addr: u64, birth: u64) -> BlockPtr {
        BlockPtr {
            addr,
            birth,
            fill: 1,
            size: 512,
            level: 0,
        }
    }

    #[test]
    fn test_reclaim_respects_capacity() {
        let tier = ClockTier::new(1024, 0);
        let evicted = Arc::new(AtomicUsize::new(0));
        let blocks: Vec<_> = (0..4).map(|_| BlockRef::alloc(512, false)).collect();
        for data in &blocks {
            tier.inactivate(data, counter_callback(&evicted));
        }
        assert_eq!(tier.resident_bytes(), 2048);

        assert_eq!(tier.reclaim(), 2);
        assert_eq!(evicted.load(Ordering::SeqCst), 2);
        assert_eq!(tier.resident_bytes(), 1024);
        assert_eq!(tier.stats().entries, 2);
    }

    #[test]
    fn test_clock_evicts_oldest_first() {
        let tier = ClockTier::new(0, 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let blocks: Vec<_> = (0..3).map(|_| BlockRef::alloc(512, false)).collect();
        for (i, data) in blocks.iter().enumerate() {
            let order = order.clone();
            tier.inactivate(data, Box::new(move || order.lock().push(i)));
        }
        tier.reclaim();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reactivated_data_gets_second_chance() {
        let tier = ClockTier::new(512, 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let hot = BlockRef::alloc(512, false);
        let cold = BlockRef::alloc(512, false);

        tier.inactivate(&hot, Box::new(|| {}));
        assert_eq!(tier.reactivate(&hot), Reactivation::Active);
        assert_eq!(tier.resident_bytes(), 0);

        let o = order.clone();
        tier.inactivate(&hot, Box::new(move || o.lock().push("hot")));
        let o = order.clone();
        tier.inactivate(&cold, Box::new(move || o.lock().push("cold")));

        assert_eq!(tier.reclaim(), 1);
        assert_eq!(*order.lock(), vec!["cold"]);
    }

    #[test]
    fn test_repeated_reuse_keeps_ring_bounded() {
        let tier = ClockTier::new(64 << 20, 0);
        let data = BlockRef::alloc(512, false);
        for _ in 0..10_000 {
            tier.inactivate(&data, Box::new(|| {}));
            assert_eq!(tier.reactivate(&data), Reactivation::Active);
        }
        let inner = tier.inner.lock();
        assert!(inner.entries.is_empty());
        assert!(inner.ring.len() <= 2 + RING_SLACK);
    }

    #[test]
    fn test_stale_slot_does_not_spend_second_chance() {
        let tier = ClockTier::new(1024, 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let hot = BlockRef::alloc(512, false);
        let cold = BlockRef::alloc(512, false);
        let newer = BlockRef::alloc(512, false);

        // Several release/reacquire cycles leave stale slots ahead of the
        // live one.
        for _ in 0..3 {
            tier.inactivate(&hot, Box::new(|| {}));
            tier.reactivate(&hot);
        }
        for (name, data) in [("hot", &hot), ("cold", &cold), ("newer", &newer)] {
            let o = order.clone();
            tier.inactivate(data, Box::new(move || o.lock().push(name)));
        }

        assert_eq!(tier.reclaim(), 1);
        assert_eq!(*order.lock(), vec!["cold"]);
    }

    #[test]
    fn test_reactivated_ids_are_bounded() {
        let tier = ClockTier::new(64 << 20, 0);
        for _ in 0..10_000 {
            let data = BlockRef::alloc(64, false);
            tier.inactivate(&data, Box::new(|| {}));
            tier.reactivate(&data);
        }
        assert!(tier.inner.lock().hot.len() <= HOT_LIMIT);
        assert_eq!(tier.stats().reactivations, 10_000);
    }

    #[test]
    fn test_evict_ref_drops_entry_without_callback() {
        let tier = ClockTier::new(0, 0);
        let evicted = Arc::new(AtomicUsize::new(0));
        let data = BlockRef::alloc(512, false);
        tier.inactivate(&data, counter_callback(&evicted));

        assert_eq!(tier.evict_ref(&data), EvictStatus::Released);
        assert_eq!(tier.resident_bytes(), 0);
        assert_eq!(tier.purge(), 0);
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reactivate_during_eviction_is_gone() {
        let tier = Arc::new(ClockTier::new(0, 0));
        let data = BlockRef::alloc(512, false);
        let seen = Arc::new(Mutex::new(None));

        let (t, d, s) = (tier.clone(), data.clone(), seen.clone());
        tier.inactivate(
            &data,
            Box::new(move || {
                *s.lock() = Some((t.reactivate(&d), t.evict_ref(&d)));
            }),
        );
        tier.purge();
        assert_eq!(
            *seen.lock(),
            Some((Reactivation::Gone, EvictStatus::InProgress))
        );
        // Once the callback returns the contents are forgotten.
        assert_eq!(tier.evict_ref(&data), EvictStatus::Released);
    }

    #[test]
    fn test_prefetch_stash() {
        let tier = ClockTier::new(0, 2);
        tier.stash_prefetched(&ptr(1, 5), Bytes::from_static(b"one"));
        tier.stash_prefetched(&ptr(2, 5), Bytes::from_static(b"two"));
        tier.stash_prefetched(&ptr(3, 5), Bytes::from_static(b"three"));

        // Oldest entry was dropped to respect the slot limit.
        assert!(tier.claim_prefetched(&ptr(1, 5)).is_none());
        // A pointer with a different birth is a different block.
        assert!(tier.claim_prefetched(&ptr(2, 6)).is_none());
        assert_eq!(tier.claim_prefetched(&ptr(2, 5)).unwrap(), "two");
        assert!(tier.claim_prefetched(&ptr(2, 5)).is_none());
        assert_eq!(tier.stats().prefetch_claimed, 1);
    }

    #[test]
    fn test_claimed_prefetch_leaves_no_order_slot() {
        let tier = ClockTier::new(0, 4);
        for addr in 0..10_000 {
            tier.stash_prefetched(&ptr(addr, 1), Bytes::from_static(b"x"));
            assert!(tier.claim_prefetched(&ptr(addr, 1)).is_some());
        }
        let inner = tier.inner.lock();
        assert!(inner.prefetched.is_empty());
        assert!(inner.prefetch_order.is_empty());
    }

    #[test]
    fn test_restash_moves_block_to_back() {
        let tier = ClockTier::new(0, 2);
        tier.stash_prefetched(&ptr(1, 1), Bytes::from_static(b"a"));
        tier.stash_prefetched(&ptr(2, 1), Bytes::from_static(b"b"));
        tier.stash_prefetched(&ptr(1, 2), Bytes::from_static(b"a2"));
        tier.stash_prefetched(&ptr(3, 1), Bytes::from_static(b"c"));

        // Block 2 was oldest once block 1 was stashed again.
        assert!(tier.claim_prefetched(&ptr(2, 1)).is_none());
        assert_eq!(tier.claim_prefetched(&ptr(1, 2)).unwrap(), "a2");
        assert_eq!(tier.claim_prefetched(&ptr(3, 1)).unwrap(), "c");
    }
}
