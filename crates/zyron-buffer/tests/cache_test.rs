//! Buffer cache integration tests.
//!
//! Exercises the public cache API end to end against the in-memory and
//! file-backed block stores:
//! - Buffer uniqueness under concurrent acquire
//! - Copy-on-write isolation between transaction groups
//! - Range frees racing reads, fills and writers; undirty and zero-in-place
//! - Fill transitions without reads
//! - Txg sync through indirect blocks, rewrites and external writes
//! - Concurrent writers overlapping txg sync

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

use zyron_buffer::{
    BlockRef, DbufCache, DbufState, Object, ObjectLayout, OverrideState, ReadFlags, TxgManager,
};
use zyron_common::{CacheConfig, CachePolicy, ObjectId, ObjectKind, StoreConfig};
use zyron_storage::{BlockStore, FileBlockStore, MemoryStore};

// =============================================================================
// Helpers
// =============================================================================

fn config() -> CacheConfig {
    CacheConfig {
        hash_buckets: 256,
        prefetch: false,
        verify: true,
        ..CacheConfig::default()
    }
}

fn cache_on(store: Arc<dyn BlockStore>, config: CacheConfig) -> DbufCache {
    DbufCache::new(config, store, Arc::new(TxgManager::default())).unwrap()
}

fn memory_cache() -> (DbufCache, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (cache_on(store.clone(), config()), store)
}

fn object(id: u64, nlevels: u8, nblkptr: usize) -> Arc<Object> {
    Object::create(
        ObjectId::new(1, id),
        ObjectLayout::new(ObjectKind::Data, 512, 12, nlevels, nblkptr).unwrap(),
    )
}

fn write_block(cache: &DbufCache, obj: &Arc<Object>, blkid: u64, fill: u8, txg: u64) {
    let handle = cache.acquire(obj, 0, blkid).unwrap();
    cache.dirty(&handle, txg);
    handle.write(0, &vec![fill; handle.size()]).unwrap();
}

fn read_block(cache: &DbufCache, obj: &Arc<Object>, blkid: u64) -> Vec<u8> {
    let handle = cache.acquire(obj, 0, blkid).unwrap();
    cache.read(&handle, ReadFlags::default()).unwrap();
    handle.read_bytes().unwrap()
}

// =============================================================================
// Buffer identity and holds
// =============================================================================

#[test]
fn test_concurrent_acquire_creates_one_buffer() {
    let (cache, _store) = memory_cache();
    let obj = object(1, 2, 1);
    let threads = 8;
    let start = Arc::new(Barrier::new(threads));
    let held = Arc::new(Barrier::new(threads));

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let cache = cache.clone();
            let obj = obj.clone();
            let start = start.clone();
            let held = held.clone();
            thread::spawn(move || {
                start.wait();
                let handle = cache.acquire(&obj, 0, 0).unwrap();
                let id = handle.id();
                // Keep the hold until every thread has its handle.
                held.wait();
                id
            })
        })
        .collect();
    let ids: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    // The block and its level-1 parent, each created once.
    assert_eq!(cache.stats().created, 2);
}

#[test]
fn test_concurrent_acquire_of_indirect_block() {
    let (cache, _store) = memory_cache();
    let obj = object(2, 2, 4);
    let start = Arc::new(Barrier::new(2));
    let held = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let cache = cache.clone();
            let obj = obj.clone();
            let start = start.clone();
            let held = held.clone();
            thread::spawn(move || {
                start.wait();
                let handle = cache.acquire(&obj, 1, 3).unwrap();
                let id = handle.id();
                let count = obj.buffer_count();
                held.wait();
                (id, count)
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(results[0].0, results[1].0);
    assert!(results.iter().all(|(_, count)| *count == 1));
}

#[test]
fn test_hold_count_returns_to_base() {
    let (cache, _store) = memory_cache();
    let obj = object(3, 1, 4);
    let handle = cache.acquire(&obj, 0, 1).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let obj = obj.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let h = cache.acquire(&obj, 0, 1).unwrap();
                    let copy = h.clone();
                    drop(h);
                    drop(copy);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(handle.hold_count(), 1);
}

// =============================================================================
// Dirty records
// =============================================================================

#[test]
fn test_older_txg_keeps_its_contents() {
    let (cache, _store) = memory_cache();
    let obj = object(4, 1, 1);
    let handle = cache.acquire(&obj, 0, 0).unwrap();

    let first = cache.dirty(&handle, 1);
    handle.write(0, b"gen1").unwrap();
    assert_eq!(&handle.read_bytes().unwrap()[..4], b"gen1");

    let second = cache.dirty(&handle, 2);
    handle.write(0, b"gen2").unwrap();

    assert_eq!(&first.read_data().unwrap()[..4], b"gen1");
    assert_eq!(&second.read_data().unwrap()[..4], b"gen2");
    assert_eq!(handle.dirty_count(), 2);

    cache.sync_txg(1);
    cache.sync_txg(2);
    drop(handle);
    assert_eq!(&read_block(&cache, &obj, 0)[..4], b"gen2");
}

#[test]
fn test_dirty_twice_in_one_txg() {
    let (cache, _store) = memory_cache();
    let obj = object(5, 1, 1);
    let handle = cache.acquire(&obj, 0, 0).unwrap();

    let a = cache.dirty(&handle, 3);
    let b = cache.dirty(&handle, 3);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(handle.dirty_count(), 1);
    assert_eq!(handle.hold_count(), 2);
    assert_eq!(obj.dirty_record_count(3), 1);
}

#[test]
fn test_dirty_propagates_to_parent() {
    let (cache, _store) = memory_cache();
    let obj = object(6, 2, 1);
    let handle = cache.acquire(&obj, 0, 3).unwrap();
    let record = cache.dirty(&handle, 4);

    let parent = cache.acquire(&obj, 1, 0).unwrap();
    assert!(parent.is_dirty());
    let parent_record = parent.dirty_record(4).unwrap();
    assert!(parent_record.has_child(&record));
    assert!(Arc::ptr_eq(&record.parent().unwrap(), &parent_record));
    // Only the top of the tree is queued on the object.
    assert_eq!(obj.dirty_record_count(4), 1);
}

// =============================================================================
// Sync and round trips
// =============================================================================

#[test]
fn test_round_trip_after_eviction() {
    let (cache, store) = memory_cache();
    let obj = object(7, 2, 1);
    write_block(&cache, &obj, 0, 0x5a, 5);

    let summary = cache.sync_txg(5);
    assert_eq!(summary.blocks_written, 2);
    assert!(!obj.root_ptr(0).is_hole());
    assert_eq!(cache.evict_object(&obj), 2);
    assert_eq!(obj.buffer_count(), 0);

    let reads_before = store.stats().reads;
    assert_eq!(read_block(&cache, &obj, 0), vec![0x5a; 512]);
    assert!(store.stats().reads > reads_before);
}

#[test]
fn test_generations_write_separate_blocks() {
    let store = Arc::new(MemoryStore::new());
    let cache = DbufCache::new(config(), store.clone(), Arc::new(TxgManager::new(5))).unwrap();
    let obj = object(8, 1, 1);

    let handle = cache.acquire(&obj, 0, 0).unwrap();
    cache.dirty(&handle, 5);
    handle.write(0, b"AAAA").unwrap();
    let snapshot = handle.data_ref().unwrap();
    drop(handle);
    cache.sync_txg(5);
    let gen5 = obj.root_ptr(0);
    assert_eq!(&store.block(&gen5).unwrap()[..4], b"AAAA");

    let handle = cache.acquire(&obj, 0, 0).unwrap();
    cache.read(&handle, ReadFlags::default()).unwrap();
    cache.dirty(&handle, 6);
    handle.write(0, b"BBBB").unwrap();
    assert_eq!(&snapshot.read()[..4], b"AAAA");
    drop(handle);
    cache.sync_txg(6);

    let gen6 = obj.root_ptr(0);
    assert!(!gen6.same_block(&gen5));
    assert_eq!(&store.block(&gen6).unwrap()[..4], b"BBBB");
    assert!(store.freed().iter().any(|(bp, txg)| bp.same_block(&gen5) && *txg == 6));
    assert_eq!(&read_block(&cache, &obj, 0)[..4], b"BBBB");
}

#[test]
fn test_unchanged_block_is_rewritten_in_place() {
    let (cache, store) = memory_cache();
    let obj = object(9, 1, 1);
    write_block(&cache, &obj, 0, 7, 1);
    cache.sync_txg(1);
    let before = obj.root_ptr(0);

    let handle = cache.acquire(&obj, 0, 0).unwrap();
    cache.dirty(&handle, 2);
    drop(handle);
    let summary = cache.sync_txg(2);

    assert_eq!(summary.rewrites, 1);
    assert!(obj.root_ptr(0).same_block(&before));
    assert!(store.freed().is_empty());
}

#[test]
fn test_bonus_copied_at_sync() {
    let (cache, _store) = memory_cache();
    let obj = object(10, 1, 1);
    let bonus = cache.acquire_bonus(&obj);
    cache.dirty(&bonus, 1);
    bonus.write(0, b"attrs").unwrap();
    drop(bonus);

    let summary = cache.sync_txg(1);
    assert_eq!(summary.bonus_copied, 1);
    assert_eq!(summary.blocks_written, 0);
    assert_eq!(&obj.bonus_bytes()[..5], b"attrs");
}

#[test]
fn test_externally_written_block_is_adopted() {
    let (cache, store) = memory_cache();
    let obj = object(11, 1, 1);
    let handle = cache.acquire(&obj, 0, 0).unwrap();
    cache.dirty(&handle, 1);
    handle.write(0, b"direct").unwrap();

    let record = cache.begin_external_write(&handle, 1).unwrap();
    assert_eq!(record.override_state(), OverrideState::PendingExternalWrite);
    let bp = store.write_external(&handle.read_bytes().unwrap(), 1, 0);
    cache.complete_external_write(&handle, &record, Some(bp));
    assert_eq!(record.override_state(), OverrideState::Overridden(bp));
    drop(handle);

    cache.sync_txg(1);
    assert!(obj.root_ptr(0).same_block(&bp));
    assert_eq!(store.stats().overrides, 1);
}

#[test]
fn test_assigned_contents_written() {
    let (cache, store) = memory_cache();
    let obj = object(12, 1, 2);
    let handle = cache.acquire(&obj, 0, 1).unwrap();
    let data = BlockRef::from_bytes(&[3u8; 512], false);
    assert!(data.is_frozen());
    let kept = data.clone();
    cache.assign(&handle, data, 1);
    assert_eq!(handle.state(), DbufState::Cached);

    // The caller's copy is not written through.
    handle.write(0, &[4u8; 8]).unwrap();
    assert_eq!(kept.to_vec(), vec![3u8; 512]);
    drop(handle);

    cache.sync_txg(1);
    let mut expected = vec![3u8; 512];
    expected[..8].fill(4);
    assert_eq!(store.block(&obj.root_ptr(1)).unwrap().to_vec(), expected);
}

// =============================================================================
// Fill transitions
// =============================================================================

#[test]
fn test_will_fill_skips_read() {
    let (cache, store) = memory_cache();
    let obj = object(21, 1, 1);
    write_block(&cache, &obj, 0, 0x33, 1);
    cache.sync_txg(1);
    cache.evict_object(&obj);
    let reads = store.stats().reads;

    let handle = cache.acquire(&obj, 0, 0).unwrap();
    assert_eq!(handle.state(), DbufState::Uncached);
    cache.will_fill(&handle, 2);
    assert_eq!(handle.state(), DbufState::Filling);
    handle.write(0, &[0x44; 512]).unwrap();
    cache.fill_done(&handle);
    assert_eq!(handle.state(), DbufState::Cached);
    assert_eq!(store.stats().reads, reads);
    drop(handle);

    cache.sync_txg(2);
    assert_eq!(store.block(&obj.root_ptr(0)).unwrap().to_vec(), vec![0x44; 512]);
}

#[test]
fn test_will_not_fill_becomes_cached_hole() {
    let (cache, store) = memory_cache();
    let obj = object(22, 1, 2);
    let handle = cache.acquire(&obj, 0, 1).unwrap();

    let record = cache.will_not_fill(&handle, 1);
    assert_eq!(handle.state(), DbufState::NoFill);
    assert!(record.data().is_none());
    assert!(handle.read_bytes().is_err());

    cache.fill_done(&handle);
    assert_eq!(handle.state(), DbufState::Cached);
    assert!(handle.data_ref().unwrap().is_hole());
    drop(handle);

    let summary = cache.sync_txg(1);
    assert_eq!(summary.blocks_written, 1);
    assert!(!obj.root_ptr(1).is_hole());
    assert_eq!(store.stats().reads, 0);
}

#[test]
fn test_free_during_fill_completes_as_zeros() {
    let (cache, _store) = memory_cache();
    let obj = object(23, 1, 4);
    let handle = cache.acquire(&obj, 0, 2).unwrap();
    let record = cache.will_fill(&handle, 4);
    handle.write(0, &[0x66; 512]).unwrap();

    cache.free_range(&obj, 2, 2, 4);
    assert_eq!(handle.state(), DbufState::Filling);

    cache.fill_done(&handle);
    assert_eq!(handle.state(), DbufState::Cached);
    assert!(handle.read_bytes().unwrap().iter().all(|&b| b == 0));
    assert!(record.read_data().unwrap().iter().all(|&b| b == 0));
    drop(handle);

    cache.sync_txg(4);
    cache.evict_object(&obj);
    assert!(read_block(&cache, &obj, 2).iter().all(|&b| b == 0));
}

#[test]
fn test_uncacheable_blocks_leave_on_release() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_on(
        store,
        CacheConfig {
            cache_policy: CachePolicy::Metadata,
            ..config()
        },
    );
    let obj = object(13, 1, 1);
    write_block(&cache, &obj, 0, 1, 1);
    cache.sync_txg(1);

    assert_eq!(obj.buffer_count(), 0);
    assert_eq!(cache.stats().tier_resident_bytes, 0);
}

#[test]
fn test_sequential_reads_prefetch_ahead() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_on(
        store,
        CacheConfig {
            prefetch: true,
            prefetch_depth: 2,
            ..config()
        },
    );
    let obj = object(20, 2, 1);
    for blkid in 0..4 {
        write_block(&cache, &obj, blkid, 0x10 + blkid as u8, 1);
    }
    cache.sync_txg(1);
    cache.evict_object(&obj);

    assert_eq!(read_block(&cache, &obj, 0), vec![0x10; 512]);
    assert_eq!(read_block(&cache, &obj, 1), vec![0x11; 512]);
    assert_eq!(cache.stats().prefetch_issued, 1);

    assert_eq!(read_block(&cache, &obj, 2), vec![0x12; 512]);
    assert_eq!(cache.stats().prefetch_hits, 1);
}

// =============================================================================
// Frees and resizing
// =============================================================================

#[test]
fn test_free_races_inflight_read() {
    let (cache, store) = memory_cache();
    let obj = object(14, 2, 1);
    write_block(&cache, &obj, 15, 0xee, 6);
    cache.sync_txg(6);

    // Keep the indirect block cached so only the data read is deferred.
    let parent = cache.acquire(&obj, 1, 0).unwrap();
    cache.read(&parent, ReadFlags::default()).unwrap();
    cache.evict_object(&obj);

    store.defer_reads(true);
    let handle = cache.acquire(&obj, 0, 15).unwrap();
    cache.read(&handle, ReadFlags::default().no_wait()).unwrap();
    assert_eq!(handle.state(), DbufState::Reading);

    cache.free_range(&obj, 10, 20, 7);
    assert_eq!(store.complete_deferred_reads(), 1);

    assert_eq!(handle.state(), DbufState::Cached);
    assert!(handle.read_bytes().unwrap().iter().all(|&b| b == 0));
    cache.read(&handle, ReadFlags::default()).unwrap();

    drop(handle);
    drop(parent);
    store.defer_reads(false);
    let summary = cache.sync_txg(7);
    assert_eq!(summary.blocks_freed, 1);
    assert!(read_block(&cache, &obj, 15).iter().all(|&b| b == 0));
}

#[test]
fn test_free_undirties_unheld_block() {
    let (cache, _store) = memory_cache();
    let obj = object(15, 1, 4);
    write_block(&cache, &obj, 2, 9, 3);

    cache.free_range(&obj, 0, 3, 3);
    assert_eq!(cache.stats().undirtied, 1);

    let summary = cache.sync_txg(3);
    assert_eq!(summary.blocks_written, 0);
    assert!(obj.root_ptr(2).is_hole());
}

#[test]
fn test_free_zeroes_held_dirty_block() {
    let (cache, store) = memory_cache();
    let obj = object(16, 1, 4);
    let handle = cache.acquire(&obj, 0, 1).unwrap();
    cache.dirty(&handle, 3);
    handle.write(0, &[4u8; 512]).unwrap();

    cache.free_range(&obj, 0, 3, 3);
    assert!(handle.read_bytes().unwrap().iter().all(|&b| b == 0));
    drop(handle);

    let summary = cache.sync_txg(3);
    assert_eq!(summary.blocks_written, 1);
    assert_eq!(store.block(&obj.root_ptr(1)).unwrap().to_vec(), vec![0u8; 512]);
}

#[test]
fn test_resize_keeps_prefix() {
    let (cache, store) = memory_cache();
    let obj = object(17, 1, 1);
    let handle = cache.acquire(&obj, 0, 0).unwrap();
    cache.dirty(&handle, 9);
    handle.write(0, &[7u8; 512]).unwrap();

    cache.new_size(&handle, 2048, 9).unwrap();
    assert_eq!(handle.size(), 2048);
    let bytes = handle.read_bytes().unwrap();
    assert!(bytes[..512].iter().all(|&b| b == 7));
    assert!(bytes[512..].iter().all(|&b| b == 0));
    drop(handle);

    cache.sync_txg(9);
    assert_eq!(store.block(&obj.root_ptr(0)).unwrap().len(), 2048);
    assert_eq!(obj.used_bytes(), 2048);
}

// =============================================================================
// Stress and file store
// =============================================================================

#[test]
fn test_concurrent_writers_overlap_sync() {
    const WRITERS: u64 = 4;
    const BLOCKS_PER_WRITER: u64 = 16;
    const ROUNDS: u64 = 12;

    let (cache, _store) = memory_cache();
    let obj = object(18, 2, 1);
    let mut model: HashMap<u64, u8> = HashMap::new();
    let mut rng = rand::thread_rng();

    for txg in 1..=ROUNDS {
        let syncer = (txg > 1).then(|| {
            let cache = cache.clone();
            thread::spawn(move || cache.sync_txg(txg - 1))
        });
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let cache = cache.clone();
                let obj = obj.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut written = Vec::new();
                    for i in 0..BLOCKS_PER_WRITER {
                        if rng.gen_bool(0.5) {
                            let blkid = w * BLOCKS_PER_WRITER + i;
                            let fill = rng.gen::<u8>();
                            write_block(&cache, &obj, blkid, fill, txg);
                            written.push((blkid, fill));
                        }
                    }
                    written
                })
            })
            .collect();
        for writer in writers {
            model.extend(writer.join().unwrap());
        }
        if let Some(syncer) = syncer {
            syncer.join().unwrap();
        }

        if rng.gen_bool(0.25) {
            let start = rng.gen_range(0..WRITERS * BLOCKS_PER_WRITER);
            let end = start + rng.gen_range(0..8);
            cache.free_range(&obj, start, end, txg);
            for blkid in start..=end {
                model.remove(&blkid);
            }
        }
    }
    cache.sync_txg(ROUNDS);
    cache.evict_object(&obj);

    for blkid in 0..WRITERS * BLOCKS_PER_WRITER {
        let expected = model.get(&blkid).copied().unwrap_or(0);
        let bytes = read_block(&cache, &obj, blkid);
        assert!(
            bytes.iter().all(|&b| b == expected),
            "block {} expected {:#x}",
            blkid,
            expected
        );
    }
}

#[test]
fn test_free_waits_for_holder_to_dirty() {
    let (cache, store) = memory_cache();
    let obj = object(24, 1, 1);
    write_block(&cache, &obj, 0, 0x11, 1);
    cache.sync_txg(1);

    let handle = cache.acquire(&obj, 0, 0).unwrap();
    cache.read(&handle, ReadFlags::default()).unwrap();

    let freer = {
        let cache = cache.clone();
        let obj = obj.clone();
        thread::spawn(move || cache.free_range(&obj, 0, 0, 2))
    };
    // The free takes its own hold while it waits.
    while handle.hold_count() < 2 {
        thread::yield_now();
    }
    assert!(!freer.is_finished());

    cache.dirty(&handle, 2);
    freer.join().unwrap();
    // Still held, so the block is zeroed in place and written.
    assert!(handle.read_bytes().unwrap().iter().all(|&b| b == 0));
    assert!(handle.dirty_record(2).is_some());
    drop(handle);

    let summary = cache.sync_txg(2);
    assert_eq!(summary.blocks_written, 1);
    assert_eq!(store.block(&obj.root_ptr(0)).unwrap().to_vec(), vec![0u8; 512]);
}

#[test]
fn test_concurrent_writers_and_free_of_same_blocks() {
    const WRITERS: usize = 6;
    const ITERATIONS: usize = 200;
    const BLOCKS: u64 = 4;

    let (cache, _store) = memory_cache();
    let obj = object(25, 1, BLOCKS as usize);
    let start = Arc::new(Barrier::new(WRITERS + 1));
    let txg = 3;

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let cache = cache.clone();
            let obj = obj.clone();
            let start = start.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                start.wait();
                for _ in 0..ITERATIONS {
                    let blkid = rng.gen_range(0..BLOCKS);
                    write_block(&cache, &obj, blkid, rng.gen_range(1..=u8::MAX), txg);
                }
            })
        })
        .collect();
    let freer = {
        let cache = cache.clone();
        let obj = obj.clone();
        let start = start.clone();
        thread::spawn(move || {
            start.wait();
            for _ in 0..ITERATIONS {
                cache.free_range(&obj, 0, BLOCKS - 1, txg);
                thread::yield_now();
            }
        })
    };
    for writer in writers {
        writer.join().unwrap();
    }
    freer.join().unwrap();

    cache.sync_txg(txg);
    cache.evict_object(&obj);
    assert_eq!(obj.buffer_count(), 0);
    for blkid in 0..BLOCKS {
        let bytes = read_block(&cache, &obj, blkid);
        assert!(
            bytes.iter().all(|&b| b == bytes[0]),
            "block {} holds a torn write",
            blkid
        );
    }
}

#[test]
fn test_file_store_round_trip() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        FileBlockStore::open(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..StoreConfig::default()
        })
        .unwrap(),
    );
    let cache = cache_on(store.clone(), config());
    let obj = object(19, 2, 1);

    for blkid in 0..4 {
        write_block(&cache, &obj, blkid, blkid as u8 + 1, 1);
    }
    let summary = cache.sync_txg(1);
    assert_eq!(summary.blocks_written, 5);
    store.flush().unwrap();

    cache.evict_object(&obj);
    for blkid in 0..4 {
        assert_eq!(read_block(&cache, &obj, blkid), vec![blkid as u8 + 1; 512]);
    }
}
