//! File-backed block store.

use crate::alloc::ExtentAllocator;
use crate::store::{
    BlockStore, ReadDone, ReadRequest, StoreStats, WriteCallbacks, WriteOutcome, WriteRequest,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zyron_common::{BlockPtr, Result, StoreConfig, ZyronError};

/// Name of the data file inside the store directory.
const DATA_FILE: &str = "blocks.dat";

/// Stores blocks in a single data file.
///
/// A block pointer's address is the index of its first allocation unit.
/// The allocator lives in memory; reopening a store treats the existing
/// file contents as allocated.
pub struct FileBlockStore {
    /// Configuration.
    config: StoreConfig,
    /// Path to the data file.
    path: PathBuf,
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    allocator: ExtentAllocator,
    stats: StoreStats,
}

impl FileBlockStore {
    /// Opens or creates a store in `config.data_dir`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(DATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let unit = config.allocation_unit as u64;
        let used = file_size.div_ceil(unit);
        let capacity = (config.capacity_units > 0).then_some(config.capacity_units);
        debug!(path = %path.display(), used_units = used, "opened block store");

        Ok(Self {
            path,
            inner: Mutex::new(FileInner {
                file,
                allocator: ExtentAllocator::new(used, capacity),
                stats: StoreStats::default(),
            }),
            config,
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of allocated units.
    pub fn allocated_units(&self) -> u64 {
        self.inner.lock().allocator.allocated_units()
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn units_for(&self, size: usize) -> u64 {
        size.div_ceil(self.config.allocation_unit).max(1) as u64
    }

    fn offset_of(&self, addr: u64) -> u64 {
        addr * self.config.allocation_unit as u64
    }

    fn read_block(&self, inner: &mut FileInner, ptr: &BlockPtr, size: usize) -> Result<Bytes> {
        let offset = self.offset_of(ptr.addr);
        let len = if ptr.size > 0 { ptr.size as usize } else { size };
        let mut buffer = vec![0u8; len];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    fn write_block(&self, req: &WriteRequest) -> Result<WriteOutcome> {
        let mut inner = self.inner.lock();
        inner.stats.writes += 1;

        if let Some(ptr) = req.override_ptr {
            inner.stats.overrides += 1;
            return Ok(WriteOutcome {
                ptr,
                rewrite: false,
            });
        }

        if let Some(data) = &req.data {
            if !req.old.is_hole() && req.old.size as usize == req.size {
                let existing = self.read_block(&mut inner, &req.old, req.size)?;
                if existing == *data {
                    inner.stats.rewrites += 1;
                    return Ok(WriteOutcome {
                        ptr: req.old,
                        rewrite: true,
                    });
                }
            }
        }

        let units = self.units_for(req.size);
        let addr = inner.allocator.allocate(units).ok_or(ZyronError::StoreFull)?;
        let offset = self.offset_of(addr);
        inner.file.seek(SeekFrom::Start(offset))?;
        match &req.data {
            Some(data) => inner.file.write_all(data)?,
            None => inner.file.write_all(&vec![0u8; req.size])?,
        }
        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        Ok(WriteOutcome {
            ptr: BlockPtr {
                addr,
                birth: req.txg,
                fill: 1,
                size: req.size as u32,
                level: req.level,
            },
            rewrite: false,
        })
    }
}

impl BlockStore for FileBlockStore {
    fn read(&self, req: ReadRequest, done: ReadDone) {
        if req.ptr.is_hole() {
            done(Ok(Bytes::from(vec![0u8; req.size])));
            return;
        }
        let result = {
            let mut inner = self.inner.lock();
            inner.stats.reads += 1;
            if req.flags.speculative {
                inner.stats.speculative_reads += 1;
            }
            let result = self.read_block(&mut inner, &req.ptr, req.size);
            if result.is_err() {
                inner.stats.read_failures += 1;
            }
            result
        };
        done(result);
    }

    fn write(&self, req: WriteRequest, callbacks: WriteCallbacks) {
        match self.write_block(&req) {
            Ok(mut outcome) => {
                (callbacks.ready)(&mut outcome.ptr);
                (callbacks.done)(Ok(outcome));
            }
            Err(e) => {
                warn!(key = %req.key, txg = req.txg, error = %e, "block write failed");
                (callbacks.done)(Err(e));
            }
        }
    }

    fn free(&self, ptr: &BlockPtr, _txg: u64) {
        if ptr.is_hole() {
            return;
        }
        let units = self.units_for(ptr.size as usize);
        let mut inner = self.inner.lock();
        inner.allocator.free(ptr.addr, units);
        inner.stats.frees += 1;
    }

    fn stats(&self) -> StoreStats {
        self.inner.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IoFlags, IoPriority};
    use std::sync::Arc;
    use tempfile::tempdir;
    use zyron_common::{BufferKey, ObjectId};

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig {
            data_dir: dir.to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        }
    }

    fn key() -> BufferKey {
        BufferKey::new(ObjectId::new(1, 1), 0, 0)
    }

    fn write(store: &FileBlockStore, data: Vec<u8>, old: BlockPtr, txg: u64) -> Result<WriteOutcome> {
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let size = data.len();
        store.write(
            WriteRequest {
                key: key(),
                txg,
                old,
                data: Some(Bytes::from(data)),
                size,
                level: 0,
                priority: IoPriority::AsyncWrite,
                override_ptr: None,
            },
            WriteCallbacks {
                ready: Box::new(|_| {}),
                done: Box::new(move |res| *slot.lock() = Some(res)),
            },
        );
        let outcome = result.lock().take().unwrap();
        outcome
    }

    fn read(store: &FileBlockStore, ptr: BlockPtr) -> Result<Bytes> {
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        store.read(
            ReadRequest {
                key: key(),
                ptr,
                size: ptr.size as usize,
                priority: IoPriority::SyncRead,
                flags: IoFlags::default(),
            },
            Box::new(move |res| *slot.lock() = Some(res)),
        );
        let bytes = result.lock().take().unwrap();
        bytes
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileBlockStore::open(config(dir.path())).unwrap();

        let a = write(&store, vec![0xAA; 1024], BlockPtr::HOLE, 1).unwrap();
        let b = write(&store, vec![0xBB; 512], BlockPtr::HOLE, 1).unwrap();
        assert_eq!(a.ptr.addr, 0);
        assert_eq!(b.ptr.addr, 2);

        assert_eq!(&read(&store, a.ptr).unwrap()[..], &[0xAA; 1024][..]);
        assert_eq!(&read(&store, b.ptr).unwrap()[..], &[0xBB; 512][..]);
    }

    #[test]
    fn test_free_reuses_space() {
        let dir = tempdir().unwrap();
        let store = FileBlockStore::open(config(dir.path())).unwrap();

        let a = write(&store, vec![1; 512], BlockPtr::HOLE, 1).unwrap();
        let _b = write(&store, vec![2; 512], BlockPtr::HOLE, 1).unwrap();
        store.free(&a.ptr, 2);
        assert_eq!(store.allocated_units(), 1);

        let c = write(&store, vec![3; 512], BlockPtr::HOLE, 2).unwrap();
        assert_eq!(c.ptr.addr, a.ptr.addr);
    }

    #[test]
    fn test_identical_rewrite_keeps_block() {
        let dir = tempdir().unwrap();
        let store = FileBlockStore::open(config(dir.path())).unwrap();

        let a = write(&store, vec![4; 512], BlockPtr::HOLE, 1).unwrap();
        let again = write(&store, vec![4; 512], a.ptr, 2).unwrap();
        assert!(again.rewrite);
        assert_eq!(again.ptr, a.ptr);
        assert_eq!(store.stats().rewrites, 1);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let dir = tempdir().unwrap();
        let store = FileBlockStore::open(StoreConfig {
            capacity_units: 2,
            ..config(dir.path())
        })
        .unwrap();

        write(&store, vec![1; 1024], BlockPtr::HOLE, 1).unwrap();
        let err = write(&store, vec![2; 512], BlockPtr::HOLE, 1).unwrap_err();
        assert!(matches!(err, ZyronError::StoreFull));
    }

    #[test]
    fn test_reopen_preserves_blocks() {
        let dir = tempdir().unwrap();
        let ptr = {
            let store = FileBlockStore::open(config(dir.path())).unwrap();
            let a = write(&store, vec![9; 512], BlockPtr::HOLE, 1).unwrap();
            store.flush().unwrap();
            a.ptr
        };
        let store = FileBlockStore::open(config(dir.path())).unwrap();
        assert_eq!(&read(&store, ptr).unwrap()[..], &[9; 512][..]);
        let b = write(&store, vec![8; 512], BlockPtr::HOLE, 2).unwrap();
        assert_eq!(b.ptr.addr, 1);
    }
}
