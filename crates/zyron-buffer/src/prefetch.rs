//! Speculative read-ahead.
//!
//! An [`AccessPredictor`] watches level-0 reads and names blocks likely to
//! be read next. Their contents are read at low priority and stashed in the
//! cache tier, where the real read claims them.

use crate::buffer::BlockOffset;
use crate::cache::{CacheCounters, DbufCache};
use crate::object::Object;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use zyron_common::{BufferKey, ObjectId, Result};
use zyron_storage::{IoFlags, IoPriority, ReadRequest};

/// Upper bound on objects tracked by [`SequentialPredictor`].
const MAX_STREAMS: usize = 256;

/// Predicts upcoming block reads from the observed access pattern.
pub trait AccessPredictor: Send + Sync {
    /// Records a read of `blkid` and returns blocks worth reading ahead.
    fn observe(&self, object: ObjectId, blkid: u64) -> Vec<u64>;
}

#[derive(Debug, Clone, Copy)]
struct Stream {
    next: u64,
    run: u64,
}

/// Detects forward sequential reads per object.
///
/// After the second consecutive block of a run, predicts as many blocks
/// ahead as the run is long, up to `depth`.
pub struct SequentialPredictor {
    depth: u64,
    streams: Mutex<HashMap<ObjectId, Stream>>,
}

impl SequentialPredictor {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth as u64,
            streams: Mutex::new(HashMap::new()),
        }
    }
}

impl AccessPredictor for SequentialPredictor {
    fn observe(&self, object: ObjectId, blkid: u64) -> Vec<u64> {
        let mut streams = self.streams.lock();
        if !streams.contains_key(&object) && streams.len() >= MAX_STREAMS {
            streams.clear();
        }
        let stream = streams.entry(object).or_insert(Stream { next: blkid, run: 0 });
        if stream.next == blkid {
            stream.run += 1;
        } else {
            stream.run = 1;
        }
        stream.next = blkid.saturating_add(1);

        let ahead = (stream.run - 1).min(self.depth);
        (1..=ahead).filter_map(|d| blkid.checked_add(d)).collect()
    }
}

impl DbufCache {
    /// Feeds a level-0 read to the predictor and prefetches its guesses.
    pub(crate) fn predict(&self, obj: &Arc<Object>, blkid: u64) {
        if !self.shared.config.prefetch {
            return;
        }
        for next in self.shared.predictor.observe(obj.id(), blkid) {
            self.prefetch(obj, next);
        }
    }

    /// Starts a speculative read of a level-0 block.
    ///
    /// Nothing happens for blocks already cached, freed, or not yet
    /// written. A failed prefetch is dropped silently.
    pub fn prefetch(&self, obj: &Arc<Object>, blkid: u64) {
        if blkid > obj.max_blkid() || obj.block_freed(blkid) {
            return;
        }
        let key = BufferKey::new(obj.id(), 0, blkid);
        if self.shared.index.find(&key).is_some() {
            return;
        }

        let Ok((blkoff, parent)) = self.findoff(obj, 0, blkid, true) else {
            return;
        };
        let bp = match (blkoff, parent) {
            (BlockOffset::Root(i), _) => obj.root_ptr(i),
            (BlockOffset::Indirect(offset), Some(parent)) => {
                let bp = self.parent_ptr(&parent, offset);
                self.release(&parent);
                bp
            }
            (_, parent) => {
                if let Some(parent) = parent {
                    self.release(&parent);
                }
                return;
            }
        };
        if bp.is_hole() {
            return;
        }

        CacheCounters::bump(&self.shared.counters.prefetch_issued);
        trace!(key = %key, ptr = %bp, "prefetch issued");
        let tier = self.shared.tier.clone();
        let req = ReadRequest {
            key,
            ptr: bp,
            size: bp.size as usize,
            priority: IoPriority::Prefetch,
            flags: IoFlags {
                can_fail: true,
                speculative: true,
            },
        };
        self.shared.store.read(
            req,
            Box::new(move |result: Result<Bytes>| match result {
                Ok(bytes) => tier.stash_prefetched(&bp, bytes),
                Err(e) => trace!(key = %key, error = %e, "prefetch dropped"),
            }),
        );
    }
}
