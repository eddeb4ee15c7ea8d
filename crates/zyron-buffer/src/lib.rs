//! Block buffer cache for Zyron objects.
//!
//! This crate provides the in-memory cache of an object's logical blocks with:
//! - A concurrent address index from (object, level, block) to buffer
//! - Per-buffer state machine with hold counting and waiters
//! - Dirty records per transaction group, copy-on-write across txgs
//! - Range frees, block resizing and externally written blocks
//! - Txg sync writing children before their indirect parents
//! - A clock cache tier for unreferenced contents and sequential prefetch

mod buffer;
mod cache;
mod data;
mod dirty;
mod free;
mod index;
mod object;
mod prefetch;
mod read;
mod sync;
mod tier;
mod txg;

pub use buffer::{BufferId, BufferUser, DbufState, ReadCallback};
pub use cache::{CacheStats, DbufCache, DbufHandle};
pub use data::BlockRef;
pub use dirty::{DirtyRecord, OverrideState};
pub use object::{Object, ObjectLayout, ObjectPhys, RangeSet, MAX_LEVELS, MAX_ROOT_PTRS};
pub use prefetch::{AccessPredictor, SequentialPredictor};
pub use read::ReadFlags;
pub use sync::SyncSummary;
pub use tier::{CacheTier, ClockTier, EvictCallback, EvictStatus, Reactivation, TierStats};
pub use txg::{TxCoordinator, TxgManager};
