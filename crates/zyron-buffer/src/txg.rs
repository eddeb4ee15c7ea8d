//! Transaction group coordination.
//!
//! The cache does not decide when transaction groups open or close; it asks
//! a [`TxCoordinator`] and reports the objects it dirtied so the sync step
//! knows what to write.

use crate::object::Object;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use zyron_common::ObjectId;

/// Source of transaction group numbers and bookkeeping of dirty objects.
pub trait TxCoordinator: Send + Sync {
    /// Returns the open txg.
    fn current_txg(&self) -> u64;

    /// Records that a top-level dirty record of `object` joined `txg`.
    fn register_dirty(&self, object: ObjectId, txg: u64);

    /// Reverses [`register_dirty`](Self::register_dirty) for a record that
    /// was dropped or synced.
    fn unregister_dirty(&self, object: ObjectId, txg: u64);

    /// Adds `object` to the set synced with `txg`.
    fn mark_object_dirty(&self, object: &Arc<Object>, txg: u64);

    /// Takes the objects dirtied in `txg`.
    fn take_dirty_objects(&self, txg: u64) -> Vec<Arc<Object>>;

    /// Called once every write of `txg` has completed.
    fn txg_synced(&self, txg: u64);
}

#[derive(Default)]
struct TxgState {
    objects: BTreeMap<u64, Vec<Arc<Object>>>,
    records: HashMap<(u64, ObjectId), usize>,
    last_synced: u64,
}

/// In-process transaction group counter.
pub struct TxgManager {
    open: AtomicU64,
    state: Mutex<TxgState>,
}

impl TxgManager {
    /// Creates a manager whose first open txg is `initial`.
    pub fn new(initial: u64) -> Self {
        assert!(initial > 0, "txg 0 is reserved for never-written blocks");
        Self {
            open: AtomicU64::new(initial),
            state: Mutex::new(TxgState::default()),
        }
    }

    /// Closes the open txg and opens the next one, returning the closed txg.
    pub fn advance(&self) -> u64 {
        let closed = self.open.fetch_add(1, Ordering::AcqRel);
        debug!(txg = closed, "txg closed");
        closed
    }

    /// Highest txg reported synced.
    pub fn last_synced(&self) -> u64 {
        self.state.lock().last_synced
    }

    /// Number of top-level dirty records registered for `txg`.
    pub fn dirty_record_count(&self, txg: u64) -> usize {
        self.state
            .lock()
            .records
            .iter()
            .filter(|((t, _), _)| *t == txg)
            .map(|(_, n)| *n)
            .sum()
    }
}

impl Default for TxgManager {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TxCoordinator for TxgManager {
    fn current_txg(&self) -> u64 {
        self.open.load(Ordering::Acquire)
    }

    fn register_dirty(&self, object: ObjectId, txg: u64) {
        *self.state.lock().records.entry((txg, object)).or_default() += 1;
    }

    fn unregister_dirty(&self, object: ObjectId, txg: u64) {
        let mut state = self.state.lock();
        let count = state
            .records
            .get_mut(&(txg, object))
            .unwrap_or_else(|| panic!("object {} not registered dirty in txg {}", object, txg));
        *count -= 1;
        if *count == 0 {
            state.records.remove(&(txg, object));
        }
    }

    fn mark_object_dirty(&self, object: &Arc<Object>, txg: u64) {
        let mut state = self.state.lock();
        let list = state.objects.entry(txg).or_default();
        if !list.iter().any(|o| Arc::ptr_eq(o, object)) {
            list.push(object.clone());
        }
    }

    fn take_dirty_objects(&self, txg: u64) -> Vec<Arc<Object>> {
        self.state.lock().objects.remove(&txg).unwrap_or_default()
    }

    fn txg_synced(&self, txg: u64) {
        let mut state = self.state.lock();
        assert!(
            txg > state.last_synced,
            "txg {} synced after txg {}",
            txg,
            state.last_synced
        );
        state.last_synced = txg;
    }
}
