//! Configuration structures for the Zyron buffer cache and block stores.

use crate::block::MIN_BLOCK_SIZE;
use crate::error::{Result, ZyronError};
use crate::types::CachePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the buffer cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of address index buckets (0 = size from physical memory).
    pub hash_buckets: usize,
    /// Which unreferenced blocks may stay cached.
    pub cache_policy: CachePolicy,
    /// Issue speculative reads ahead of sequential access.
    pub prefetch: bool,
    /// Number of blocks predicted ahead of a sequential reader.
    pub prefetch_depth: usize,
    /// Bytes of inactive data the cache tier keeps before reclaiming.
    pub tier_capacity_bytes: usize,
    /// Prefetched blocks held by the cache tier awaiting a real read.
    pub prefetch_slots: usize,
    /// Check buffer invariants on every hold and release.
    pub verify: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hash_buckets: 0,
            cache_policy: CachePolicy::All,
            prefetch: true,
            prefetch_depth: 1,
            tier_capacity_bytes: 64 * 1024 * 1024, // 64 MB
            prefetch_slots: 256,
            verify: cfg!(debug_assertions),
        }
    }
}

impl CacheConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.hash_buckets != 0 && !self.hash_buckets.is_power_of_two() {
            return Err(ZyronError::ConfigError(format!(
                "hash_buckets must be a power of two, got {}",
                self.hash_buckets
            )));
        }
        if self.prefetch && self.prefetch_depth == 0 {
            return Err(ZyronError::InvalidParameter {
                name: "prefetch_depth".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for the file-backed block store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the data file.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
    /// Allocation granularity in bytes.
    pub allocation_unit: usize,
    /// Maximum number of allocation units (0 = unbounded).
    pub capacity_units: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
            allocation_unit: MIN_BLOCK_SIZE,
            capacity_units: 0,
        }
    }
}

impl StoreConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.allocation_unit < MIN_BLOCK_SIZE || !self.allocation_unit.is_power_of_two() {
            return Err(ZyronError::InvalidParameter {
                name: "allocation_unit".to_string(),
                value: self.allocation_unit.to_string(),
            });
        }
        Ok(())
    }

    /// Returns the store capacity in bytes, if bounded.
    pub fn capacity_bytes(&self) -> Option<u64> {
        (self.capacity_units > 0).then(|| self.capacity_units * self.allocation_unit as u64)
    }
}
