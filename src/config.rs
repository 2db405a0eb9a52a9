// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

use crate::Error;

/// 32 TiB, the hard ceiling on configured capacity (§8 boundary behavior).
pub const MAX_CAPACITY_BYTES: u64 = 32 * 1024 * 1024 * 1024 * 1024;

/// Which concrete [`crate::engine::IoEngine`] backs the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Heap,
    Offheap,
}

/// Tunables for a [`crate::BucketCache`]. Mirrors the shape of
/// `forest_db::rocks_config::RocksDbConfig`: a plain, serde-(de)serializable
/// struct with a `Default` impl matching the spec's stated defaults, plus a
/// validating constructor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BucketCacheConfig {
    pub engine: EngineKind,
    /// Total capacity of the byte-store engine, in bytes. Must not exceed
    /// [`MAX_CAPACITY_BYTES`].
    pub capacity: u64,
    /// Strictly increasing, positive slot sizes. The smallest size class
    /// `>= len` is chosen for a given block.
    pub size_classes: Vec<usize>,
    /// Number of writer worker threads (and writer queues).
    pub writer_threads: usize,
    /// Bounded capacity of each writer queue.
    pub queue_capacity: usize,
    /// How long engine errors may persist before the cache disables itself.
    pub io_error_tolerance_ms: u64,
    /// How often the stats thread logs and publishes a snapshot.
    pub stats_period_secs: u64,
    pub accept_factor: f64,
    pub min_factor: f64,
    pub single_factor: f64,
    pub multi_factor: f64,
    pub memory_factor: f64,
    pub extra_free_factor: f64,
}

impl Default for BucketCacheConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Heap,
            capacity: 1024 * 1024 * 1024,
            size_classes: vec![4096, 8192, 16384, 32768, 65536, 131072],
            writer_threads: 3,
            queue_capacity: 64,
            io_error_tolerance_ms: 60_000,
            stats_period_secs: 300,
            accept_factor: 0.95,
            min_factor: 0.85,
            single_factor: 0.25,
            multi_factor: 0.50,
            memory_factor: 0.25,
            extra_free_factor: 0.10,
        }
    }
}

impl BucketCacheConfig {
    /// Validates the configuration against the invariants named in §6/§8:
    /// capacity within the 32 TiB ceiling, and a strictly increasing,
    /// non-empty, positive size-class vector.
    pub fn validate(&self) -> Result<(), Error> {
        if self.capacity > MAX_CAPACITY_BYTES {
            return Err(Error::CapacityTooLarge(self.capacity));
        }
        if self.size_classes.is_empty() || self.size_classes.iter().any(|&s| s == 0) {
            return Err(Error::InvalidSizeClasses);
        }
        if self.size_classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidSizeClasses);
        }
        Ok(())
    }

    /// The size class a buffer of `requested_len` bytes would be rounded up
    /// into, ignoring current allocator occupancy. Per-buffer size is
    /// `max(requested, size_classes[0])`.
    pub fn size_class_for(&self, requested_len: usize) -> Option<usize> {
        let requested_len = requested_len.max(self.size_classes[0]);
        self.size_classes
            .iter()
            .copied()
            .find(|&s| s >= requested_len)
    }
}
