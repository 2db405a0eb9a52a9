// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A point-in-time snapshot of the cache's accounting counters, matching the
/// stats table in §6. Percentages are pre-divided so a consumer can log or
/// export them without re-deriving ratios from raw counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub failed_block_additions: u64,
    pub total_size: u64,
    pub free_size: u64,
    pub used_size: u64,
    pub block_count: u64,
    pub accesses: u64,
    pub hits: u64,
    pub hit_ratio: f64,
    pub caching_accesses: u64,
    pub caching_hits: u64,
    pub caching_hit_ratio: f64,
    pub evictions: u64,
    pub evicted_blocks: u64,
    pub evicted_per_run: f64,
}

/// Running counters a [`crate::BucketCache`] updates on every `cache`/`get`
/// call and the [`StatsLogger`] snapshots periodically. All relaxed: these
/// feed human-facing logging and prometheus gauges, not control flow.
#[derive(Default)]
pub struct StatsCounters {
    pub accesses: AtomicU64,
    pub hits: AtomicU64,
    pub caching_accesses: AtomicU64,
    pub caching_hits: AtomicU64,
}

impl StatsCounters {
    pub fn record_access(&self, hit: bool) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_caching_access(&self, hit: bool) {
        self.caching_accesses.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.caching_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(
        &self,
        failed_block_additions: u64,
        total_size: u64,
        free_size: u64,
        used_size: u64,
        block_count: u64,
        evictions: u64,
        evicted_blocks: u64,
    ) -> CacheStats {
        let accesses = self.accesses.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        let caching_accesses = self.caching_accesses.load(Ordering::Relaxed);
        let caching_hits = self.caching_hits.load(Ordering::Relaxed);
        CacheStats {
            failed_block_additions,
            total_size,
            free_size,
            used_size,
            block_count,
            accesses,
            hits,
            hit_ratio: ratio(hits, accesses),
            caching_accesses,
            caching_hits,
            caching_hit_ratio: ratio(caching_hits, caching_accesses),
            evictions,
            evicted_blocks,
            evicted_per_run: if evictions == 0 {
                0.0
            } else {
                evicted_blocks as f64 / evictions as f64
            },
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Background thread that logs a [`CacheStats`] snapshot on a fixed period,
/// in the style of `forest_db`'s rolling-store GC loop logging its pass
/// summary at `info` level on every sweep.
pub struct StatsLogger {
    handle: Option<JoinHandle<()>>,
}

impl StatsLogger {
    pub fn spawn<F>(period: Duration, shutdown: Arc<AtomicBool>, snapshot_fn: F) -> Self
    where
        F: Fn() -> CacheStats + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("bucket-cache-stats".into())
            .spawn(move || loop {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(period);
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let stats = snapshot_fn();
                log::info!(
                    "bucket cache: {} blocks, {}/{} bytes used, hit ratio {:.3}, {} evictions ({} blocks)",
                    stats.block_count,
                    stats.used_size,
                    stats.total_size,
                    stats.hit_ratio,
                    stats.evictions,
                    stats.evicted_blocks,
                );
            })
            .expect("spawning the stats logger thread");
        Self { handle: Some(handle) }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_is_zero_with_no_accesses() {
        let counters = StatsCounters::default();
        let stats = counters.snapshot(0, 100, 100, 0, 0, 0, 0);
        assert_eq!(stats.hit_ratio, 0.0);
    }

    #[test]
    fn hit_ratio_tracks_recorded_hits() {
        let counters = StatsCounters::default();
        counters.record_access(true);
        counters.record_access(false);
        counters.record_access(true);
        let stats = counters.snapshot(0, 100, 100, 0, 0, 0, 0);
        assert!((stats.hit_ratio - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn caching_ratio_is_tracked_separately_from_overall_ratio() {
        let counters = StatsCounters::default();
        counters.record_access(true);
        counters.record_caching_access(false);
        let stats = counters.snapshot(0, 100, 100, 0, 0, 0, 0);
        assert_eq!(stats.hit_ratio, 1.0);
        assert_eq!(stats.caching_hit_ratio, 0.0);
    }
}
