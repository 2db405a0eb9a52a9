// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A secondary (L2) block cache that sits between callers and a backing
//! store of immutable, content-addressed blocks. Admitted blocks are staged
//! in RAM, then asynchronously persisted by a pool of writer workers into a
//! fixed-capacity byte-store engine managed by a size-classed bucket
//! allocator. A three-priority eviction engine keeps used space under a
//! configured ceiling, and sustained engine I/O errors disable the cache
//! rather than let every call start failing individually.

pub mod allocator;
pub mod config;
pub mod engine;
pub mod errors;
pub mod eviction;
pub mod index;
pub mod io_error;
pub mod key;
pub mod metrics;
pub mod offset_lock;
pub mod staging;
pub mod stats;
pub mod writer;

pub use config::{BucketCacheConfig, EngineKind};
pub use errors::Error;
pub use key::{BlockKey, Priority};
pub use stats::CacheStats;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eviction::{BackingMap, EvictionEngine};
use index::SecondaryIndex;
use io_error::IoErrorController;
use offset_lock::SparseOffsetLock;
use staging::{RamStagingTable, WriterQueues};
use stats::{StatsCounters, StatsLogger};
use writer::{WriterShared, WriterWorker};

/// A secondary block cache over a pluggable [`engine::IoEngine`]. Cheap to
/// clone: all shared state lives behind `Arc`, so a clone is another handle
/// to the same cache, workers, and background threads.
pub struct BucketCache {
    shared: Arc<WriterShared>,
    queues: Arc<WriterQueues>,
    counters: Arc<StatsCounters>,
    workers: Vec<WriterWorker>,
    worker_shutdown: Arc<AtomicBool>,
    stats_logger: Option<StatsLogger>,
    stats_shutdown: Arc<AtomicBool>,
}

impl BucketCache {
    /// Builds a cache from `config`, allocating its engine and spawning its
    /// writer worker pool and stats logger thread. Returns an error if
    /// `config` fails [`BucketCacheConfig::validate`] or the engine cannot be
    /// constructed.
    pub fn new(config: BucketCacheConfig) -> Result<Self, Error> {
        config.validate()?;

        let engine: Box<dyn engine::IoEngine> = match config.engine {
            EngineKind::Heap => Box::new(engine::HeapEngine::new(config.capacity)),
            #[cfg(feature = "offheap")]
            EngineKind::Offheap => Box::new(engine::OffheapEngine::new_anon(config.capacity)?),
            #[cfg(not(feature = "offheap"))]
            EngineKind::Offheap => {
                return Err(Error::Other("offheap engine requires the \"offheap\" feature".into()))
            }
        };

        let allocator = allocator::BucketAllocator::new(config.capacity, config.size_classes.clone());
        let acceptable_size = (config.accept_factor * config.capacity as f64) as u64;

        let shared = Arc::new(WriterShared {
            engine,
            allocator,
            backing: BackingMap::default(),
            staging: RamStagingTable::new(),
            offset_lock: SparseOffsetLock::new(),
            index: SecondaryIndex::new(),
            eviction: EvictionEngine::new(&config),
            io_errors: IoErrorController::new(Duration::from_millis(config.io_error_tolerance_ms)),
            enabled: AtomicBool::new(true),
            access_seq: AtomicU64::new(0),
            acceptable_size,
        });

        let queues = Arc::new(WriterQueues::new(config.writer_threads, config.queue_capacity));
        let worker_shutdown = Arc::new(AtomicBool::new(false));
        let workers = (0..config.writer_threads)
            .map(|idx| {
                WriterWorker::spawn(idx, shared.clone(), queues.receiver(idx), worker_shutdown.clone())
            })
            .collect();

        let counters = Arc::new(StatsCounters::default());
        let stats_shutdown = Arc::new(AtomicBool::new(false));
        let stats_logger = if config.stats_period_secs > 0 {
            let shared_for_logger = shared.clone();
            let counters_for_logger = counters.clone();
            Some(StatsLogger::spawn(
                Duration::from_secs(config.stats_period_secs),
                stats_shutdown.clone(),
                move || snapshot(&shared_for_logger, &counters_for_logger),
            ))
        } else {
            None
        };

        Ok(Self {
            shared,
            queues,
            counters,
            workers,
            worker_shutdown,
            stats_logger,
            stats_shutdown,
        })
    }

    /// Admits a block for `file_id` at `offset` into RAM staging and hands it
    /// to a writer queue. `in_memory` pins it at MEMORY priority from birth.
    /// `wait` controls whether admission blocks briefly on a full queue
    /// (§4.4) rather than failing immediately.
    pub fn cache(
        &self,
        file_id: impl Into<String>,
        offset: u64,
        payload: Vec<u8>,
        in_memory: bool,
        wait: bool,
    ) -> Result<(), Error> {
        if !self.is_enabled() {
            return Err(Error::Other("cache is disabled".into()));
        }
        let key = BlockKey::new(file_id, offset);
        // Already committed or already staged: a no-op, per §4.4. Admitting
        // again here would hand the writer a second offset for the same key,
        // leaking the one the backing map entry already points at once it's
        // overwritten.
        if self.shared.backing.contains_key(&key) || self.shared.staging.contains(&key) {
            return Ok(());
        }
        let seq = self.shared.next_access_seq();
        self.shared.staging.insert(key.clone(), payload, seq, in_memory);
        if let Err(_) = self.queues.enqueue(key.clone(), wait) {
            self.shared.staging.remove(&key);
            metrics::FAILED_BLOCK_ADDITIONS.inc();
            return Err(Error::Other("writer queue is full".into()));
        }
        Ok(())
    }

    /// Looks up `file_id`/`offset`, checking RAM staging first and then the
    /// backing map.
    ///
    /// `caching` marks this lookup as part of a scan-resistant caching read
    /// path (§6): its hit/miss outcome is tallied separately into
    /// `caching_accesses`/`caching_hits` in addition to the overall stats.
    /// `repeat` marks this call as a repeat of an access already counted
    /// once for the same logical operation, suppressing the overall
    /// access/hit tally so it isn't counted twice.
    pub fn get(
        &self,
        file_id: &str,
        offset: u64,
        caching: bool,
        repeat: bool,
    ) -> Result<Option<Vec<u8>>, Error> {
        let key = BlockKey::new(file_id, offset);
        let seq = self.shared.next_access_seq();

        let record_hit = |hit: bool| {
            if caching {
                self.counters.record_caching_access(hit);
            }
            if !repeat {
                self.counters.record_access(hit);
            }
        };

        if let Some(payload) = self.shared.staging.get(&key, seq) {
            record_hit(true);
            metrics::HITS.inc();
            return Ok(Some(payload));
        }

        if let Some(entry) = self.shared.backing.get(&key) {
            let offset = entry.offset();
            let length = entry.length as usize;
            let _guard = self.shared.offset_lock.acquire(offset);
            let mut buf = vec![0u8; length];
            let timer = metrics::IO_HIT_LATENCY.start_timer();
            let result = self.shared.engine.read(&mut buf, offset);
            timer.observe_duration();
            match result {
                Ok(()) => {
                    entry.record_access(seq);
                    self.shared.io_errors.report_success();
                    record_hit(true);
                    metrics::HITS.inc();
                    Ok(Some(buf))
                }
                Err(e) => {
                    if self.shared.io_errors.report_failure() {
                        self.shared.disable();
                    }
                    Err(e)
                }
            }
        } else {
            record_hit(false);
            metrics::MISSES.inc();
            Ok(None)
        }
    }

    /// Evicts a single block if present, freeing its allocator slot. Returns
    /// whether a block was actually removed.
    pub fn evict(&self, file_id: &str, offset: u64) -> Result<bool, Error> {
        let key = BlockKey::new(file_id, offset);
        if self.shared.staging.remove(&key).is_some() {
            return Ok(true);
        }
        let Some((_, entry)) = self.shared.backing.remove(&key) else {
            return Ok(false);
        };
        let offset = entry.offset();
        let _guard = self.shared.offset_lock.acquire(offset);
        self.shared.index.remove(&key);
        self.shared.allocator.free(offset)?;
        Ok(true)
    }

    /// Evicts every cached block belonging to `file_id`, per §4.6's
    /// `evictBlocksByFile`: a linear scan over the secondary index for that
    /// file. Returns the number of blocks evicted.
    pub fn evict_by_file(&self, file_id: &str) -> Result<u64, Error> {
        let keys = self.shared.index.keys_for_file(file_id);
        let mut count = 0;
        for key in keys {
            if self.evict(&key.file_id, key.offset)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drops every staged and committed block without shutting down the
    /// engine or worker pool. Primarily for tests.
    pub fn clear(&self) {
        self.shared.staging.clear();
        self.shared.backing.clear();
        self.shared.index.clear();
    }

    /// Stops accepting new work, drains in-flight writer work, and shuts
    /// down the underlying engine. Idempotent.
    pub fn shutdown(&mut self) {
        self.worker_shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            worker.join();
        }
        self.stats_shutdown.store(true, Ordering::SeqCst);
        if let Some(logger) = self.stats_logger.take() {
            logger.join();
        }
        self.shared.engine.shutdown();
    }

    pub fn size(&self) -> u64 {
        self.shared.allocator.total_size()
    }

    pub fn free_size(&self) -> u64 {
        self.shared.allocator.free_size()
    }

    pub fn block_count(&self) -> u64 {
        self.shared.backing.len() as u64 + self.shared.staging.len() as u64
    }

    pub fn heap_size(&self) -> u64 {
        self.shared.staging.heap_size()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> CacheStats {
        snapshot(&self.shared, &self.counters)
    }
}

fn snapshot(shared: &WriterShared, counters: &StatsCounters) -> CacheStats {
    counters.snapshot(
        metrics::FAILED_BLOCK_ADDITIONS.get() as u64,
        shared.allocator.total_size(),
        shared.allocator.free_size(),
        shared.allocator.used_size(),
        shared.backing.len() as u64,
        metrics::EVICTIONS.get() as u64,
        metrics::EVICTED_BLOCKS.get() as u64,
    )
}

impl Drop for BucketCache {
    fn drop(&mut self) {
        if !self.workers.is_empty() || self.stats_logger.is_some() {
            self.shutdown();
        }
    }
}
