// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::allocator::BucketAllocator;
use crate::engine::IoEngine;
use crate::errors::Error;
use crate::eviction::{BackingMap, EvictionEngine};
use crate::index::SecondaryIndex;
use crate::io_error::IoErrorController;
use crate::key::{BlockKey, BucketEntry, Priority, RamEntry};
use crate::metrics;
use crate::offset_lock::SparseOffsetLock;
use crate::staging::RamStagingTable;

/// State a writer worker shares with every other worker and with the
/// `BucketCache` facade. One instance is created per cache and `Arc`'d out to
/// each worker thread, matching the shared-state-plus-named-thread shape of
/// `forest_db`'s background GC loop.
pub struct WriterShared {
    pub engine: Box<dyn IoEngine>,
    pub allocator: BucketAllocator,
    pub backing: BackingMap,
    pub staging: RamStagingTable,
    pub offset_lock: SparseOffsetLock,
    pub index: SecondaryIndex,
    pub eviction: EvictionEngine,
    pub io_errors: IoErrorController,
    pub enabled: AtomicBool,
    pub access_seq: AtomicU64,
    pub acceptable_size: u64,
}

impl WriterShared {
    pub fn next_access_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        log::error!("bucket cache disabled after sustained I/O errors");
    }

    fn maybe_free_space(&self) {
        if self
            .eviction
            .over_acceptable(self.allocator.used_size(), self.allocator.total_size())
        {
            let stats = self
                .eviction
                .free_space(&self.backing, &self.allocator, &self.offset_lock, &self.index);
            log::debug!(
                "free_space evicted {} blocks ({} bytes)",
                stats.evicted_blocks,
                stats.evicted_bytes
            );
        }
    }
}

/// One worker thread per writer queue. Drains its queue's pending keys out of
/// RAM staging in batches, allocates and writes each, syncs the engine once
/// per batch, and commits the whole batch into the backing map -- or rolls it
/// back entirely on a sync failure, per §4.5.
pub struct WriterWorker {
    handle: Option<JoinHandle<()>>,
}

impl WriterWorker {
    pub fn spawn(idx: usize, shared: Arc<WriterShared>, rx: Receiver<BlockKey>, shutdown: Arc<AtomicBool>) -> Self {
        let handle = thread::Builder::new()
            .name(format!("bucket-cache-writer-{idx}"))
            .spawn(move || run(shared, rx, shutdown))
            .expect("spawning a writer worker thread");
        Self { handle: Some(handle) }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<WriterShared>, rx: Receiver<BlockKey>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            // Drain whatever is left without blocking, as one final batch.
            let mut batch = Vec::new();
            while let Ok(key) = rx.try_recv() {
                batch.push(key);
            }
            if !batch.is_empty() {
                batch.reverse();
                process_batch(&shared, batch);
            }
            return;
        }
        match crate::staging::recv_timeout(&rx, Duration::from_millis(200)) {
            Some(first) => {
                let mut batch = vec![first];
                while let Ok(key) = rx.try_recv() {
                    batch.push(key);
                }
                // LIFO: the most recently queued key in this batch is
                // committed first, per §4.5 step 3.
                batch.reverse();
                process_batch(&shared, batch);
            }
            None => continue,
        }
    }
}

/// One entry successfully allocated and written, awaiting the batch's single
/// `sync()` before it can be committed (or rolled back) as a unit.
struct PreparedEntry {
    key: BlockKey,
    offset: u64,
    length: u32,
    priority: Priority,
}

impl PreparedEntry {
    fn new(key: BlockKey, offset: u64, length: u32, priority: Priority) -> Self {
        Self { key, offset, length, priority }
    }
}

/// Commits a batch of staged keys as a unit, per §4.5 steps 1-7: each key is
/// individually removed from staging, allocated, and written; the engine is
/// synced exactly once for the whole batch; success commits every prepared
/// entry into the backing map, failure frees every allocated offset and
/// commits nothing.
fn process_batch(shared: &WriterShared, batch: Vec<BlockKey>) {
    if batch.is_empty() {
        return;
    }

    let mut prepared = Vec::with_capacity(batch.len());
    for key in batch {
        let Some((ram, priority)) = shared.staging.remove(&key) else {
            continue;
        };
        if let Some(entry) = allocate_and_write(shared, &key, &ram, priority.get()) {
            prepared.push(entry);
        }
    }

    if prepared.is_empty() {
        return;
    }

    if let Err(e) = shared.engine.sync() {
        for entry in &prepared {
            let _ = shared.allocator.free(entry.offset);
            metrics::FAILED_BLOCK_ADDITIONS.inc();
            log::warn!("rolling back block {:?}: batch sync failed", entry.key);
        }
        handle_io_error(shared, &e);
        return;
    }
    shared.io_errors.report_success();

    for entry in prepared {
        commit(shared, entry);
    }

    if shared.allocator.used_size() > shared.acceptable_size {
        shared.maybe_free_space();
    }
}

/// Allocates space for `ram`'s payload (retrying once via eviction if the
/// size class is full) and writes it to the engine. Returns `None`, after
/// accounting, if allocation or the write itself fails -- neither rolls back
/// into the batch's sync/commit step since nothing has been staked on them.
fn allocate_and_write(
    shared: &WriterShared,
    key: &BlockKey,
    ram: &RamEntry,
    priority: Priority,
) -> Option<PreparedEntry> {
    let len = ram.payload.len();
    let offset = match shared.allocator.allocate(len) {
        Ok(offset) => offset,
        Err(Error::NoSpaceInThisSizeClass) | Err(Error::CacheFull(_)) => {
            shared.maybe_free_space();
            match shared.allocator.allocate(len) {
                Ok(offset) => offset,
                Err(_) => {
                    metrics::FAILED_NO_SPACE_IN_CLASS.inc();
                    log::warn!("dropping block {:?}: no space in size class after eviction", key);
                    return None;
                }
            }
        }
        Err(e) => {
            metrics::FAILED_BLOCK_ADDITIONS.inc();
            log::warn!("dropping block {:?}: {e}", key);
            return None;
        }
    };

    if let Err(e) = shared.engine.write(&ram.payload, offset) {
        let _ = shared.allocator.free(offset);
        handle_io_error(shared, &e);
        return None;
    }

    Some(PreparedEntry::new(key.clone(), offset, len as u32, priority))
}

fn commit(shared: &WriterShared, entry: PreparedEntry) {
    let seq = shared.next_access_seq();
    let bucket_entry = match BucketEntry::new(entry.offset, entry.length, seq, entry.priority) {
        Ok(bucket_entry) => bucket_entry,
        Err(e) => {
            let _ = shared.allocator.free(entry.offset);
            log::error!("constructing bucket entry for {:?} failed: {e}", entry.key);
            return;
        }
    };

    shared.backing.insert(entry.key.clone(), bucket_entry);
    shared.index.insert(&entry.key);
    metrics::BLOCK_SIZE_BYTES.observe(entry.length as f64);
    metrics::USED_SIZE_BYTES.set(shared.allocator.used_size() as i64);
    metrics::BLOCK_COUNT.set(shared.backing.len() as i64);
}

fn handle_io_error(shared: &WriterShared, err: &Error) {
    log::error!("engine I/O error: {err}");
    if shared.io_errors.report_failure() {
        shared.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketCacheConfig;
    use crate::engine::HeapEngine;
    use std::sync::atomic::AtomicUsize;

    fn shared_for_test() -> Arc<WriterShared> {
        shared_with_engine(Box::new(HeapEngine::new(1024 * 1024)))
    }

    fn shared_with_engine(engine: Box<dyn IoEngine>) -> Arc<WriterShared> {
        let config = BucketCacheConfig {
            capacity: 1024 * 1024,
            size_classes: vec![4096],
            ..Default::default()
        };
        let acceptable_size = (config.accept_factor * config.capacity as f64) as u64;
        Arc::new(WriterShared {
            engine,
            allocator: BucketAllocator::new(config.capacity, config.size_classes.clone()),
            backing: BackingMap::default(),
            staging: RamStagingTable::new(),
            offset_lock: SparseOffsetLock::new(),
            index: SecondaryIndex::new(),
            eviction: EvictionEngine::new(&config),
            io_errors: IoErrorController::new(Duration::from_secs(60)),
            enabled: AtomicBool::new(true),
            access_seq: AtomicU64::new(0),
            acceptable_size,
        })
    }

    /// Wraps a `HeapEngine` but always fails `sync()`, to exercise the
    /// batch rollback path without a real storage backend.
    struct FailingEngine {
        inner: HeapEngine,
    }

    impl FailingEngine {
        fn new(capacity: u64) -> Self {
            Self {
                inner: HeapEngine::new(capacity),
            }
        }
    }

    impl IoEngine for FailingEngine {
        fn read(&self, dst: &mut [u8], offset: u64) -> Result<(), Error> {
            self.inner.read(dst, offset)
        }

        fn write(&self, src: &[u8], offset: u64) -> Result<(), Error> {
            self.inner.write(src, offset)
        }

        fn sync(&self) -> Result<(), Error> {
            Err(Error::Other("simulated sync failure".into()))
        }

        fn shutdown(&self) {
            self.inner.shutdown();
        }

        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }
    }

    /// Wraps a `HeapEngine` and counts `sync()` calls, to verify a batch of
    /// N entries triggers exactly one sync rather than one per entry.
    struct CountingSyncEngine {
        inner: HeapEngine,
        sync_calls: Arc<AtomicUsize>,
    }

    impl CountingSyncEngine {
        fn new(capacity: u64, sync_calls: Arc<AtomicUsize>) -> Self {
            Self {
                inner: HeapEngine::new(capacity),
                sync_calls,
            }
        }
    }

    impl IoEngine for CountingSyncEngine {
        fn read(&self, dst: &mut [u8], offset: u64) -> Result<(), Error> {
            self.inner.read(dst, offset)
        }

        fn write(&self, src: &[u8], offset: u64) -> Result<(), Error> {
            self.inner.write(src, offset)
        }

        fn sync(&self) -> Result<(), Error> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.sync()
        }

        fn shutdown(&self) {
            self.inner.shutdown();
        }

        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }
    }

    #[test]
    fn process_batch_commits_every_staged_block_into_backing_map() {
        let shared = shared_for_test();
        let keys: Vec<_> = (0..5u64)
            .map(|i| {
                let key = BlockKey::new("f", i * 256);
                shared.staging.insert(key.clone(), vec![i as u8; 4], 1, false);
                key
            })
            .collect();

        process_batch(&shared, keys.clone());

        for key in &keys {
            assert!(shared.staging.remove(key).is_none());
            assert!(shared.backing.contains_key(key));
        }
        assert_eq!(shared.index.keys_for_file("f").len(), 5);
    }

    #[test]
    fn missing_staged_entry_is_a_silent_no_op() {
        let shared = shared_for_test();
        let key = BlockKey::new("f", 256);
        process_batch(&shared, vec![key.clone()]);
        assert!(!shared.backing.contains_key(&key));
    }

    /// §8 scenario 4: a batch of 10 fails its single `engine.sync()` call.
    /// None of the 10 keys should appear in the backing map, and every
    /// offset allocated for the batch must be back in the free list.
    #[test]
    fn sync_failure_rolls_back_the_entire_batch() {
        let shared = shared_with_engine(Box::new(FailingEngine::new(1024 * 1024)));
        let free_before = shared.allocator.free_size();

        let keys: Vec<_> = (0..10u64)
            .map(|i| {
                let key = BlockKey::new("f", i * 256);
                shared.staging.insert(key.clone(), vec![i as u8; 4], 1, false);
                key
            })
            .collect();

        process_batch(&shared, keys.clone());

        for key in &keys {
            assert!(!shared.backing.contains_key(key));
        }
        assert_eq!(shared.allocator.free_size(), free_before);
        assert_eq!(shared.backing.len(), 0);
    }

    /// A batch of several prepared entries must trigger exactly one
    /// `engine.sync()` call, not one per entry.
    #[test]
    fn batch_calls_engine_sync_exactly_once() {
        let sync_calls = Arc::new(AtomicUsize::new(0));
        let shared = shared_with_engine(Box::new(CountingSyncEngine::new(1024 * 1024, sync_calls.clone())));

        let keys: Vec<_> = (0..4u64)
            .map(|i| {
                let key = BlockKey::new("f", i * 256);
                shared.staging.insert(key.clone(), vec![i as u8; 4], 1, false);
                key
            })
            .collect();
        process_batch(&shared, keys);

        assert_eq!(sync_calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared.backing.len(), 4);
    }
}
