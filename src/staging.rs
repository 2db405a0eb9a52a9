// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;

use crate::key::{AtomicPriority, BlockKey, Priority, RamEntry};

/// RAM-resident staging area a block passes through between admission and a
/// writer worker committing it into the backing map. Entries here are always
/// served on `get()` ahead of the backing map, since they are the most
/// recently admitted data.
#[derive(Default)]
pub struct RamStagingTable {
    entries: DashMap<BlockKey, (RamEntry, AtomicPriority)>,
    /// Running total of staged payload bytes (§3/§4.4 `heap_size`): bumped on
    /// admit, brought back down as entries leave staging via `remove`.
    heap_size: AtomicU64,
}

impl RamStagingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `payload` under `key`, replacing any prior staged entry for the
    /// same key. Returns the priority the entry was created with.
    pub fn insert(&self, key: BlockKey, payload: Vec<u8>, access_seq: u64, in_memory: bool) -> Priority {
        let new_len = payload.len() as u64;
        let (entry, priority) = RamEntry::new(key.clone(), payload, access_seq, in_memory);
        let initial = priority.get();
        let previous = self.entries.insert(key, (entry, priority));
        let previous_len = previous.map(|(ram, _)| ram.payload.len() as u64).unwrap_or(0);
        if new_len >= previous_len {
            self.heap_size.fetch_add(new_len - previous_len, Ordering::Relaxed);
        } else {
            self.heap_size.fetch_sub(previous_len - new_len, Ordering::Relaxed);
        }
        initial
    }

    /// Looks up `key`, bumping its access sequence and promoting its priority
    /// as a side effect of the hit (§3's priority lifecycle).
    pub fn get(&self, key: &BlockKey, access_seq: u64) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| {
            let (ram, priority) = entry.value();
            ram.bump_access(access_seq);
            priority.promote();
            ram.payload.clone()
        })
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes and returns the staged entry for `key`, if any. Used by a
    /// writer worker once it has committed the block into the backing map.
    pub fn remove(&self, key: &BlockKey) -> Option<(RamEntry, AtomicPriority)> {
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if let Some((ram, _)) = &removed {
            self.heap_size.fetch_sub(ram.payload.len() as u64, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of payload currently staged, per §3's `heap_size`.
    pub fn heap_size(&self) -> u64 {
        self.heap_size.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.heap_size.store(0, Ordering::Relaxed);
    }
}

/// Error returned when a block could not be handed to a writer queue.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("writer queue is full")]
    QueueFull,
}

/// The `N` bounded channels a [`crate::BucketCache`] hands admitted keys off
/// to. A key's shard is a deterministic hash of its [`BlockKey`], so repeated
/// writes to the same key always serialize through the same worker.
pub struct WriterQueues {
    senders: Vec<Sender<BlockKey>>,
    receivers: Vec<Receiver<BlockKey>>,
}

impl WriterQueues {
    pub fn new(num_queues: usize, capacity: usize) -> Self {
        let mut senders = Vec::with_capacity(num_queues);
        let mut receivers = Vec::with_capacity(num_queues);
        for _ in 0..num_queues {
            let (tx, rx) = bounded(capacity);
            senders.push(tx);
            receivers.push(rx);
        }
        Self { senders, receivers }
    }

    pub fn num_queues(&self) -> usize {
        self.senders.len()
    }

    pub fn shard_for(&self, key: &BlockKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Non-blocking enqueue. If it fails and `wait` is set, parks on the
    /// queue's capacity for up to 50ms and retries once before giving up.
    pub fn enqueue(&self, key: BlockKey, wait: bool) -> Result<(), EnqueueError> {
        let shard = self.shard_for(&key);
        let sender = &self.senders[shard];
        match sender.try_send(key) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(key)) if wait => sender
                .send_timeout(key, Duration::from_millis(50))
                .map_err(|_| EnqueueError::QueueFull),
            Err(_) => Err(EnqueueError::QueueFull),
        }
    }

    /// The receiving half for queue `idx`, handed to the corresponding writer
    /// worker thread at startup.
    pub fn receiver(&self, idx: usize) -> Receiver<BlockKey> {
        self.receivers[idx].clone()
    }
}

/// Blocking receive with a timeout, used by a writer worker to wake
/// periodically even with an empty queue so it can observe a shutdown flag.
pub fn recv_timeout(rx: &Receiver<BlockKey>, timeout: Duration) -> Option<BlockKey> {
    match rx.recv_timeout(timeout) {
        Ok(key) => Some(key),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => None,
    }
}
