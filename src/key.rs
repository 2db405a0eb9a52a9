// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Identity of a cached block: which file it belongs to and its byte offset
/// within that file. Equality and ordering both consider `file_id` first so
/// that entries for the same file sort together by ascending offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub file_id: String,
    pub offset: u64,
}

impl BlockKey {
    pub fn new(file_id: impl Into<String>, offset: u64) -> Self {
        Self {
            file_id: file_id.into(),
            offset,
        }
    }
}

/// Priority tier used by the eviction engine. `Single` is the entry point for
/// any freshly admitted block; a re-access promotes it to `Multi`. Blocks
/// admitted with `in_memory = true` are born `Memory` and never demote.
/// Priority is never restored once an entry is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Priority {
    Single = 0,
    Multi = 1,
    Memory = 2,
}

impl Priority {
    /// Applies the promotion rule for a re-access: `Single` becomes `Multi`,
    /// everything else is unchanged.
    pub fn promote(self) -> Self {
        match self {
            Priority::Single => Priority::Multi,
            other => other,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Priority::Single,
            1 => Priority::Multi,
            _ => Priority::Memory,
        }
    }
}

/// Atomically-updated priority cell shared by [`RamEntry`] and
/// [`BucketEntry`], so a concurrent `get()` can promote SINGLE -> MULTI
/// without taking a write lock on the whole entry.
#[derive(Debug)]
pub struct AtomicPriority(AtomicU8);

impl AtomicPriority {
    pub fn new(priority: Priority) -> Self {
        Self(AtomicU8::new(priority as u8))
    }

    pub fn get(&self) -> Priority {
        Priority::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn promote(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(Priority::from_u8(v).promote() as u8)
            });
    }
}

impl Clone for AtomicPriority {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

/// A block held in the RAM staging table, awaiting persistence by a writer
/// worker. Lives from admission until the owning worker commits it into the
/// backing map or drops it.
#[derive(Debug)]
pub struct RamEntry {
    pub key: BlockKey,
    pub payload: Vec<u8>,
    access_seq: AtomicU64,
}

impl RamEntry {
    pub fn new(key: BlockKey, payload: Vec<u8>, access_seq: u64, in_memory: bool) -> (Self, AtomicPriority) {
        let priority = AtomicPriority::new(if in_memory {
            Priority::Memory
        } else {
            Priority::Single
        });
        (
            Self {
                key,
                payload,
                access_seq: AtomicU64::new(access_seq),
            },
            priority,
        )
    }

    pub fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::Relaxed)
    }

    pub fn bump_access(&self, seq: u64) {
        self.access_seq.store(seq, Ordering::Relaxed);
    }
}

/// Compact descriptor for a persisted block, held in the backing map. The
/// offset is required to be a multiple of 256 bytes; this is enforced at
/// construction rather than encoded as a packed bitfield, since implementers
/// MAY relax the packing as long as the alignment invariant holds.
#[derive(Debug)]
pub struct BucketEntry {
    offset: u64,
    pub length: u32,
    access_seq: AtomicU64,
    priority: AtomicPriority,
}

/// Byte alignment every stored offset must satisfy.
pub const OFFSET_ALIGNMENT: u64 = 256;

impl BucketEntry {
    pub fn new(offset: u64, length: u32, access_seq: u64, priority: Priority) -> Result<Self, crate::Error> {
        if offset % OFFSET_ALIGNMENT != 0 {
            return Err(crate::Error::Misaligned(offset));
        }
        Ok(Self {
            offset,
            length,
            access_seq: AtomicU64::new(access_seq),
            priority: AtomicPriority::new(priority),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn priority(&self) -> Priority {
        self.priority.get()
    }

    pub fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::Relaxed)
    }

    /// Records an access: bumps recency and applies the SINGLE -> MULTI
    /// promotion rule (§3's priority lifecycle).
    pub fn record_access(&self, seq: u64) {
        self.access_seq.store(seq, Ordering::Relaxed);
        self.priority.promote();
    }

    /// A snapshot copy used by the eviction engine, which needs an owned,
    /// independently sortable view while it scans the backing map.
    pub fn snapshot(&self) -> BucketEntrySnapshot {
        BucketEntrySnapshot {
            offset: self.offset,
            length: self.length,
            access_seq: self.access_seq(),
            priority: self.priority(),
        }
    }
}

impl Clone for BucketEntry {
    fn clone(&self) -> Self {
        Self {
            offset: self.offset,
            length: self.length,
            access_seq: AtomicU64::new(self.access_seq()),
            priority: self.priority.clone(),
        }
    }
}

/// Owned, `Copy`-able snapshot of a [`BucketEntry`] taken under no lock other
/// than the backing map's own shard lock. Used by the eviction engine, which
/// needs a stable view of `access_seq` while it orders entries across groups.
#[derive(Debug, Clone, Copy)]
pub struct BucketEntrySnapshot {
    pub offset: u64,
    pub length: u32,
    pub access_seq: u64,
    pub priority: Priority,
}
