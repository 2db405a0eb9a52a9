// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use parking_lot::Mutex;

use crate::Error;

/// Per-size-class occupancy snapshot, named to match the spec's stats table
/// (`itemSize, totalCount, usedCount, freeCount`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStatistics {
    pub item_size: usize,
    pub total_count: usize,
    pub used_count: usize,
    pub free_count: usize,
}

/// State of a single fixed-size region of the engine. A bucket holds exactly
/// one size class at a time; `class` is `None` for a bucket that has never
/// been assigned (equivalent to "all free, any class").
struct BucketState {
    class: Option<usize>,
    /// Stack of free slot indices within this bucket, valid only while
    /// `class.is_some()`.
    free_slots: Vec<u32>,
    used_count: usize,
}

impl BucketState {
    fn unassigned() -> Self {
        Self {
            class: None,
            free_slots: Vec::new(),
            used_count: 0,
        }
    }

    fn is_all_free(&self) -> bool {
        self.used_count == 0
    }

    /// (Re-)assigns this bucket to `class_idx`, sized for `slot_count` slots.
    fn assign(&mut self, class_idx: usize, slot_count: usize) {
        debug_assert!(self.is_all_free());
        self.class = Some(class_idx);
        self.free_slots = (0..slot_count as u32).rev().collect();
        self.used_count = 0;
    }
}

/// Partitions a fixed-capacity byte range into power-of-two-ish size classes
/// with free-list management, per §4.2. Uses a single `parking_lot::Mutex`
/// over the allocator's bookkeeping metadata (bucket assignment and free
/// lists) rather than per-bucket locks: allocation/free are metadata-only
/// operations with no I/O, so a single short critical section is both
/// simplest and fast enough, in the spirit of `forest_db`'s `RollingStore`
/// guarding its whole bucket map behind one `RwLock`.
pub struct BucketAllocator {
    size_classes: Vec<usize>,
    bucket_capacity: u64,
    num_buckets: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    buckets: Vec<BucketState>,
    /// Indices of buckets currently assigned to each class.
    class_buckets: Vec<Vec<usize>>,
    /// Indices of buckets that have never been assigned to any class.
    unassigned: Vec<usize>,
    total_count: Vec<usize>,
    used_count: Vec<usize>,
    used_size: u64,
}

/// Number of slots a bucket of the largest size class holds; also fixes
/// `bucket_capacity` for every other class (a bucket is always the same
/// number of bytes regardless of which class currently owns it).
const SLOTS_PER_BUCKET_OF_LARGEST_CLASS: u64 = 64;

impl BucketAllocator {
    /// Builds an allocator over `capacity` bytes using `size_classes`
    /// (already validated strictly increasing and positive by
    /// [`crate::config::BucketCacheConfig::validate`]).
    pub fn new(capacity: u64, size_classes: Vec<usize>) -> Self {
        let largest = *size_classes.last().expect("non-empty, validated");
        let bucket_capacity = largest as u64 * SLOTS_PER_BUCKET_OF_LARGEST_CLASS;
        let num_buckets = (capacity / bucket_capacity) as usize;
        let buckets = (0..num_buckets).map(|_| BucketState::unassigned()).collect();
        let unassigned = (0..num_buckets).collect();
        let n_classes = size_classes.len();
        Self {
            size_classes,
            bucket_capacity,
            num_buckets,
            inner: Mutex::new(Inner {
                buckets,
                class_buckets: vec![Vec::new(); n_classes],
                unassigned,
                total_count: vec![0; n_classes],
                used_count: vec![0; n_classes],
                used_size: 0,
            }),
        }
    }

    fn class_index_for(&self, len: usize) -> Result<usize, Error> {
        self.size_classes
            .iter()
            .position(|&s| s >= len)
            .ok_or(Error::CacheFull(len))
    }

    fn slot_count(&self, class_idx: usize) -> usize {
        (self.bucket_capacity / self.size_classes[class_idx] as u64) as usize
    }

    /// Allocates a range able to hold `len` bytes. Chooses the smallest size
    /// class `>= len`, converting an all-free bucket of another class if the
    /// chosen class has no free slot, per §4.2.
    pub fn allocate(&self, len: usize) -> Result<u64, Error> {
        let class_idx = self.class_index_for(len)?;
        let mut inner = self.inner.lock();

        if let Some(offset) = self.try_alloc_in_class(&mut inner, class_idx) {
            return Ok(offset);
        }

        if self.try_convert_bucket(&mut inner, class_idx) {
            if let Some(offset) = self.try_alloc_in_class(&mut inner, class_idx) {
                return Ok(offset);
            }
        }

        Err(Error::NoSpaceInThisSizeClass)
    }

    fn try_alloc_in_class(&self, inner: &mut Inner, class_idx: usize) -> Option<u64> {
        for &bucket_idx in &inner.class_buckets[class_idx] {
            let bucket = &mut inner.buckets[bucket_idx];
            if let Some(slot) = bucket.free_slots.pop() {
                bucket.used_count += 1;
                inner.used_count[class_idx] += 1;
                inner.used_size += self.size_classes[class_idx] as u64;
                let offset = bucket_idx as u64 * self.bucket_capacity
                    + slot as u64 * self.size_classes[class_idx] as u64;
                return Some(offset);
            }
        }
        None
    }

    /// Finds an all-free bucket (unassigned, or assigned to another class
    /// but currently empty) and converts it to `class_idx`.
    fn try_convert_bucket(&self, inner: &mut Inner, class_idx: usize) -> bool {
        let candidate = if let Some(idx) = inner.unassigned.pop() {
            Some(idx)
        } else {
            let mut found = None;
            for other in 0..self.size_classes.len() {
                if other == class_idx {
                    continue;
                }
                if let Some(pos) = inner.class_buckets[other]
                    .iter()
                    .position(|&b| inner.buckets[b].is_all_free())
                {
                    let bucket_idx = inner.class_buckets[other].remove(pos);
                    inner.total_count[other] -= self.slot_count(other);
                    found = Some(bucket_idx);
                    break;
                }
            }
            found
        };

        match candidate {
            Some(bucket_idx) => {
                let slots = self.slot_count(class_idx);
                inner.buckets[bucket_idx].assign(class_idx, slots);
                inner.class_buckets[class_idx].push(bucket_idx);
                inner.total_count[class_idx] += slots;
                true
            }
            None => false,
        }
    }

    /// Returns `offset`'s slot to its bucket's free list. A bucket that
    /// becomes fully free remains assigned to its class; it is only
    /// reclaimed lazily, the next time some other class needs to convert it.
    pub fn free(&self, offset: u64) -> Result<(), Error> {
        let bucket_idx = (offset / self.bucket_capacity) as usize;
        let mut inner = self.inner.lock();
        let class_idx = inner.buckets[bucket_idx]
            .class
            .ok_or_else(|| Error::Other(format!("free() on unassigned bucket at offset {offset}")))?;
        let item_size = self.size_classes[class_idx] as u64;
        let within_bucket = offset % self.bucket_capacity;
        let slot = (within_bucket / item_size) as u32;

        let bucket = &mut inner.buckets[bucket_idx];
        bucket.free_slots.push(slot);
        bucket.used_count -= 1;
        inner.used_count[class_idx] -= 1;
        inner.used_size -= item_size;
        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        self.num_buckets as u64 * self.bucket_capacity
    }

    pub fn used_size(&self) -> u64 {
        self.inner.lock().used_size
    }

    pub fn free_size(&self) -> u64 {
        self.total_size() - self.used_size()
    }

    pub fn size_classes(&self) -> &[usize] {
        &self.size_classes
    }

    pub fn statistics(&self) -> Vec<IndexStatistics> {
        let inner = self.inner.lock();
        self.size_classes
            .iter()
            .enumerate()
            .map(|(i, &item_size)| IndexStatistics {
                item_size,
                total_count: inner.total_count[i],
                used_count: inner.used_count[i],
                free_count: inner.total_count[i] - inner.used_count[i],
            })
            .collect()
    }
}
