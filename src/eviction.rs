// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use dashmap::DashMap;

use crate::allocator::BucketAllocator;
use crate::config::BucketCacheConfig;
use crate::index::SecondaryIndex;
use crate::key::{BlockKey, BucketEntry, BucketEntrySnapshot, Priority};
use crate::metrics;
use crate::offset_lock::SparseOffsetLock;

/// Backing map type shared between the writer pipeline, `get()`, and the
/// eviction engine: every block that has been committed to the engine.
pub type BackingMap = DashMap<BlockKey, BucketEntry>;

/// Outcome of a single `free_space` run, used for stats/logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictionRunStats {
    pub evicted_blocks: u64,
    pub evicted_bytes: u64,
}

/// Implements §4.6's space-reclamation algorithm. Two independent
/// computations drive a run:
///
/// - A per-size-class deficit: each class wants at least
///   `free_goal_i = max(1, floor(totalCount_i * (1 - min_factor)))` free
///   slots; a class short of that contributes `(free_goal_i - free_count_i)
///   * item_size_i` bytes to the overall freeing budget `B`.
/// - A per-priority-group quota: each group has an absolute target size
///   `bucketSize = total_size * factor * min_factor`; a group's `overflow`
///   is `max(0, totalSize(group) - bucketSize)`. Groups are visited in
///   ascending overflow order in Pass 1, each contributing at most its own
///   overflow toward `B`. Pass 2 makes up any remaining shortfall by
///   continuing to evict from SINGLE and MULTI only -- MEMORY is never
///   asked for more than its own overflow.
pub struct EvictionEngine {
    accept_factor: f64,
    min_factor: f64,
    single_factor: f64,
    multi_factor: f64,
    memory_factor: f64,
    extra_free_factor: f64,
}

impl EvictionEngine {
    pub fn new(config: &BucketCacheConfig) -> Self {
        Self {
            accept_factor: config.accept_factor,
            min_factor: config.min_factor,
            single_factor: config.single_factor,
            multi_factor: config.multi_factor,
            memory_factor: config.memory_factor,
            extra_free_factor: config.extra_free_factor,
        }
    }

    /// `true` once used space has crossed the acceptable threshold and a
    /// `free_space` run should be triggered.
    pub fn over_acceptable(&self, used_size: u64, total_size: u64) -> bool {
        used_size as f64 > self.accept_factor * total_size as f64
    }

    /// Bytes the allocator's size classes collectively want freed to bring
    /// every class back up to its own free-slot goal.
    fn class_deficit_bytes(&self, allocator: &BucketAllocator) -> u64 {
        let mut total = 0u64;
        for class in allocator.statistics() {
            let free_goal = ((class.total_count as f64) * (1.0 - self.min_factor))
                .floor()
                .max(1.0) as usize;
            if class.free_count < free_goal {
                total += (free_goal - class.free_count) as u64 * class.item_size as u64;
            }
        }
        total
    }

    /// Evicts entries from `backing` to satisfy the per-size-class deficit,
    /// apportioned across priority groups by their own overflow.
    pub fn free_space(
        &self,
        backing: &BackingMap,
        allocator: &BucketAllocator,
        offset_lock: &SparseOffsetLock,
        index: &SecondaryIndex,
    ) -> EvictionRunStats {
        if !self.over_acceptable(allocator.used_size(), allocator.total_size()) {
            return EvictionRunStats::default();
        }

        let budget = self.class_deficit_bytes(allocator);
        if budget == 0 {
            return EvictionRunStats::default();
        }
        let mut remaining_budget = (budget as f64 * (1.0 + self.extra_free_factor)) as u64;

        let mut single = Vec::new();
        let mut multi = Vec::new();
        let mut memory = Vec::new();
        for entry in backing.iter() {
            let snapshot = entry.value().snapshot();
            let key = entry.key().clone();
            match snapshot.priority {
                Priority::Single => single.push((key, snapshot)),
                Priority::Multi => multi.push((key, snapshot)),
                Priority::Memory => memory.push((key, snapshot)),
            }
        }
        for group in [&mut single, &mut multi, &mut memory] {
            group.sort_unstable_by_key(|(_, s)| s.access_seq);
        }

        let total_size = allocator.total_size();
        let bucket_size = |factor: f64| (total_size as f64 * factor * self.min_factor) as u64;
        let group_bytes = |group: &[(BlockKey, BucketEntrySnapshot)]| {
            group.iter().map(|(_, s)| s.length as u64).sum::<u64>()
        };

        let mut groups = [
            (Priority::Single, group_bytes(&single).saturating_sub(bucket_size(self.single_factor))),
            (Priority::Multi, group_bytes(&multi).saturating_sub(bucket_size(self.multi_factor))),
            (Priority::Memory, group_bytes(&memory).saturating_sub(bucket_size(self.memory_factor))),
        ];
        groups.sort_by_key(|(_, overflow)| *overflow);

        let mut stats = EvictionRunStats::default();
        let mut single_consumed = 0usize;
        let mut multi_consumed = 0usize;

        // Pass 1: each group contributes at most its own overflow.
        for (priority, overflow) in groups {
            if remaining_budget == 0 {
                break;
            }
            let quota = overflow.min(remaining_budget);
            if quota == 0 {
                continue;
            }
            let group = match priority {
                Priority::Single => &single,
                Priority::Multi => &multi,
                Priority::Memory => &memory,
            };
            let (consumed, freed) =
                evict_until(group, quota, backing, allocator, offset_lock, index, &mut stats);
            remaining_budget = remaining_budget.saturating_sub(freed);
            match priority {
                Priority::Single => single_consumed = consumed,
                Priority::Multi => multi_consumed = consumed,
                Priority::Memory => {}
            }
        }

        // Pass 2: any remaining shortfall comes only from SINGLE and MULTI,
        // continuing past what each already gave up in Pass 1. MEMORY is
        // never revisited here.
        if remaining_budget > 0 {
            let (more, freed) = evict_until(
                &single[single_consumed..],
                remaining_budget,
                backing,
                allocator,
                offset_lock,
                index,
                &mut stats,
            );
            let _ = more;
            remaining_budget = remaining_budget.saturating_sub(freed);
        }
        if remaining_budget > 0 {
            evict_until(
                &multi[multi_consumed..],
                remaining_budget,
                backing,
                allocator,
                offset_lock,
                index,
                &mut stats,
            );
        }

        metrics::EVICTIONS.inc();
        metrics::EVICTED_BLOCKS.inc_by(stats.evicted_blocks);
        stats
    }
}

/// Evicts oldest-first from `group` until `target_bytes` has been freed or
/// the group is exhausted. Returns the number of entries consumed (whether
/// or not each was still present to evict) and the bytes actually freed.
fn evict_until(
    group: &[(BlockKey, BucketEntrySnapshot)],
    target_bytes: u64,
    backing: &BackingMap,
    allocator: &BucketAllocator,
    offset_lock: &SparseOffsetLock,
    index: &SecondaryIndex,
    stats: &mut EvictionRunStats,
) -> (usize, u64) {
    let mut freed = 0u64;
    let mut consumed = 0usize;
    for (key, snapshot) in group {
        if freed >= target_bytes {
            break;
        }
        if evict_block(key, snapshot.offset, backing, allocator, offset_lock, index) {
            freed += snapshot.length as u64;
            stats.evicted_blocks += 1;
            stats.evicted_bytes += snapshot.length as u64;
        }
        consumed += 1;
    }
    (consumed, freed)
}

/// Evicts a single block: takes the offset lock, re-checks the entry is
/// still present at the offset observed during the scan (it may have been
/// evicted or rewritten concurrently), then frees the allocator slot and
/// removes the map/index entries. Returns `false` if the entry had already
/// moved on, in which case nothing is freed.
fn evict_block(
    key: &BlockKey,
    observed_offset: u64,
    backing: &BackingMap,
    allocator: &BucketAllocator,
    offset_lock: &SparseOffsetLock,
    index: &SecondaryIndex,
) -> bool {
    let _guard = offset_lock.acquire(observed_offset);
    let still_present = backing
        .get(key)
        .map(|e| e.offset() == observed_offset)
        .unwrap_or(false);
    if !still_present {
        return false;
    }
    backing.remove(key);
    index.remove(key);
    let _ = allocator.free(observed_offset);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Priority;

    /// A single size class of 4096 bytes gets one 64-slot bucket
    /// (`SLOTS_PER_BUCKET_OF_LARGEST_CLASS` in `allocator.rs`), so a
    /// capacity of exactly `4096*64` bytes gives every test a 64-slot
    /// allocator to divide among priority groups.
    const CAPACITY: u64 = 4096 * 64;

    fn setup() -> (BackingMap, BucketAllocator, SparseOffsetLock, SecondaryIndex) {
        let backing = BackingMap::default();
        let allocator = BucketAllocator::new(CAPACITY, vec![4096]);
        (backing, allocator, SparseOffsetLock::new(), SecondaryIndex::new())
    }

    fn insert(
        backing: &BackingMap,
        allocator: &BucketAllocator,
        index: &SecondaryIndex,
        file: &str,
        offset_seq: u64,
        priority: Priority,
    ) -> BlockKey {
        let offset = allocator.allocate(4096).unwrap();
        let key = BlockKey::new(file, offset);
        let entry = BucketEntry::new(offset, 4096, offset_seq, priority).unwrap();
        backing.insert(key.clone(), entry);
        index.insert(&key);
        key
    }

    #[test]
    fn does_nothing_when_under_accept_threshold() {
        let (backing, allocator, lock, index) = setup();
        let config = BucketCacheConfig::default();
        let engine = EvictionEngine::new(&config);
        insert(&backing, &allocator, &index, "f", 1, Priority::Single);
        let stats = engine.free_space(&backing, &allocator, &lock, &index);
        assert_eq!(stats.evicted_blocks, 0);
    }

    /// 64-slot allocator, `min_factor` 0.5 (`free_goal` = 32 free slots),
    /// `single_factor` and `memory_factor` both 0.5 so each group's bucket
    /// target is 16 slots worth of bytes (65536 bytes). 40 SINGLE entries
    /// (overflow 24 slots) and 10 MEMORY entries (well under their 16-slot
    /// target, overflow 0) leave 50 slots used / 14 free, 18 slots short of
    /// `free_goal`. Only the 18 oldest SINGLE entries should be evicted;
    /// MEMORY, despite its configured 50% share of the freeing budget under
    /// the old flat-proportional bug, is untouched because it isn't
    /// overflowing its own bucket.
    #[test]
    fn evicts_from_the_overflowing_group_to_satisfy_the_class_deficit() {
        let (backing, allocator, lock, index) = setup();
        let mut config = BucketCacheConfig::default();
        config.accept_factor = 0.3;
        config.min_factor = 0.5;
        config.single_factor = 0.5;
        config.multi_factor = 0.0;
        config.memory_factor = 0.5;
        config.extra_free_factor = 0.0;
        let engine = EvictionEngine::new(&config);

        let mut single_keys = Vec::new();
        for seq in 1..=40u64 {
            single_keys.push(insert(&backing, &allocator, &index, "f", seq, Priority::Single));
        }
        let memory_keys: Vec<_> = (41..=50u64)
            .map(|seq| insert(&backing, &allocator, &index, "f", seq, Priority::Memory))
            .collect();

        let stats = engine.free_space(&backing, &allocator, &lock, &index);
        assert_eq!(stats.evicted_blocks, 18);
        assert_eq!(stats.evicted_bytes, 18 * 4096);
        // The 18 oldest (lowest access_seq) SINGLE entries are gone.
        for key in &single_keys[..18] {
            assert!(!backing.contains_key(key));
        }
        for key in &single_keys[18..] {
            assert!(backing.contains_key(key));
        }
        // MEMORY was within its own target and is left untouched.
        for key in &memory_keys {
            assert!(backing.contains_key(key));
        }
    }

    /// 64-slot allocator, `min_factor` 0.25 (`free_goal` = 48 free slots),
    /// all three groups share an 8-slot bucket target (`0.5*0.25*64`). 15
    /// SINGLE (overflow 7), 15 MULTI (overflow 7), and 8 MEMORY (exactly at
    /// its bucket target, overflow 0) leave 38 used / 26 free, 22 slots
    /// short of `free_goal` -- a shortfall bigger than SINGLE's and MULTI's
    /// combined overflow (14 slots). Pass 1 evicts SINGLE and MULTI down to
    /// their bucket targets and leaves MEMORY untouched (it has no
    /// overflow); Pass 2 then exhausts the rest of SINGLE to cover the
    /// remaining 8-slot shortfall. MEMORY is never touched in either pass,
    /// even though it holds entries that could have absorbed the shortfall.
    #[test]
    fn pass_two_shortfall_never_draws_from_memory() {
        let (backing, allocator, lock, index) = setup();
        let mut config = BucketCacheConfig::default();
        config.accept_factor = 0.3;
        config.min_factor = 0.25;
        config.single_factor = 0.5;
        config.multi_factor = 0.5;
        config.memory_factor = 0.5;
        config.extra_free_factor = 0.0;
        let engine = EvictionEngine::new(&config);

        for seq in 1..=15u64 {
            insert(&backing, &allocator, &index, "s", seq, Priority::Single);
        }
        for seq in 16..=30u64 {
            insert(&backing, &allocator, &index, "m", seq, Priority::Multi);
        }
        for seq in 31..=38u64 {
            insert(&backing, &allocator, &index, "k", seq, Priority::Memory);
        }

        let stats = engine.free_space(&backing, &allocator, &lock, &index);
        assert_eq!(stats.evicted_blocks, 22);

        let remaining_single = index.keys_for_file("s").len();
        let remaining_multi = index.keys_for_file("m").len();
        let remaining_memory = index.keys_for_file("k").len();
        assert_eq!(remaining_single, 0);
        assert_eq!(remaining_multi, 8);
        assert_eq!(remaining_memory, 8);
    }
}
