// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod subtests;

use bucket_cache::{BucketCache, BucketCacheConfig, EngineKind};

/// A cache sized so that a handful of 4 KiB blocks push it over
/// `accept_factor`, forcing `free_space` to run on every subsequent commit.
fn small_cache() -> BucketCache {
    BucketCache::new(BucketCacheConfig {
        engine: EngineKind::Heap,
        capacity: 256 * 1024,
        size_classes: vec![4096],
        writer_threads: 1,
        queue_capacity: 64,
        accept_factor: 0.2,
        min_factor: 0.1,
        single_factor: 1.0,
        multi_factor: 0.0,
        memory_factor: 0.0,
        extra_free_factor: 0.0,
        stats_period_secs: 0,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn oldest_single_priority_blocks_are_evicted_once_over_capacity() {
    let _ = pretty_env_logger::try_init();
    let cache = small_cache();
    for i in 0..20u64 {
        cache
            .cache("f", i * 4096, vec![i as u8; 4096], false, true)
            .unwrap();
    }
    subtests::wait_until(|| cache.get_stats().evictions > 0);

    // The oldest admitted block should have been reclaimed by eviction
    // pressure long before the newest one.
    subtests::wait_until(|| cache.get("f", 0, false, false).unwrap().is_none());
    assert!(cache.get("f", 19 * 4096, false, false).unwrap().is_some());
}

#[test]
fn repeated_access_protects_a_block_from_early_eviction() {
    let cache = small_cache();
    cache.cache("hot", 0, vec![1; 4096], false, true).unwrap();
    subtests::wait_until(|| cache.block_count() == 1);

    for _ in 0..30u64 {
        // Re-accessing promotes SINGLE -> MULTI, which this config never
        // asks free_space to evict from directly.
        let _ = cache.get("hot", 0, false, false);
    }

    for i in 1..20u64 {
        cache
            .cache("cold", i * 4096, vec![i as u8; 4096], false, true)
            .unwrap();
    }
    subtests::wait_until(|| cache.get_stats().evictions > 0);

    assert!(cache.get("hot", 0, false, false).unwrap().is_some());
}

#[test]
fn free_size_never_goes_negative_under_sustained_admission() {
    let cache = small_cache();
    for i in 0..50u64 {
        let _ = cache.cache("f", i * 4096, vec![0u8; 4096], false, true);
    }
    subtests::wait_until(|| cache.get_stats().evictions > 0);
    assert!(cache.free_size() <= cache.size());
}
