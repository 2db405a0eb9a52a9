// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::thread;
use std::time::Duration;

use bucket_cache::BucketCache;

/// Polls `f` until it returns `true` or the timeout elapses, for waiting on
/// the async writer pipeline to commit a just-admitted block.
pub fn wait_until<F: Fn() -> bool>(f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within timeout");
}

pub fn write(cache: &BucketCache) {
    cache.cache("subtest", 0, vec![1], false, true).unwrap();
}

pub fn read(cache: &BucketCache) {
    let value = vec![1, 2, 3, 4];
    cache.cache("subtest", 256, value.clone(), false, true).unwrap();
    let res = cache.get("subtest", 256, false, false).unwrap().unwrap();
    assert_eq!(value, res);
}

pub fn exists(cache: &BucketCache) {
    cache.cache("subtest", 512, vec![9], false, true).unwrap();
    assert!(cache.get("subtest", 512, false, false).unwrap().is_some());
}

pub fn does_not_exist(cache: &BucketCache) {
    assert!(cache.get("subtest", 99_999, false, false).unwrap().is_none());
}

pub fn bulk_write(cache: &BucketCache) {
    let values: Vec<(u64, Vec<u8>)> = vec![(0, vec![0]), (256, vec![1]), (512, vec![2])];
    for (offset, value) in &values {
        cache.cache("bulk", *offset, value.clone(), false, true).unwrap();
    }
    for (offset, _) in &values {
        assert!(cache.get("bulk", *offset, false, false).unwrap().is_some());
    }
}
