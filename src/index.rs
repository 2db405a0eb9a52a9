// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeSet;

use dashmap::DashMap;

use crate::key::BlockKey;

/// Maps a file's identity to the set of its cached block keys, ordered by
/// ascending offset. Maintained consistent with the backing map except
/// during the brief windows of insert/evict (§3).
#[derive(Default)]
pub struct SecondaryIndex {
    by_file: DashMap<String, BTreeSet<u64>>,
}

impl SecondaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &BlockKey) {
        self.by_file
            .entry(key.file_id.clone())
            .or_default()
            .insert(key.offset);
    }

    /// Removes `key` from the index. Drops the file's entry entirely once
    /// its last block is removed, keeping the map from accumulating
    /// tombstones for files with no cached blocks left.
    pub fn remove(&self, key: &BlockKey) {
        if let Some(mut set) = self.by_file.get_mut(&key.file_id) {
            set.remove(&key.offset);
            if set.is_empty() {
                drop(set);
                self.by_file.remove(&key.file_id);
            }
        }
    }

    /// All keys currently indexed for `file_id`, ascending by offset.
    pub fn keys_for_file(&self, file_id: &str) -> Vec<BlockKey> {
        self.by_file
            .get(file_id)
            .map(|set| {
                set.iter()
                    .map(|&offset| BlockKey::new(file_id, offset))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.by_file.clear();
    }
}
