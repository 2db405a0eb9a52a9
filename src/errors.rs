// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Cache error. Internal currency between the engine, allocator, and writer
/// layers. The public cache API never returns this directly (no exceptions
/// escape `cache`/`get`/`evict`), but it is returned by the lower-level
/// [`crate::engine::IoEngine`] and [`crate::allocator::BucketAllocator`]
/// surfaces that a caller implementing a custom engine would target.
#[derive(Debug, Error)]
pub enum Error {
    #[error("requested offset {0} is not 256-byte aligned")]
    Misaligned(u64),
    #[error("requested capacity {0} exceeds the 32 TiB limit")]
    CapacityTooLarge(u64),
    #[error("size classes must be strictly increasing and positive")]
    InvalidSizeClasses,
    #[error("no size class can hold a block of {0} bytes")]
    CacheFull(usize),
    #[error("size class has no free slot and no bucket is available to reassign")]
    NoSpaceInThisSizeClass,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<Error> for String {
    fn from(e: Error) -> Self {
        e.to_string()
    }
}
