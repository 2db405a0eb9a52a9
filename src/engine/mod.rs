// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod heap;
#[cfg(feature = "offheap")]
mod offheap;

pub use heap::HeapEngine;
#[cfg(feature = "offheap")]
pub use offheap::OffheapEngine;

use crate::Error;

/// Byte-addressable store the cache core treats as opaque. An engine may be
/// on-process heap, off-process mapped memory, or a file; the core never
/// assumes persistence across process restart.
pub trait IoEngine: Send + Sync {
    /// Fills `dst` with `dst.len()` bytes starting at `offset`.
    fn read(&self, dst: &mut [u8], offset: u64) -> Result<(), Error>;

    /// Writes all of `src` starting at `offset`.
    fn write(&self, src: &[u8], offset: u64) -> Result<(), Error>;

    /// Guarantees writes visible before this call are durable/ordered ahead
    /// of any subsequent read that observes them.
    fn sync(&self) -> Result<(), Error>;

    /// Releases resources. Idempotent.
    fn shutdown(&self);

    /// Total addressable capacity in bytes.
    fn capacity(&self) -> u64;
}
