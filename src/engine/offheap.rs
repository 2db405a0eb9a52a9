// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::MmapMut;
use parking_lot::RwLock;

use super::IoEngine;
use crate::Error;

/// A `memmap2`-backed engine: either an anonymous mapping (process-private,
/// off the Rust heap allocator but still resident) or, when a path is
/// supplied, a file-backed mapping that the OS page cache serves. Modeled
/// after the way `forest_db::rocks::RocksDb` wraps a concrete backend behind
/// the same `Store`-shaped trait the rest of the crate is written against.
#[derive(Debug)]
pub struct OffheapEngine {
    mmap: RwLock<MmapMut>,
    capacity: u64,
    shutdown: AtomicBool,
}

impl OffheapEngine {
    pub fn new_anon(capacity: u64) -> Result<Self, Error> {
        let mmap = MmapMut::map_anon(capacity as usize)?;
        Ok(Self {
            mmap: RwLock::new(mmap),
            capacity,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn open_file<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity)?;
        // SAFETY: the file is exclusively owned by this engine for its
        // lifetime; no other process is expected to mutate it concurrently.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap: RwLock::new(mmap),
            capacity,
            shutdown: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Other("engine is shut down".into()));
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), Error> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::Other("offset overflow".into()))?;
        if end > self.capacity {
            return Err(Error::Other(format!(
                "range {offset}..{end} exceeds engine capacity {}",
                self.capacity
            )));
        }
        Ok(())
    }
}

impl IoEngine for OffheapEngine {
    fn read(&self, dst: &mut [u8], offset: u64) -> Result<(), Error> {
        self.check_open()?;
        self.check_bounds(offset, dst.len())?;
        let mmap = self.mmap.read();
        let start = offset as usize;
        dst.copy_from_slice(&mmap[start..start + dst.len()]);
        Ok(())
    }

    fn write(&self, src: &[u8], offset: u64) -> Result<(), Error> {
        self.check_open()?;
        self.check_bounds(offset, src.len())?;
        let mut mmap = self.mmap.write();
        let start = offset as usize;
        mmap[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        self.check_open()?;
        self.mmap.read().flush()?;
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}
