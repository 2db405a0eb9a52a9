// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::IoEngine;
use crate::Error;

/// A single contiguous in-process buffer, guarded by a `parking_lot::RwLock`.
/// `sync()` is a no-op since heap writes are immediately visible to any
/// subsequent read; `shutdown()` drops the backing buffer. Analogous to
/// `forest_db::memory::MemoryDB`'s `Arc<RwLock<HashMap<..>>>` wrapper, but
/// byte-offset-addressed rather than keyed.
#[derive(Debug)]
pub struct HeapEngine {
    buf: RwLock<Vec<u8>>,
    capacity: u64,
    shutdown: AtomicBool,
}

impl HeapEngine {
    pub fn new(capacity: u64) -> Self {
        Self {
            buf: RwLock::new(vec![0u8; capacity as usize]),
            capacity,
            shutdown: AtomicBool::new(false),
        }
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

impl IoEngine for HeapEngine {
    fn read(&self, dst: &mut [u8], offset: u64) -> Result<(), Error> {
        self.check_open()?;
        self.check_bounds(offset, dst.len())?;
        let buf = self.buf.read();
        let start = offset as usize;
        dst.copy_from_slice(&buf[start..start + dst.len()]);
        Ok(())
    }

    fn write(&self, src: &[u8], offset: u64) -> Result<(), Error> {
        self.check_open()?;
        self.check_bounds(offset, src.len())?;
        let mut buf = self.buf.write();
        let start = offset as usize;
        buf[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        self.check_open()
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.buf.write().clear();
        self.buf.write().shrink_to_fit();
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let engine = HeapEngine::new(4096);
        engine.write(b"hello", 256).unwrap();
        engine.sync().unwrap();
        let mut dst = [0u8; 5];
        engine.read(&mut dst, 256).unwrap();
        assert_eq!(&dst, b"hello");
    }

    #[test]
    fn out_of_bounds_rejected() {
        let engine = HeapEngine::new(1024);
        assert!(engine.write(&[0u8; 10], 1020).is_err());
    }

    #[test]
    fn shutdown_then_read_fails() {
        let engine = HeapEngine::new(1024);
        engine.write(b"x", 0).unwrap();
        engine.shutdown();
        let mut dst = [0u8; 1];
        assert!(engine.read(&mut dst, 0).is_err());
        // idempotent
        engine.shutdown();
    }
}
