// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracks a run of engine I/O failures and decides when they have persisted
/// long enough to disable the cache outright, per §4.7. A single success
/// resets the run; the controller itself never re-enables a disabled cache
/// (that requires rebuilding the [`crate::BucketCache`]).
pub struct IoErrorController {
    tolerance: Duration,
    state: Mutex<Option<Instant>>,
}

impl IoErrorController {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance,
            state: Mutex::new(None),
        }
    }

    /// Records an engine failure. Returns `true` once the failure run has
    /// persisted past the configured tolerance, meaning the caller should
    /// disable the cache.
    pub fn report_failure(&self) -> bool {
        let mut state = self.state.lock();
        let start = *state.get_or_insert_with(Instant::now);
        start.elapsed() >= self.tolerance
    }

    /// Records a successful engine operation, clearing any failure run.
    pub fn report_success(&self) {
        *self.state.lock() = None;
    }

    pub fn is_failing(&self) -> bool {
        self.state.lock().is_some()
    }
}
