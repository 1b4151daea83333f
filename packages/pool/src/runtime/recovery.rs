// packages/pool/src/runtime/recovery.rs
//! Restart scheduling for failed non-primary workers
//!
//! Each failure doubles the delay before the next restart attempt, up to a
//! cap. With the default 1s base and 8s cap the schedule is
//! 1s, 2s, 4s, 8s, 8s, ... Recovery never gives up.

use crate::runtime::scoped_id::WorkerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const MAX_EXPONENT: u32 = 16;

/// Exponential backoff between restart attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(8))
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// Delay before the restart that follows `failures` failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_EXPONENT);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// Tracks the one outstanding recovery task per worker
#[derive(Default)]
pub struct RecoveryScheduler {
    pending: HashMap<WorkerId, JoinHandle<()>>,
}

impl RecoveryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True from scheduling until the attempt calls `finish`
    pub fn is_scheduled(&self, worker_id: WorkerId) -> bool {
        self.pending.contains_key(&worker_id)
    }

    pub fn insert(&mut self, worker_id: WorkerId, handle: JoinHandle<()>) {
        if let Some(previous) = self.pending.insert(worker_id, handle) {
            previous.abort();
        }
    }

    /// Called by the recovery task itself once its attempt is over
    pub fn finish(&mut self, worker_id: WorkerId) {
        self.pending.remove(&worker_id);
    }

    pub fn cancel_all(&mut self) {
        for (worker_id, handle) in self.pending.drain() {
            debug!("Cancelling recovery of worker {}", worker_id);
            handle.abort();
        }
    }
}

impl Drop for RecoveryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
