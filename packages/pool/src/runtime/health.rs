// packages/pool/src/runtime/health.rs
//! Per-worker health, in-flight accounting and thread pins
//!
//! # State machine
//!
//! ```text
//! idle ─► starting ─► healthy ─► degraded ─► restarting ─► healthy
//!                                   ▲             │
//!                                   └─────────────┘ (restart failed)
//! any ─► stopped ─► starting (pool restart only)
//! ```
//!
//! Health entries are created when a slot is materialised and never removed.
//! The tracker is plain owned state; the pool serialises access to it.

use crate::runtime::scoped_id::WorkerId;
use crate::runtime::selector::{first_available, select_worker, LocalThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealthState {
    Idle,
    Starting,
    Healthy,
    Degraded,
    Restarting,
    Stopped,
}

impl WorkerHealthState {
    /// Whether new threads may be routed to a worker in this state
    pub fn is_available(self) -> bool {
        !matches!(
            self,
            WorkerHealthState::Degraded | WorkerHealthState::Restarting | WorkerHealthState::Stopped
        )
    }
}

impl fmt::Display for WorkerHealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerHealthState::Idle => "idle",
            WorkerHealthState::Starting => "starting",
            WorkerHealthState::Healthy => "healthy",
            WorkerHealthState::Degraded => "degraded",
            WorkerHealthState::Restarting => "restarting",
            WorkerHealthState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Health record for one worker slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHealth {
    pub state: WorkerHealthState,

    /// Failures since the worker last came up; drives the backoff
    pub failure_count: u32,

    pub restart_count: u32,
    pub in_flight_turns: usize,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self {
            state: WorkerHealthState::Idle,
            failure_count: 0,
            restart_count: 0,
            in_flight_turns: 0,
            last_start_at: None,
            last_failure_at: None,
        }
    }
}

/// Metrics for one worker as reported by `snapshot()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub health: WorkerHealthState,
    pub queue_depth: usize,
    pub in_flight_turns: usize,
    pub failure_count: u32,
    pub restart_count: u32,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Read-only view of the pool, built on demand
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub configured_worker_count: usize,
    pub active_worker_count: usize,
    pub pinned_thread_count: usize,
    pub total_queued_turns: usize,
    pub total_in_flight_turns: usize,
    pub workers: Vec<WorkerMetrics>,
}

impl PoolSnapshot {
    pub fn worker(&self, worker_id: WorkerId) -> Option<&WorkerMetrics> {
        self.workers.iter().find(|m| m.worker_id == worker_id)
    }
}

/// Health records plus the thread pin map
#[derive(Debug, Default)]
pub struct HealthTracker {
    workers: BTreeMap<WorkerId, WorkerHealth>,
    pins: HashMap<LocalThreadId, WorkerId>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for a newly materialised slot
    pub fn ensure(&mut self, worker_id: WorkerId) {
        self.workers.entry(worker_id).or_default();
    }

    pub fn state(&self, worker_id: WorkerId) -> WorkerHealthState {
        self.workers
            .get(&worker_id)
            .map_or(WorkerHealthState::Idle, |h| h.state)
    }

    pub fn is_available(&self, worker_id: WorkerId) -> bool {
        self.state(worker_id).is_available()
    }

    pub fn unavailable_workers(&self) -> BTreeSet<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, health)| !health.state.is_available())
            .map(|(worker_id, _)| *worker_id)
            .collect()
    }

    fn entry(&mut self, worker_id: WorkerId) -> &mut WorkerHealth {
        self.workers.entry(worker_id).or_default()
    }

    pub fn mark_starting(&mut self, worker_id: WorkerId) {
        self.entry(worker_id).state = WorkerHealthState::Starting;
    }

    /// Worker came up through `start()`/`restart()` on the pool
    pub fn mark_healthy(&mut self, worker_id: WorkerId, at: DateTime<Utc>) {
        let health = self.entry(worker_id);
        health.state = WorkerHealthState::Healthy;
        health.failure_count = 0;
        health.last_start_at = Some(at);
    }

    /// Worker came back through automatic recovery
    pub fn mark_recovered(&mut self, worker_id: WorkerId, at: DateTime<Utc>) {
        self.mark_healthy(worker_id, at);
        self.entry(worker_id).restart_count += 1;
    }

    pub fn mark_restarting(&mut self, worker_id: WorkerId) {
        self.entry(worker_id).state = WorkerHealthState::Restarting;
    }

    /// Record a termination or failed (re)start; returns the failure count
    pub fn record_failure(&mut self, worker_id: WorkerId, at: DateTime<Utc>) -> u32 {
        let health = self.entry(worker_id);
        health.state = WorkerHealthState::Degraded;
        health.failure_count += 1;
        health.in_flight_turns = 0;
        health.last_failure_at = Some(at);
        health.failure_count
    }

    /// Every slot stopped, counters zeroed, pins dropped
    pub fn mark_all_stopped(&mut self) {
        for health in self.workers.values_mut() {
            health.state = WorkerHealthState::Stopped;
            health.in_flight_turns = 0;
        }
        self.pins.clear();
    }

    pub fn begin_turn(&mut self, worker_id: WorkerId) -> usize {
        let health = self.entry(worker_id);
        health.in_flight_turns += 1;
        health.in_flight_turns
    }

    /// Saturates at zero
    pub fn finish_turn(&mut self, worker_id: WorkerId) -> usize {
        let health = self.entry(worker_id);
        health.in_flight_turns = health.in_flight_turns.saturating_sub(1);
        health.in_flight_turns
    }

    // Pins

    pub fn pin(&mut self, thread_id: LocalThreadId, worker_id: WorkerId) {
        self.pins.insert(thread_id, worker_id);
    }

    pub fn unpin(&mut self, thread_id: LocalThreadId) -> Option<WorkerId> {
        self.pins.remove(&thread_id)
    }

    pub fn reset_pins(&mut self) {
        self.pins.clear();
    }

    pub fn pinned(&self, thread_id: LocalThreadId) -> Option<WorkerId> {
        self.pins.get(&thread_id).copied()
    }

    pub fn pinned_count(&self) -> usize {
        self.pins.len()
    }

    /// Select a worker for `thread_id` and pin the thread to it
    pub fn route_thread(&mut self, thread_id: LocalThreadId, worker_count: usize) -> WorkerId {
        let selection = select_worker(
            thread_id,
            worker_count,
            self.pinned(thread_id),
            &self.unavailable_workers(),
        );
        let worker_id = selection.or_primary();
        self.pin(thread_id, worker_id);
        worker_id
    }

    /// Where threads go when their worker fails: the primary if it is
    /// available, else the lowest available worker, else the primary anyway
    pub fn fallback_worker(&self, worker_count: usize) -> WorkerId {
        if self.is_available(WorkerId::PRIMARY) {
            return WorkerId::PRIMARY;
        }
        first_available(worker_count, &self.unavailable_workers()).or_primary()
    }

    /// Move every pin on `from` to `to`; returns how many moved
    pub fn reassign_pins(&mut self, from: WorkerId, to: WorkerId) -> usize {
        let mut moved = 0;
        for worker_id in self.pins.values_mut() {
            if *worker_id == from {
                *worker_id = to;
                moved += 1;
            }
        }
        moved
    }

    /// Per-worker metrics in worker order
    pub fn metrics(&self, queue_depths: &BTreeMap<WorkerId, usize>) -> Vec<WorkerMetrics> {
        self.workers
            .iter()
            .map(|(worker_id, health)| WorkerMetrics {
                worker_id: *worker_id,
                health: health.state,
                queue_depth: queue_depths.get(worker_id).copied().unwrap_or(0),
                in_flight_turns: health.in_flight_turns,
                failure_count: health.failure_count,
                restart_count: health.restart_count,
                last_start_at: health.last_start_at,
                last_failure_at: health.last_failure_at,
            })
            .collect()
    }
}
