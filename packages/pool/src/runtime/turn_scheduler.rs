// packages/pool/src/runtime/turn_scheduler.rs
//! Per-worker turn admission
//!
//! Each worker owns a semaphore with `max_turns_per_worker` permits. A permit
//! is taken (and forgotten) when a turn is admitted and handed back when the
//! turn fails to start or its completion event arrives. Callers beyond the
//! limit wait on the semaphore; their number is the worker's queue depth.
//!
//! ```text
//! reserve(w) ──► gate[w].acquire ──► TurnTicket { epoch }
//!                    │
//!   reset_worker(w): close gate, swap in a fresh one, epoch += 1
//!                    │   waiters retry on the new gate
//!   cancel_all():    close every gate ──► PoolError::Cancelled
//! ```
//!
//! A ticket remembers the gate it came from, so a turn admitted before a
//! reset returns its permit to the closed gate and never to the fresh one.

use crate::runtime::scoped_id::WorkerId;
use crate::utils::errors::{PoolError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::trace;

/// Admission of one turn on one worker
#[derive(Debug)]
pub struct TurnTicket {
    worker_id: WorkerId,
    epoch: u64,
    gate: Arc<Semaphore>,
}

impl TurnTicket {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }
}

struct Gate {
    semaphore: Arc<Semaphore>,
    epoch: u64,
}

#[derive(Default)]
struct SchedulerState {
    gates: HashMap<WorkerId, Gate>,
    waiting: HashMap<WorkerId, usize>,
    cancellations: u64,
}

impl SchedulerState {
    fn gate(&mut self, worker_id: WorkerId, limit: usize) -> &Gate {
        self.gates.entry(worker_id).or_insert_with(|| Gate {
            semaphore: Arc::new(Semaphore::new(limit)),
            epoch: 0,
        })
    }

    fn replace_gate(&mut self, worker_id: WorkerId, limit: usize) {
        let gate = self.gates.entry(worker_id).or_insert_with(|| Gate {
            semaphore: Arc::new(Semaphore::new(limit)),
            epoch: 0,
        });
        gate.semaphore.close();
        gate.semaphore = Arc::new(Semaphore::new(limit));
        gate.epoch += 1;
    }
}

/// Admission control for concurrently running turns
pub struct TurnScheduler {
    max_turns_per_worker: usize,
    state: Mutex<SchedulerState>,
}

impl TurnScheduler {
    pub fn new(max_turns_per_worker: usize) -> Self {
        Self {
            max_turns_per_worker: max_turns_per_worker.clamp(1, Semaphore::MAX_PERMITS),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Wait for a turn permit on `worker_id`
    ///
    /// Survives `reset_worker` by moving to the fresh gate; fails with
    /// `Cancelled` once `cancel_all` runs.
    pub async fn reserve(&self, worker_id: WorkerId) -> Result<TurnTicket> {
        let _waiting = Waiting::enter(self, worker_id);
        let cancellations = self.state.lock().cancellations;

        loop {
            let (gate, epoch) = {
                let mut state = self.state.lock();
                if state.cancellations != cancellations {
                    return Err(PoolError::Cancelled);
                }
                let gate = state.gate(worker_id, self.max_turns_per_worker);
                (Arc::clone(&gate.semaphore), gate.epoch)
            };

            match Arc::clone(&gate).acquire_owned().await {
                Ok(permit) => {
                    // Held until the turn ends, not until this scope ends
                    permit.forget();
                    return Ok(TurnTicket {
                        worker_id,
                        epoch,
                        gate,
                    });
                }
                Err(_) => trace!("Admission gate for worker {} closed", worker_id),
            }
        }
    }

    /// Whether `ticket` was issued since the worker's last reset
    pub fn is_current(&self, ticket: &TurnTicket) -> bool {
        self.state
            .lock()
            .gates
            .get(&ticket.worker_id)
            .is_some_and(|gate| gate.epoch == ticket.epoch)
    }

    /// Hand a ticket's permit back to the gate that issued it
    pub fn release(&self, ticket: TurnTicket) {
        ticket.gate.add_permits(1);
    }

    /// Return one permit for a turn that completed on the worker's current
    /// gate; never grows the gate past its limit
    pub fn release_current(&self, worker_id: WorkerId) {
        let state = self.state.lock();
        if let Some(gate) = state.gates.get(&worker_id) {
            if gate.semaphore.available_permits() < self.max_turns_per_worker {
                gate.semaphore.add_permits(1);
            }
        }
    }

    /// Forget every permit on a failed worker and let its waiters in again
    pub fn reset_worker(&self, worker_id: WorkerId) {
        self.state
            .lock()
            .replace_gate(worker_id, self.max_turns_per_worker);
    }

    /// Fail every waiter with `Cancelled` and drop all permits
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        state.cancellations += 1;
        let workers: Vec<WorkerId> = state.gates.keys().copied().collect();
        for worker_id in workers {
            state.replace_gate(worker_id, self.max_turns_per_worker);
        }
    }

    pub fn queue_depth(&self, worker_id: WorkerId) -> usize {
        self.state
            .lock()
            .waiting
            .get(&worker_id)
            .copied()
            .unwrap_or(0)
    }

    /// Queue depth of every worker with callers waiting
    pub fn queue_depths(&self) -> BTreeMap<WorkerId, usize> {
        self.state
            .lock()
            .waiting
            .iter()
            .map(|(worker_id, waiting)| (*worker_id, *waiting))
            .collect()
    }

    #[cfg(test)]
    fn in_use(&self, worker_id: WorkerId) -> usize {
        self.state.lock().gates.get(&worker_id).map_or(0, |gate| {
            self.max_turns_per_worker - gate.semaphore.available_permits()
        })
    }
}

/// Counts a caller as queued while it waits for admission
struct Waiting<'a> {
    scheduler: &'a TurnScheduler,
    worker_id: WorkerId,
}

impl<'a> Waiting<'a> {
    fn enter(scheduler: &'a TurnScheduler, worker_id: WorkerId) -> Self {
        *scheduler.state.lock().waiting.entry(worker_id).or_insert(0) += 1;
        Self {
            scheduler,
            worker_id,
        }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut state = self.scheduler.state.lock();
        if let Some(waiting) = state.waiting.get_mut(&self.worker_id) {
            *waiting = waiting.saturating_sub(1);
            if *waiting == 0 {
                state.waiting.remove(&self.worker_id);
            }
        }
    }
}
