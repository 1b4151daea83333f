// packages/pool/src/runtime/pool.rs
//! Runtime worker pool
//!
//! `RuntimePool` spreads conversation threads over a fixed number of runtime
//! workers and presents them to callers as one runtime.
//!
//! # Architecture
//!
//! ```text
//! RuntimePool
//! ├─ workers:   w0 (primary), w1, ... wN-1   (created lazily from w0)
//! ├─ health:    state + counters per worker, thread pins
//! ├─ approvals: synthetic id -> (worker, raw id)
//! ├─ pumps:     one event task per worker ──► unified event stream
//! ├─ recovery:  one backoff task per failed non-primary worker
//! └─ turns:     per-worker admission queue
//! ```
//!
//! All bookkeeping lives behind one short-lived lock; worker calls are made
//! with the lock released. Lifecycle calls (`start`, `restart`, `stop`) are
//! additionally serialised against each other.
//!
//! With a single configured worker, ids pass through unscoped and approval
//! ids are not remapped.

use crate::observability::{
    APPROVALS_ROUTED_TOTAL, EVENTS_FORWARDED_TOTAL, IN_FLIGHT_TURNS, WORKER_FAILURES_TOTAL,
    WORKER_RESTARTS_TOTAL,
};
use crate::runtime::events::{
    AccountState, ApprovalDecision, Capabilities, ChatGptLoginStart, ModelInfo, RuntimeEvent,
    SafetyConfig, TurnRequest,
};
use crate::runtime::health::{HealthTracker, PoolSnapshot};
use crate::runtime::multiplexer::{spawn_event_pump, transform_event, ApprovalRoutes};
use crate::runtime::recovery::{BackoffPolicy, RecoveryScheduler};
use crate::runtime::scoped_id::{parse_scoped_id, resolve_route, IdScoper, TurnRoute, WorkerId};
use crate::runtime::selector::LocalThreadId;
use crate::runtime::turn_scheduler::{TurnScheduler, TurnTicket};
use crate::runtime::worker::RuntimeWorker;
use crate::utils::config::{logical_core_count, recommended_turn_limit, PoolConfig};
use crate::utils::errors::{PoolError, Result};
use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy)]
enum LifecycleCall {
    Start,
    Restart,
}

struct PoolState {
    workers: BTreeMap<WorkerId, Arc<dyn RuntimeWorker>>,
    health: HealthTracker,
    approvals: ApprovalRoutes,
    pumps: HashMap<WorkerId, JoinHandle<()>>,
    recovery: RecoveryScheduler,
    running: bool,
}

struct PoolInner {
    configured_size: usize,
    scoper: IdScoper,
    backoff: BackoffPolicy,
    state: Mutex<PoolState>,
    lifecycle: tokio::sync::Mutex<()>,
    turns: TurnScheduler,
    event_tx: mpsc::UnboundedSender<RuntimeEvent>,
}

/// Pool of runtime workers behind a single runtime-shaped API
pub struct RuntimePool {
    inner: Arc<PoolInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RuntimeEvent>>>,
}

impl RuntimePool {
    /// Pool of `configured_size` workers cloned from `primary`
    pub fn new(primary: Arc<dyn RuntimeWorker>, configured_size: usize) -> Self {
        Self::build(
            primary,
            configured_size,
            recommended_turn_limit(logical_core_count()),
            BackoffPolicy::default(),
        )
    }

    pub fn with_config(primary: Arc<dyn RuntimeWorker>, config: &PoolConfig) -> Self {
        Self::build(
            primary,
            config.effective_pool_size(),
            config.effective_turn_limit(),
            config.backoff_policy(),
        )
    }

    fn build(
        primary: Arc<dyn RuntimeWorker>,
        configured_size: usize,
        max_turns_per_worker: usize,
        backoff: BackoffPolicy,
    ) -> Self {
        let configured_size = configured_size.max(1);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut health = HealthTracker::new();
        health.ensure(WorkerId::PRIMARY);
        let mut workers = BTreeMap::new();
        workers.insert(WorkerId::PRIMARY, primary);

        info!(
            "Creating runtime pool with {} workers ({} turns per worker)",
            configured_size, max_turns_per_worker
        );

        Self {
            inner: Arc::new(PoolInner {
                configured_size,
                scoper: IdScoper::for_pool_size(configured_size),
                backoff,
                state: Mutex::new(PoolState {
                    workers,
                    health,
                    approvals: ApprovalRoutes::new(),
                    pumps: HashMap::new(),
                    recovery: RecoveryScheduler::new(),
                    running: false,
                }),
                lifecycle: tokio::sync::Mutex::new(()),
                turns: TurnScheduler::new(max_turns_per_worker),
                event_tx,
            }),
            events: Mutex::new(Some(event_rx)),
        }
    }

    /// Target worker count; fixed for the pool's lifetime
    pub fn configured_size(&self) -> usize {
        self.inner.configured_size
    }

    /// The unified event stream; only the first call gets it
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<RuntimeEvent>> {
        self.events.lock().take()
    }

    // Lifecycle

    /// Create missing workers, then start every worker in order
    ///
    /// Stops at the first failure; workers already started stay started.
    pub async fn start(&self) -> Result<()> {
        self.inner.bring_up(LifecycleCall::Start).await
    }

    pub async fn restart(&self) -> Result<()> {
        self.inner.bring_up(LifecycleCall::Restart).await
    }

    /// Cancel pumps and recovery, drop routing state, stop every worker
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;

        let workers: Vec<(WorkerId, Arc<dyn RuntimeWorker>)> = {
            let mut state = self.inner.state.lock();
            for (_, pump) in state.pumps.drain() {
                pump.abort();
            }
            state.recovery.cancel_all();
            if !state.approvals.is_empty() {
                debug!("Dropping {} unanswered approvals", state.approvals.len());
                state.approvals.clear();
            }
            state.health.mark_all_stopped();
            self.inner.turns.cancel_all();
            state.running = false;
            state
                .workers
                .iter()
                .map(|(id, worker)| (*id, Arc::clone(worker)))
                .collect()
        };

        for (worker_id, worker) in workers {
            gauge!(IN_FLIGHT_TURNS, "worker" => worker_id.to_string()).set(0.0);
            worker.stop().await;
        }
        info!("Runtime pool stopped");
    }

    // Thread affinity

    /// Pin a local thread to the worker named in `scoped_thread_id`
    pub fn pin(&self, local_thread_id: LocalThreadId, scoped_thread_id: &str) {
        let worker_id = resolve_route(scoped_thread_id).worker_id;
        self.inner.state.lock().health.pin(local_thread_id, worker_id);
    }

    pub fn unpin(&self, local_thread_id: LocalThreadId) {
        self.inner.state.lock().health.unpin(local_thread_id);
    }

    pub fn reset_pins(&self) {
        self.inner.state.lock().health.reset_pins();
    }

    // Threads and turns

    /// Start a thread on the worker selected for `local_thread_id`
    pub async fn start_thread(
        &self,
        local_thread_id: LocalThreadId,
        cwd: Option<&str>,
        safety: Option<&SafetyConfig>,
    ) -> Result<String> {
        self.inner.ensure_workers_initialized().await?;

        let (worker_id, worker) = {
            let mut state = self.inner.state.lock();
            let worker_id = state
                .health
                .route_thread(local_thread_id, self.inner.configured_size);
            (worker_id, state.workers.get(&worker_id).cloned())
        };
        let worker = worker.ok_or(PoolError::ProcessNotRunning)?;

        debug!("Thread {} routed to worker {}", local_thread_id, worker_id);
        let raw_thread_id = worker.start_thread(cwd, safety).await?;
        Ok(self.inner.scoper.scope(&raw_thread_id, worker_id))
    }

    /// Start a turn on the worker that owns `request.thread_id`
    ///
    /// Waits for an admission slot on that worker first.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<String> {
        let route = self.inner.route_for(&request.thread_id)?;
        let worker_id = route.worker_id;
        let worker = self.inner.worker(worker_id).await?;

        let ticket = loop {
            let ticket = self.inner.turns.reserve(worker_id).await?;
            let mut state = self.inner.state.lock();
            if self.inner.turns.is_current(&ticket) {
                let in_flight = state.health.begin_turn(worker_id);
                gauge!(IN_FLIGHT_TURNS, "worker" => worker_id.to_string()).set(in_flight as f64);
                break ticket;
            }
            // The worker failed between admission and bookkeeping
            drop(state);
            self.inner.turns.release(ticket);
        };

        let raw_request = TurnRequest {
            thread_id: route.thread_id,
            ..request
        };
        match worker.start_turn(raw_request).await {
            Ok(raw_turn_id) => Ok(self.inner.scoper.scope(&raw_turn_id, worker_id)),
            Err(err) => {
                self.inner.abandon_turn(ticket);
                debug!("Turn start on worker {} failed: {}", worker_id, err);
                Err(err)
            }
        }
    }

    pub async fn steer_turn(
        &self,
        scoped_thread_id: &str,
        text: &str,
        expected_scoped_turn_id: &str,
    ) -> Result<()> {
        let route = self.inner.route_for(scoped_thread_id)?;
        let raw_turn_id = match parse_scoped_id(expected_scoped_turn_id) {
            Some((turn_worker, _)) if turn_worker != route.worker_id => {
                return Err(PoolError::InvalidResponse(format!(
                    "turn {} does not belong to thread {}",
                    expected_scoped_turn_id, scoped_thread_id
                )));
            }
            Some((_, raw)) => raw,
            None => expected_scoped_turn_id,
        };

        let worker = self.inner.worker(route.worker_id).await?;
        worker.steer_turn(&route.thread_id, text, raw_turn_id).await
    }

    /// Answer an approval raised on the unified stream
    ///
    /// Each pooled approval id can be answered once.
    pub async fn respond_to_approval(
        &self,
        request_id: i64,
        decision: ApprovalDecision,
    ) -> Result<()> {
        if !self.inner.scoper.is_enabled() {
            let worker = self.inner.primary()?;
            return worker.respond_to_approval(request_id, decision).await;
        }

        let route = self
            .inner
            .state
            .lock()
            .approvals
            .take(request_id)
            .ok_or_else(|| {
                PoolError::InvalidResponse(format!(
                    "unknown pooled approval request id: {}",
                    request_id
                ))
            })?;
        counter!(APPROVALS_ROUTED_TOTAL).increment(1);

        let worker = self.inner.worker(route.worker_id).await?;
        worker
            .respond_to_approval(route.raw_request_id, decision)
            .await
    }

    /// Point-in-time view of worker health and load
    pub fn snapshot(&self) -> PoolSnapshot {
        let queue_depths = self.inner.turns.queue_depths();

        let state = self.inner.state.lock();
        let workers = state.health.metrics(&queue_depths);
        PoolSnapshot {
            configured_worker_count: self.inner.configured_size,
            active_worker_count: state.workers.len(),
            pinned_thread_count: state.health.pinned_count(),
            total_queued_turns: queue_depths.values().sum(),
            total_in_flight_turns: workers.iter().map(|m| m.in_flight_turns).sum(),
            workers,
        }
    }

    // Primary-only operations

    pub async fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.inner.primary()?.capabilities().await)
    }

    pub async fn read_account(&self, refresh_token: bool) -> Result<AccountState> {
        self.inner.primary()?.read_account(refresh_token).await
    }

    pub async fn start_chatgpt_login(&self) -> Result<ChatGptLoginStart> {
        self.inner.primary()?.start_chatgpt_login().await
    }

    pub async fn cancel_chatgpt_login(&self, login_id: &str) -> Result<()> {
        self.inner.primary()?.cancel_chatgpt_login(login_id).await
    }

    pub async fn start_api_key_login(&self, api_key: &str) -> Result<()> {
        self.inner.primary()?.start_api_key_login(api_key).await
    }

    pub async fn logout_account(&self) -> Result<()> {
        self.inner.primary()?.logout_account().await
    }

    pub async fn list_all_models(&self) -> Result<Vec<ModelInfo>> {
        self.inner.primary()?.list_all_models().await
    }
}

impl PoolInner {
    async fn bring_up(self: &Arc<Self>, call: LifecycleCall) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_workers_initialized().await?;

        let workers: Vec<(WorkerId, Arc<dyn RuntimeWorker>)> = {
            let mut state = self.state.lock();
            state.running = true;
            if let LifecycleCall::Restart = call {
                state.recovery.cancel_all();
            }
            state
                .workers
                .iter()
                .map(|(id, worker)| (*id, Arc::clone(worker)))
                .collect()
        };

        for (worker_id, worker) in workers {
            self.state.lock().health.mark_starting(worker_id);

            let result = match call {
                LifecycleCall::Start => worker.start().await,
                LifecycleCall::Restart => worker.restart().await,
            };
            let mut state = self.state.lock();
            if let Err(err) = result {
                warn!("Worker {} failed to {:?}: {}", worker_id, call, err);
                self.fail_worker(&mut state, worker_id);
                return Err(err);
            }
            state.health.mark_healthy(worker_id, Utc::now());
            self.start_event_pump_if_needed(&mut state, worker_id);
            info!("Worker {} is healthy after {:?}", worker_id, call);
        }
        Ok(())
    }

    /// Materialise every slot up to the configured size by cloning the primary
    async fn ensure_workers_initialized(&self) -> Result<()> {
        let (primary, missing) = {
            let state = self.state.lock();
            let missing: Vec<WorkerId> = (0..self.configured_size)
                .map(WorkerId)
                .filter(|id| !state.workers.contains_key(id))
                .collect();
            (state.workers.get(&WorkerId::PRIMARY).cloned(), missing)
        };
        if missing.is_empty() {
            return Ok(());
        }
        let primary = primary.ok_or(PoolError::ProcessNotRunning)?;

        for worker_id in missing {
            let sibling = primary.make_sibling().await;
            let mut state = self.state.lock();
            state.workers.entry(worker_id).or_insert(sibling);
            state.health.ensure(worker_id);
            debug!("Materialised worker slot {}", worker_id);
        }
        Ok(())
    }

    async fn worker(&self, worker_id: WorkerId) -> Result<Arc<dyn RuntimeWorker>> {
        self.ensure_workers_initialized().await?;
        self.state
            .lock()
            .workers
            .get(&worker_id)
            .cloned()
            .ok_or(PoolError::ProcessNotRunning)
    }

    fn primary(&self) -> Result<Arc<dyn RuntimeWorker>> {
        self.state
            .lock()
            .workers
            .get(&WorkerId::PRIMARY)
            .cloned()
            .ok_or(PoolError::ProcessNotRunning)
    }

    /// Decode a caller thread id, rejecting workers outside the pool
    fn route_for(&self, thread_id: &str) -> Result<TurnRoute> {
        let route = resolve_route(thread_id);
        if route.worker_id.index() >= self.configured_size {
            return Err(PoolError::InvalidResponse(format!(
                "invalid scoped runtime worker id: {}",
                thread_id
            )));
        }
        Ok(route)
    }

    /// A turn failed to start; a ticket from before the worker's last reset
    /// no longer counts towards its in-flight turns
    fn abandon_turn(&self, ticket: TurnTicket) {
        let worker_id = ticket.worker_id();
        let mut state = self.state.lock();
        if self.turns.is_current(&ticket) {
            let in_flight = state.health.finish_turn(worker_id);
            gauge!(IN_FLIGHT_TURNS, "worker" => worker_id.to_string()).set(in_flight as f64);
        } else {
            debug!("Ignoring turn failure from before worker {} was reset", worker_id);
        }
        self.turns.release(ticket);
    }

    fn start_event_pump_if_needed(self: &Arc<Self>, state: &mut PoolState, worker_id: WorkerId) {
        if state
            .pumps
            .get(&worker_id)
            .is_some_and(|pump| !pump.is_finished())
        {
            return;
        }
        let Some(worker) = state.workers.get(&worker_id) else {
            return;
        };

        let pool = Arc::downgrade(self);
        let pump = spawn_event_pump(worker_id, worker.events(), move |worker_id, event| {
            match pool.upgrade() {
                Some(pool) => {
                    pool.handle_worker_event(worker_id, event);
                    true
                }
                None => false,
            }
        });
        state.pumps.insert(worker_id, pump);
    }

    fn handle_worker_event(self: &Arc<Self>, worker_id: WorkerId, event: RuntimeEvent) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }

        if event.is_fatal_termination() {
            if self.scoper.is_enabled() && !worker_id.is_primary() {
                self.handle_termination(&mut state, worker_id);
                return;
            }
            warn!("Primary worker {} terminated", worker_id);
            self.fail_worker(&mut state, worker_id);
        }

        if event.is_turn_completed() {
            let in_flight = state.health.finish_turn(worker_id);
            gauge!(IN_FLIGHT_TURNS, "worker" => worker_id.to_string()).set(in_flight as f64);
            self.turns.release_current(worker_id);
        }

        trace!("Forwarding event from worker {}", worker_id);
        let event = transform_event(event, worker_id, &self.scoper, &mut state.approvals);
        counter!(EVENTS_FORWARDED_TOTAL).increment(1);
        // Nobody listening is not an error
        let _ = self.event_tx.send(event);
    }

    /// Non-primary worker exited: fail it, move its threads, schedule a restart
    fn handle_termination(self: &Arc<Self>, state: &mut PoolState, worker_id: WorkerId) {
        warn!("Worker {} terminated", worker_id);
        let failures = self.fail_worker(state, worker_id);

        let fallback = state.health.fallback_worker(self.configured_size);
        let moved = state.health.reassign_pins(worker_id, fallback);
        debug!(
            "Reassigned {} threads from worker {} to worker {}",
            moved, worker_id, fallback
        );

        self.schedule_recovery(state, worker_id, failures);
    }

    fn fail_worker(&self, state: &mut PoolState, worker_id: WorkerId) -> u32 {
        let failures = state.health.record_failure(worker_id, Utc::now());
        self.turns.reset_worker(worker_id);
        counter!(WORKER_FAILURES_TOTAL, "worker" => worker_id.to_string()).increment(1);
        gauge!(IN_FLIGHT_TURNS, "worker" => worker_id.to_string()).set(0.0);
        failures
    }

    fn schedule_recovery(self: &Arc<Self>, state: &mut PoolState, worker_id: WorkerId, failures: u32) {
        if !state.running || state.recovery.is_scheduled(worker_id) {
            return;
        }

        let delay = self.backoff.delay_for(failures);
        state.health.mark_restarting(worker_id);
        info!(
            "Restarting worker {} in {:?} (failure {} in a row)",
            worker_id, delay, failures
        );

        let pool = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pool) = pool.upgrade() {
                pool.attempt_recovery(worker_id).await;
            }
        });
        state.recovery.insert(worker_id, task);
    }

    async fn attempt_recovery(self: &Arc<Self>, worker_id: WorkerId) {
        let worker = {
            let mut state = self.state.lock();
            if !state.running {
                state.recovery.finish(worker_id);
                return;
            }
            state.workers.get(&worker_id).cloned()
        };
        let Some(worker) = worker else {
            self.state.lock().recovery.finish(worker_id);
            return;
        };

        let result = worker.restart().await;

        let mut state = self.state.lock();
        state.recovery.finish(worker_id);
        if !state.running {
            return;
        }
        match result {
            Ok(()) => {
                state.health.mark_recovered(worker_id, Utc::now());
                counter!(WORKER_RESTARTS_TOTAL, "worker" => worker_id.to_string()).increment(1);
                self.start_event_pump_if_needed(&mut state, worker_id);
                info!("Worker {} recovered", worker_id);
            }
            Err(err) => {
                warn!("Worker {} restart failed: {}", worker_id, err);
                let failures = self.fail_worker(&mut state, worker_id);
                self.schedule_recovery(&mut state, worker_id, failures);
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for (_, pump) in self.state.get_mut().pumps.drain() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::health::WorkerHealthState;
    use crate::runtime::simulated::{SimulatedScript, SimulatedWorker};
    use std::time::Duration;
    use ulid::Ulid;

    fn pool_of(size: usize, script: SimulatedScript) -> (RuntimePool, SimulatedWorker) {
        let primary = SimulatedWorker::new(script);
        let config = PoolConfig {
            pool_size: size,
            max_parallel_turns_per_worker: 4,
            ..PoolConfig::default()
        };
        let pool = RuntimePool::with_config(Arc::new(primary.clone()), &config);
        (pool, primary)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    fn health_of(pool: &RuntimePool, worker_id: WorkerId) -> WorkerHealthState {
        pool.snapshot().worker(worker_id).map(|m| m.health).unwrap()
    }

    fn in_flight_of(pool: &RuntimePool, worker_id: WorkerId) -> usize {
        pool.snapshot()
            .worker(worker_id)
            .map(|m| m.in_flight_turns)
            .unwrap()
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_ids_are_not_scoped() {
        let (pool, _primary) = pool_of(1, SimulatedScript::default());
        let mut events = pool.take_event_receiver().unwrap();
        pool.start().await.unwrap();

        let thread_id = pool.start_thread(Ulid::new(), None, None).await.unwrap();
        assert_eq!(thread_id, "thr_1");

        let turn_id = pool
            .start_turn(TurnRequest::text(thread_id.clone(), "hello"))
            .await
            .unwrap();
        assert_eq!(turn_id, "turn_1");

        assert_eq!(
            events.recv().await.unwrap(),
            RuntimeEvent::ThreadStarted {
                thread_id: "thr_1".to_string()
            }
        );
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_materialises_all_slots_on_start() {
        let (pool, primary) = pool_of(3, SimulatedScript::default());
        pool.start().await.unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.configured_worker_count, 3);
        assert_eq!(snapshot.active_worker_count, 3);
        assert!(snapshot
            .workers
            .iter()
            .all(|m| m.health == WorkerHealthState::Healthy && m.last_start_at.is_some()));
        for index in 0..3 {
            assert_eq!(primary.sibling(index).unwrap().starts(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_primary_failover_and_recovery() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        let mut events = pool.take_event_receiver().unwrap();
        pool.start().await.unwrap();

        let thread = Ulid::new();
        pool.pin(thread, "w1|thr_seed");
        let scoped = pool.start_thread(thread, None, None).await.unwrap();
        assert_eq!(scoped, "w1|thr_1");

        primary.sibling(1).unwrap().crash();
        wait_until(|| health_of(&pool, WorkerId(1)) == WorkerHealthState::Restarting).await;

        let rerouted = pool.start_thread(thread, None, None).await.unwrap();
        assert!(rerouted.starts_with("w0|"), "got {}", rerouted);

        wait_until(|| health_of(&pool, WorkerId(1)) == WorkerHealthState::Healthy).await;
        let snapshot = pool.snapshot();
        let worker = snapshot.worker(WorkerId(1)).unwrap();
        assert_eq!(worker.restart_count, 1);
        assert_eq!(worker.failure_count, 0);
        assert!(worker.last_failure_at.is_some());

        // The termination never reaches callers
        assert!(!drain(&mut events).iter().any(|e| e.is_fatal_termination()));
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_backoff_doubles_to_cap() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        pool.start().await.unwrap();
        let worker = primary.sibling(1).unwrap();
        worker.fail_restarts(4);

        let crashed_at = tokio::time::Instant::now();
        worker.crash();
        wait_until(|| worker.restarts() == 1).await;

        let attempts = worker.restart_attempts();
        assert_eq!(attempts.len(), 5);
        let mut previous = crashed_at;
        let gaps: Vec<u64> = attempts
            .iter()
            .map(|attempt| {
                let gap = (*attempt - previous).as_millis() as u64;
                previous = *attempt;
                (gap + 500) / 1000
            })
            .collect();
        assert_eq!(gaps, vec![1, 2, 4, 8, 8]);

        let snapshot = pool.snapshot();
        let metrics = snapshot.worker(WorkerId(1)).unwrap();
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.restart_count, 1);
        assert_eq!(metrics.health, WorkerHealthState::Healthy);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_termination_is_forwarded_without_recovery() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        let mut events = pool.take_event_receiver().unwrap();
        pool.start().await.unwrap();

        primary.crash();
        let event = events.recv().await.unwrap();
        assert!(event.is_fatal_termination());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(health_of(&pool, WorkerId::PRIMARY), WorkerHealthState::Degraded);
        assert_eq!(primary.restart_attempts().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thread_on_terminated_primary_moves_to_sibling() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        let mut events = pool.take_event_receiver().unwrap();
        pool.start().await.unwrap();

        let thread = Ulid::new();
        pool.pin(thread, "w0|seed");
        assert_eq!(pool.start_thread(thread, None, None).await.unwrap(), "w0|thr_1");

        primary.crash();
        loop {
            match events.recv().await {
                Some(event) if event.is_fatal_termination() => break,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
        assert_eq!(health_of(&pool, WorkerId::PRIMARY), WorkerHealthState::Degraded);

        let moved = pool.start_thread(thread, None, None).await.unwrap();
        assert_eq!(moved, "w1|thr_1");
        assert_eq!(primary.sibling(1).unwrap().starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_recovery() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        pool.start().await.unwrap();
        let worker = primary.sibling(1).unwrap();

        worker.crash();
        wait_until(|| health_of(&pool, WorkerId(1)) == WorkerHealthState::Restarting).await;
        pool.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(worker.restart_attempts().is_empty());
        assert_eq!(health_of(&pool, WorkerId(1)), WorkerHealthState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_restart_cancels_pending_recovery() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        pool.start().await.unwrap();
        let worker = primary.sibling(1).unwrap();

        worker.crash();
        wait_until(|| health_of(&pool, WorkerId(1)) == WorkerHealthState::Restarting).await;
        pool.restart().await.unwrap();
        assert_eq!(worker.restart_attempts().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(worker.restart_attempts().len(), 1);
        let snapshot = pool.snapshot();
        let metrics = snapshot.worker(WorkerId(1)).unwrap();
        assert_eq!(metrics.health, WorkerHealthState::Healthy);
        assert_eq!(metrics.restart_count, 0);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stops_at_first_failing_worker() {
        let (pool, primary) = pool_of(3, SimulatedScript::default());
        pool.start().await.unwrap();
        pool.stop().await;

        let failing = primary.sibling(2).unwrap();
        failing.fail_next_starts(1);
        let err = pool.start().await.unwrap_err();
        assert_eq!(err, PoolError::Worker("simulated start failure".to_string()));

        assert_eq!(health_of(&pool, WorkerId(0)), WorkerHealthState::Healthy);
        assert_eq!(health_of(&pool, WorkerId(1)), WorkerHealthState::Healthy);
        let snapshot = pool.snapshot();
        let metrics = snapshot.worker(WorkerId(2)).unwrap();
        assert_eq!(metrics.health, WorkerHealthState::Degraded);
        assert_eq!(metrics.failure_count, 1);
        assert!(!failing.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_failing_after_worker_reset_keeps_new_turn_counted() {
        let primary = SimulatedWorker::new(SimulatedScript::with_latency(Duration::from_secs(60)));
        let config = PoolConfig {
            pool_size: 2,
            max_parallel_turns_per_worker: 1,
            ..PoolConfig::default()
        };
        let pool = Arc::new(RuntimePool::with_config(Arc::new(primary.clone()), &config));
        pool.start().await.unwrap();

        let thread = Ulid::new();
        pool.pin(thread, "w1|seed");
        let thread_id = pool.start_thread(thread, None, None).await.unwrap();
        let worker = primary.sibling(1).unwrap();

        // A turn start that is still in progress when the worker dies
        worker.stall_next_turns(1);
        let stale = tokio::spawn({
            let pool = Arc::clone(&pool);
            let thread_id = thread_id.clone();
            async move { pool.start_turn(TurnRequest::text(thread_id, "stale")).await }
        });
        wait_until(|| worker.stalled_turns() == 1).await;
        assert_eq!(in_flight_of(&pool, WorkerId(1)), 1);

        worker.crash();
        wait_until(|| worker.restarts() == 1).await;
        wait_until(|| health_of(&pool, WorkerId(1)) == WorkerHealthState::Healthy).await;

        pool.start_turn(TurnRequest::text(thread_id.clone(), "fresh"))
            .await
            .unwrap();
        assert_eq!(in_flight_of(&pool, WorkerId(1)), 1);

        worker.release_stalled_turns();
        assert!(stale.await.unwrap().is_err());
        assert_eq!(in_flight_of(&pool, WorkerId(1)), 1);

        // The fresh turn still holds the only slot
        let third = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.start_turn(TurnRequest::text(thread_id, "third")).await }
        });
        wait_until(|| pool.snapshot().total_queued_turns == 1).await;
        assert_eq!(in_flight_of(&pool, WorkerId(1)), 1);

        pool.stop().await;
        assert_eq!(third.await.unwrap(), Err(PoolError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_is_answered_once() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        let mut events = pool.take_event_receiver().unwrap();
        pool.start().await.unwrap();

        let thread = Ulid::new();
        pool.pin(thread, "w1|seed");
        pool.start_thread(thread, None, None).await.unwrap();

        let worker = primary.sibling(1).unwrap();
        let raw_id = worker.request_approval(Some("thr_1"), None);

        let request = loop {
            match events.recv().await {
                Some(RuntimeEvent::ApprovalRequested(request)) => break request,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        };
        assert_eq!(request.id, 1);
        assert_eq!(request.thread_id.as_deref(), Some("w1|thr_1"));

        pool.respond_to_approval(request.id, ApprovalDecision::Approve)
            .await
            .unwrap();
        assert_eq!(
            worker.answered_approvals(),
            vec![(raw_id, ApprovalDecision::Approve)]
        );

        let err = pool
            .respond_to_approval(request.id, ApprovalDecision::Approve)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown pooled approval request id"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_counter_returns_to_zero() {
        let (pool, primary) =
            pool_of(1, SimulatedScript::with_latency(Duration::from_millis(200)));
        let mut events = pool.take_event_receiver().unwrap();
        pool.start().await.unwrap();
        let thread_id = pool.start_thread(Ulid::new(), None, None).await.unwrap();

        primary.fail_next_turns(1);
        assert!(pool
            .start_turn(TurnRequest::text(thread_id.clone(), "fails"))
            .await
            .is_err());
        assert_eq!(pool.snapshot().total_in_flight_turns, 0);

        for _ in 0..3 {
            pool.start_turn(TurnRequest::text(thread_id.clone(), "works"))
                .await
                .unwrap();
        }
        assert_eq!(pool.snapshot().total_in_flight_turns, 3);

        wait_until(|| pool.snapshot().total_in_flight_turns == 0).await;
        let completed = drain(&mut events)
            .iter()
            .filter(|e| e.is_turn_completed())
            .count();
        assert_eq!(completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_queue_beyond_worker_limit() {
        let primary = SimulatedWorker::new(SimulatedScript::with_latency(Duration::from_secs(1)));
        let config = PoolConfig {
            pool_size: 1,
            max_parallel_turns_per_worker: 1,
            ..PoolConfig::default()
        };
        let pool = Arc::new(RuntimePool::with_config(Arc::new(primary), &config));
        pool.start().await.unwrap();
        let thread_id = pool.start_thread(Ulid::new(), None, None).await.unwrap();

        pool.start_turn(TurnRequest::text(thread_id.clone(), "first"))
            .await
            .unwrap();
        let queued = tokio::spawn({
            let pool = Arc::clone(&pool);
            let thread_id = thread_id.clone();
            async move { pool.start_turn(TurnRequest::text(thread_id, "second")).await }
        });

        wait_until(|| pool.snapshot().total_queued_turns == 1).await;
        assert_eq!(pool.snapshot().workers[0].queue_depth, 1);

        assert_eq!(queued.await.unwrap().unwrap(), "turn_2");
        assert_eq!(pool.snapshot().total_queued_turns, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_queued_turns() {
        let primary = SimulatedWorker::new(SimulatedScript::with_latency(Duration::from_secs(60)));
        let config = PoolConfig {
            pool_size: 1,
            max_parallel_turns_per_worker: 1,
            ..PoolConfig::default()
        };
        let pool = Arc::new(RuntimePool::with_config(Arc::new(primary), &config));
        pool.start().await.unwrap();
        let thread_id = pool.start_thread(Ulid::new(), None, None).await.unwrap();
        pool.start_turn(TurnRequest::text(thread_id.clone(), "busy"))
            .await
            .unwrap();

        let queued = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.start_turn(TurnRequest::text(thread_id, "waits")).await }
        });
        wait_until(|| pool.snapshot().total_queued_turns == 1).await;

        pool.stop().await;
        assert_eq!(queued.await.unwrap(), Err(PoolError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_worker_is_rejected() {
        let (pool, _primary) = pool_of(2, SimulatedScript::default());
        pool.start().await.unwrap();

        let err = pool
            .start_turn(TurnRequest::text("w5|thr_1", "hello"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_response());
        assert!(err.to_string().contains("invalid scoped runtime worker id"));
        assert_eq!(pool.snapshot().total_in_flight_turns, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscoped_thread_routes_to_primary() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        pool.start().await.unwrap();

        let thread = Ulid::new();
        pool.pin(thread, "w0|seed");
        let scoped = pool.start_thread(thread, None, None).await.unwrap();
        assert_eq!(scoped, "w0|thr_1");

        // Pre-pooling ids carry no prefix
        let turn_id = pool
            .start_turn(TurnRequest::text("thr_1", "legacy"))
            .await
            .unwrap();
        assert_eq!(turn_id, "w0|turn_1");
        assert_eq!(primary.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steer_rejects_turn_from_other_worker() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        pool.start().await.unwrap();

        let thread = Ulid::new();
        pool.pin(thread, "w1|seed");
        let scoped = pool.start_thread(thread, None, None).await.unwrap();

        let err = pool
            .steer_turn(&scoped, "faster", "w0|turn_1")
            .await
            .unwrap_err();
        assert!(err.is_invalid_response());

        pool.steer_turn(&scoped, "faster", "w1|turn_7").await.unwrap();
        assert_eq!(
            primary.sibling(1).unwrap().steered(),
            vec![("turn_7".to_string(), "faster".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_is_sticky_and_pin_overrides_hash() {
        let (pool, _primary) = pool_of(4, SimulatedScript::default());
        pool.start().await.unwrap();

        let thread = Ulid::new();
        let first = pool.start_thread(thread, None, None).await.unwrap();
        let second = pool.start_thread(thread, None, None).await.unwrap();
        assert_eq!(first[..3], second[..3]);

        pool.pin(thread, "w3|elsewhere");
        let pinned = pool.start_thread(thread, None, None).await.unwrap();
        assert!(pinned.starts_with("w3|"));
        assert_eq!(pool.snapshot().pinned_thread_count, 1);

        pool.unpin(thread);
        assert_eq!(pool.snapshot().pinned_thread_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (pool, primary) = pool_of(2, SimulatedScript::default());
        pool.start().await.unwrap();
        pool.pin(Ulid::new(), "w1|thr_1");

        pool.stop().await;
        pool.stop().await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.pinned_thread_count, 0);
        assert_eq!(snapshot.total_in_flight_turns, 0);
        assert!(snapshot
            .workers
            .iter()
            .all(|m| m.health == WorkerHealthState::Stopped));
        assert!(!primary.is_running());

        // Restart brings the pool back
        pool.restart().await.unwrap();
        assert_eq!(health_of(&pool, WorkerId(1)), WorkerHealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_through_uses_primary() {
        let (pool, _primary) = pool_of(3, SimulatedScript::default());
        pool.start().await.unwrap();

        let login = pool.start_chatgpt_login().await.unwrap();
        assert_eq!(login.login_id, "login_0");
        assert!(pool.capabilities().await.unwrap().turn_steer);
        assert_eq!(pool.list_all_models().await.unwrap().len(), 1);
    }
}
