// packages/pool/src/runtime/simulated.rs
//! In-process scripted worker
//!
//! `SimulatedWorker` stands in for a real runtime process in the load harness
//! and in tests. It mints raw ids (`thr_N`, `turn_N`), plays a fixed event
//! script for every turn and can be crashed on demand.
//!
//! Siblings created through `make_sibling` share one fleet registry, so a test
//! holding the primary can reach worker N with `sibling(N)`.

use crate::runtime::events::{
    Account, AccountState, ApprovalDecision, ApprovalKind, ApprovalRequest, AuthMode,
    Capabilities, ChatGptLoginStart, ModelInfo, RuntimeEvent, SafetyConfig, TurnCompletion,
    TurnRequest,
};
use crate::runtime::worker::{RuntimeWorker, WorkerEventStream};
use crate::utils::errors::{PoolError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::debug;

const EVENT_BUFFER: usize = 1024;

/// Behaviour shared by a simulated worker and its siblings
#[derive(Debug, Clone, Default)]
pub struct SimulatedScript {
    /// Time from turn start to completion
    pub turn_latency: Duration,

    /// Extra random latency, up to this much
    pub latency_jitter: Duration,
}

impl SimulatedScript {
    pub fn with_latency(turn_latency: Duration) -> Self {
        Self {
            turn_latency,
            latency_jitter: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct SimState {
    running: bool,
    generation: u64,
    next_thread: u64,
    next_turn: u64,
    next_approval: i64,
    threads: HashSet<String>,
    pending_approvals: HashSet<i64>,
    answered_approvals: Vec<(i64, ApprovalDecision)>,
    steered: Vec<(String, String)>,
    failing_turns: u32,
    failing_restarts: u32,
    failing_starts: u32,
    stalling_turns: u32,
    stalled_turns: usize,
    starts: u32,
    restart_attempts: Vec<Instant>,
    restarts: u32,
}

struct SimInner {
    index: usize,
    script: SimulatedScript,
    fleet: Arc<Mutex<Vec<Weak<SimInner>>>>,
    state: Mutex<SimState>,
    events: broadcast::Sender<RuntimeEvent>,
    stall_released: Notify,
}

/// Scripted in-process `RuntimeWorker`
#[derive(Clone)]
pub struct SimulatedWorker {
    inner: Arc<SimInner>,
}

impl SimulatedWorker {
    pub fn new(script: SimulatedScript) -> Self {
        Self::in_fleet(script, Arc::new(Mutex::new(Vec::new())))
    }

    fn in_fleet(script: SimulatedScript, fleet: Arc<Mutex<Vec<Weak<SimInner>>>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut members = fleet.lock();
        let inner = Arc::new(SimInner {
            index: members.len(),
            script,
            fleet: Arc::clone(&fleet),
            state: Mutex::new(SimState {
                next_approval: 100,
                ..SimState::default()
            }),
            events,
            stall_released: Notify::new(),
        });
        members.push(Arc::downgrade(&inner));
        drop(members);
        Self { inner }
    }

    /// Position in creation order; the first worker is 0
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// The fleet member created `index`-th, if it is still alive
    pub fn sibling(&self, index: usize) -> Option<SimulatedWorker> {
        let fleet = self.inner.fleet.lock();
        let inner = fleet.get(index)?.upgrade()?;
        Some(SimulatedWorker { inner })
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Simulate the process exiting: emit the termination notice and fail
    /// every call until restarted. Turns in progress never complete.
    pub fn crash(&self) {
        {
            let mut state = self.inner.state.lock();
            state.running = false;
            state.generation += 1;
        }
        debug!("Simulated worker {} crashed", self.inner.index);
        self.emit(RuntimeEvent::terminated("simulated worker exited"));
    }

    /// Fail the next `count` turn starts
    pub fn fail_next_turns(&self, count: u32) {
        self.inner.state.lock().failing_turns = count;
    }

    /// Fail the next `count` restarts
    pub fn fail_restarts(&self, count: u32) {
        self.inner.state.lock().failing_restarts = count;
    }

    /// Fail the next `count` starts
    pub fn fail_next_starts(&self, count: u32) {
        self.inner.state.lock().failing_starts = count;
    }

    /// Hold the next `count` turn starts until `release_stalled_turns`,
    /// which fails them the way a dropped transport would
    pub fn stall_next_turns(&self, count: u32) {
        self.inner.state.lock().stalling_turns = count;
    }

    pub fn release_stalled_turns(&self) {
        self.inner.stall_released.notify_waiters();
    }

    /// Turn starts currently held by `stall_next_turns`
    pub fn stalled_turns(&self) -> usize {
        self.inner.state.lock().stalled_turns
    }

    /// Push an arbitrary event onto this worker's stream
    pub fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Raise a command approval and return its raw request id
    pub fn request_approval(&self, thread_id: Option<&str>, turn_id: Option<&str>) -> i64 {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_approval;
            state.next_approval += 1;
            state.pending_approvals.insert(id);
            id
        };
        self.emit(RuntimeEvent::ApprovalRequested(ApprovalRequest {
            id,
            kind: ApprovalKind::CommandExecution,
            method: "item/commandExecution/requestApproval".to_string(),
            thread_id: thread_id.map(str::to_string),
            turn_id: turn_id.map(str::to_string),
            item_id: Some(format!("item_approval_{}", id)),
            reason: Some("simulated approval".to_string()),
            risk: None,
            cwd: None,
            command: vec!["true".to_string()],
            changes: Vec::new(),
            detail: "true".to_string(),
        }));
        id
    }

    pub fn starts(&self) -> u32 {
        self.inner.state.lock().starts
    }

    /// Successful restarts
    pub fn restarts(&self) -> u32 {
        self.inner.state.lock().restarts
    }

    /// When each restart attempt, failed or not, was made
    pub fn restart_attempts(&self) -> Vec<Instant> {
        self.inner.state.lock().restart_attempts.clone()
    }

    pub fn answered_approvals(&self) -> Vec<(i64, ApprovalDecision)> {
        self.inner.state.lock().answered_approvals.clone()
    }

    pub fn steered(&self) -> Vec<(String, String)> {
        self.inner.state.lock().steered.clone()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.state.lock().running {
            Ok(())
        } else {
            Err(PoolError::ProcessNotRunning)
        }
    }

    fn turn_delay(&self) -> Duration {
        let jitter = self.inner.script.latency_jitter;
        if jitter.is_zero() {
            return self.inner.script.turn_latency;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
        self.inner.script.turn_latency + Duration::from_millis(extra)
    }

    fn play_turn(&self, thread_id: String, turn_id: String, generation: u64) {
        let worker = self.clone();
        let delay = self.turn_delay();
        tokio::spawn(async move {
            worker.emit(RuntimeEvent::TurnStarted {
                thread_id: Some(thread_id.clone()),
                turn_id: turn_id.clone(),
            });
            tokio::time::sleep(delay).await;

            if worker.inner.state.lock().generation != generation {
                return;
            }
            worker.emit(RuntimeEvent::AssistantMessageDelta {
                thread_id: Some(thread_id.clone()),
                turn_id: Some(turn_id.clone()),
                item_id: format!("item_{}", turn_id),
                delta: "done".to_string(),
            });
            worker.emit(RuntimeEvent::TurnCompleted(TurnCompletion {
                thread_id: Some(thread_id),
                turn_id: Some(turn_id),
                status: "completed".to_string(),
                error_message: None,
            }));
        });
    }
}

#[async_trait]
impl RuntimeWorker for SimulatedWorker {
    async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(PoolError::Worker("simulated start failure".to_string()));
        }
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.restart_attempts.push(Instant::now());
        if state.failing_restarts > 0 {
            state.failing_restarts -= 1;
            return Err(PoolError::Worker("simulated restart failure".to_string()));
        }
        state.running = true;
        state.generation += 1;
        state.restarts += 1;
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.running = false;
        state.generation += 1;
    }

    async fn capabilities(&self) -> Capabilities {
        Capabilities {
            turn_steer: true,
            follow_up_suggestions: false,
            model_listing: true,
        }
    }

    async fn start_thread(
        &self,
        _cwd: Option<&str>,
        _safety: Option<&SafetyConfig>,
    ) -> Result<String> {
        self.ensure_running()?;
        let thread_id = {
            let mut state = self.inner.state.lock();
            state.next_thread += 1;
            let thread_id = format!("thr_{}", state.next_thread);
            state.threads.insert(thread_id.clone());
            thread_id
        };
        self.emit(RuntimeEvent::ThreadStarted {
            thread_id: thread_id.clone(),
        });
        Ok(thread_id)
    }

    async fn start_turn(&self, request: TurnRequest) -> Result<String> {
        self.ensure_running()?;
        let stall = {
            let mut state = self.inner.state.lock();
            if !state.threads.contains(&request.thread_id) {
                return Err(PoolError::InvalidResponse(format!(
                    "unknown thread: {}",
                    request.thread_id
                )));
            }
            if state.failing_turns > 0 {
                state.failing_turns -= 1;
                return Err(PoolError::Worker("simulated turn failure".to_string()));
            }
            if state.stalling_turns > 0 {
                state.stalling_turns -= 1;
                true
            } else {
                false
            }
        };

        if stall {
            let released = self.inner.stall_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            self.inner.state.lock().stalled_turns += 1;
            released.await;
            self.inner.state.lock().stalled_turns -= 1;
            return Err(PoolError::Worker("simulated transport closed".to_string()));
        }

        let (turn_id, generation) = {
            let mut state = self.inner.state.lock();
            state.next_turn += 1;
            (format!("turn_{}", state.next_turn), state.generation)
        };
        self.play_turn(request.thread_id, turn_id.clone(), generation);
        Ok(turn_id)
    }

    async fn steer_turn(&self, thread_id: &str, text: &str, expected_turn_id: &str) -> Result<()> {
        self.ensure_running()?;
        let mut state = self.inner.state.lock();
        if !state.threads.contains(thread_id) {
            return Err(PoolError::InvalidResponse(format!(
                "unknown thread: {}",
                thread_id
            )));
        }
        state
            .steered
            .push((expected_turn_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn respond_to_approval(&self, request_id: i64, decision: ApprovalDecision) -> Result<()> {
        self.ensure_running()?;
        let mut state = self.inner.state.lock();
        if !state.pending_approvals.remove(&request_id) {
            return Err(PoolError::InvalidResponse(format!(
                "unknown approval request id: {}",
                request_id
            )));
        }
        state.answered_approvals.push((request_id, decision));
        Ok(())
    }

    async fn read_account(&self, _refresh_token: bool) -> Result<AccountState> {
        self.ensure_running()?;
        Ok(AccountState {
            account: Some(Account {
                email: Some("simulated@example.com".to_string()),
                plan: None,
            }),
            auth_mode: AuthMode::ApiKey,
            requires_auth: false,
        })
    }

    async fn start_chatgpt_login(&self) -> Result<ChatGptLoginStart> {
        self.ensure_running()?;
        Ok(ChatGptLoginStart {
            login_id: format!("login_{}", self.inner.index),
            auth_url: "https://auth.example.com/simulated".to_string(),
        })
    }

    async fn cancel_chatgpt_login(&self, _login_id: &str) -> Result<()> {
        self.ensure_running()
    }

    async fn start_api_key_login(&self, _api_key: &str) -> Result<()> {
        self.ensure_running()?;
        self.emit(RuntimeEvent::AccountUpdated {
            auth_mode: AuthMode::ApiKey,
        });
        Ok(())
    }

    async fn logout_account(&self) -> Result<()> {
        self.ensure_running()
    }

    async fn list_all_models(&self) -> Result<Vec<ModelInfo>> {
        self.ensure_running()?;
        Ok(vec![ModelInfo {
            id: "simulated-model".to_string(),
            display_name: "Simulated".to_string(),
            is_default: true,
        }])
    }

    fn events(&self) -> WorkerEventStream {
        let receiver = self.inner.events.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Simulated event subscriber lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn make_sibling(&self) -> Arc<dyn RuntimeWorker> {
        let sibling = Self::in_fleet(self.inner.script.clone(), Arc::clone(&self.inner.fleet));
        Arc::new(sibling)
    }
}

/// Counts of simulated event kinds, for harness summaries
pub fn tally_events<'a>(events: impl IntoIterator<Item = &'a RuntimeEvent>) -> HashMap<&'static str, usize> {
    let mut tally = HashMap::new();
    for event in events {
        let kind = match event {
            RuntimeEvent::ThreadStarted { .. } => "thread_started",
            RuntimeEvent::TurnStarted { .. } => "turn_started",
            RuntimeEvent::AssistantMessageDelta { .. } => "assistant_message_delta",
            RuntimeEvent::CommandOutputDelta(_) => "command_output_delta",
            RuntimeEvent::FollowUpSuggestions(_) => "follow_up_suggestions",
            RuntimeEvent::FileChangesUpdated(_) => "file_changes_updated",
            RuntimeEvent::ApprovalRequested(_) => "approval_requested",
            RuntimeEvent::Action(_) => "action",
            RuntimeEvent::TurnCompleted(_) => "turn_completed",
            RuntimeEvent::AccountUpdated { .. } => "account_updated",
            RuntimeEvent::AccountLoginCompleted(_) => "account_login_completed",
        };
        *tally.entry(kind).or_insert(0) += 1;
    }
    tally
}
