// packages/pool/src/runtime/worker.rs
//! Worker handle contract
//!
//! A worker is one externally supervised runtime process. The pool owns one
//! handle per slot and never looks past this trait: process spawning, wire
//! framing and turn semantics all live behind it.

use crate::runtime::events::{
    AccountState, ApprovalDecision, Capabilities, ChatGptLoginStart, ModelInfo, RuntimeEvent,
    SafetyConfig, TurnRequest,
};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Raw events from one worker, in emission order
pub type WorkerEventStream = BoxStream<'static, RuntimeEvent>;

/// Operations the pool consumes from a runtime worker
///
/// Identifiers passed in and returned are always raw (worker-local).
#[async_trait]
pub trait RuntimeWorker: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Restart in place; the handle stays the same
    async fn restart(&self) -> Result<()>;

    async fn stop(&self);

    async fn capabilities(&self) -> Capabilities;

    /// Start a thread and return its raw id
    async fn start_thread(&self, cwd: Option<&str>, safety: Option<&SafetyConfig>)
        -> Result<String>;

    /// Start a turn on `request.thread_id` and return the raw turn id
    async fn start_turn(&self, request: TurnRequest) -> Result<String>;

    async fn steer_turn(&self, thread_id: &str, text: &str, expected_turn_id: &str) -> Result<()>;

    async fn respond_to_approval(&self, request_id: i64, decision: ApprovalDecision) -> Result<()>;

    async fn read_account(&self, refresh_token: bool) -> Result<AccountState>;

    async fn start_chatgpt_login(&self) -> Result<ChatGptLoginStart>;

    async fn cancel_chatgpt_login(&self, login_id: &str) -> Result<()>;

    async fn start_api_key_login(&self, api_key: &str) -> Result<()>;

    async fn logout_account(&self) -> Result<()>;

    async fn list_all_models(&self) -> Result<Vec<ModelInfo>>;

    /// Subscribe to this worker's events
    ///
    /// Each call returns a fresh subscription; a subscription taken after a
    /// restart sees the restarted process's events.
    fn events(&self) -> WorkerEventStream;

    /// A new, unstarted handle equivalent to this one
    async fn make_sibling(&self) -> Arc<dyn RuntimeWorker>;
}
