// packages/pool/src/runtime/events.rs
//! Runtime event stream and request model
//!
//! Every worker emits the same `RuntimeEvent` variants; the pool re-emits them
//! on its unified stream with embedded identifiers rewritten to scoped form.

use serde::{Deserialize, Serialize};

/// Action method a worker emits when its process has exited for good
pub const RUNTIME_TERMINATED_METHOD: &str = "runtime/terminated";

/// Event emitted by a runtime worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    ThreadStarted {
        thread_id: String,
    },
    TurnStarted {
        thread_id: Option<String>,
        turn_id: String,
    },
    AssistantMessageDelta {
        thread_id: Option<String>,
        turn_id: Option<String>,
        item_id: String,
        delta: String,
    },
    CommandOutputDelta(CommandOutputDelta),
    FollowUpSuggestions(FollowUpSuggestionBatch),
    FileChangesUpdated(FileChangeUpdate),
    ApprovalRequested(ApprovalRequest),
    Action(RuntimeAction),
    TurnCompleted(TurnCompletion),
    AccountUpdated {
        auth_mode: AuthMode,
    },
    AccountLoginCompleted(LoginCompleted),
}

impl RuntimeEvent {
    /// Termination notice for a worker whose process exited
    pub fn terminated(detail: impl Into<String>) -> Self {
        RuntimeEvent::Action(RuntimeAction {
            method: RUNTIME_TERMINATED_METHOD.to_string(),
            item_id: None,
            item_type: "runtime".to_string(),
            thread_id: None,
            turn_id: None,
            title: "Runtime terminated".to_string(),
            detail: detail.into(),
        })
    }

    pub fn is_fatal_termination(&self) -> bool {
        matches!(self, RuntimeEvent::Action(action) if action.method == RUNTIME_TERMINATED_METHOD)
    }

    pub fn is_turn_completed(&self) -> bool {
        matches!(self, RuntimeEvent::TurnCompleted(_))
    }

    /// Thread identifier carried by the event, if any
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            RuntimeEvent::ThreadStarted { thread_id } => Some(thread_id),
            RuntimeEvent::TurnStarted { thread_id, .. }
            | RuntimeEvent::AssistantMessageDelta { thread_id, .. } => thread_id.as_deref(),
            RuntimeEvent::CommandOutputDelta(output) => output.thread_id.as_deref(),
            RuntimeEvent::FollowUpSuggestions(batch) => batch.thread_id.as_deref(),
            RuntimeEvent::FileChangesUpdated(update) => update.thread_id.as_deref(),
            RuntimeEvent::ApprovalRequested(request) => request.thread_id.as_deref(),
            RuntimeEvent::Action(action) => action.thread_id.as_deref(),
            RuntimeEvent::TurnCompleted(completion) => completion.thread_id.as_deref(),
            RuntimeEvent::AccountUpdated { .. } | RuntimeEvent::AccountLoginCompleted(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutputDelta {
    pub item_id: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpSuggestion {
    pub text: String,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpSuggestionBatch {
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub suggestions: Vec<FollowUpSuggestion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Add,
    Delete,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangeUpdate {
    pub item_id: Option<String>,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub status: String,
    pub changes: Vec<FileChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    CommandExecution,
    FileChange,
    Unknown,
}

/// Approval prompt raised by a worker; `id` is only meaningful to whoever emitted it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: i64,
    pub kind: ApprovalKind,
    pub method: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub item_id: Option<String>,
    pub reason: Option<String>,
    pub risk: Option<String>,
    pub cwd: Option<String>,
    pub command: Vec<String>,
    pub changes: Vec<FileChange>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeAction {
    pub method: String,
    pub item_id: Option<String>,
    pub item_type: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub title: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnCompletion {
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    ChatGpt,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginCompleted {
    pub login_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

// Requests

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Untrusted,
    OnFailure,
    OnRequest,
    Never,
}

/// Sandbox and approval settings applied to a thread or turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub sandbox_mode: SandboxMode,
    pub approval_policy: ApprovalPolicy,
    pub network_access: bool,
    pub writable_roots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillInput {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Text { text: String },
    Image { url: String },
    LocalImage { path: String },
    Mention { name: String, path: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOptions {
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

/// Everything needed to start a turn on a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub thread_id: String,
    pub text: String,
    pub safety: Option<SafetyConfig>,
    pub skill_inputs: Vec<SkillInput>,
    pub input_items: Vec<InputItem>,
    pub turn_options: Option<TurnOptions>,
}

impl TurnRequest {
    /// Plain-text turn with no extra inputs
    pub fn text(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            text: text.into(),
            safety: None,
            skill_inputs: Vec::new(),
            input_items: Vec::new(),
            turn_options: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    ApproveForSession,
    Decline,
    Cancel,
}

/// Optional protocol features a worker supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub turn_steer: bool,
    pub follow_up_suggestions: bool,
    pub model_listing: bool,
}

// Pass-through account operations

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub email: Option<String>,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub account: Option<Account>,
    pub auth_mode: AuthMode,
    pub requires_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatGptLoginStart {
    pub login_id: String,
    pub auth_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub is_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_is_fatal() {
        let event = RuntimeEvent::terminated("exit status 1");
        assert!(event.is_fatal_termination());
        assert!(!event.is_turn_completed());
    }

    #[test]
    fn test_regular_action_is_not_fatal() {
        let event = RuntimeEvent::Action(RuntimeAction {
            method: "item/started".to_string(),
            item_id: Some("item_1".to_string()),
            item_type: "commandExecution".to_string(),
            thread_id: Some("thr_1".to_string()),
            turn_id: None,
            title: "Started commandExecution".to_string(),
            detail: String::new(),
        });
        assert!(!event.is_fatal_termination());
        assert_eq!(event.thread_id(), Some("thr_1"));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RuntimeEvent::ThreadStarted {
            thread_id: "w1|thr_1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "thread_started");
        assert_eq!(json["thread_id"], "w1|thr_1");
    }
}
