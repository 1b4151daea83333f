// packages/pool/src/runtime/multiplexer.rs
//! Event multiplexing
//!
//! One pump task per worker drains that worker's raw stream in order and hands
//! each event to the pool. The pool decides whether an event is a fatal
//! termination; everything else is passed through `transform_event`, which
//! rewrites embedded ids to scoped form and swaps worker approval ids for
//! synthetic pool-wide ones.
//!
//! ```text
//! worker w0 stream ──► pump(w0) ──┐
//! worker w1 stream ──► pump(w1) ──┼──► pool.handle_worker_event ──► unified stream
//! worker wN stream ──► pump(wN) ──┘
//! ```

use crate::runtime::events::{
    ApprovalRequest, CommandOutputDelta, FileChangeUpdate, FollowUpSuggestionBatch, RuntimeAction,
    RuntimeEvent, TurnCompletion,
};
use crate::runtime::scoped_id::{IdScoper, WorkerId};
use crate::runtime::worker::WorkerEventStream;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Where a synthetic approval id should be answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalRoute {
    pub worker_id: WorkerId,
    pub raw_request_id: i64,
}

/// Synthetic approval id allocation
///
/// Ids start at 1 and only ever increase; clearing the routes does not reset
/// the counter, so an id is never handed out twice.
#[derive(Debug)]
pub struct ApprovalRoutes {
    routes: HashMap<i64, ApprovalRoute>,
    next_id: i64,
}

impl Default for ApprovalRoutes {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            next_id: 1,
        }
    }
}

impl ApprovalRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker_id: WorkerId, raw_request_id: i64) -> i64 {
        let synthetic_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.routes.insert(
            synthetic_id,
            ApprovalRoute {
                worker_id,
                raw_request_id,
            },
        );
        synthetic_id
    }

    /// Consume a route; a second `take` of the same id returns `None`
    pub fn take(&mut self, synthetic_id: i64) -> Option<ApprovalRoute> {
        self.routes.remove(&synthetic_id)
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Rewrite every id embedded in `event` for the unified stream
pub fn transform_event(
    event: RuntimeEvent,
    worker_id: WorkerId,
    scoper: &IdScoper,
    approvals: &mut ApprovalRoutes,
) -> RuntimeEvent {
    if !scoper.is_enabled() {
        return event;
    }
    let scope = |id: Option<String>| scoper.scope_opt(id, worker_id);

    match event {
        RuntimeEvent::ThreadStarted { thread_id } => RuntimeEvent::ThreadStarted {
            thread_id: scoper.scope(&thread_id, worker_id),
        },
        RuntimeEvent::TurnStarted { thread_id, turn_id } => RuntimeEvent::TurnStarted {
            thread_id: scope(thread_id),
            turn_id: scoper.scope(&turn_id, worker_id),
        },
        RuntimeEvent::AssistantMessageDelta {
            thread_id,
            turn_id,
            item_id,
            delta,
        } => RuntimeEvent::AssistantMessageDelta {
            thread_id: scope(thread_id),
            turn_id: scope(turn_id),
            item_id: scoper.scope(&item_id, worker_id),
            delta,
        },
        RuntimeEvent::CommandOutputDelta(output) => {
            RuntimeEvent::CommandOutputDelta(CommandOutputDelta {
                item_id: scoper.scope(&output.item_id, worker_id),
                thread_id: scope(output.thread_id),
                turn_id: scope(output.turn_id),
                delta: output.delta,
            })
        }
        RuntimeEvent::FollowUpSuggestions(batch) => {
            RuntimeEvent::FollowUpSuggestions(FollowUpSuggestionBatch {
                thread_id: scope(batch.thread_id),
                turn_id: scope(batch.turn_id),
                suggestions: batch.suggestions,
            })
        }
        RuntimeEvent::FileChangesUpdated(update) => {
            RuntimeEvent::FileChangesUpdated(FileChangeUpdate {
                item_id: scope(update.item_id),
                thread_id: scope(update.thread_id),
                turn_id: scope(update.turn_id),
                status: update.status,
                changes: update.changes,
            })
        }
        RuntimeEvent::ApprovalRequested(request) => {
            let synthetic_id = approvals.register(worker_id, request.id);
            trace!(
                "Approval {} from worker {} exposed as {}",
                request.id,
                worker_id,
                synthetic_id
            );
            RuntimeEvent::ApprovalRequested(ApprovalRequest {
                id: synthetic_id,
                thread_id: scope(request.thread_id),
                turn_id: scope(request.turn_id),
                item_id: scope(request.item_id),
                ..request
            })
        }
        RuntimeEvent::Action(action) => RuntimeEvent::Action(RuntimeAction {
            item_id: scope(action.item_id),
            thread_id: scope(action.thread_id),
            turn_id: scope(action.turn_id),
            ..action
        }),
        RuntimeEvent::TurnCompleted(completion) => RuntimeEvent::TurnCompleted(TurnCompletion {
            thread_id: scope(completion.thread_id),
            turn_id: scope(completion.turn_id),
            status: completion.status,
            error_message: completion.error_message,
        }),
        RuntimeEvent::AccountUpdated { .. } | RuntimeEvent::AccountLoginCompleted(_) => event,
    }
}

/// Drain `events` on a new task, handing each event to `deliver`
///
/// The pump ends when the stream ends or `deliver` returns false.
pub fn spawn_event_pump<F>(
    worker_id: WorkerId,
    mut events: WorkerEventStream,
    mut deliver: F,
) -> JoinHandle<()>
where
    F: FnMut(WorkerId, RuntimeEvent) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if !deliver(worker_id, event) {
                break;
            }
        }
        debug!("Event pump for worker {} finished", worker_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::events::{ApprovalKind, AuthMode};
    use futures::stream;
    use tokio::sync::mpsc;

    fn approval(id: i64) -> RuntimeEvent {
        RuntimeEvent::ApprovalRequested(ApprovalRequest {
            id,
            kind: ApprovalKind::CommandExecution,
            method: "item/commandExecution/requestApproval".to_string(),
            thread_id: Some("thr_1".to_string()),
            turn_id: Some("turn_1".to_string()),
            item_id: Some("item_1".to_string()),
            reason: None,
            risk: None,
            cwd: None,
            command: vec!["ls".to_string()],
            changes: Vec::new(),
            detail: "ls".to_string(),
        })
    }

    #[test]
    fn test_disabled_scoper_forwards_unchanged() {
        let scoper = IdScoper::for_pool_size(1);
        let mut routes = ApprovalRoutes::new();
        let event = approval(42);

        let out = transform_event(event.clone(), WorkerId::PRIMARY, &scoper, &mut routes);
        assert_eq!(out, event);
        assert!(routes.is_empty());
    }

    #[test]
    fn test_ids_are_scoped() {
        let scoper = IdScoper::for_pool_size(3);
        let mut routes = ApprovalRoutes::new();
        let event = RuntimeEvent::AssistantMessageDelta {
            thread_id: Some("thr_1".to_string()),
            turn_id: None,
            item_id: "item_9".to_string(),
            delta: "hi".to_string(),
        };

        let out = transform_event(event, WorkerId(2), &scoper, &mut routes);
        assert_eq!(
            out,
            RuntimeEvent::AssistantMessageDelta {
                thread_id: Some("w2|thr_1".to_string()),
                turn_id: None,
                item_id: "w2|item_9".to_string(),
                delta: "hi".to_string(),
            }
        );
    }

    #[test]
    fn test_approval_gets_synthetic_id_and_route() {
        let scoper = IdScoper::for_pool_size(2);
        let mut routes = ApprovalRoutes::new();

        let first = transform_event(approval(500), WorkerId(1), &scoper, &mut routes);
        let second = transform_event(approval(500), WorkerId(0), &scoper, &mut routes);

        let RuntimeEvent::ApprovalRequested(first) = first else {
            panic!("expected approval");
        };
        let RuntimeEvent::ApprovalRequested(second) = second else {
            panic!("expected approval");
        };
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.thread_id.as_deref(), Some("w1|thr_1"));
        assert_eq!(first.command, vec!["ls".to_string()]);

        assert_eq!(
            routes.take(1),
            Some(ApprovalRoute {
                worker_id: WorkerId(1),
                raw_request_id: 500
            })
        );
        assert_eq!(routes.take(1), None);
    }

    #[test]
    fn test_synthetic_ids_survive_clear() {
        let mut routes = ApprovalRoutes::new();
        assert_eq!(routes.register(WorkerId(1), 7), 1);
        routes.clear();
        assert_eq!(routes.register(WorkerId(1), 7), 2);
    }

    #[test]
    fn test_account_events_untouched() {
        let scoper = IdScoper::for_pool_size(2);
        let mut routes = ApprovalRoutes::new();
        let event = RuntimeEvent::AccountUpdated {
            auth_mode: AuthMode::ApiKey,
        };
        assert_eq!(
            transform_event(event.clone(), WorkerId(1), &scoper, &mut routes),
            event
        );
    }

    #[tokio::test]
    async fn test_pump_preserves_order_and_stops_on_false() {
        let events: Vec<RuntimeEvent> = (0..5)
            .map(|n| RuntimeEvent::ThreadStarted {
                thread_id: format!("thr_{}", n),
            })
            .collect();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let pump = spawn_event_pump(WorkerId(1), stream::iter(events).boxed(), move |w, e| {
            let keep_going = e.thread_id() != Some("thr_2");
            let _ = tx.send((w, e));
            keep_going
        });
        pump.await.unwrap();

        let mut seen = Vec::new();
        while let Ok((worker_id, event)) = rx.try_recv() {
            assert_eq!(worker_id, WorkerId(1));
            seen.push(event.thread_id().map(str::to_string));
        }
        assert_eq!(
            seen,
            vec![
                Some("thr_0".to_string()),
                Some("thr_1".to_string()),
                Some("thr_2".to_string())
            ]
        );
    }
}
