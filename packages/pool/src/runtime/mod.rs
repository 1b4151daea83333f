// packages/pool/src/runtime/mod.rs
//! Runtime worker pooling
//!
//! This module spreads conversation threads across several runtime workers:
//!
//! - **Pool**: the public orchestrator; lifecycle, routing, snapshots
//! - **Scoped ids**: `w<N>|<raw>` identifiers that remember their worker
//! - **Selector**: deterministic thread-to-worker hashing with pins
//! - **Health**: per-worker state machine and counters
//! - **Recovery**: capped exponential backoff restarts
//! - **Turn scheduler**: per-worker admission of concurrent turns
//! - **Multiplexer**: per-worker event pumps feeding one unified stream
//! - **Simulated**: an in-process worker for tests and load runs
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 RuntimePool                   │
//! │  ┌────────┐  ┌────────┐        ┌────────┐     │
//! │  │ w0     │  │ w1     │  ...   │ wN-1   │     │
//! │  │primary │  │sibling │        │sibling │     │
//! │  └───┬────┘  └───┬────┘        └───┬────┘     │
//! │      │ events    │ events          │ events   │
//! │      └───────────┴───────┬─────────┘          │
//! │                          ▼                    │
//! │              unified event stream             │
//! └───────────────────────────────────────────────┘
//! ```

pub mod events;
pub mod health;
pub mod multiplexer;
pub mod pool;
pub mod recovery;
pub mod scoped_id;
pub mod selector;
pub mod simulated;
pub mod turn_scheduler;
pub mod worker;

// Re-export commonly used types
pub use events::{RuntimeEvent, TurnRequest};
pub use health::{PoolSnapshot, WorkerHealthState, WorkerMetrics};
pub use pool::RuntimePool;
pub use recovery::BackoffPolicy;
pub use scoped_id::{TurnRoute, WorkerId};
pub use selector::{LocalThreadId, Selection};
pub use simulated::{SimulatedScript, SimulatedWorker};
pub use worker::{RuntimeWorker, WorkerEventStream};
