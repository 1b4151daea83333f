// packages/pool/src/runtime/scoped_id.rs
//! Worker-scoped identifiers
//!
//! A scoped identifier carries the worker that minted it: `w<N>|<raw-id>`.
//! Anything that does not match that shape is an unscoped id owned by the
//! primary worker, which keeps ids minted before pooling routable.
//!
//! ```text
//! "w3|thr_123"  -> (w3, "thr_123")
//! "thr_123"     -> (w0, "thr_123")
//! "w-1|thr_123" -> (w0, "w-1|thr_123")
//! ```

use crate::utils::errors::{PoolError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the worker prefix and the raw id
pub const SCOPED_DELIMITER: char = '|';

static SCOPED_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^w(\d+)\|(.+)$").expect("scoped id pattern is valid"));

/// Index of a worker slot; `w0` is the primary worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl WorkerId {
    pub const PRIMARY: WorkerId = WorkerId(0);

    pub fn index(self) -> usize {
        self.0
    }

    pub fn is_primary(self) -> bool {
        self == Self::PRIMARY
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Owning worker and worker-local thread id for a caller-supplied thread id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnRoute {
    pub worker_id: WorkerId,
    pub thread_id: String,
}

/// Prefix `raw_id` with its worker
///
/// Empty ids stay empty: `w1|` would not parse back as scoped.
pub fn scope(raw_id: &str, worker_id: WorkerId) -> String {
    if raw_id.is_empty() {
        return String::new();
    }
    format!("{}{}{}", worker_id, SCOPED_DELIMITER, raw_id)
}

/// Split a scoped id; `None` if it is not scoped
pub fn parse_scoped_id(id: &str) -> Option<(WorkerId, &str)> {
    let captures = SCOPED_ID_PATTERN.captures(id)?;
    let worker = captures.get(1)?.as_str().parse::<usize>().ok()?;
    let raw = captures.get(2)?.as_str();
    Some((WorkerId(worker), raw))
}

/// Decode any id; unscoped ids belong to the primary worker
pub fn decode(id: &str) -> (WorkerId, &str) {
    parse_scoped_id(id).unwrap_or((WorkerId::PRIMARY, id))
}

/// Raw id with any worker prefix removed
pub fn unscoped_id(id: &str) -> &str {
    decode(id).1
}

/// Route for a thread id that may predate pooling
pub fn resolve_route(thread_id: &str) -> TurnRoute {
    let (worker_id, raw) = decode(thread_id);
    TurnRoute {
        worker_id,
        thread_id: raw.to_string(),
    }
}

/// Route for a thread id that must already be scoped
pub fn resolve_strict_route(thread_id: &str) -> Result<TurnRoute> {
    let (worker_id, raw) = parse_scoped_id(thread_id).ok_or_else(|| {
        PoolError::InvalidResponse(format!("invalid scoped runtime thread id: {}", thread_id))
    })?;
    Ok(TurnRoute {
        worker_id,
        thread_id: raw.to_string(),
    })
}

/// Applies scoping only when the pool has more than one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdScoper {
    enabled: bool,
}

impl IdScoper {
    pub fn for_pool_size(pool_size: usize) -> Self {
        Self {
            enabled: pool_size > 1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scope(&self, raw_id: &str, worker_id: WorkerId) -> String {
        if self.enabled {
            scope(raw_id, worker_id)
        } else {
            raw_id.to_string()
        }
    }

    pub fn scope_opt(&self, raw_id: Option<String>, worker_id: WorkerId) -> Option<String> {
        raw_id.map(|id| self.scope(&id, worker_id))
    }
}
