// packages/pool/src/utils/errors.rs
//! Error types for the runtime pool

use thiserror::Error;

/// Errors surfaced by the pool and by worker handles
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No worker slot exists (or the worker process is down) when one is required
    #[error("runtime process is not running")]
    ProcessNotRunning,

    /// A caller-supplied identifier could not be routed, or an approval id is unknown
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A worker handle rejected the call
    #[error("worker error: {0}")]
    Worker(String),

    /// The caller was waiting for turn admission when the pool stopped
    #[error("operation cancelled: pool stopped")]
    Cancelled,

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// True for errors that mean "the caller sent an identifier we cannot route"
    pub fn is_invalid_response(&self) -> bool {
        matches!(self, PoolError::InvalidResponse(_))
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, PoolError>;
