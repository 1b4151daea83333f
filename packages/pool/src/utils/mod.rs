// packages/pool/src/utils/mod.rs
//! Shared utilities: error types and configuration

pub mod config;
pub mod errors;

pub use config::{HarnessConfig, LoggingConfig, PoolConfig};
pub use errors::{PoolError, Result};
