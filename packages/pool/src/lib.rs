// packages/pool/src/lib.rs
//! Runtime Pool Library
//!
//! Runs several runtime worker processes behind one runtime-shaped API.
//! Threads are spread across workers by a stable hash, identifiers are
//! scoped so every later call finds its worker again, and failed
//! non-primary workers are restarted in the background.
//!
//! # Architecture
//!
//! - **runtime**: the pool, its routing and health machinery, worker contract
//! - **observability**: tracing and metrics setup
//! - **utils**: errors and configuration

pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::pool::RuntimePool;
pub use runtime::worker::RuntimeWorker;
pub use utils::config::PoolConfig;
pub use utils::errors::{PoolError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
