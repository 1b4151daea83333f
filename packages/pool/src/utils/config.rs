// packages/pool/src/utils/config.rs
//! Pool configuration
//!
//! Layered with the `config` crate, lowest precedence first:
//!
//! 1. Built-in defaults (sized from the host's core count)
//! 2. `runtime-pool.{toml,yaml,json}` in the working directory, or the file
//!    named by `RUNTIME_POOL_CONFIG`
//! 3. `RUNTIME_POOL__*` environment variables (`__` separates nested keys,
//!    e.g. `RUNTIME_POOL__LOGGING__JSON=true`)

use crate::runtime::recovery::BackoffPolicy;
use crate::utils::errors::{PoolError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "RUNTIME_POOL_CONFIG";

const ENV_PREFIX: &str = "RUNTIME_POOL";
const DEFAULT_CONFIG_BASENAME: &str = "runtime-pool";
const MAX_TURNS_PER_WORKER: usize = 64;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Target worker count (clamped to at least 1)
    pub pool_size: usize,

    /// Concurrently running turns admitted per worker (clamped to 1..=64)
    pub max_parallel_turns_per_worker: usize,

    /// First recovery delay in seconds
    pub backoff_base_secs: u64,

    /// Longest recovery delay in seconds
    pub backoff_cap_secs: u64,

    pub logging: LoggingConfig,

    /// Prometheus exporter listen address; metrics stay in-process when unset
    pub metrics_listen_addr: Option<SocketAddr>,

    pub harness: HarnessConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load-harness settings used by the `runtime-pool` binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Conversation threads to open
    pub threads: usize,

    /// Turns started on each thread
    pub turns_per_thread: usize,

    /// Simulated turn latency in milliseconds
    pub latency_ms: u64,

    /// Non-primary worker to crash once while turns are running
    pub crash_worker: Option<usize>,

    /// How long to wait for every turn to complete
    pub timeout_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            threads: 16,
            turns_per_thread: 4,
            latency_ms: 50,
            crash_worker: None,
            timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = logical_core_count();
        Self {
            pool_size: recommended_pool_size(cores),
            max_parallel_turns_per_worker: recommended_turn_limit(cores),
            backoff_base_secs: 1,
            backoff_cap_secs: 8,
            logging: LoggingConfig::default(),
            metrics_listen_addr: None,
            harness: HarnessConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Load from defaults, the optional config file, and the environment
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(explicit.as_deref())
    }

    /// Load using `path` as the config file instead of the default lookup
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&PoolConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false)),
        };

        let config: PoolConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base_secs == 0 {
            return Err(PoolError::Config(
                "backoff_base_secs must be greater than 0".to_string(),
            ));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(PoolError::Config(format!(
                "backoff_cap_secs ({}) must not be smaller than backoff_base_secs ({})",
                self.backoff_cap_secs, self.backoff_base_secs
            )));
        }
        Ok(())
    }

    /// Worker count actually used by the pool
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.max(1)
    }

    /// Per-worker turn admission limit actually used by the pool
    pub fn effective_turn_limit(&self) -> usize {
        self.max_parallel_turns_per_worker
            .clamp(1, MAX_TURNS_PER_WORKER)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_cap_secs),
        )
    }
}

/// Logical cores visible to this process
pub fn logical_core_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Half the logical cores, kept between 2 and 8 workers
pub fn recommended_pool_size(logical_cores: usize) -> usize {
    (logical_cores.max(1) / 2).clamp(2, 8)
}

/// Per-worker turn limit scaled with the host
pub fn recommended_turn_limit(logical_cores: usize) -> usize {
    match logical_cores {
        n if n >= 16 => 5,
        n if n >= 10 => 4,
        n if n >= 6 => 3,
        _ => 2,
    }
}
