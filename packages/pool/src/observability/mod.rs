// packages/pool/src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Logging goes through `tracing`; `RUST_LOG` takes precedence over the
//! configured level. Metrics go through the `metrics` facade and are only
//! exported when a Prometheus listen address is configured; without a
//! recorder installed the pool's metric calls are no-ops.

use crate::utils::config::LoggingConfig;
use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const WORKER_FAILURES_TOTAL: &str = "runtime_pool_worker_failures_total";
pub const WORKER_RESTARTS_TOTAL: &str = "runtime_pool_worker_restarts_total";
pub const IN_FLIGHT_TURNS: &str = "runtime_pool_in_flight_turns";
pub const EVENTS_FORWARDED_TOTAL: &str = "runtime_pool_events_forwarded_total";
pub const APPROVALS_ROUTED_TOTAL: &str = "runtime_pool_approvals_routed_total";

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level directive '{}'", config.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()?;
    }

    Ok(())
}

/// Install the Prometheus exporter when `listen_addr` is set
pub fn init_metrics(listen_addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = listen_addr else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_metrics();
    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        WORKER_FAILURES_TOTAL,
        "Fatal terminations and failed restarts per worker"
    );
    describe_counter!(
        WORKER_RESTARTS_TOTAL,
        "Successful automatic restarts per worker"
    );
    describe_gauge!(IN_FLIGHT_TURNS, "Turns started but not yet completed per worker");
    describe_counter!(
        EVENTS_FORWARDED_TOTAL,
        "Events forwarded to the unified stream"
    );
    describe_counter!(
        APPROVALS_ROUTED_TOTAL,
        "Approval responses routed back to their worker"
    );
}
