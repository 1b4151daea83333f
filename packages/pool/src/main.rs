// packages/pool/src/main.rs
//! Runtime Pool load harness
//!
//! Starts a pool of simulated workers, drives concurrent turns through it
//! (optionally crashing one worker part-way) and prints the final snapshot.

use anyhow::{Context, Result};
use futures::future::join_all;
use runtime_pool::observability::{init_metrics, init_tracing};
use runtime_pool::runtime::simulated::tally_events;
use runtime_pool::runtime::{
    RuntimeEvent, RuntimePool, SimulatedScript, SimulatedWorker, TurnRequest,
};
use runtime_pool::utils::config::PoolConfig;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};
use ulid::Ulid;

#[tokio::main]
async fn main() -> Result<()> {
    let config = PoolConfig::load().context("failed to load configuration")?;

    init_tracing(&config.logging)?;
    init_metrics(config.metrics_listen_addr)?;

    info!("Starting runtime pool harness v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", config);

    let harness = config.harness.clone();
    let latency = Duration::from_millis(harness.latency_ms);
    let primary = SimulatedWorker::new(SimulatedScript {
        turn_latency: latency,
        latency_jitter: latency / 2,
    });
    let pool = Arc::new(RuntimePool::with_config(
        Arc::new(primary.clone()),
        &config,
    ));
    let mut events = pool
        .take_event_receiver()
        .context("event stream already taken")?;

    pool.start().await?;
    info!(
        "Pool started with {} workers; driving {} threads x {} turns",
        pool.configured_size(),
        harness.threads,
        harness.turns_per_thread
    );

    if let Some(index) = harness.crash_worker {
        if index == 0 || index >= pool.configured_size() {
            warn!("Ignoring crash_worker {}: not a non-primary worker", index);
        } else if let Some(victim) = primary.sibling(index) {
            tokio::spawn(async move {
                tokio::time::sleep(latency / 2).await;
                warn!("Crashing worker {}", index);
                victim.crash();
            });
        }
    }

    let started_at = Instant::now();
    let started = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let drivers = (0..harness.threads).map(|_| {
        let pool = Arc::clone(&pool);
        let started = Arc::clone(&started);
        let failed = Arc::clone(&failed);
        let turns = harness.turns_per_thread;
        tokio::spawn(async move {
            let thread_id = match pool.start_thread(Ulid::new(), None, None).await {
                Ok(thread_id) => thread_id,
                Err(err) => {
                    warn!("Thread start failed: {}", err);
                    failed.fetch_add(turns, Ordering::Relaxed);
                    return;
                }
            };
            for turn in 0..turns {
                let request = TurnRequest::text(thread_id.clone(), format!("turn {}", turn));
                match pool.start_turn(request).await {
                    Ok(_) => started.fetch_add(1, Ordering::Relaxed),
                    Err(err) => {
                        warn!("Turn start on {} failed: {}", thread_id, err);
                        failed.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        })
    });
    for result in join_all(drivers).await {
        result.context("turn driver panicked")?;
    }

    let started = started.load(Ordering::Relaxed);
    let deadline = started_at + Duration::from_secs(harness.timeout_secs);
    let mut seen: Vec<RuntimeEvent> = Vec::new();
    let mut completed = 0;
    while completed < started {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => {
                if event.is_turn_completed() {
                    completed += 1;
                }
                seen.push(event);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Timed out with {} of {} started turns completed",
                    completed, started
                );
                break;
            }
        }
    }

    let elapsed = started_at.elapsed();
    let summary = json!({
        "started_turns": started,
        "failed_turns": failed.load(Ordering::Relaxed),
        "completed_turns": completed,
        "elapsed_ms": elapsed.as_millis() as u64,
        "events": tally_events(&seen),
        "snapshot": pool.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    pool.stop().await;
    info!("Harness finished in {:?}", elapsed);
    Ok(())
}
