//! Retention Engine Service - scheduler harness for the unlock and reaper pools
//!
//! This service drives the retention engine's pull-based workers:
//! - Polling the unlock worker pool up to its capacity each cycle
//! - Registering, claiming and reaping expired-artifact buckets
//! - Recovering stale bucket claims left behind by crashed workers
//! - Emitting a metrics snapshot on shutdown
//!
//! Capacity tiers are read from the environment and re-evaluated every
//! cycle, so the deployment scales by flipping `RETENTION_UNLOCK_CAPACITY` /
//! `RETENTION_REAPER_CAPACITY` rather than redeploying. Standalone runs wire
//! the in-memory stores; a production deployment constructs the same engine
//! against its database- and Redis-backed store implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engine_config::EngineSettings;
use retention::bucket::BucketManager;
use retention::lease::ProjectLock;
use retention::store::{
    CoordinationStore, InMemoryCoordinationStore, InMemoryPipelineStore, PipelineStore,
};
use retention::{
    ExpiredArtifactReaper, LimitedCapacityWorker, ReaperPool, RetentionMetrics, UnlockExecutor,
    UnlockQueue, UnlockWorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "retention-engine", version, about = "Pipeline artifact retention engine")]
struct Args {
    /// Seconds between unlock pool scheduling cycles
    #[arg(long, env = "RETENTION_UNLOCK_POLL_SECS", default_value_t = 5)]
    unlock_poll_secs: u64,

    /// Seconds between reaper scheduling cycles
    #[arg(long, env = "RETENTION_REAPER_POLL_SECS", default_value_t = 30)]
    reaper_poll_secs: u64,

    /// Seconds between stale bucket claim recovery sweeps
    #[arg(long, env = "RETENTION_RECOVERY_POLL_SECS", default_value_t = 300)]
    recovery_poll_secs: u64,

    /// Log filter directive (e.g. "info" or "retention=debug")
    #[arg(long, env = "RETENTION_LOG", default_value = "info")]
    log_filter: String,
}

/// Invoke a pool `max_concurrency()` times concurrently, as the external
/// scheduler contract requires. Worker-level failures are logged; the next
/// cycle retries whatever is still queued.
async fn run_scheduler_cycle(pool: &Arc<dyn LimitedCapacityWorker>, name: &str) {
    let slots = pool.max_concurrency();
    if slots == 0 {
        return;
    }

    let invocations = (0..slots).map(|_| pool.perform_work());
    for result in join_all(invocations).await {
        if let Err(e) = result {
            error!(pool = name, error = %e, "worker invocation failed");
        }
    }

    match pool.remaining_work().await {
        Ok(remaining) if remaining > 0 => {
            info!(pool = name, remaining, "work left for next cycle");
        }
        Ok(_) => {}
        Err(e) => warn!(pool = name, error = %e, "failed to read remaining work"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = EngineSettings::from_env();
    settings.validate().context("invalid engine settings")?;
    info!(
        unlock_capacity = settings.unlock_capacity.max_concurrency(),
        reaper_capacity = settings.reaper_capacity.max_concurrency(),
        "starting retention engine"
    );

    let coordination: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let pipelines: Arc<dyn PipelineStore> = Arc::new(InMemoryPipelineStore::new());
    let metrics = RetentionMetrics::new();

    let queue = UnlockQueue::new(Arc::clone(&coordination));
    let executor = UnlockExecutor::new(
        Arc::clone(&pipelines),
        ProjectLock::new(Arc::clone(&coordination), &settings.unlock),
        settings.unlock.clone(),
    );
    let unlock_pool: Arc<dyn LimitedCapacityWorker> = Arc::new(UnlockWorkerPool::new(
        queue,
        executor,
        settings.unlock_capacity.clone(),
        metrics.clone(),
    ));

    let buckets = BucketManager::new(
        Arc::clone(&coordination),
        settings.reaper_capacity.clone(),
        settings.reaper.claim_ttl(),
    );
    let reaper_pool: Arc<dyn LimitedCapacityWorker> = Arc::new(ReaperPool::new(
        ExpiredArtifactReaper::new(Arc::clone(&pipelines), settings.reaper.clone()),
        buckets.clone(),
        metrics.clone(),
    ));

    let unlock_loop = {
        let pool = Arc::clone(&unlock_pool);
        let mut ticker = tokio::time::interval(Duration::from_secs(args.unlock_poll_secs));
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                run_scheduler_cycle(&pool, "unlock").await;
            }
        })
    };

    let reaper_loop = {
        let pool = Arc::clone(&reaper_pool);
        let buckets = buckets.clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(args.reaper_poll_secs));
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                // Fresh deployments and scale-ups become claimable before
                // workers fire.
                let max_buckets = buckets.max_buckets();
                if let Err(e) = buckets.enqueue_missing_buckets(max_buckets).await {
                    warn!(error = %e, "failed to register reaper buckets");
                }
                run_scheduler_cycle(&pool, "reaper").await;
            }
        })
    };

    let recovery_loop = {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.recovery_poll_secs));
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                match buckets.recover_stale_buckets().await {
                    Ok(0) => {}
                    Ok(recovered) => info!(recovered, "recovered stale bucket claims"),
                    Err(e) => warn!(error = %e, "stale claim recovery failed"),
                }
            }
        })
    };

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping scheduler loops");

    unlock_loop.abort();
    reaper_loop.abort();
    recovery_loop.abort();

    let snapshot = metrics.snapshot().await;
    info!(
        metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "final metrics snapshot"
    );
    Ok(())
}
