//! Pull-based worker pools with capacity bounded by runtime configuration.
//!
//! A pool never loops internally: the external scheduler invokes
//! `perform_work` up to `max_concurrency()` times per cycle, which keeps the
//! concurrency bound enforced uniformly across every pool in the deployment.
//! Capacity is re-read on each call so operators can scale without a
//! redeploy.

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::Result;
use crate::executor::UnlockExecutor;
use crate::metrics::RetentionMetrics;
use crate::queue::UnlockQueue;
use engine_config::CapacityHandle;

/// What a single `perform_work` invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// One unit of work was pulled and processed.
    Performed,
    /// Nothing was pending; the invocation was a no-op.
    Idle,
}

/// The shared shape of a capacity-bounded, scheduler-driven worker.
#[async_trait]
pub trait LimitedCapacityWorker: Send + Sync {
    /// Upper bound on simultaneous `perform_work` invocations, re-evaluated
    /// every scheduling cycle.
    fn max_concurrency(&self) -> usize;

    /// Approximate units of pending work, for scheduling and observability.
    async fn remaining_work(&self) -> Result<usize>;

    /// Pull at most one unit of work and process it.
    async fn perform_work(&self) -> Result<WorkOutcome>;
}

/// Drains the unlock request queue through the unlock executor.
#[derive(Clone)]
pub struct UnlockWorkerPool {
    queue: UnlockQueue,
    executor: UnlockExecutor,
    capacity: CapacityHandle,
    metrics: RetentionMetrics,
}

impl UnlockWorkerPool {
    #[must_use]
    pub fn new(
        queue: UnlockQueue,
        executor: UnlockExecutor,
        capacity: CapacityHandle,
        metrics: RetentionMetrics,
    ) -> Self {
        Self {
            queue,
            executor,
            capacity,
            metrics,
        }
    }
}

#[async_trait]
impl LimitedCapacityWorker for UnlockWorkerPool {
    fn max_concurrency(&self) -> usize {
        self.capacity.max_concurrency()
    }

    async fn remaining_work(&self) -> Result<usize> {
        self.queue.size().await
    }

    async fn perform_work(&self) -> Result<WorkOutcome> {
        let Some(request) = self.queue.dequeue_oldest().await? else {
            return Ok(WorkOutcome::Idle);
        };

        let outcome = match self.executor.execute(request.pipeline_id).await {
            Ok(outcome) => outcome,
            Err(error) => {
                // Hard failure: put the request back for the next sweep
                // before surfacing to the scheduler.
                self.queue.enqueue(request.pipeline_id).await?;
                return Err(error);
            }
        };

        if outcome.exec_timeout {
            // The executor aborted cleanly mid-batch; put the pipeline back
            // so the next cycle finishes the job. Idempotent either way.
            self.queue.enqueue(request.pipeline_id).await?;
        }

        let wait_time = request.wait_time(Utc::now());
        let remaining_pending = self.queue.size().await?;

        info!(
            pipeline_id = %request.pipeline_id,
            project = outcome.project.map(|p| p.0),
            unlock_wait_time = wait_time.num_seconds(),
            remaining_pending,
            skipped_already_leased = outcome.skipped_already_leased,
            skipped_already_unlocked = outcome.skipped_already_unlocked,
            exec_timeout = outcome.exec_timeout,
            unlocked_job_artifacts = outcome.unlocked_job_artifacts,
            unlocked_pipeline_artifacts = outcome.unlocked_pipeline_artifacts,
            "unlock attempt finished"
        );
        self.metrics.record_unlock(&outcome).await;

        Ok(WorkOutcome::Performed)
    }
}
