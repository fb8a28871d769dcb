//! The unlock executor: one pipeline per call, exactly-once-effective.
//!
//! Execution is serialized per project through the unlock lease, re-validates
//! state after acquisition (the queue entry may be stale), performs the
//! unlock in bounded batches, and aborts cleanly when the execution budget
//! runs out so the caller can re-enqueue.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::lease::{Acquire, ProjectLock};
use crate::pipeline::{LockState, Pipeline, PipelineId, ProjectId};
use crate::store::PipelineStore;
use engine_config::UnlockTuning;

/// Terminal status of an unlock execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockStatus {
    /// The pipeline's artifacts were transitioned to unlocked.
    #[default]
    Success,
    /// Nothing to do: already leased, already unlocked, or the pipeline row
    /// is gone.
    Skipped,
    /// The execution budget ran out mid-batch; re-enqueue and retry.
    TimedOut,
}

impl UnlockStatus {
    /// Status name as a lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Everything a caller needs to know about one unlock attempt. Non-progress
/// outcomes are flags here, never errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnlockOutcome {
    pub status: UnlockStatus,
    /// Project the pipeline belongs to, when the row still existed.
    pub project: Option<ProjectId>,
    pub skipped_already_leased: bool,
    pub skipped_already_unlocked: bool,
    pub exec_timeout: bool,
    pub unlocked_job_artifacts: usize,
    pub unlocked_pipeline_artifacts: usize,
}

/// Performs the locked → unlocked transition for one pipeline.
#[derive(Clone)]
pub struct UnlockExecutor {
    pipelines: Arc<dyn PipelineStore>,
    lock: ProjectLock,
    tuning: UnlockTuning,
}

impl UnlockExecutor {
    #[must_use]
    pub fn new(pipelines: Arc<dyn PipelineStore>, lock: ProjectLock, tuning: UnlockTuning) -> Self {
        Self {
            pipelines,
            lock,
            tuning,
        }
    }

    /// Unlock one pipeline's artifacts.
    ///
    /// # Errors
    ///
    /// Only lease retry exhaustion ([`crate::error::RetentionError::LeaseUnavailable`])
    /// and store failures surface as errors; every expected non-progress
    /// outcome is reported through the returned [`UnlockOutcome`].
    pub async fn execute(&self, pipeline_id: PipelineId) -> Result<UnlockOutcome> {
        let Some(pipeline) = self.pipelines.pipeline(pipeline_id).await? else {
            // The row was purged while queued; nothing left to unlock.
            warn!(pipeline_id = %pipeline_id, "pipeline vanished before unlock");
            return Ok(UnlockOutcome {
                status: UnlockStatus::Skipped,
                ..UnlockOutcome::default()
            });
        };

        match self.lock.acquire(pipeline.project_id).await? {
            Acquire::HeldElsewhere { holder } => {
                debug!(
                    pipeline_id = %pipeline_id,
                    project = %pipeline.project_id,
                    holder = %holder,
                    "unlock already in progress for project"
                );
                Ok(UnlockOutcome {
                    status: UnlockStatus::Skipped,
                    project: Some(pipeline.project_id),
                    skipped_already_leased: true,
                    ..UnlockOutcome::default()
                })
            }
            Acquire::Acquired(lease) => {
                let outcome = self.unlock_under_lease(&pipeline).await;
                if let Err(error) = lease.release().await {
                    // The outcome stands either way; the lease self-expires.
                    warn!(
                        pipeline_id = %pipeline_id,
                        error = %error,
                        "failed to release unlock lease"
                    );
                }
                outcome
            }
        }
    }

    async fn unlock_under_lease(&self, pipeline: &Pipeline) -> Result<UnlockOutcome> {
        let mut outcome = UnlockOutcome {
            project: Some(pipeline.project_id),
            ..UnlockOutcome::default()
        };

        // Re-validate under the lease: another executor or a direct
        // transition may have handled this pipeline already.
        let Some(current) = self.pipelines.pipeline(pipeline.id).await? else {
            outcome.status = UnlockStatus::Skipped;
            return Ok(outcome);
        };
        if current.lock_state == LockState::Unlocked {
            outcome.status = UnlockStatus::Skipped;
            outcome.skipped_already_unlocked = true;
            return Ok(outcome);
        }

        let deadline = Instant::now() + self.tuning.execution_budget();
        let batch = self.tuning.batch_size;

        loop {
            if Instant::now() >= deadline {
                return Ok(self.timed_out(outcome, pipeline.id));
            }
            let changed = self.pipelines.unlock_job_artifacts(pipeline.id, batch).await?;
            outcome.unlocked_job_artifacts += changed;
            if changed < batch {
                break;
            }
        }

        loop {
            if Instant::now() >= deadline {
                return Ok(self.timed_out(outcome, pipeline.id));
            }
            let changed = self
                .pipelines
                .unlock_pipeline_artifacts(pipeline.id, batch)
                .await?;
            outcome.unlocked_pipeline_artifacts += changed;
            if changed < batch {
                break;
            }
        }

        self.pipelines
            .set_lock_state(pipeline.id, LockState::Unlocked)
            .await?;
        outcome.status = UnlockStatus::Success;
        Ok(outcome)
    }

    fn timed_out(&self, mut outcome: UnlockOutcome, pipeline_id: PipelineId) -> UnlockOutcome {
        warn!(
            pipeline_id = %pipeline_id,
            unlocked_job_artifacts = outcome.unlocked_job_artifacts,
            unlocked_pipeline_artifacts = outcome.unlocked_pipeline_artifacts,
            "unlock execution budget exhausted, aborting for retry"
        );
        outcome.status = UnlockStatus::TimedOut;
        outcome.exec_timeout = true;
        outcome
    }
}
