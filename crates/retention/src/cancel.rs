//! Pipeline cancellation with cascade to triggered pipelines.
//!
//! Canceling a pipeline cancels every pipeline it triggered, recursively,
//! when the cascade flag is set. Terminal pipelines are skipped, not
//! errored; cancellation is idempotent. Each canceled pipeline is also
//! enqueued for unlocking: a canceled pipeline will never become the keep
//! pipeline, so its artifacts have no reason to stay protected.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::pipeline::{PipelineId, PipelineStatus};
use crate::queue::UnlockQueue;
use crate::store::PipelineStore;

/// Whether a cancellation propagates to pipelines triggered by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    /// Cancel the target and, recursively, every pipeline it triggered.
    ToChildren,
    /// Cancel only the target.
    None,
}

/// Counts reported by a cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Pipelines transitioned to canceled, in visit order.
    pub canceled: Vec<PipelineId>,
    /// Pipelines skipped because they were already terminal.
    pub skipped_terminal: usize,
}

/// Cancels pipelines and feeds the unlock queue with the casualties.
#[derive(Clone)]
pub struct CancelPipelineService {
    pipelines: Arc<dyn PipelineStore>,
    queue: UnlockQueue,
}

impl CancelPipelineService {
    #[must_use]
    pub fn new(pipelines: Arc<dyn PipelineStore>, queue: UnlockQueue) -> Self {
        Self { pipelines, queue }
    }

    /// Cancel `pipeline_id`, cascading per `cascade`.
    ///
    /// Children record the root pipeline as `auto_canceled_by`; the root
    /// itself carries no marker (it was canceled directly). Canceling an
    /// already-terminal pipeline changes nothing, but its children are still
    /// visited, since a finished parent can have running children.
    pub async fn cancel(&self, pipeline_id: PipelineId, cascade: Cascade) -> Result<CancelOutcome> {
        let mut outcome = CancelOutcome::default();
        let mut visited: HashSet<PipelineId> = HashSet::new();
        let mut stack: Vec<(PipelineId, Option<PipelineId>)> = vec![(pipeline_id, None)];

        while let Some((current, caused_by)) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }

            if let Some(pipeline) = self.pipelines.pipeline(current).await? {
                if pipeline.status.can_cancel() {
                    self.pipelines
                        .update_status(current, PipelineStatus::Canceled, caused_by)
                        .await?;
                    self.queue.enqueue(current).await?;
                    outcome.canceled.push(current);
                    debug!(
                        pipeline_id = %current,
                        auto_canceled_by = ?caused_by,
                        "canceled pipeline"
                    );
                } else {
                    outcome.skipped_terminal += 1;
                    debug!(
                        pipeline_id = %current,
                        status = %pipeline.status,
                        "pipeline already terminal, cancel is a no-op"
                    );
                }
            } else {
                outcome.skipped_terminal += 1;
                continue;
            }

            if cascade == Cascade::ToChildren {
                for child in self.pipelines.child_pipelines(current).await? {
                    stack.push((child.id, Some(pipeline_id)));
                }
            }
        }

        info!(
            pipeline_id = %pipeline_id,
            canceled = outcome.canceled.len(),
            skipped_terminal = outcome.skipped_terminal,
            cascade = cascade == Cascade::ToChildren,
            "cancellation finished"
        );
        Ok(outcome)
    }
}
