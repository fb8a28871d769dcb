//! Ref-level unlock planning.
//!
//! When a ref moves (push, merge, pipeline completion) every pipeline on it
//! except the designated keep pipeline is stale and gets queued for
//! unlocking. Which pipeline to keep is the query service's decision; the
//! planner only decides which of the returned pipelines to queue.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{RetentionError, Result};
use crate::pipeline::{PipelineId, ProjectId};
use crate::queue::UnlockQueue;
use crate::store::RefQueryService;

/// Counts reported by a planning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    /// Pipelines newly added to the unlock queue.
    pub enqueued: usize,
    /// Pipelines that were already pending.
    pub already_pending: usize,
}

/// Plans unlock work for a ref and feeds the unlock queue.
#[derive(Clone)]
pub struct RefUnlockPlanner {
    refs: Arc<dyn RefQueryService>,
    queue: UnlockQueue,
}

impl RefUnlockPlanner {
    #[must_use]
    pub fn new(refs: Arc<dyn RefQueryService>, queue: UnlockQueue) -> Self {
        Self { refs, queue }
    }

    /// Enqueue every locked pipeline on the ref except the keep pipeline.
    ///
    /// Zero matches is a normal outcome: the ref may carry no locked
    /// pipelines at all, or only the keep pipeline.
    pub async fn plan_for_ref(&self, project: ProjectId, ref_name: &str) -> Result<PlanOutcome> {
        let keep = self.refs.latest_pipeline_to_keep(project, ref_name).await?;
        let locked = self.refs.locked_pipelines_for_ref(project, ref_name).await?;

        let stale = locked.into_iter().filter(|id| Some(*id) != keep);
        let outcome = self.enqueue_all(stale).await?;

        info!(
            project = %project,
            ref_name = %ref_name,
            keep = ?keep,
            enqueued = outcome.enqueued,
            already_pending = outcome.already_pending,
            "planned unlock work for ref"
        );
        Ok(outcome)
    }

    /// Enqueue every locked pipeline on a deleted ref. With the ref gone
    /// there is no keep pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RetentionError::LastSnapshotProtected`] when the project has
    /// no unlocked artifact snapshot outside this ref; unlocking everything
    /// here would expose the project's last snapshot to expiry deletion.
    pub async fn plan_for_ref_deletion(
        &self,
        project: ProjectId,
        ref_name: &str,
    ) -> Result<PlanOutcome> {
        if !self
            .refs
            .has_unlocked_snapshot_elsewhere(project, ref_name)
            .await?
        {
            return Err(RetentionError::LastSnapshotProtected {
                project,
                ref_name: ref_name.to_string(),
            });
        }

        let locked = self.refs.locked_pipelines_for_ref(project, ref_name).await?;
        let outcome = self.enqueue_all(locked.into_iter()).await?;

        info!(
            project = %project,
            ref_name = %ref_name,
            enqueued = outcome.enqueued,
            already_pending = outcome.already_pending,
            "planned unlock work for deleted ref"
        );
        Ok(outcome)
    }

    async fn enqueue_all(
        &self,
        pipelines: impl Iterator<Item = PipelineId>,
    ) -> Result<PlanOutcome> {
        let mut outcome = PlanOutcome::default();
        for id in pipelines {
            if self.queue.enqueue(id).await? {
                outcome.enqueued += 1;
            } else {
                debug!(pipeline_id = %id, "pipeline already pending unlock");
                outcome.already_pending += 1;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryCoordinationStore, MockRefQueryService};

    fn planner_with(refs: MockRefQueryService) -> RefUnlockPlanner {
        RefUnlockPlanner::new(
            Arc::new(refs),
            UnlockQueue::new(Arc::new(InMemoryCoordinationStore::new())),
        )
    }

    #[tokio::test]
    async fn test_plan_skips_keep_pipeline() {
        let mut refs = MockRefQueryService::new();
        refs.expect_latest_pipeline_to_keep()
            .returning(|_, _| Ok(Some(PipelineId(5))));
        refs.expect_locked_pipelines_for_ref()
            .returning(|_, _| Ok((1..=5).map(PipelineId).collect()));

        let outcome = planner_with(refs)
            .plan_for_ref(ProjectId(1), "main")
            .await
            .unwrap();

        assert_eq!(outcome.enqueued, 4);
        assert_eq!(outcome.already_pending, 0);
    }

    #[tokio::test]
    async fn test_plan_tolerates_zero_matches() {
        let mut refs = MockRefQueryService::new();
        refs.expect_latest_pipeline_to_keep().returning(|_, _| Ok(None));
        refs.expect_locked_pipelines_for_ref()
            .returning(|_, _| Ok(Vec::new()));

        let outcome = planner_with(refs)
            .plan_for_ref(ProjectId(1), "main")
            .await
            .unwrap();

        assert_eq!(outcome, PlanOutcome::default());
    }

    #[tokio::test]
    async fn test_replanning_reports_already_pending() {
        let mut refs = MockRefQueryService::new();
        refs.expect_latest_pipeline_to_keep()
            .returning(|_, _| Ok(Some(PipelineId(3))));
        refs.expect_locked_pipelines_for_ref()
            .returning(|_, _| Ok(vec![PipelineId(1), PipelineId(2), PipelineId(3)]));

        let planner = planner_with(refs);
        let first = planner.plan_for_ref(ProjectId(1), "main").await.unwrap();
        assert_eq!(first.enqueued, 2);

        let second = planner.plan_for_ref(ProjectId(1), "main").await.unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.already_pending, 2);
    }

    #[tokio::test]
    async fn test_ref_deletion_guards_last_snapshot() {
        let mut refs = MockRefQueryService::new();
        refs.expect_has_unlocked_snapshot_elsewhere()
            .returning(|_, _| Ok(false));

        let result = planner_with(refs)
            .plan_for_ref_deletion(ProjectId(1), "main")
            .await;

        assert!(matches!(
            result,
            Err(RetentionError::LastSnapshotProtected { .. })
        ));
    }

    #[tokio::test]
    async fn test_ref_deletion_enqueues_everything() {
        let mut refs = MockRefQueryService::new();
        refs.expect_has_unlocked_snapshot_elsewhere()
            .returning(|_, _| Ok(true));
        refs.expect_locked_pipelines_for_ref()
            .returning(|_, _| Ok(vec![PipelineId(1), PipelineId(2)]));

        let outcome = planner_with(refs)
            .plan_for_ref_deletion(ProjectId(1), "feature/retire")
            .await
            .unwrap();

        assert_eq!(outcome.enqueued, 2);
    }
}
