//! Expired-artifact reaping over claimed buckets.
//!
//! A reaping pass streams the expired, unlocked artifacts whose bucket
//! assignment matches the claimed index and deletes them in small batches.
//! The configured bucket count is re-checked before every batch: a
//! scale-down mid-run terminates the pass early rather than continuing under
//! an inconsistent partitioning. Remaining rows are safe: the assignment
//! function is stable, so the next sweep at the new bucket count picks them
//! up.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::bucket::{bucket_for, BucketManager};
use crate::error::Result;
use crate::metrics::RetentionMetrics;
use crate::pipeline::ArtifactId;
use crate::pool::{LimitedCapacityWorker, WorkOutcome};
use crate::store::PipelineStore;
use engine_config::ReaperTuning;

/// Result of reaping one bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReapOutcome {
    /// Artifact rows deleted during this pass.
    pub destroyed_count: usize,
    /// True when the pass stopped early because the bucket count shrank.
    pub terminated_early: bool,
}

/// Deletes expired, unlocked artifacts inside one claimed bucket.
#[derive(Clone)]
pub struct ExpiredArtifactReaper {
    pipelines: Arc<dyn PipelineStore>,
    tuning: ReaperTuning,
}

impl ExpiredArtifactReaper {
    #[must_use]
    pub fn new(pipelines: Arc<dyn PipelineStore>, tuning: ReaperTuning) -> Self {
        Self { pipelines, tuning }
    }

    /// Count of deletable artifacts currently assigned to `bucket_index`.
    /// Shares [`bucket_for`] with the deletion path below.
    pub async fn pending_in_bucket(&self, bucket_index: usize, max_buckets: usize) -> Result<usize> {
        let candidates = self.pipelines.expired_unlocked_artifacts(Utc::now()).await?;
        Ok(candidates
            .iter()
            .filter(|a| bucket_for(a.project_id, a.job_id, max_buckets) == bucket_index)
            .count())
    }

    /// Count of deletable artifacts across all buckets.
    pub async fn pending_total(&self) -> Result<usize> {
        Ok(self
            .pipelines
            .expired_unlocked_artifacts(Utc::now())
            .await?
            .len())
    }

    /// Reap one bucket. `max_buckets` is the partitioning the bucket was
    /// claimed under; `current_max_buckets` is re-evaluated by the caller
    /// before each batch via the closure.
    pub async fn reap_bucket(
        &self,
        bucket_index: usize,
        max_buckets: usize,
        current_max_buckets: impl Fn() -> usize + Send,
    ) -> Result<ReapOutcome> {
        let mut outcome = ReapOutcome::default();

        loop {
            if current_max_buckets() < max_buckets {
                info!(
                    mod_bucket = bucket_index,
                    max_buckets,
                    destroyed_job_artifacts_count = outcome.destroyed_count,
                    terminated_early_due_to_scale_down = true,
                    "bucket count shrank mid-run, terminating reap early"
                );
                outcome.terminated_early = true;
                return Ok(outcome);
            }

            let candidates = self.pipelines.expired_unlocked_artifacts(Utc::now()).await?;
            let batch: Vec<ArtifactId> = candidates
                .iter()
                .filter(|a| bucket_for(a.project_id, a.job_id, max_buckets) == bucket_index)
                .take(self.tuning.batch_size)
                .map(|a| a.id)
                .collect();
            if batch.is_empty() {
                break;
            }

            let destroyed = self.pipelines.destroy_job_artifacts(&batch).await?;
            outcome.destroyed_count += destroyed;
            debug!(
                mod_bucket = bucket_index,
                destroyed, "destroyed expired artifact batch"
            );
        }

        Ok(outcome)
    }
}

/// The reaper's capacity-bounded pool: one `perform_work` call claims one
/// bucket, reaps it, and releases it.
#[derive(Clone)]
pub struct ReaperPool {
    reaper: ExpiredArtifactReaper,
    buckets: BucketManager,
    metrics: RetentionMetrics,
}

impl ReaperPool {
    #[must_use]
    pub fn new(
        reaper: ExpiredArtifactReaper,
        buckets: BucketManager,
        metrics: RetentionMetrics,
    ) -> Self {
        Self {
            reaper,
            buckets,
            metrics,
        }
    }
}

#[async_trait]
impl LimitedCapacityWorker for ReaperPool {
    fn max_concurrency(&self) -> usize {
        self.buckets.max_buckets()
    }

    async fn remaining_work(&self) -> Result<usize> {
        self.reaper.pending_total().await
    }

    async fn perform_work(&self) -> Result<WorkOutcome> {
        let Some(claimed) = self.buckets.claim_bucket().await? else {
            return Ok(WorkOutcome::Idle);
        };

        let claimed_under = self.buckets.max_buckets();
        let capacity = self.buckets.clone();
        let outcome = self
            .reaper
            .reap_bucket(claimed.index, claimed_under, move || {
                capacity.max_buckets()
            })
            .await;

        // Release under the *current* bucket count so a mid-flight
        // scale-down cannot orphan the claim.
        let index = claimed.index;
        let release = self
            .buckets
            .release_bucket(claimed, self.buckets.max_buckets())
            .await;
        let outcome = outcome?;
        release?;

        info!(
            mod_bucket = index,
            destroyed_job_artifacts_count = outcome.destroyed_count,
            terminated_early_due_to_scale_down = outcome.terminated_early,
            "reaped bucket"
        );
        self.metrics.record_reap(&outcome).await;

        Ok(WorkOutcome::Performed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::{JobArtifact, JobId, LockState, PipelineId, ProjectId};
    use crate::store::{CoordinationStore, InMemoryCoordinationStore, InMemoryPipelineStore};
    use engine_config::{CapacityHandle, CapacityTier};

    fn deletable_artifact(id: u64) -> JobArtifact {
        JobArtifact {
            id: ArtifactId(id),
            job_id: JobId(id),
            pipeline_id: PipelineId(1),
            project_id: ProjectId(1),
            expire_at: Some(Utc::now() - chrono::Duration::hours(1)),
            locked: LockState::Unlocked,
            size_bytes: 1,
        }
    }

    fn reaper(store: &Arc<InMemoryPipelineStore>) -> ExpiredArtifactReaper {
        ExpiredArtifactReaper::new(
            Arc::clone(store) as Arc<dyn PipelineStore>,
            ReaperTuning {
                batch_size: 10,
                ..ReaperTuning::default()
            },
        )
    }

    #[tokio::test]
    async fn test_reap_deletes_only_matching_bucket() {
        let store = Arc::new(InMemoryPipelineStore::new());
        for id in 0..50 {
            store.insert_job_artifact(deletable_artifact(id));
        }
        let max_buckets = 4;
        let target = 1;
        let expected = reaper(&store)
            .pending_in_bucket(target, max_buckets)
            .await
            .unwrap();

        let outcome = reaper(&store)
            .reap_bucket(target, max_buckets, move || max_buckets)
            .await
            .unwrap();

        assert_eq!(outcome.destroyed_count, expected);
        assert!(!outcome.terminated_early);
        // Rows in other buckets are untouched.
        assert_eq!(store.job_artifact_count(), 50 - expected);
        assert_eq!(
            reaper(&store)
                .pending_in_bucket(target, max_buckets)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_locked_or_unexpired_artifacts_survive() {
        let store = Arc::new(InMemoryPipelineStore::new());
        store.insert_job_artifact(JobArtifact {
            locked: LockState::ArtifactsLocked,
            ..deletable_artifact(1)
        });
        store.insert_job_artifact(JobArtifact {
            expire_at: Some(Utc::now() + chrono::Duration::hours(1)),
            ..deletable_artifact(2)
        });

        for bucket in 0..4 {
            reaper(&store)
                .reap_bucket(bucket, 4, || 4)
                .await
                .unwrap();
        }
        assert_eq!(store.job_artifact_count(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_terminates_early() {
        let store = Arc::new(InMemoryPipelineStore::new());
        for id in 0..50 {
            store.insert_job_artifact(deletable_artifact(id));
        }

        // Capacity already below the partitioning the bucket was claimed
        // under: the pass must stop before deleting anything.
        let outcome = reaper(&store).reap_bucket(0, 10, || 5).await.unwrap();

        assert!(outcome.terminated_early);
        assert_eq!(outcome.destroyed_count, 0);
        assert_eq!(store.job_artifact_count(), 50);
    }

    #[tokio::test]
    async fn test_pool_claims_reaps_and_releases() {
        let store = Arc::new(InMemoryPipelineStore::new());
        for id in 0..20 {
            store.insert_job_artifact(deletable_artifact(id));
        }
        let coordination: Arc<dyn CoordinationStore> =
            Arc::new(InMemoryCoordinationStore::new());
        let capacity = CapacityHandle::new(Some(CapacityTier::ExtraLow));
        let buckets = BucketManager::new(
            Arc::clone(&coordination),
            capacity.clone(),
            Duration::from_secs(60),
        );
        buckets.enqueue_missing_buckets(1).await.unwrap();
        let pool = ReaperPool::new(reaper(&store), buckets, RetentionMetrics::new());

        // One bucket partitioning: a single pass drains everything.
        assert_eq!(pool.perform_work().await.unwrap(), WorkOutcome::Performed);
        assert_eq!(store.job_artifact_count(), 0);
        assert_eq!(pool.remaining_work().await.unwrap(), 0);

        // Bucket was released: the next call claims it again and idles
        // through an empty bucket.
        assert_eq!(pool.perform_work().await.unwrap(), WorkOutcome::Performed);
    }
}
