//! Counters for the retention engine.
//!
//! These back the observability sink alongside the structured log lines the
//! pools emit per attempt. Counters are process-local; aggregation across
//! workers happens downstream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::executor::UnlockOutcome;
use crate::reaper::ReapOutcome;

/// Shared counter set, cheap to clone into every pool.
#[derive(Clone)]
pub struct RetentionMetrics {
    pipelines_unlocked_total: Arc<RwLock<u64>>,
    job_artifacts_unlocked_total: Arc<RwLock<u64>>,
    pipeline_artifacts_unlocked_total: Arc<RwLock<u64>>,
    skipped_already_leased_total: Arc<RwLock<u64>>,
    skipped_already_unlocked_total: Arc<RwLock<u64>>,
    exec_timeouts_total: Arc<RwLock<u64>>,
    destroyed_job_artifacts_total: Arc<RwLock<u64>>,
    reaper_early_terminations_total: Arc<RwLock<u64>>,
    started_at: DateTime<Utc>,
}

impl Default for RetentionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RetentionMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pipelines_unlocked_total: Arc::new(RwLock::new(0)),
            job_artifacts_unlocked_total: Arc::new(RwLock::new(0)),
            pipeline_artifacts_unlocked_total: Arc::new(RwLock::new(0)),
            skipped_already_leased_total: Arc::new(RwLock::new(0)),
            skipped_already_unlocked_total: Arc::new(RwLock::new(0)),
            exec_timeouts_total: Arc::new(RwLock::new(0)),
            destroyed_job_artifacts_total: Arc::new(RwLock::new(0)),
            reaper_early_terminations_total: Arc::new(RwLock::new(0)),
            started_at: Utc::now(),
        }
    }

    /// Fold one unlock attempt into the counters.
    pub async fn record_unlock(&self, outcome: &UnlockOutcome) {
        if outcome.skipped_already_leased {
            *self.skipped_already_leased_total.write().await += 1;
        }
        if outcome.skipped_already_unlocked {
            *self.skipped_already_unlocked_total.write().await += 1;
        }
        if outcome.exec_timeout {
            *self.exec_timeouts_total.write().await += 1;
        }
        if outcome.status == crate::executor::UnlockStatus::Success {
            *self.pipelines_unlocked_total.write().await += 1;
        }
        *self.job_artifacts_unlocked_total.write().await +=
            outcome.unlocked_job_artifacts as u64;
        *self.pipeline_artifacts_unlocked_total.write().await +=
            outcome.unlocked_pipeline_artifacts as u64;
    }

    /// Fold one reaping pass into the counters.
    pub async fn record_reap(&self, outcome: &ReapOutcome) {
        *self.destroyed_job_artifacts_total.write().await += outcome.destroyed_count as u64;
        if outcome.terminated_early {
            *self.reaper_early_terminations_total.write().await += 1;
        }
    }

    /// Point-in-time copy of every counter.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pipelines_unlocked_total: *self.pipelines_unlocked_total.read().await,
            job_artifacts_unlocked_total: *self.job_artifacts_unlocked_total.read().await,
            pipeline_artifacts_unlocked_total: *self
                .pipeline_artifacts_unlocked_total
                .read()
                .await,
            skipped_already_leased_total: *self.skipped_already_leased_total.read().await,
            skipped_already_unlocked_total: *self.skipped_already_unlocked_total.read().await,
            exec_timeouts_total: *self.exec_timeouts_total.read().await,
            destroyed_job_artifacts_total: *self.destroyed_job_artifacts_total.read().await,
            reaper_early_terminations_total: *self
                .reaper_early_terminations_total
                .read()
                .await,
            started_at: self.started_at,
        }
    }
}

/// Exported counter values.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pipelines_unlocked_total: u64,
    pub job_artifacts_unlocked_total: u64,
    pub pipeline_artifacts_unlocked_total: u64,
    pub skipped_already_leased_total: u64,
    pub skipped_already_unlocked_total: u64,
    pub exec_timeouts_total: u64,
    pub destroyed_job_artifacts_total: u64,
    pub reaper_early_terminations_total: u64,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::UnlockStatus;

    #[tokio::test]
    async fn test_unlock_counters_accumulate() {
        let metrics = RetentionMetrics::new();

        metrics
            .record_unlock(&UnlockOutcome {
                status: UnlockStatus::Success,
                unlocked_job_artifacts: 12,
                unlocked_pipeline_artifacts: 2,
                ..UnlockOutcome::default()
            })
            .await;
        metrics
            .record_unlock(&UnlockOutcome {
                status: UnlockStatus::Skipped,
                skipped_already_leased: true,
                ..UnlockOutcome::default()
            })
            .await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.pipelines_unlocked_total, 1);
        assert_eq!(snapshot.job_artifacts_unlocked_total, 12);
        assert_eq!(snapshot.pipeline_artifacts_unlocked_total, 2);
        assert_eq!(snapshot.skipped_already_leased_total, 1);
    }

    #[tokio::test]
    async fn test_reap_counters_accumulate() {
        let metrics = RetentionMetrics::new();
        metrics
            .record_reap(&ReapOutcome {
                destroyed_count: 40,
                terminated_early: true,
            })
            .await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.destroyed_job_artifacts_total, 40);
        assert_eq!(snapshot.reaper_early_terminations_total, 1);
    }
}
