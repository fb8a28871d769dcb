//! In-memory store implementations.
//!
//! Back the engine in tests and in the demo daemon. Both types are plain
//! injected handles; a deployment against real infrastructure swaps them for
//! database- and Redis-backed implementations of the same traits.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{RetentionError, Result};
use crate::pipeline::{
    ArtifactId, JobArtifact, LockState, Pipeline, PipelineArtifact, PipelineId, PipelineStatus,
    ProjectId,
};
use crate::store::{CoordinationStore, PipelineStore, RefQueryService};

#[derive(Default)]
struct ZsetEntry {
    by_score: BTreeSet<(i64, u64)>,
    scores: HashMap<u64, i64>,
}

struct LeaseEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// In-memory coordination store: ordered sets, TTL leases, plain sets.
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    zsets: DashMap<String, ZsetEntry>,
    leases: DashMap<String, LeaseEntry>,
    sets: DashMap<String, BTreeSet<u64>>,
}

impl InMemoryCoordinationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn zadd_if_absent(&self, key: &str, member: u64, score: i64) -> Result<bool> {
        let mut entry = self.zsets.entry(key.to_string()).or_default();
        if entry.scores.contains_key(&member) {
            return Ok(false);
        }
        entry.by_score.insert((score, member));
        entry.scores.insert(member, score);
        Ok(true)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(u64, i64)>> {
        let Some(mut entry) = self.zsets.get_mut(key) else {
            return Ok(None);
        };
        let Some(&(score, member)) = entry.by_score.iter().next() else {
            return Ok(None);
        };
        entry.by_score.remove(&(score, member));
        entry.scores.remove(&member);
        Ok(Some((member, score)))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.zsets.get(key).map_or(0, |entry| entry.scores.len()))
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl =
            chrono::Duration::from_std(ttl).map_err(|e| RetentionError::Store(e.to_string()))?;
        let fresh = LeaseEntry {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.holder == holder || current.expires_at <= now {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.holder == holder)
            .is_some())
    }

    async fn lease_holder(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        Ok(self.leases.get(key).and_then(|lease| {
            (lease.expires_at > now).then(|| lease.holder.clone())
        }))
    }

    async fn purge_expired_leases(&self, prefix: &str) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for key in expired {
            if self
                .leases
                .remove_if(&key, |_, lease| lease.expires_at <= now)
                .is_some()
            {
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn set_add(&self, key: &str, member: u64) -> Result<bool> {
        Ok(self.sets.entry(key.to_string()).or_default().insert(member))
    }

    async fn set_remove(&self, key: &str, member: u64) -> Result<bool> {
        Ok(self
            .sets
            .get_mut(key)
            .is_some_and(|mut set| set.remove(&member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<u64>> {
        Ok(self
            .sets
            .get(key)
            .map_or_else(Vec::new, |set| set.iter().copied().collect()))
    }
}

/// In-memory pipeline/artifact store. Also answers ref-level retention
/// queries with a simple newest-pipeline-wins keep policy; production policy
/// lives in the real query service.
#[derive(Default)]
pub struct InMemoryPipelineStore {
    pipelines: DashMap<PipelineId, Pipeline>,
    job_artifacts: DashMap<ArtifactId, JobArtifact>,
    pipeline_artifacts: DashMap<ArtifactId, PipelineArtifact>,
}

impl InMemoryPipelineStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pipeline row.
    pub fn insert_pipeline(&self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.id, pipeline);
    }

    /// Seed a job artifact row.
    pub fn insert_job_artifact(&self, artifact: JobArtifact) {
        self.job_artifacts.insert(artifact.id, artifact);
    }

    /// Seed a pipeline artifact row.
    pub fn insert_pipeline_artifact(&self, artifact: PipelineArtifact) {
        self.pipeline_artifacts.insert(artifact.id, artifact);
    }

    /// Count of job artifact rows still present.
    #[must_use]
    pub fn job_artifact_count(&self) -> usize {
        self.job_artifacts.len()
    }

    fn ref_of(&self, pipeline: PipelineId) -> Option<String> {
        self.pipelines.get(&pipeline).map(|p| p.ref_name.clone())
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.get(&id).map(|p| p.clone()))
    }

    async fn update_status(
        &self,
        id: PipelineId,
        status: PipelineStatus,
        auto_canceled_by: Option<PipelineId>,
    ) -> Result<()> {
        if let Some(mut pipeline) = self.pipelines.get_mut(&id) {
            let was_canceled = pipeline.status == PipelineStatus::Canceled;
            pipeline.status = status;
            if status == PipelineStatus::Canceled {
                pipeline.auto_canceled_by = auto_canceled_by;
            } else if was_canceled {
                // Leaving the canceled state invalidates the marker.
                pipeline.auto_canceled_by = None;
            }
            if status.is_terminal() && pipeline.finished_at.is_none() {
                pipeline.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_lock_state(&self, id: PipelineId, state: LockState) -> Result<()> {
        if let Some(mut pipeline) = self.pipelines.get_mut(&id) {
            pipeline.lock_state = state;
        }
        Ok(())
    }

    async fn unlock_job_artifacts(&self, pipeline: PipelineId, limit: usize) -> Result<usize> {
        let mut batch: Vec<ArtifactId> = self
            .job_artifacts
            .iter()
            .filter(|a| a.pipeline_id == pipeline && a.locked.is_locked())
            .map(|a| a.id)
            .collect();
        batch.sort_unstable();
        batch.truncate(limit);

        let mut changed = 0;
        for id in batch {
            if let Some(mut artifact) = self.job_artifacts.get_mut(&id) {
                artifact.locked = LockState::Unlocked;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn unlock_pipeline_artifacts(&self, pipeline: PipelineId, limit: usize) -> Result<usize> {
        let mut batch: Vec<ArtifactId> = self
            .pipeline_artifacts
            .iter()
            .filter(|a| a.pipeline_id == pipeline && a.locked.is_locked())
            .map(|a| a.id)
            .collect();
        batch.sort_unstable();
        batch.truncate(limit);

        let mut changed = 0;
        for id in batch {
            if let Some(mut artifact) = self.pipeline_artifacts.get_mut(&id) {
                artifact.locked = LockState::Unlocked;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn child_pipelines(&self, parent: PipelineId) -> Result<Vec<Pipeline>> {
        let mut children: Vec<Pipeline> = self
            .pipelines
            .iter()
            .filter(|p| p.parent == Some(parent))
            .map(|p| p.clone())
            .collect();
        children.sort_unstable_by_key(|p| p.id);
        Ok(children)
    }

    async fn expired_unlocked_artifacts(&self, now: DateTime<Utc>) -> Result<Vec<JobArtifact>> {
        let mut candidates: Vec<JobArtifact> = self
            .job_artifacts
            .iter()
            .filter(|a| a.deletable(now))
            .map(|a| a.clone())
            .collect();
        candidates.sort_unstable_by_key(|a| a.id);
        Ok(candidates)
    }

    async fn destroy_job_artifacts(&self, ids: &[ArtifactId]) -> Result<usize> {
        let mut destroyed = 0;
        for id in ids {
            if self.job_artifacts.remove(id).is_some() {
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }
}

#[async_trait]
impl RefQueryService for InMemoryPipelineStore {
    async fn latest_pipeline_to_keep(
        &self,
        project: ProjectId,
        ref_name: &str,
    ) -> Result<Option<PipelineId>> {
        Ok(self
            .pipelines
            .iter()
            .filter(|p| p.project_id == project && p.ref_name == ref_name)
            .map(|p| p.id)
            .max())
    }

    async fn locked_pipelines_for_ref(
        &self,
        project: ProjectId,
        ref_name: &str,
    ) -> Result<Vec<PipelineId>> {
        let mut locked: Vec<PipelineId> = self
            .pipelines
            .iter()
            .filter(|p| {
                p.project_id == project && p.ref_name == ref_name && p.lock_state.is_locked()
            })
            .map(|p| p.id)
            .collect();
        // Oldest first, so the planner enqueues in unlock order.
        locked.sort_unstable();
        Ok(locked)
    }

    async fn has_unlocked_snapshot_elsewhere(
        &self,
        project: ProjectId,
        ref_name: &str,
    ) -> Result<bool> {
        Ok(self.job_artifacts.iter().any(|artifact| {
            artifact.project_id == project
                && !artifact.locked.is_locked()
                && self
                    .ref_of(artifact.pipeline_id)
                    .is_some_and(|r| r != ref_name)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordination() -> InMemoryCoordinationStore {
        InMemoryCoordinationStore::new()
    }

    #[tokio::test]
    async fn test_zadd_is_add_if_absent() {
        let store = coordination();
        assert!(store.zadd_if_absent("q", 1, 100).await.unwrap());
        assert!(!store.zadd_if_absent("q", 1, 50).await.unwrap());
        assert_eq!(store.zcard("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zpop_returns_smallest_score() {
        let store = coordination();
        store.zadd_if_absent("q", 2, 200).await.unwrap();
        store.zadd_if_absent("q", 1, 100).await.unwrap();
        store.zadd_if_absent("q", 3, 300).await.unwrap();

        assert_eq!(store.zpop_min("q").await.unwrap(), Some((1, 100)));
        assert_eq!(store.zpop_min("q").await.unwrap(), Some((2, 200)));
        assert_eq!(store.zpop_min("q").await.unwrap(), Some((3, 300)));
        assert_eq!(store.zpop_min("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lease_mutual_exclusion() {
        let store = coordination();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease("lock", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("lock", "b", ttl).await.unwrap());
        // Same holder refreshes.
        assert!(store.acquire_lease("lock", "a", ttl).await.unwrap());

        assert!(!store.release_lease("lock", "b").await.unwrap());
        assert!(store.release_lease("lock", "a").await.unwrap());
        assert!(store.acquire_lease("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_stealable() {
        let store = coordination();

        assert!(store
            .acquire_lease("lock", "crashed", Duration::from_millis(0))
            .await
            .unwrap());
        assert_eq!(store.lease_holder("lock").await.unwrap(), None);
        assert!(store
            .acquire_lease("lock", "next", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(
            store.lease_holder("lock").await.unwrap(),
            Some("next".to_string())
        );
    }

    #[tokio::test]
    async fn test_purge_expired_leases_scoped_by_prefix() {
        let store = coordination();
        store
            .acquire_lease("bucket:0", "w", Duration::from_millis(0))
            .await
            .unwrap();
        store
            .acquire_lease("bucket:1", "w", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .acquire_lease("other:0", "w", Duration::from_millis(0))
            .await
            .unwrap();

        assert_eq!(store.purge_expired_leases("bucket:").await.unwrap(), 1);
        assert_eq!(
            store.lease_holder("bucket:1").await.unwrap(),
            Some("w".to_string())
        );
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let store = InMemoryPipelineStore::new();
        store.insert_job_artifact(JobArtifact {
            id: ArtifactId(1),
            job_id: crate::pipeline::JobId(1),
            pipeline_id: PipelineId(1),
            project_id: ProjectId(1),
            expire_at: None,
            locked: LockState::Unlocked,
            size_bytes: 0,
        });

        let ids = [ArtifactId(1)];
        assert_eq!(store.destroy_job_artifacts(&ids).await.unwrap(), 1);
        assert_eq!(store.destroy_job_artifacts(&ids).await.unwrap(), 0);
    }
}
