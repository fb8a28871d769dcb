//! Collaborator interfaces for persistence and coordination.
//!
//! The engine owns no storage of its own: pipeline and artifact rows live in
//! the shared persistence layer, queue entries and leases in the shared
//! coordination store. Both are consumed through the narrow traits below and
//! injected as explicitly constructed handles; components never reach for a
//! process-wide instance.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::pipeline::{
    ArtifactId, JobArtifact, LockState, Pipeline, PipelineId, PipelineStatus, ProjectId,
};

pub use memory::{InMemoryCoordinationStore, InMemoryPipelineStore};

/// Read/update access to pipeline and artifact rows.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Load a pipeline row, or `None` when it no longer exists.
    async fn pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    /// Apply a status transition, recording the causing pipeline for
    /// auto-cancellation.
    async fn update_status(
        &self,
        id: PipelineId,
        status: PipelineStatus,
        auto_canceled_by: Option<PipelineId>,
    ) -> Result<()>;

    /// Persist the pipeline's lock state.
    async fn set_lock_state(&self, id: PipelineId, state: LockState) -> Result<()>;

    /// Unlock up to `limit` of the pipeline's locked job artifacts. Returns
    /// the number of rows changed; fewer than `limit` means the pipeline has
    /// no locked job artifacts left.
    async fn unlock_job_artifacts(&self, pipeline: PipelineId, limit: usize) -> Result<usize>;

    /// Same as [`PipelineStore::unlock_job_artifacts`] for pipeline-level
    /// artifacts.
    async fn unlock_pipeline_artifacts(&self, pipeline: PipelineId, limit: usize) -> Result<usize>;

    /// Pipelines directly triggered by `parent`.
    async fn child_pipelines(&self, parent: PipelineId) -> Result<Vec<Pipeline>>;

    /// Expired, unlocked job artifacts: the reaper's candidate set.
    async fn expired_unlocked_artifacts(&self, now: DateTime<Utc>) -> Result<Vec<JobArtifact>>;

    /// Delete the given artifact rows. Returns the number of rows actually
    /// deleted; already-deleted ids are skipped, keeping deletion idempotent.
    async fn destroy_job_artifacts(&self, ids: &[ArtifactId]) -> Result<usize>;
}

/// Resolves ref-level retention questions against the pipeline dataset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RefQueryService: Send + Sync {
    /// The most recent pipeline on the ref that retention policy keeps
    /// locked, if any.
    async fn latest_pipeline_to_keep(
        &self,
        project: ProjectId,
        ref_name: &str,
    ) -> Result<Option<PipelineId>>;

    /// Pipelines on the ref currently holding `artifacts_locked`.
    async fn locked_pipelines_for_ref(
        &self,
        project: ProjectId,
        ref_name: &str,
    ) -> Result<Vec<PipelineId>>;

    /// Whether the project retains an unlocked artifact snapshot on some
    /// other ref. Input to the last-snapshot cleanup guard.
    async fn has_unlocked_snapshot_elsewhere(
        &self,
        project: ProjectId,
        ref_name: &str,
    ) -> Result<bool>;
}

/// Shared coordination primitives: the ordered unlock queue, self-expiring
/// leases, and small registries. Shaped after a sorted-set/key-value store so
/// a Redis-like backend drops in.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Add `member` with `score` iff not already present. Returns whether it
    /// was newly added. Must be atomic under concurrent callers.
    async fn zadd_if_absent(&self, key: &str, member: u64, score: i64) -> Result<bool>;

    /// Remove and return the member with the smallest score.
    async fn zpop_min(&self, key: &str) -> Result<Option<(u64, i64)>>;

    /// Cardinality of the ordered set. Approximate is acceptable; used for
    /// observability only.
    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Acquire a self-expiring lease. Succeeds when the key is free, held by
    /// `holder` already (refresh), or held by an expired holder (steal).
    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release a lease if still held by `holder`. Returns whether a release
    /// happened.
    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool>;

    /// Current live holder of a lease, if any.
    async fn lease_holder(&self, key: &str) -> Result<Option<String>>;

    /// Drop expired leases under a key prefix. Returns how many were purged.
    async fn purge_expired_leases(&self, prefix: &str) -> Result<usize>;

    /// Add `member` to a plain set. Returns whether it was newly added.
    async fn set_add(&self, key: &str, member: u64) -> Result<bool>;

    /// Remove `member` from a plain set. Returns whether it was present.
    async fn set_remove(&self, key: &str, member: u64) -> Result<bool>;

    /// All members of a plain set, ascending.
    async fn set_members(&self, key: &str) -> Result<Vec<u64>>;
}
