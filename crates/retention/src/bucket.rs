//! Bucket partitioning and claim coordination for expired-artifact deletion.
//!
//! The expired artifact population is split into `N` deterministic buckets so
//! deletion concurrency is bounded and workers never overlap. The assignment
//! function must be identical wherever it is evaluated (the counting path
//! and the deletion path diverging would skip rows forever), so it hashes
//! with SHA-256 rather than anything process- or release-dependent.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::{JobId, ProjectId};
use crate::store::CoordinationStore;
use engine_config::CapacityHandle;

/// Registry set of bucket indexes known to be claimable.
pub const KNOWN_BUCKETS_KEY: &str = "retention:reaper:buckets";

const CLAIM_KEY_PREFIX: &str = "retention:reaper:claim:";

fn claim_key(index: u64) -> String {
    format!("{CLAIM_KEY_PREFIX}{index}")
}

/// Deterministic bucket assignment for an artifact candidate.
///
/// Pure: the same `(project, job, max_buckets)` always maps to the same
/// bucket, in every process and release.
#[must_use]
pub fn bucket_for(project: ProjectId, job: JobId, max_buckets: usize) -> usize {
    debug_assert!(max_buckets >= 1);
    let mut hasher = Sha256::new();
    hasher.update(project.0.to_be_bytes());
    hasher.update(job.0.to_be_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % max_buckets.max(1) as u64) as usize
}

/// A successfully claimed bucket. Hand it back via
/// [`BucketManager::release_bucket`].
#[derive(Debug)]
pub struct ClaimedBucket {
    pub index: usize,
    holder: String,
}

/// Coordinates claim/release of deletion buckets across the reaper pool.
#[derive(Clone)]
pub struct BucketManager {
    coordination: Arc<dyn CoordinationStore>,
    capacity: CapacityHandle,
    claim_ttl: Duration,
}

impl BucketManager {
    #[must_use]
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        capacity: CapacityHandle,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            coordination,
            capacity,
            claim_ttl,
        }
    }

    /// The currently configured bucket count. Zero pauses reaping.
    #[must_use]
    pub fn max_buckets(&self) -> usize {
        self.capacity.max_concurrency()
    }

    /// Claim an unclaimed bucket, marking it with a short lease. Returns
    /// `None` when every bucket is claimed or the pool is paused.
    pub async fn claim_bucket(&self) -> Result<Option<ClaimedBucket>> {
        let max_buckets = self.max_buckets();
        if max_buckets == 0 {
            return Ok(None);
        }

        let holder = Uuid::new_v4().to_string();
        for index in self.coordination.set_members(KNOWN_BUCKETS_KEY).await? {
            if index >= max_buckets as u64 {
                continue;
            }
            if self
                .coordination
                .acquire_lease(&claim_key(index), &holder, self.claim_ttl)
                .await?
            {
                debug!(mod_bucket = index, "claimed reaper bucket");
                return Ok(Some(ClaimedBucket {
                    index: index as usize,
                    holder,
                }));
            }
        }
        Ok(None)
    }

    /// Release a claim. `max_buckets` is the *current* configuration, not
    /// the value at claim time: when the bucket count shrank mid-flight the
    /// now-invalid index is also dropped from the claimable registry instead
    /// of staying marked claimed forever.
    pub async fn release_bucket(&self, claimed: ClaimedBucket, max_buckets: usize) -> Result<()> {
        let index = claimed.index as u64;
        self.coordination
            .release_lease(&claim_key(index), &claimed.holder)
            .await?;

        if claimed.index >= max_buckets {
            self.coordination
                .set_remove(KNOWN_BUCKETS_KEY, index)
                .await?;
            info!(
                mod_bucket = index,
                max_buckets, "released bucket orphaned by scale-down"
            );
        } else {
            debug!(mod_bucket = index, "released reaper bucket");
        }
        Ok(())
    }

    /// Clear claims whose lease expired without a matching release. Crash
    /// recovery; invoked by the scheduler, not by workers.
    pub async fn recover_stale_buckets(&self) -> Result<usize> {
        let recovered = self
            .coordination
            .purge_expired_leases(CLAIM_KEY_PREFIX)
            .await?;
        if recovered > 0 {
            info!(recovered, "recovered stale bucket claims");
        }
        Ok(recovered)
    }

    /// Ensure a claim-availability record exists for every bucket index in
    /// `[0, max_buckets)`, so fresh deployments and scale-ups become
    /// claimable immediately.
    pub async fn enqueue_missing_buckets(&self, max_buckets: usize) -> Result<usize> {
        let mut added = 0;
        for index in 0..max_buckets as u64 {
            if self.coordination.set_add(KNOWN_BUCKETS_KEY, index).await? {
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, max_buckets, "registered missing reaper buckets");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCoordinationStore;
    use engine_config::CapacityTier;

    fn manager(capacity: CapacityHandle) -> BucketManager {
        BucketManager::new(
            Arc::new(InMemoryCoordinationStore::new()),
            capacity,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_bucket_assignment_is_pure() {
        for n in 1..=16 {
            let a = bucket_for(ProjectId(42), JobId(7), n);
            let b = bucket_for(ProjectId(42), JobId(7), n);
            assert_eq!(a, b);
            assert!(a < n);
        }
    }

    #[test]
    fn test_bucket_assignment_distinguishes_inputs() {
        // Not a distribution test; just that both ids participate.
        let base = bucket_for(ProjectId(1), JobId(1), 1024);
        let other_job = bucket_for(ProjectId(1), JobId(2), 1024);
        let other_project = bucket_for(ProjectId(2), JobId(1), 1024);
        assert!(base != other_job || base != other_project);
    }

    #[tokio::test]
    async fn test_claims_are_exclusive() {
        let capacity = CapacityHandle::new(Some(CapacityTier::Low));
        let manager = manager(capacity);
        manager.enqueue_missing_buckets(2).await.unwrap();

        let first = manager.claim_bucket().await.unwrap().unwrap();
        let second = manager.claim_bucket().await.unwrap().unwrap();
        assert_ne!(first.index, second.index);

        // Both buckets claimed: nothing left.
        assert!(manager.claim_bucket().await.unwrap().is_none());

        manager.release_bucket(first, 2).await.unwrap();
        assert!(manager.claim_bucket().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_paused_pool_claims_nothing() {
        let manager = manager(CapacityHandle::new(None));
        manager.enqueue_missing_buckets(2).await.unwrap();
        assert!(manager.claim_bucket().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scale_down_release_drops_orphaned_index() {
        let capacity = CapacityHandle::new(Some(CapacityTier::Medium));
        let manager = manager(capacity.clone());
        manager.enqueue_missing_buckets(5).await.unwrap();

        // Claim bucket 4, then scale down to 2 buckets mid-flight.
        let claimed = loop {
            let bucket = manager.claim_bucket().await.unwrap().unwrap();
            if bucket.index == 4 {
                break bucket;
            }
        };
        capacity.set(CapacityTier::Low);

        manager.release_bucket(claimed, 2).await.unwrap();

        let known = manager
            .coordination
            .set_members(KNOWN_BUCKETS_KEY)
            .await
            .unwrap();
        assert!(!known.contains(&4));
    }

    #[tokio::test]
    async fn test_stale_claim_recovery() {
        let capacity = CapacityHandle::new(Some(CapacityTier::ExtraLow));
        let manager = BucketManager::new(
            Arc::new(InMemoryCoordinationStore::new()),
            capacity,
            Duration::from_millis(0),
        );
        manager.enqueue_missing_buckets(1).await.unwrap();

        // Claim with an instantly-expiring lease and never release.
        let _claimed = manager.claim_bucket().await.unwrap().unwrap();

        assert_eq!(manager.recover_stale_buckets().await.unwrap(), 1);
        assert!(manager.claim_bucket().await.unwrap().is_some());
    }
}
