//! Per-project unlock lease.
//!
//! Unlock writes to a project's pipelines are serialized through a single
//! time-bounded, self-expiring lease in the coordination store. A crashed
//! holder cannot block progress: acquisition steals leases whose TTL has
//! lapsed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RetentionError, Result};
use crate::pipeline::ProjectId;
use crate::store::CoordinationStore;
use engine_config::UnlockTuning;

/// Outcome of a lease acquisition attempt.
pub enum Acquire {
    /// The lease is ours until released or expired.
    Acquired(ActiveLease),
    /// Another live holder owns the lease. A normal, expected outcome.
    HeldElsewhere { holder: String },
}

/// Acquires the per-project unlock lease with bounded retries.
#[derive(Clone)]
pub struct ProjectLock {
    coordination: Arc<dyn CoordinationStore>,
    ttl: Duration,
    retries: u32,
    backoff: Duration,
}

impl ProjectLock {
    #[must_use]
    pub fn new(coordination: Arc<dyn CoordinationStore>, tuning: &UnlockTuning) -> Self {
        Self {
            coordination,
            ttl: tuning.lease_ttl(),
            retries: tuning.lease_retries,
            backoff: tuning.lease_backoff(),
        }
    }

    /// Set the lease TTL (overrides the tuning value).
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(project: ProjectId) -> String {
        format!("retention:unlock:project:{project}")
    }

    /// Attempt to take the project's unlock lease.
    ///
    /// A lease observed held by a live holder returns
    /// [`Acquire::HeldElsewhere`] immediately. Losing the acquisition race
    /// repeatedly without ever observing a live holder exhausts the retry
    /// budget and surfaces [`RetentionError::LeaseUnavailable`], the only
    /// hard failure in the unlock path.
    pub async fn acquire(&self, project: ProjectId) -> Result<Acquire> {
        let key = Self::key(project);
        let holder = Uuid::new_v4().to_string();

        let mut delay = self.backoff;
        for attempt in 1..=self.retries {
            if let Some(current) = self.coordination.lease_holder(&key).await? {
                debug!(
                    project = %project,
                    holder = %current,
                    "unlock lease held by another process"
                );
                return Ok(Acquire::HeldElsewhere { holder: current });
            }

            if self.coordination.acquire_lease(&key, &holder, self.ttl).await? {
                debug!(project = %project, holder = %holder, "acquired unlock lease");
                return Ok(Acquire::Acquired(ActiveLease {
                    coordination: Arc::clone(&self.coordination),
                    key,
                    holder,
                }));
            }

            // Lost the race between observe and acquire; back off and retry.
            debug!(project = %project, attempt, "lost unlock lease acquisition race");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(RetentionError::LeaseUnavailable {
            project,
            attempts: self.retries,
        })
    }
}

/// A held lease. Must be released explicitly; expiry is the crash fallback.
pub struct ActiveLease {
    coordination: Arc<dyn CoordinationStore>,
    key: String,
    holder: String,
}

impl ActiveLease {
    /// The holder identity recorded in the store.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lease. Releasing a lease that already expired and was
    /// stolen is a no-op.
    pub async fn release(self) -> Result<()> {
        if !self
            .coordination
            .release_lease(&self.key, &self.holder)
            .await?
        {
            warn!(key = %self.key, "unlock lease expired before release");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCoordinationStore;

    fn lock(store: &Arc<InMemoryCoordinationStore>) -> ProjectLock {
        let tuning = UnlockTuning {
            lease_backoff_ms: 1,
            ..UnlockTuning::default()
        };
        ProjectLock::new(Arc::clone(store) as Arc<dyn CoordinationStore>, &tuning)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let project = ProjectId(7);

        let first = lock(&store).acquire(project).await.unwrap();
        let Acquire::Acquired(lease) = first else {
            panic!("expected acquisition");
        };

        // Second caller observes the live holder.
        match lock(&store).acquire(project).await.unwrap() {
            Acquire::HeldElsewhere { holder } => assert_eq!(holder, lease.holder()),
            Acquire::Acquired(_) => panic!("lease should be held"),
        }

        lease.release().await.unwrap();
        assert!(matches!(
            lock(&store).acquire(project).await.unwrap(),
            Acquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_does_not_block() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let project = ProjectId(7);

        let crashed = lock(&store).with_ttl(Duration::from_millis(0));
        let Acquire::Acquired(_lease) = crashed.acquire(project).await.unwrap() else {
            panic!("expected acquisition");
        };
        // The crashed holder never released; its TTL has already lapsed.

        assert!(matches!(
            lock(&store).acquire(project).await.unwrap(),
            Acquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_projects_lock_independently() {
        let store = Arc::new(InMemoryCoordinationStore::new());

        let Acquire::Acquired(_a) = lock(&store).acquire(ProjectId(1)).await.unwrap() else {
            panic!("expected acquisition");
        };
        assert!(matches!(
            lock(&store).acquire(ProjectId(2)).await.unwrap(),
            Acquire::Acquired(_)
        ));
    }
}
