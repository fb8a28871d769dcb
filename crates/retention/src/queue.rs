//! The durable, deduplicating FIFO queue of pipelines awaiting unlock.
//!
//! Entries are ordered by enqueue time so the oldest-enqueued pipeline is
//! unlocked first, bounding worst-case artifact storage growth. Enqueueing a
//! pipeline that is already pending is a no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::pipeline::PipelineId;
use crate::store::CoordinationStore;

/// Ordered-set key holding pending unlock requests.
pub const UNLOCK_QUEUE_KEY: &str = "retention:unlock:queue";

/// A dequeued unlock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockRequest {
    pub pipeline_id: PipelineId,
    pub enqueued_at: DateTime<Utc>,
}

impl UnlockRequest {
    /// Time the request spent waiting in the queue.
    #[must_use]
    pub fn wait_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.enqueued_at
    }
}

/// Handle to the shared unlock request queue.
#[derive(Clone)]
pub struct UnlockQueue {
    coordination: Arc<dyn CoordinationStore>,
}

impl UnlockQueue {
    #[must_use]
    pub fn new(coordination: Arc<dyn CoordinationStore>) -> Self {
        Self { coordination }
    }

    /// Enqueue a pipeline for unlocking. Returns whether it was newly added;
    /// an already-pending pipeline keeps its original position.
    pub async fn enqueue(&self, pipeline_id: PipelineId) -> Result<bool> {
        let added = self
            .coordination
            .zadd_if_absent(
                UNLOCK_QUEUE_KEY,
                pipeline_id.0,
                Utc::now().timestamp_millis(),
            )
            .await?;
        if added {
            debug!(pipeline_id = %pipeline_id, "enqueued pipeline for unlock");
        }
        Ok(added)
    }

    /// Remove and return the oldest-enqueued request, or `None` when the
    /// queue is empty.
    pub async fn dequeue_oldest(&self) -> Result<Option<UnlockRequest>> {
        let Some((member, score)) = self.coordination.zpop_min(UNLOCK_QUEUE_KEY).await? else {
            return Ok(None);
        };
        let enqueued_at = DateTime::<Utc>::from_timestamp_millis(score).unwrap_or_else(Utc::now);
        Ok(Some(UnlockRequest {
            pipeline_id: PipelineId(member),
            enqueued_at,
        }))
    }

    /// Approximate pending count. Observability only, never a correctness
    /// input.
    pub async fn size(&self) -> Result<usize> {
        self.coordination.zcard(UNLOCK_QUEUE_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCoordinationStore;

    fn queue() -> UnlockQueue {
        UnlockQueue::new(Arc::new(InMemoryCoordinationStore::new()))
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let queue = queue();
        assert!(queue.enqueue(PipelineId(1)).await.unwrap());
        assert!(!queue.enqueue(PipelineId(1)).await.unwrap());
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let queue = queue();
        for id in [1, 2, 3] {
            queue.enqueue(PipelineId(id)).await.unwrap();
            // Distinct enqueue timestamps keep the ordering unambiguous.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let mut order = Vec::new();
        while let Some(request) = queue.dequeue_oldest().await.unwrap() {
            order.push(request.pipeline_id);
        }
        assert_eq!(order, vec![PipelineId(1), PipelineId(2), PipelineId(3)]);
    }

    #[tokio::test]
    async fn test_dequeue_empty_returns_none() {
        let queue = queue();
        assert_eq!(queue.dequeue_oldest().await.unwrap(), None);
        assert_eq!(queue.size().await.unwrap(), 0);
    }
}
