//! Inbound trigger events and their routing.
//!
//! The engine consumes three kinds of triggers: ref updates (push/merge),
//! pipeline completion or cancellation, and ref deletion. Each resolves to a
//! planning pass that feeds the unlock queue; the periodic sweeps are driven
//! directly by the scheduler and have no event payload.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::{PipelineId, ProjectId};
use crate::planner::{PlanOutcome, RefUnlockPlanner};
use crate::store::PipelineStore;

/// A ref was created or moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefUpdated {
    pub project_id: ProjectId,
    pub user_id: u64,
    pub ref_name: String,
}

/// A ref was deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefDeleted {
    pub project_id: ProjectId,
    pub user_id: u64,
    pub ref_name: String,
}

/// A pipeline reached a stopped state (success, failure or cancellation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStopped {
    pub pipeline_id: PipelineId,
}

/// Any inbound retention trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionEvent {
    RefUpdated(RefUpdated),
    RefDeleted(RefDeleted),
    PipelineStopped(PipelineStopped),
}

/// How an event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// A planning pass ran.
    Planned(PlanOutcome),
    /// The event carried nothing actionable.
    Ignored { reason: String },
}

/// Routes inbound events to the planner.
#[derive(Clone)]
pub struct EventRouter {
    planner: RefUnlockPlanner,
    pipelines: Arc<dyn PipelineStore>,
}

impl EventRouter {
    #[must_use]
    pub fn new(planner: RefUnlockPlanner, pipelines: Arc<dyn PipelineStore>) -> Self {
        Self { planner, pipelines }
    }

    /// Handle one inbound event.
    pub async fn handle(&self, event: RetentionEvent) -> Result<EventDisposition> {
        match event {
            RetentionEvent::RefUpdated(event) => {
                let outcome = self
                    .planner
                    .plan_for_ref(event.project_id, &event.ref_name)
                    .await?;
                Ok(EventDisposition::Planned(outcome))
            }
            RetentionEvent::RefDeleted(event) => {
                let outcome = self
                    .planner
                    .plan_for_ref_deletion(event.project_id, &event.ref_name)
                    .await?;
                Ok(EventDisposition::Planned(outcome))
            }
            RetentionEvent::PipelineStopped(event) => {
                // The stopped pipeline names the ref whose older pipelines
                // are now stale.
                let Some(pipeline) = self.pipelines.pipeline(event.pipeline_id).await? else {
                    warn!(
                        pipeline_id = %event.pipeline_id,
                        "stopped pipeline not found, ignoring event"
                    );
                    return Ok(EventDisposition::Ignored {
                        reason: "pipeline not found".to_string(),
                    });
                };
                let outcome = self
                    .planner
                    .plan_for_ref(pipeline.project_id, &pipeline.ref_name)
                    .await?;
                info!(
                    pipeline_id = %event.pipeline_id,
                    project = %pipeline.project_id,
                    ref_name = %pipeline.ref_name,
                    enqueued = outcome.enqueued,
                    "planned unlock work after pipeline stop"
                );
                Ok(EventDisposition::Planned(outcome))
            }
        }
    }
}
