#![allow(clippy::missing_errors_doc, clippy::doc_markdown)]

//! Pipeline-artifact retention and unlock engine.
//!
//! Decides which pipeline's build artifacts stay protected per ref, moves
//! older pipelines' artifacts to unlocked without races, and reclaims expired
//! artifact storage through sharded, capacity-bounded background workers.
//!
//! The engine owns no storage: pipeline and artifact rows live behind
//! [`store::PipelineStore`], queue entries and leases behind
//! [`store::CoordinationStore`]. Both are injected handles. Worker pools are
//! pull-based ([`pool::LimitedCapacityWorker`]): an external scheduler
//! invokes them up to `max_concurrency()` times per cycle, and capacity is
//! re-read each cycle so operators can scale at runtime.

pub mod bucket;
pub mod cancel;
pub mod error;
pub mod events;
pub mod executor;
pub mod lease;
pub mod metrics;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod queue;
pub mod reaper;
pub mod store;

// Re-export commonly used types
pub use cancel::{CancelOutcome, CancelPipelineService, Cascade};
pub use error::{RetentionError, Result};
pub use events::{EventDisposition, EventRouter, RetentionEvent};
pub use executor::{UnlockExecutor, UnlockOutcome, UnlockStatus};
pub use metrics::{MetricsSnapshot, RetentionMetrics};
pub use pipeline::{JobArtifact, LockState, Pipeline, PipelineId, PipelineStatus, ProjectId};
pub use planner::{PlanOutcome, RefUnlockPlanner};
pub use pool::{LimitedCapacityWorker, UnlockWorkerPool, WorkOutcome};
pub use queue::{UnlockQueue, UnlockRequest};
pub use reaper::{ExpiredArtifactReaper, ReapOutcome, ReaperPool};
