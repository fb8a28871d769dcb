//! Error taxonomy for the retention engine.
//!
//! Expected no-ops (already leased, already unlocked, empty queue, no
//! claimable bucket, execution timeout) are outcome values on the operations
//! that produce them, never errors. The variants here are the cases that must
//! reach the invoking scheduler.

use thiserror::Error;

use crate::pipeline::ProjectId;

/// Errors surfaced by retention engine operations.
#[derive(Debug, Error)]
pub enum RetentionError {
    /// Lease acquisition lost the race on every attempt within the retry
    /// budget. The scheduler may alert or back off; the queue entry is left
    /// in place for retry.
    #[error("failed to obtain unlock lease for project {project} after {attempts} attempts")]
    LeaseUnavailable { project: ProjectId, attempts: u32 },

    /// Ref cleanup would remove the project's last unlocked artifact
    /// snapshot. Rejected outright rather than silently skipped.
    #[error("refusing cleanup of {ref_name}: last unlocked artifact snapshot for project {project}")]
    LastSnapshotProtected { project: ProjectId, ref_name: String },

    /// A persistence or coordination backend failure.
    #[error("store error: {0}")]
    Store(String),
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, RetentionError>;
