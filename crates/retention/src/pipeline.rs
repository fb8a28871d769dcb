//! Pipeline and artifact data model: identifiers, lock state, status.
//!
//! Lock state is the retention engine's own concern; pipeline status is
//! carried only as far as the cancellation cascade needs it (terminal
//! detection and the cancel transition).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Identifier of a pipeline.
    PipelineId
);
id_type!(
    /// Identifier of a project.
    ProjectId
);
id_type!(
    /// Identifier of a job within a pipeline.
    JobId
);
id_type!(
    /// Identifier of a stored artifact row.
    ArtifactId
);

/// Whether a pipeline's artifacts are protected from expiry-based deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    ArtifactsLocked,
}

impl LockState {
    /// Lock state name as a lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::ArtifactsLocked => "artifacts_locked",
        }
    }

    /// True while artifacts are protected from deletion.
    #[must_use]
    pub const fn is_locked(self) -> bool {
        matches!(self, Self::ArtifactsLocked)
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline execution status, reduced to what retention needs.
///
/// The cancel transition moves any non-terminal status to `Canceled`;
/// canceling an already-terminal pipeline is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
}

impl PipelineStatus {
    /// Status name as a lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Skipped => "skipped",
            Self::Manual => "manual",
        }
    }

    /// True once the pipeline has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled | Self::Skipped)
    }

    /// Whether the cancel transition applies.
    #[must_use]
    pub const fn can_cancel(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A CI pipeline row as the retention engine sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub project_id: ProjectId,
    /// Name of the ref (branch or tag) the pipeline ran against.
    pub ref_name: String,
    pub status: PipelineStatus,
    pub lock_state: LockState,
    /// Parent pipeline when this pipeline was triggered by another one.
    pub parent: Option<PipelineId>,
    /// Set when the pipeline was canceled as a side effect of another
    /// pipeline's cancellation; cleared if the pipeline re-enters an active
    /// state.
    pub auto_canceled_by: Option<PipelineId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A job artifact row. `locked` is cached from the owning pipeline's lock
/// state at write time, not live-joined; `pipeline_id` is resolved through
/// the owning job at write time for the same reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArtifact {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub project_id: ProjectId,
    pub expire_at: Option<DateTime<Utc>>,
    pub locked: LockState,
    pub size_bytes: u64,
}

impl JobArtifact {
    /// True once `expire_at` has passed. Artifacts without an expiry never
    /// expire.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }

    /// Deletable means expired and not lock-protected.
    #[must_use]
    pub fn deletable(&self, now: DateTime<Utc>) -> bool {
        self.expired(now) && !self.locked.is_locked()
    }
}

/// A pipeline-level artifact row (reports and similar), unlocked alongside
/// the job artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineArtifact {
    pub id: ArtifactId,
    pub pipeline_id: PipelineId,
    pub project_id: ProjectId,
    pub locked: LockState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_state_names() {
        assert_eq!(LockState::Unlocked.as_str(), "unlocked");
        assert_eq!(LockState::ArtifactsLocked.as_str(), "artifacts_locked");
        assert!(LockState::ArtifactsLocked.is_locked());
        assert!(!LockState::Unlocked.is_locked());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(PipelineStatus::Success.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Canceled.is_terminal());
        assert!(PipelineStatus::Skipped.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
        assert!(!PipelineStatus::Manual.is_terminal());
    }

    #[test]
    fn test_cancel_applies_only_to_active_pipelines() {
        assert!(PipelineStatus::Running.can_cancel());
        assert!(PipelineStatus::Created.can_cancel());
        assert!(!PipelineStatus::Canceled.can_cancel());
        assert!(!PipelineStatus::Success.can_cancel());
    }

    #[test]
    fn test_artifact_expiry() {
        let now = Utc::now();
        let artifact = JobArtifact {
            id: ArtifactId(1),
            job_id: JobId(10),
            pipeline_id: PipelineId(100),
            project_id: ProjectId(7),
            expire_at: Some(now - chrono::Duration::hours(1)),
            locked: LockState::ArtifactsLocked,
            size_bytes: 1024,
        };

        assert!(artifact.expired(now));
        // Expired but still locked: not deletable.
        assert!(!artifact.deletable(now));

        let unlocked = JobArtifact {
            locked: LockState::Unlocked,
            ..artifact.clone()
        };
        assert!(unlocked.deletable(now));

        let keep_forever = JobArtifact {
            expire_at: None,
            ..artifact
        };
        assert!(!keep_forever.expired(now));
    }
}
