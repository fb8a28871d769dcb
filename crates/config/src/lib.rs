//! Shared configuration types for the artifact retention engine.
//!
//! This crate owns the runtime knobs that operators turn without redeploying:
//! the capacity tier driving worker concurrency, and the tuning values for
//! leases, batch sizes and execution budgets. Components receive these as
//! injected handles; nothing in here is process-global.

pub mod capacity;
pub mod tuning;

pub use capacity::{CapacityHandle, CapacityTier};
pub use tuning::{EngineSettings, ReaperTuning, UnlockTuning};

use thiserror::Error;

/// Errors raised while parsing or validating engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown capacity tier: {0}")]
    UnknownTier(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
