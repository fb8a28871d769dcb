//! Tuning values for the unlock and reaping pipelines.
//!
//! Everything here has a production default; deployments override individual
//! values through the environment or a deserialized settings document.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capacity::{CapacityHandle, CapacityTier};
use crate::ConfigError;

/// Tuning for the unlock executor and its worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockTuning {
    /// TTL of the per-project unlock lease, in seconds.
    pub lease_ttl_secs: u64,
    /// Attempts to acquire the lease before surfacing a hard failure.
    pub lease_retries: u32,
    /// Base delay between lease attempts, in milliseconds. Doubles per attempt.
    pub lease_backoff_ms: u64,
    /// Rows updated per batch while unlocking artifacts.
    pub batch_size: usize,
    /// Wall-clock budget for a single unlock execution, in seconds.
    pub execution_budget_secs: u64,
}

impl Default for UnlockTuning {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 60,
            lease_retries: 3,
            lease_backoff_ms: 300,
            batch_size: 100,
            execution_budget_secs: 300,
        }
    }
}

impl UnlockTuning {
    /// TTL of the per-project unlock lease.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Base backoff between lease attempts.
    #[must_use]
    pub const fn lease_backoff(&self) -> Duration {
        Duration::from_millis(self.lease_backoff_ms)
    }

    /// Wall-clock budget for a single unlock execution.
    #[must_use]
    pub const fn execution_budget(&self) -> Duration {
        Duration::from_secs(self.execution_budget_secs)
    }

    /// Reject values that would stall or spin the executor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "unlock.batch_size".to_string(),
                value: "0".to_string(),
            });
        }
        if self.lease_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "unlock.lease_retries".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Tuning for the expired-artifact reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperTuning {
    /// TTL of a bucket claim, in seconds. Expired claims are recoverable.
    pub claim_ttl_secs: u64,
    /// Rows deleted per batch while reaping a bucket.
    pub batch_size: usize,
}

impl Default for ReaperTuning {
    fn default() -> Self {
        Self {
            claim_ttl_secs: 600,
            batch_size: 100,
        }
    }
}

impl ReaperTuning {
    /// TTL of a bucket claim.
    #[must_use]
    pub const fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    /// Reject values that would stall the reaper.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reaper.batch_size".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Environment variable naming the unlock pool's capacity tier.
pub const ENV_UNLOCK_CAPACITY: &str = "RETENTION_UNLOCK_CAPACITY";
/// Environment variable naming the reaper pool's capacity tier.
pub const ENV_REAPER_CAPACITY: &str = "RETENTION_REAPER_CAPACITY";

/// Complete runtime settings for the engine: capacity handles plus tuning.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub unlock_capacity: CapacityHandle,
    pub reaper_capacity: CapacityHandle,
    pub unlock: UnlockTuning,
    pub reaper: ReaperTuning,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            unlock_capacity: CapacityHandle::new(Some(CapacityTier::Low)),
            reaper_capacity: CapacityHandle::new(Some(CapacityTier::Low)),
            unlock: UnlockTuning::default(),
            reaper: ReaperTuning::default(),
        }
    }
}

impl EngineSettings {
    /// Build settings from the environment, falling back to defaults.
    ///
    /// An unparseable tier value is treated as unset and logged rather than
    /// refused; a misconfigured deployment should idle, not crash-loop.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            unlock_capacity: CapacityHandle::new(tier_from_env(ENV_UNLOCK_CAPACITY)),
            reaper_capacity: CapacityHandle::new(tier_from_env(ENV_REAPER_CAPACITY)),
            unlock: UnlockTuning::default(),
            reaper: ReaperTuning::default(),
        }
    }

    /// Validate all tuning sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.unlock.validate()?;
        self.reaper.validate()
    }
}

fn tier_from_env(key: &str) -> Option<CapacityTier> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<CapacityTier>() {
        Ok(tier) => Some(tier),
        Err(_) => {
            warn!(%key, value = %raw, "unparseable capacity tier in environment, pool will idle");
            None
        }
    }
}
