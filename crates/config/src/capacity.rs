//! Capacity tiers for the retention worker pools.
//!
//! Concurrency is selected from a small ordered set of tiers rather than a
//! free-form integer so that operators scale the subsystem in understood,
//! pre-sized steps. Exactly one tier is active at a time; when none is active
//! the effective capacity is zero and the pools idle.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ConfigError;

/// Ordered concurrency tiers for a worker pool.
///
/// Ordering is part of the contract: `ExtraLow < Low < Medium < High`. The
/// legacy deployment exposed the tiers as four independent toggles; when more
/// than one is enabled the highest tier wins (see
/// [`CapacityTier::from_legacy_flags`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityTier {
    ExtraLow,
    Low,
    Medium,
    High,
}

impl CapacityTier {
    /// Maximum simultaneous worker invocations for this tier.
    #[must_use]
    pub const fn concurrency(self) -> usize {
        match self {
            Self::ExtraLow => 1,
            Self::Low => 2,
            Self::Medium => 5,
            Self::High => 10,
        }
    }

    /// Tier name as a lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExtraLow => "extra_low",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Resolve the legacy four-toggle representation into a single tier.
    ///
    /// Returns `None` when no toggle is enabled. When several are enabled at
    /// once the highest tier wins; that state is ambiguous in the legacy
    /// scheme, so it is logged.
    #[must_use]
    pub fn from_legacy_flags(extra_low: bool, low: bool, medium: bool, high: bool) -> Option<Self> {
        let enabled: Vec<Self> = [
            (extra_low, Self::ExtraLow),
            (low, Self::Low),
            (medium, Self::Medium),
            (high, Self::High),
        ]
        .into_iter()
        .filter_map(|(on, tier)| on.then_some(tier))
        .collect();

        if enabled.len() > 1 {
            warn!(
                enabled = enabled.len(),
                resolved = enabled.iter().max().map_or("", |t| t.as_str()),
                "multiple capacity tiers enabled, highest tier wins"
            );
        }

        enabled.into_iter().max()
    }
}

impl std::fmt::Display for CapacityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CapacityTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "extra_low" | "extra-low" => Ok(Self::ExtraLow),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(ConfigError::UnknownTier(other.to_string())),
        }
    }
}

/// Shared, runtime-swappable handle to a pool's active capacity tier.
///
/// Pools re-read the handle on every scheduling cycle, so operators can scale
/// a running deployment up or down (or pause it entirely by clearing the
/// tier) without restarting anything.
#[derive(Clone, Default)]
pub struct CapacityHandle {
    inner: Arc<RwLock<Option<CapacityTier>>>,
}

impl CapacityHandle {
    /// Create a handle with the given initial tier (`None` pauses the pool).
    #[must_use]
    pub fn new(tier: Option<CapacityTier>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tier)),
        }
    }

    /// Activate a tier, replacing whatever was active before.
    pub fn set(&self, tier: CapacityTier) {
        *self.write_guard() = Some(tier);
    }

    /// Deactivate all tiers; the pool idles until a tier is set again.
    pub fn clear(&self) {
        *self.write_guard() = None;
    }

    /// The currently active tier, if any.
    #[must_use]
    pub fn active_tier(&self) -> Option<CapacityTier> {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Effective concurrency bound: the active tier's concurrency, or zero.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.active_tier().map_or(0, CapacityTier::concurrency)
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Option<CapacityTier>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for CapacityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityHandle")
            .field("active_tier", &self.active_tier())
            .finish()
    }
}
