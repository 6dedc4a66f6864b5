//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use psu_common::config::{RankingMode, RedundancyConfig};
use serde::Serialize;
use serde_with::{serde_as, DurationSeconds};
use tracing::info;

/// Process-wide redundancy settings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedundancyPolicy {
    pub ranking_mode: RankingMode,
    pub redundancy_supported: bool,
    pub redundancy_enabled: bool,
    pub rotation_enabled: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub rotation_period: Duration,
}

impl RedundancyPolicy {
    pub fn from_config(config: &RedundancyConfig) -> Self {
        Self {
            ranking_mode: config.ranking_mode,
            redundancy_supported: config.supported,
            redundancy_enabled: config.enabled,
            rotation_enabled: config.rotation_enabled,
            rotation_period: config.rotation_period,
        }
    }

    /// Staging and writes are allowed only when both flags are set.
    pub fn allows_staging(&self) -> bool {
        self.redundancy_supported && self.redundancy_enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("rotation period must be greater than zero")]
    ZeroRotationPeriod,
}

/// Policy shared between the engine and administrative callers.
///
/// `redundancy_supported` is fixed at construction. Readers take a fresh
/// copy with [`SharedPolicy::snapshot`] on every callback.
#[derive(Debug, Clone)]
pub struct SharedPolicy {
    inner: Arc<RwLock<RedundancyPolicy>>,
}

impl SharedPolicy {
    pub fn new(policy: RedundancyPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(policy)),
        }
    }

    pub fn snapshot(&self) -> RedundancyPolicy {
        self.inner.read().clone()
    }

    pub fn ranking_mode(&self) -> RankingMode {
        self.inner.read().ranking_mode
    }

    pub fn set_redundancy_enabled(&self, enabled: bool) {
        self.inner.write().redundancy_enabled = enabled;
        info!(enabled, "redundancy enable toggled");
    }

    pub fn set_rotation_enabled(&self, enabled: bool) {
        self.inner.write().rotation_enabled = enabled;
        info!(enabled, "rotation enable toggled");
    }

    /// Takes effect the next time the rotation timer is armed.
    pub fn set_rotation_period(&self, period: Duration) -> Result<(), PolicyError> {
        if period.is_zero() {
            return Err(PolicyError::ZeroRotationPeriod);
        }
        self.inner.write().rotation_period = period;
        info!(period_s = period.as_secs(), "rotation period updated");
        Ok(())
    }

    pub fn set_ranking_mode(&self, mode: RankingMode) {
        self.inner.write().ranking_mode = mode;
        info!(?mode, "ranking mode set");
    }

    /// One-way switch taken when a fault appears under operator ranking.
    /// Returns `true` when the mode actually changed.
    pub(crate) fn switch_to_platform_managed(&self) -> bool {
        let mut policy = self.inner.write();
        if policy.ranking_mode == RankingMode::PlatformManaged {
            return false;
        }
        policy.ranking_mode = RankingMode::PlatformManaged;
        true
    }
}
