//! # Config
//!
//! Policy constants for stabilization, acquisition and the continuous watch.
//! Every field has a default so partial JSON files are accepted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::acquisition::AcquisitionPolicy;
use crate::source::PositionOptions;

/// Hysteresis thresholds for the rolling location history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationPolicy {
    /// Max samples retained in the rolling history
    pub history_len: usize,
    /// Samples at least this old are ignored
    pub freshness_window_ms: i64,
    /// A candidate must beat the held accuracy by more than this
    pub improvement_margin_meters: f64,
    /// Displacement that counts as real movement
    pub movement_threshold_meters: f64,
    /// Movement only overrides with a reading better than this
    pub movement_accuracy_ceiling_meters: f64,
}

impl Default for StabilizationPolicy {
    fn default() -> Self {
        Self {
            history_len: 5,
            freshness_window_ms: 30_000,
            improvement_margin_meters: 5.0,
            movement_threshold_meters: 15.0,
            movement_accuracy_ceiling_meters: 50.0,
        }
    }
}

/// struct holding configuration options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub stabilization: StabilizationPolicy,
    pub acquisition: AcquisitionPolicy,
    /// Options for the continuous watch subscription
    pub watch: PositionOptions,
    /// Radius used when the gym registry has none configured
    pub default_checkin_radius_meters: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            stabilization: StabilizationPolicy::default(),
            acquisition: AcquisitionPolicy::default(),
            watch: PositionOptions {
                enable_high_accuracy: true,
                timeout_ms: 15_000,
                max_cache_age_ms: 0,
            },
            default_checkin_radius_meters: 500.0,
        }
    }
}

impl PresenceConfig {
    /// Load from a JSON file, filling missing fields with defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: PresenceConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.check()?;
        log::debug!("Loaded presence config from {}", path.display());
        Ok(config)
    }

    /// Reject combinations the estimator cannot work with
    pub fn check(&self) -> Result<()> {
        if self.stabilization.history_len == 0 {
            anyhow::bail!("stabilization.history_len must be at least 1");
        }
        if self.stabilization.freshness_window_ms <= 0 {
            anyhow::bail!("stabilization.freshness_window_ms must be positive");
        }
        if self.acquisition.attempts.is_empty() {
            anyhow::bail!("acquisition.attempts must list at least one attempt");
        }
        Ok(())
    }
}
