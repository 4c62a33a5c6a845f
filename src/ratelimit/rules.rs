//! Tier rules as written in configuration files.
//!
//! A rule names a tier and gives its limits either through a preset, through
//! explicit `requests_per_unit`/`unit` fields, or both (explicit fields win).
//!
//! ```yaml
//! tiers:
//!   - name: burst
//!     preset: burst
//!   - name: api
//!     requests_per_unit: 100
//!     unit: minute
//!     units: 15
//!     key_by: header:x-api-key
//!     fail_mode: closed
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::counter::TimeWindow;
use super::key::KeyBy;
use super::limiter::{FailMode, RateLimitConfig};
use super::presets;
use super::store::CounterStore;
use crate::error::{Result, ThrottleError};

/// Configuration for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    /// Unique tier name
    pub name: String,
    /// Preset supplying default limits
    #[serde(default)]
    pub preset: Option<String>,
    /// Number of requests allowed per window
    #[serde(default)]
    pub requests_per_unit: Option<u64>,
    /// The time unit of the window
    #[serde(default)]
    pub unit: Option<TimeWindow>,
    /// How many units one window spans
    #[serde(default = "default_units")]
    pub units: u32,
    /// How requests are keyed
    #[serde(default)]
    pub key_by: KeyBy,
    /// Behaviour when the counter store fails
    #[serde(default)]
    pub fail_mode: FailMode,
}

fn default_units() -> u32 {
    1
}

impl TierRule {
    /// A rule taking all of its limits from a preset.
    pub fn from_preset(name: impl Into<String>, preset: &str) -> Self {
        Self {
            name: name.into(),
            preset: Some(preset.to_string()),
            requests_per_unit: None,
            unit: None,
            units: default_units(),
            key_by: KeyBy::default(),
            fail_mode: FailMode::default(),
        }
    }

    /// Resolve the window length and request ceiling.
    pub fn limits(&self) -> Result<(Duration, u64)> {
        let preset = match &self.preset {
            Some(name) => Some(presets::find(name).ok_or_else(|| {
                ThrottleError::Config(format!("tier {}: unknown preset {}", self.name, name))
            })?),
            None => None,
        };

        if self.units == 0 {
            return Err(ThrottleError::Config(format!("tier {}: units must be at least 1", self.name)));
        }

        let window = self
            .unit
            .map(|unit| unit.times(self.units))
            .or(preset.map(|p| p.window))
            .ok_or_else(|| ThrottleError::Config(format!("tier {}: no unit or preset", self.name)))?;

        let max_requests = self
            .requests_per_unit
            .or(preset.map(|p| p.max_requests))
            .ok_or_else(|| {
                ThrottleError::Config(format!("tier {}: no requests_per_unit or preset", self.name))
            })?;

        if max_requests == 0 {
            return Err(ThrottleError::Config(format!(
                "tier {}: requests_per_unit must be positive",
                self.name
            )));
        }

        Ok((window, max_requests))
    }

    /// Build the policy for this rule, counting in `store`.
    pub fn to_config(&self, store: Arc<dyn CounterStore>) -> Result<RateLimitConfig> {
        let (window, max_requests) = self.limits()?;
        Ok(RateLimitConfig::new(window, max_requests)
            .with_store(store)
            .with_key_by(self.key_by.clone())
            .with_fail_mode(self.fail_mode))
    }
}
