//! Named policy presets.
//!
//! Plain data: callers turn a preset into a [`RateLimitConfig`] and override
//! whatever they need.

use std::time::Duration;

use super::limiter::RateLimitConfig;

/// A named `(window, max_requests)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    /// Name used in configuration files
    pub name: &'static str,
    /// Length of one counting window
    pub window: Duration,
    /// Requests allowed per key per window
    pub max_requests: u64,
}

impl Preset {
    /// A policy with this preset's limits and every other setting defaulted.
    pub fn config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.window, self.max_requests)
    }
}

/// Administrative operations: 5 per 15 minutes.
pub const STRICT: Preset = Preset {
    name: "strict",
    window: Duration::from_secs(15 * 60),
    max_requests: 5,
};

/// Regular API traffic: 100 per 15 minutes.
pub const STANDARD: Preset = Preset {
    name: "standard",
    window: Duration::from_secs(15 * 60),
    max_requests: 100,
};

/// Read-heavy or trusted API traffic: 1000 per 15 minutes.
pub const GENEROUS: Preset = Preset {
    name: "generous",
    window: Duration::from_secs(15 * 60),
    max_requests: 1000,
};

/// Short bursts: 10 per second.
pub const BURST: Preset = Preset {
    name: "burst",
    window: Duration::from_secs(1),
    max_requests: 10,
};

/// Daily ceiling: 10 000 per day.
pub const DAILY: Preset = Preset {
    name: "daily",
    window: Duration::from_secs(24 * 60 * 60),
    max_requests: 10_000,
};

/// AI-backed package generation: 10 per hour.
pub const GENERATION: Preset = Preset {
    name: "generation",
    window: Duration::from_secs(60 * 60),
    max_requests: 10,
};

/// Every built-in preset.
pub const ALL: [Preset; 6] = [STRICT, STANDARD, GENEROUS, BURST, DAILY, GENERATION];

/// Look up a preset by name.
pub fn find(name: &str) -> Option<Preset> {
    ALL.iter().copied().find(|preset| preset.name == name)
}
