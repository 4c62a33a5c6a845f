//! Several named policies evaluated together.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use super::key::RequestContext;
use super::limiter::{Decision, RateLimitConfig, RateLimiter};
use super::middleware::RateLimitMiddleware;
use crate::error::{Result, ThrottleError};

/// The binding outcome of a multi-tier check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TieredDecision {
    /// Tier whose decision binds
    pub tier: String,
    /// That tier's decision
    #[serde(flatten)]
    pub decision: Decision,
}

/// A set of independent named rate limiters.
///
/// Tiers share no state. Registration order is kept and decides which tier
/// is reported when several deny the same request.
#[derive(Debug)]
pub struct TieredRateLimiter {
    tiers: Vec<(String, RateLimiter)>,
}

impl TieredRateLimiter {
    /// Create one limiter per `(name, config)` pair.
    ///
    /// Fails on an empty set or a repeated name. A config without a key
    /// prefix is namespaced under its tier name, so tiers handed the same
    /// store still count separately.
    pub fn new<I, S>(tiers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, RateLimitConfig)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut limiters = Vec::new();

        for (name, mut config) in tiers {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(ThrottleError::DuplicateTier(name));
            }
            if config.key_prefix.is_none() {
                config.key_prefix = Some(name.clone());
            }
            debug!(
                tier = %name,
                limit = config.max_requests,
                window = ?config.window,
                "Registering rate limit tier"
            );
            let limiter = RateLimiter::for_tier(config, &name);
            limiters.push((name, limiter));
        }

        if limiters.is_empty() {
            return Err(ThrottleError::Config("at least one rate limit tier is required".into()));
        }

        Ok(Self { tiers: limiters })
    }

    /// Get the tier names in registration order.
    pub fn tier_names(&self) -> impl Iterator<Item = &str> {
        self.tiers.iter().map(|(name, _)| name.as_str())
    }

    /// Get the limiter for a tier.
    pub fn limiter(&self, tier: &str) -> Result<&RateLimiter> {
        self.tiers
            .iter()
            .find(|(name, _)| name == tier)
            .map(|(_, limiter)| limiter)
            .ok_or_else(|| ThrottleError::UnknownTier(tier.to_string()))
    }

    /// Check one request against a single tier.
    pub async fn check_tier(&self, tier: &str, ctx: &RequestContext) -> Result<Decision> {
        self.limiter(tier)?.check_limit(ctx).await
    }

    /// Returns the middleware adapter for a single tier.
    pub fn middleware(&self, tier: &str) -> Result<RateLimitMiddleware> {
        Ok(self.limiter(tier)?.middleware())
    }

    /// Check one request against every tier and return the binding result.
    ///
    /// Each tier counts the request. The first denying tier (in registration
    /// order) wins; if every tier allows, the one with the least quota left
    /// wins. A key derivation error from any tier is returned.
    pub async fn check_all_tiers(&self, ctx: &RequestContext) -> Result<TieredDecision> {
        let checks = self.tiers.iter().map(|(_, limiter)| limiter.check_limit(ctx));
        let results = join_all(checks).await;

        let mut decisions = Vec::with_capacity(results.len());
        for ((name, _), result) in self.tiers.iter().zip(results) {
            decisions.push((name, result?));
        }
        most_restrictive(decisions)
    }

    /// Count an already-derived key against every tier.
    pub async fn check_all_for_key(&self, key: &str) -> Result<TieredDecision> {
        let checks = self.tiers.iter().map(|(_, limiter)| limiter.check_key(key));
        let decisions = join_all(checks).await;

        most_restrictive(self.tiers.iter().map(|(name, _)| name).zip(decisions).collect())
    }

    /// Release background work owned by every tier's store.
    pub fn close(&self) {
        for (_, limiter) in &self.tiers {
            limiter.close();
        }
    }
}

fn most_restrictive(decisions: Vec<(&String, Decision)>) -> Result<TieredDecision> {
    let mut binding: Option<(&String, Decision)> = None;

    for (name, decision) in decisions {
        if !decision.allowed {
            binding = Some((name, decision));
            break;
        }
        let tighter = match &binding {
            Some((_, current)) => decision.remaining < current.remaining,
            None => true,
        };
        if tighter {
            binding = Some((name, decision));
        }
    }

    let (tier, decision) = binding
        .ok_or_else(|| ThrottleError::Config("no rate limit tiers registered".into()))?;
    if !decision.allowed {
        debug!(tier = %tier, "Request denied by rate limit tier");
    }

    Ok(TieredDecision {
        tier: tier.clone(),
        decision,
    })
}
