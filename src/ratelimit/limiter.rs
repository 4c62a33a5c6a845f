//! Core rate limiter implementation.
//!
//! A [`RateLimiter`] is one fixed-window policy: at most `max_requests` per
//! key per window, where the window is anchored to the first request seen for
//! the key. A burst straddling a window edge can therefore admit up to twice
//! the ceiling over a short rolling interval; that approximation buys O(1)
//! storage and work per key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{deadline, CounterEntry};
use super::key::{KeyBy, KeyFn, RequestContext};
use super::memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
use super::middleware::{too_many_requests, LimitHandler, RateLimitMiddleware};
use super::store::{CounterStore, StoreError, StoreResult};
use crate::error::Result;

/// Default bound on a single counter store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// What a check returns when the counter store fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Let the request through with a full quota
    #[default]
    Open,
    /// Reject the request until the store recovers
    Closed,
}

/// Configuration for a single rate limiting policy.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Length of one counting window
    pub window: Duration,
    /// Requests allowed per key per window
    pub max_requests: u64,
    /// Maps a request to the key it is counted under
    pub key_fn: KeyFn,
    /// Builds the response for a denied request
    pub on_limit_reached: LimitHandler,
    /// Where counters live
    pub store: Arc<dyn CounterStore>,
    /// Behaviour when the store fails
    pub fail_mode: FailMode,
    /// Bound on each store call
    pub store_timeout: Duration,
    /// Namespace prepended to every derived key
    pub key_prefix: Option<String>,
    /// Time source for fallback decisions and retry hints
    pub clock: Arc<dyn Clock>,
}

impl RateLimitConfig {
    /// A policy allowing `max_requests` per `window`, keyed by remote address
    /// and counted in a fresh in-process store. Inside a Tokio runtime that
    /// store sweeps expired counters every [`DEFAULT_SWEEP_INTERVAL`].
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
            key_fn: KeyBy::RemoteAddr.key_fn(),
            on_limit_reached: Arc::new(too_many_requests),
            store: Arc::new(MemoryStore::sweeping(DEFAULT_SWEEP_INTERVAL)),
            fail_mode: FailMode::Open,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: None,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Derive keys with a custom function.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&RequestContext) -> Result<String> + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// Derive keys with a built-in strategy.
    pub fn with_key_by(mut self, key_by: KeyBy) -> Self {
        self.key_fn = key_by.key_fn();
        self
    }

    /// Replace the denial response.
    pub fn with_on_limit_reached<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RequestContext, &Decision) -> http::Response<String> + Send + Sync + 'static,
    {
        self.on_limit_reached = Arc::new(handler);
        self
    }

    /// Count in `store` instead of a private in-process store.
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = store;
        self
    }

    /// Set the fail mode.
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Set the per-call store timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Namespace every key under `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("fail_mode", &self.fail_mode)
            .field("store_timeout", &self.store_timeout)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The ceiling for this policy
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until `reset_at`, rounded up
    pub retry_after_secs: u64,
}

impl Decision {
    fn from_entry(entry: &CounterEntry, limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            allowed: entry.count <= limit,
            limit,
            remaining: entry.remaining(limit),
            reset_at: entry.window_end,
            retry_after_secs: ceil_secs(entry.duration_until_reset(now)),
        }
    }
}

/// Read-only view of a key's counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Requests counted in the current window
    pub count: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window resets, `None` if no window is open
    pub reset_at: Option<DateTime<Utc>>,
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// A single throttling policy over a counter store.
///
/// Cloning is cheap and clones share the same store.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Tier name, for logging
    tier: Option<String>,
}

impl RateLimiter {
    /// Create a new rate limiter from `config`.
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, tier: None }
    }

    pub(crate) fn for_tier(config: RateLimitConfig, tier: &str) -> Self {
        Self {
            config,
            tier: Some(tier.to_string()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Get the tier name, if this limiter belongs to a tiered limiter.
    pub fn tier(&self) -> Option<&str> {
        self.tier.as_deref()
    }

    /// Derive the counting key for a request.
    pub fn derive_key(&self, ctx: &RequestContext) -> Result<String> {
        (self.config.key_fn)(ctx)
    }

    /// Count one request and decide whether it may proceed.
    ///
    /// Store failures never surface here; they resolve through the fail mode.
    /// Only a key derivation error is returned.
    pub async fn check_limit(&self, ctx: &RequestContext) -> Result<Decision> {
        let key = self.derive_key(ctx)?;
        Ok(self.check_key(&key).await)
    }

    /// Count one request under an already-derived key.
    pub async fn check_key(&self, key: &str) -> Decision {
        let store_key = self.store_key(key);

        trace!(key = %store_key, tier = ?self.tier, "Checking rate limit");

        let outcome = self
            .bounded(self.config.store.increment(&store_key, self.config.window))
            .await;

        match outcome {
            Ok(entry) => {
                let decision = Decision::from_entry(&entry, self.config.max_requests, self.config.clock.now());
                if !decision.allowed {
                    debug!(
                        key = %store_key,
                        tier = ?self.tier,
                        count = entry.count,
                        limit = self.config.max_requests,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.store_failure(&store_key, e),
        }
    }

    /// Returns the middleware adapter for this policy.
    pub fn middleware(&self) -> RateLimitMiddleware {
        RateLimitMiddleware::new(self.clone())
    }

    /// Clear the counter for a request's key.
    pub async fn reset_key(&self, ctx: &RequestContext) -> Result<()> {
        let key = self.derive_key(ctx)?;
        self.reset_for_key(&key).await
    }

    /// Clear the counter for an already-derived key.
    pub async fn reset_for_key(&self, key: &str) -> Result<()> {
        let store_key = self.store_key(key);
        self.bounded(self.config.store.reset(&store_key)).await?;
        debug!(key = %store_key, tier = ?self.tier, "Rate limit counter reset");
        Ok(())
    }

    /// Read a request's counter without consuming quota.
    pub async fn get_status(&self, ctx: &RequestContext) -> Result<Status> {
        let key = self.derive_key(ctx)?;
        self.status_for_key(&key).await
    }

    /// Read the counter for an already-derived key without consuming quota.
    pub async fn status_for_key(&self, key: &str) -> Result<Status> {
        let store_key = self.store_key(key);
        let entry = self.bounded(self.config.store.get(&store_key)).await?;
        let limit = self.config.max_requests;

        Ok(match entry {
            Some(entry) => Status {
                count: entry.count,
                remaining: entry.remaining(limit),
                reset_at: Some(entry.window_end),
            },
            None => Status {
                count: 0,
                remaining: limit,
                reset_at: None,
            },
        })
    }

    /// Release background work owned by the store.
    pub fn close(&self) {
        self.config.store.close();
    }

    fn store_key(&self, key: &str) -> String {
        match &self.config.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    async fn bounded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.store_timeout)),
        }
    }

    fn store_failure(&self, store_key: &str, error: StoreError) -> Decision {
        let now = self.config.clock.now();
        let limit = self.config.max_requests;

        warn!(
            key = %store_key,
            tier = ?self.tier,
            limit = limit,
            fail_mode = ?self.config.fail_mode,
            error = %error,
            "Counter store failed during rate limit check"
        );

        match self.config.fail_mode {
            FailMode::Open => Decision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: deadline(now, self.config.window),
                retry_after_secs: 0,
            },
            FailMode::Closed => Decision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: deadline(now, self.config.window),
                retry_after_secs: ceil_secs(self.config.window),
            },
        }
    }
}
