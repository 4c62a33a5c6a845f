//! Forge Throttle - Request Throttling for OpenNode Forge
//!
//! This crate implements the abuse-prevention layer in front of the package
//! generation API. Each policy is a fixed-window counter over a pluggable
//! counter store (in-process or Redis), and a tiered limiter evaluates several
//! policies at once and reports whichever one binds.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{Result, ThrottleError};
pub use ratelimit::{
    Decision, RateLimitConfig, RateLimitMiddleware, RateLimiter, RequestContext,
    TieredDecision, TieredRateLimiter,
};
