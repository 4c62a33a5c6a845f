//! Request pipeline adapter for a rate limiter.
//!
//! Every response passing through the adapter carries the limit, remaining
//! quota and reset time headers, whether the request was admitted or not.
//! Denied requests never reach the next stage.

use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::key::RequestContext;
use super::limiter::{Decision, RateLimiter};
use crate::error::Result;

/// Header carrying the policy ceiling.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the quota left in the window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Header carrying the window reset time (RFC 3339).
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Builds the response sent for a denied request.
pub type LimitHandler = Arc<dyn Fn(&RequestContext, &Decision) -> Response<String> + Send + Sync>;

/// Default denial: `429 Too Many Requests` with a `Retry-After` hint and a
/// JSON body naming the wait in seconds.
pub fn too_many_requests(_ctx: &RequestContext, decision: &Decision) -> Response<String> {
    let retry_after = decision.retry_after_secs.max(1);
    let body = serde_json::json!({
        "error": "Too many requests, please try again later.",
        "retryAfter": retry_after,
    })
    .to_string();

    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(retry_after));
    resp
}

/// Attach the rate limit headers for `decision`.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from_str(&decision.reset_at.to_rfc3339())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}

/// Middleware wrapping one [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct RateLimitMiddleware {
    limiter: RateLimiter,
}

impl RateLimitMiddleware {
    /// Create a new middleware for `limiter`.
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    /// Get the wrapped limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one request through the limiter.
    ///
    /// Admitted requests are handed to `next`; denied ones get the policy's
    /// `on_limit_reached` response. Either way the rate limit headers are set.
    /// A key derivation failure is returned without calling `next`.
    pub async fn handle<B, F, Fut>(&self, ctx: RequestContext, next: F) -> Result<Response<B>>
    where
        B: From<String>,
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Response<B>>,
    {
        let decision = self.limiter.check_limit(&ctx).await?;

        let mut response = if decision.allowed {
            next(ctx).await
        } else {
            debug!(
                tier = ?self.limiter.tier(),
                path = %ctx.path,
                retry_after = decision.retry_after_secs,
                "Rejecting rate limited request"
            );
            (self.limiter.config().on_limit_reached)(&ctx, &decision).map(B::from)
        };

        apply_headers(response.headers_mut(), &decision);
        Ok(response)
    }
}
