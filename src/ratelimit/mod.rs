//! Rate limiting logic and counter storage.

mod clock;
mod counter;
mod key;
mod limiter;
mod memory;
mod middleware;
pub mod presets;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod rules;
mod store;
mod tiered;

pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{CounterEntry, TimeWindow};
pub use key::{KeyBy, KeyFn, RequestContext};
pub use limiter::{Decision, FailMode, RateLimitConfig, RateLimiter, Status, DEFAULT_STORE_TIMEOUT};
pub use memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
pub use middleware::{
    apply_headers, too_many_requests, LimitHandler, RateLimitMiddleware, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use store::{CounterStore, StoreError, StoreResult};
pub use tiered::{TieredDecision, TieredRateLimiter};
