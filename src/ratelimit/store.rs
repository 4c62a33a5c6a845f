//! Counter store trait for abstracting in-process and shared backends.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::counter::CounterEntry;

/// Errors a counter store can report.
///
/// The limiter never surfaces these from a rate limit check; they are
/// resolved by its fail mode and logged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the allotted time
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The backing service answered with an error or unreadable data
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for key to counter storage with expiry.
///
/// Implementations must make `increment` atomic per key: N concurrent
/// increments against an empty or expired entry yield exactly the counts
/// `1..=N`. The other operations carry no atomicity requirement.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current entry for `key`, or `None` if absent or expired. Never mutates.
    async fn get(&self, key: &str) -> StoreResult<Option<CounterEntry>>;

    /// Replace the entry for `key` unconditionally, expiring after `ttl`.
    async fn set(&self, key: &str, count: u64, ttl: Duration) -> StoreResult<()>;

    /// Create or increment the entry for `key`.
    ///
    /// An absent or expired entry restarts at a count of one with its window
    /// ending `ttl` from now. Later increments in the same window keep the
    /// original window end.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<CounterEntry>;

    /// Delete the entry for `key` immediately.
    async fn reset(&self, key: &str) -> StoreResult<()>;

    /// Release background work owned by the store. Idempotent.
    fn close(&self) {}
}
