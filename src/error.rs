//! Error types for the throttling layer.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for forge-throttle operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tier name that was never registered with the tiered limiter
    #[error("Unknown rate limit tier: {0}")]
    UnknownTier(String),

    /// Two tiers registered under the same name
    #[error("Duplicate rate limit tier: {0}")]
    DuplicateTier(String),

    /// The key function could not derive a counting key for a request
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Counter store errors (only surfaced by administrative operations)
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for forge-throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
