//! Error types for the Quorate engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Quorate operations.
///
/// A rate-limit rejection from [`RateLimiter::try_acquire`] is *not* an
/// error; it is `Ok(false)`. Everything here is an infrastructure or
/// configuration fault, except [`LimiterError::RateLimited`] which is only
/// produced by the rule-based entry point.
///
/// [`RateLimiter::try_acquire`]: crate::ratelimit::RateLimiter::try_acquire
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An algorithm program could not be located or read
    #[error("Failed to load script `{name}`: {source}")]
    Script {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The backing store was unreachable or the script raised an error
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The store call did not answer within the configured timeout
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The executor was handed a program it cannot run
    #[error("Unexpected reply from store: {0}")]
    UnexpectedReply(String),

    /// A named rule rejected the request
    #[error("Rate limit exceeded for key: {key}")]
    RateLimited { key: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error is a rate-limit rejection rather than a fault.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LimiterError::RateLimited { .. })
    }
}

/// Result type alias for Quorate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
