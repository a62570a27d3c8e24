// src/errors.rs

// error handling for the governance layer

// dependencies
use thiserror::Error;

use crate::clock::ClockError;

/// Error type for governance configuration and clock issues.
///
/// Rate-limit denials and threshold breaches are normal outcomes and never
/// show up here; handler failures travel through the pipeline in the
/// handler's own error type.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("Bucket capacity must be at least one token")]
    InvalidCapacity,

    #[error("Refill rate must be positive")]
    InvalidRefillRate,

    #[error("Bucket bound must allow at least one client")]
    InvalidBucketBound,

    #[error("Cache must hold at least one entry")]
    InvalidCacheSize,

    #[error("TTL must be greater than zero")]
    InvalidTtl,

    #[error("Sweep interval must be greater than zero")]
    InvalidSweepInterval,

    #[error("Sample retention must be greater than zero")]
    InvalidRetention,

    #[error("Invalid key pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("Clock error occurred: {0}")]
    ClockError(#[from] ClockError),

    #[error("Configuration parse error: {0}")]
    ConfigError(#[from] serde_json::Error),
}

/// Result type alias for governance operations
pub type Result<T> = std::result::Result<T, GovernorError>;
