//! Error types for lopan-cache
//!
//! Only construction, configuration and caller-side serialization surface as
//! errors. Tier-internal failures are absorbed and degrade to cache misses.

use thiserror::Error;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Platform cache directory could not be determined
    #[error("Could not determine cache directory for the current platform")]
    CacheDirectoryNotFound,

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration rejected by validation
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}
