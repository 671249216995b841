//! Error types for the media cache

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// File open/read/write/rename/delete failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport, DNS, or TLS failure while talking to the origin
    #[error("Network error: {0}")]
    Network(String),

    /// Origin answered with a non-2xx status
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// On-disk file size disagrees with the expected size at completion
    #[error("Integrity check failed: expected {expected} bytes, found {actual}")]
    Integrity {
        /// Size the caller declared or the range set implies
        expected: i64,
        /// Size actually found on disk
        actual: i64,
    },

    /// Operation was cancelled by the caller or the scheduler
    #[error("Cancelled")]
    Cancelled,

    /// Metadata or file missing where one was expected
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration or request parameter
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted before startup reconciliation completed
    #[error("Cache not initialized")]
    NotInitialized,

    /// Metadata record encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A coordinator channel closed unexpectedly
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Request or task timed out
    #[error("Timed out after {0} seconds")]
    Timeout(u64),
}

impl CacheError {
    /// Whether a failed origin attempt may be retried
    ///
    /// Network-level failures and 408/429/5xx statuses are transient; every
    /// other failure is terminal for the current fetch.
    pub fn is_retriable(&self) -> bool {
        match self {
            CacheError::Network(_) => true,
            CacheError::Timeout(_) => true,
            CacheError::HttpStatus(code) => {
                matches!(code, 408 | 429) || (500..=599).contains(code)
            }
            _ => false,
        }
    }

    /// Whether this error represents a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

impl Clone for CacheError {
    fn clone(&self) -> Self {
        match self {
            CacheError::Io(e) => CacheError::Io(std::io::Error::new(e.kind(), e.to_string())),
            CacheError::Network(s) => CacheError::Network(s.clone()),
            CacheError::HttpStatus(c) => CacheError::HttpStatus(*c),
            CacheError::Integrity { expected, actual } => CacheError::Integrity {
                expected: *expected,
                actual: *actual,
            },
            CacheError::Cancelled => CacheError::Cancelled,
            CacheError::NotFound(s) => CacheError::NotFound(s.clone()),
            CacheError::Config(s) => CacheError::Config(s.clone()),
            CacheError::NotInitialized => CacheError::NotInitialized,
            CacheError::Serialization(s) => CacheError::Serialization(s.clone()),
            CacheError::ChannelClosed(s) => CacheError::ChannelClosed(s.clone()),
            CacheError::Timeout(s) => CacheError::Timeout(*s),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CacheError>;
