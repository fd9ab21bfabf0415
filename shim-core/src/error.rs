//! Error types for the interception layer and its hosts

use thiserror::Error;

/// Main error type for shim operations
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport failures from the underlying fetch primitive.
///
/// The tile cache hands these back to callers unchanged once no stale entry
/// can stand in for the response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Cache storage backend failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Failures raised by host seams (mapping library objects, global scope).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("{0} is not available")]
    Missing(String),

    #[error("call to {target} failed: {reason}")]
    CallFailed { target: String, reason: String },
}

impl HostError {
    pub fn call_failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        HostError::CallFailed {
            target: target.into(),
            reason: reason.into(),
        }
    }
}
