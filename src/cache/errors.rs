//! Cache tier error types.
//!
//! These never reach a `QueryCache` caller: every tier failure is logged,
//! counted and treated as a miss.

use thiserror::Error;

/// Errors raised by a single cache tier operation
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Failed to reach the shared store
    #[error("Cache connection error: {0}")]
    ConnectionError(String),

    /// Stored payload could not be encoded or decoded
    #[error("Cache serialization error: {0}")]
    SerializationError(String),

    /// Shared-store round trip exceeded the configured bound
    #[error("Cache operation timed out: {0}")]
    Timeout(String),

    /// Shared-store breaker is open; the tier is being skipped
    #[error("Cache tier unavailable: circuit open")]
    CircuitOpen,

    /// Generic backend error
    #[error("Cache backend error: {0}")]
    BackendError(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        CacheError::SerializationError(error.to_string())
    }
}

impl From<CacheError> for crate::error::GatewayError {
    fn from(error: CacheError) -> Self {
        crate::error::GatewayError::Cache(error.to_string())
    }
}

/// Result type for cache tier operations
pub type CacheResult<T> = Result<T, CacheError>;
