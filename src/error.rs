//! Error types for the ERP gateway core.
//!
//! Every failure that can reach a caller of [`ConnectionManager`](crate::database::ConnectionManager)
//! is a [`GatewayError`]. Variants fall into four families that drive the
//! resilience layer:
//!
//! - **Transient**: timeouts, connection resets, pool exhaustion, slow queries.
//!   These feed the retry loop and count against the circuit breaker.
//! - **Circuit open**: synthesized when a breaker rejects a call before it is
//!   attempted. Never retried by the same call.
//! - **Exhausted**: [`GatewayError::MaxRetriesExceeded`] wraps the last
//!   underlying error together with the number of attempts made.
//! - **Permanent**: validation, authentication, not-found, malformed query.
//!   Surfaced immediately without entering the backoff loop.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Connection reset: {0}")]
    ConnectionReset(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Slow query degradation: {0}")]
    SlowQuery(String),
    #[error("Circuit breaker open for {component}")]
    CircuitOpen { component: String },
    #[error("Max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        source: Box<GatewayError>,
    },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Malformed query: {0}")]
    MalformedQuery(String),
    #[error("Connection manager closed")]
    ManagerClosed,
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse category used by the retry policy and telemetry labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transient,
    CircuitOpen,
    Exhausted,
    Permanent,
    Lifecycle,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Exhausted => "exhausted",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Lifecycle => "lifecycle",
        }
    }
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Timeout(_)
            | GatewayError::ConnectionReset(_)
            | GatewayError::Connection(_)
            | GatewayError::PoolExhausted(_)
            | GatewayError::SlowQuery(_) => ErrorCategory::Transient,
            GatewayError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            GatewayError::MaxRetriesExceeded { .. } => ErrorCategory::Exhausted,
            GatewayError::ManagerClosed => ErrorCategory::Lifecycle,
            GatewayError::Validation(_)
            | GatewayError::Authentication(_)
            | GatewayError::NotFound(_)
            | GatewayError::MalformedQuery(_)
            | GatewayError::Configuration(_)
            | GatewayError::Driver(_)
            | GatewayError::Cache(_)
            | GatewayError::Internal(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether another attempt of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Conditions the HTTP boundary maps to a 503 with a retry hint
    pub fn is_service_unavailable(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitOpen { .. }
                | GatewayError::MaxRetriesExceeded { .. }
                | GatewayError::Timeout(_)
                | GatewayError::ManagerClosed
        )
    }

    /// Suggested client back-off for service-unavailable conditions
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::CircuitOpen { .. } => Some(Duration::from_secs(30)),
            GatewayError::MaxRetriesExceeded { .. } => Some(Duration::from_secs(10)),
            GatewayError::Timeout(_) => Some(Duration::from_secs(5)),
            GatewayError::ManagerClosed => Some(Duration::from_secs(60)),
            _ => None,
        }
    }

    /// Innermost error, unwrapping any `MaxRetriesExceeded` layers
    pub fn root_cause(&self) -> &GatewayError {
        match self {
            GatewayError::MaxRetriesExceeded { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        GatewayError::Validation(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::config::ConfigurationError> for GatewayError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        GatewayError::Configuration(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
