//! # Resilience Module
//!
//! Fault tolerance for ERP connectivity: per-connection circuit breakers and
//! the retry policy that drives repeated attempts.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: one per connection id, rolling failure window,
//!   single half-open probe
//! - **Manager**: explicit per-id breaker map owned by the connection manager
//! - **Retry Policy**: exponential backoff with jitter, deadline aware
//! - **Metrics**: atomic counters with snapshot DTOs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use erp_gateway::error::GatewayError;
//! use erp_gateway::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     window: Duration::from_secs(60),
//!     cool_down: Duration::from_secs(30),
//! };
//!
//! let circuit_breaker = CircuitBreaker::new("EMP".to_string(), config);
//!
//! let rows = circuit_breaker
//!     .call(|| async { Ok::<_, GatewayError>(42) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod retry;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerError, CircuitState, TripsBreaker};
pub use config::CircuitBreakerConfig;
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use retry::{RetryContext, RetryDecision, RetryOutcome, RetryPolicy};
