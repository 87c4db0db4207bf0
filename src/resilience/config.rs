//! # Circuit Breaker Configuration
//!
//! Runtime configuration for a single circuit breaker. The serialized,
//! per-component form lives in `crate::config::CircuitBreakerConfig` and is
//! converted here through `to_resilience_config()`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures inside `window` that open the circuit
    pub failure_threshold: u32,

    /// Rolling window over which failures are counted
    pub window: Duration,

    /// Time to wait in open state before admitting a probe
    pub cool_down: Duration,
}

impl CircuitBreakerConfig {
    /// Create configuration for ERP database connections
    pub fn for_database() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cool_down: Duration::from_secs(30),
        }
    }

    /// Create configuration for the shared cache tier.
    ///
    /// Trips faster and recovers sooner than the database breakers because
    /// skipping the shared tier is cheap.
    pub fn for_cache() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(30),
            cool_down: Duration::from_secs(10),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.window.is_zero() {
            return Err("window must be greater than 0".to_string());
        }

        if self.cool_down.is_zero() {
            return Err("cool_down must be greater than 0".to_string());
        }

        if self.cool_down > Duration::from_secs(300) {
            return Err("cool_down should not exceed 300 seconds".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_database()
    }
}
