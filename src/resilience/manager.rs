//! # Circuit Breaker Manager
//!
//! Owns one circuit breaker per connection id (`EMP`, `MULT`) plus any
//! auxiliary components such as the shared cache tier. Breakers are created
//! lazily from the per-component configuration.

use crate::config::CircuitBreakerConfig;
use crate::resilience::{
    CircuitBreaker, CircuitState, SystemCircuitBreakerMetrics,
};
use crate::telemetry::{NoopSink, TelemetrySink};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Manager for the circuit breakers of one gateway instance
#[derive(Debug, Clone)]
pub struct CircuitBreakerManager {
    /// Circuit breakers by connection id
    circuit_breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,

    config: CircuitBreakerConfig,

    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreakerManager {
    /// Create a manager from configuration
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::with_telemetry(config, Arc::new(NoopSink))
    }

    /// Create a manager whose breakers report transitions to `telemetry`
    pub fn with_telemetry(config: &CircuitBreakerConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        info!(
            enabled = config.enabled,
            components = config.component_configs.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: Arc::new(DashMap::new()),
            config: config.clone(),
            telemetry,
        }
    }

    /// Whether breakers should gate calls at all
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get or create circuit breaker for a connection id
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.get(component_name) {
            return Arc::clone(breaker.value());
        }

        let entry = self
            .circuit_breakers
            .entry(component_name.to_string())
            .or_insert_with(|| {
                let component_config = self
                    .config
                    .config_for_component(component_name)
                    .to_resilience_config();
                info!(component = component_name, "Created new circuit breaker");
                Arc::new(CircuitBreaker::with_telemetry(
                    component_name.to_string(),
                    component_config,
                    Arc::clone(&self.telemetry),
                ))
            });
        Arc::clone(entry.value())
    }

    /// Get all circuit breaker names
    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Current state of one breaker, if it exists
    pub fn state_of(&self, component_name: &str) -> Option<CircuitState> {
        self.circuit_breakers
            .get(component_name)
            .map(|breaker| breaker.state())
    }

    /// Current state of every breaker
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.circuit_breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    /// Get system-wide circuit breaker metrics
    pub fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();
        for entry in self.circuit_breakers.iter() {
            system_metrics.add_circuit_breaker(entry.key().clone(), entry.value().metrics());
        }
        system_metrics
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("Forcing all circuit breakers open (emergency stop)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("Forcing all circuit breakers closed (emergency recovery)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }

    /// Check overall system health based on circuit breaker states
    pub fn system_health_score(&self) -> f64 {
        self.get_system_metrics().health_score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerComponentConfig;

    fn create_test_config() -> CircuitBreakerConfig {
        let mut config = CircuitBreakerConfig::default();
        config.component_configs.insert(
            "cache".to_string(),
            CircuitBreakerComponentConfig {
                failure_threshold: 2,
                window_ms: 5_000,
                cool_down_ms: 1_000,
            },
        );
        config
    }

    #[test]
    fn test_circuit_breaker_manager_creation() {
        let manager = CircuitBreakerManager::from_config(&create_test_config());
        assert!(manager.list_components().is_empty());
        assert_eq!(manager.system_health_score(), 1.0);
    }

    #[test]
    fn test_get_or_create_circuit_breaker() {
        let manager = CircuitBreakerManager::from_config(&create_test_config());

        let breaker1 = manager.get_circuit_breaker("EMP");
        let breaker2 = manager.get_circuit_breaker("EMP");
        assert!(Arc::ptr_eq(&breaker1, &breaker2));
        assert_eq!(manager.list_components(), vec!["EMP".to_string()]);
    }

    #[test]
    fn test_component_config_applied() {
        let manager = CircuitBreakerManager::from_config(&create_test_config());
        assert_eq!(manager.get_circuit_breaker("cache").config().failure_threshold, 2);
        assert_eq!(manager.get_circuit_breaker("MULT").config().failure_threshold, 5);
    }

    #[test]
    fn test_force_all_and_states() {
        let manager = CircuitBreakerManager::from_config(&create_test_config());
        manager.get_circuit_breaker("EMP");
        manager.get_circuit_breaker("MULT");

        manager.force_open_all();
        assert_eq!(manager.state_of("EMP"), Some(CircuitState::Open));
        assert_eq!(manager.system_health_score(), 0.0);

        manager.force_close_all();
        assert!(manager
            .states()
            .values()
            .all(|state| *state == CircuitState::Closed));
        assert_eq!(manager.state_of("unknown"), None);
    }
}
