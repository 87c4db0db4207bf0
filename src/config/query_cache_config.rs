//! Query Cache Configuration Management
//!
//! Configuration for the two-tier query cache. Environment presets allow
//! different cache behaviors in production, development, and test, and a
//! small set of environment variables can override individual values.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for query cache behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub enabled: bool,
    /// TTL used when a caller does not supply one
    pub default_ttl_seconds: u64,
    pub l1: L1Config,
    pub l2: L2Config,
}

/// Process-local tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    pub max_entries: usize,
    pub sweep_interval_ms: u64,
}

/// Which shared store backs the L2 tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum L2Backend {
    /// Redis (or any protocol-compatible store)
    Redis,
    /// In-process stand-in with shared-store semantics, for tests and single-node runs
    Memory,
    /// Shared tier disabled
    None,
}

/// Shared tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L2Config {
    pub backend: L2Backend,
    pub url: Option<String>,
    /// Namespace prefix applied to every key written to the shared store
    pub key_prefix: String,
    /// Upper bound for a single shared-store round trip
    pub operation_timeout_ms: u64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            backend: L2Backend::None,
            url: None,
            key_prefix: "erpgw:".to_string(),
            operation_timeout_ms: 250,
        }
    }
}

impl L1Config {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl L2Config {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for QueryCacheConfig {
    /// Default configuration suitable for production
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_seconds: 300,
            l1: L1Config::default(),
            l2: L2Config::default(),
        }
    }
}

impl QueryCacheConfig {
    /// Create test-optimized configuration with rapid invalidation
    pub fn for_test() -> Self {
        Self {
            enabled: true,
            default_ttl_seconds: 5,
            l1: L1Config {
                max_entries: 1_000,
                sweep_interval_ms: 50, // Aggressive sweep
            },
            l2: L2Config {
                backend: L2Backend::Memory,
                url: None,
                key_prefix: "test:".to_string(),
                operation_timeout_ms: 100,
            },
        }
    }

    /// Create development-optimized configuration
    pub fn for_development() -> Self {
        Self {
            enabled: true,
            default_ttl_seconds: 60,
            l1: L1Config {
                max_entries: 2_000,
                sweep_interval_ms: 10_000,
            },
            l2: L2Config {
                backend: L2Backend::Redis,
                url: Some("redis://localhost:6379".to_string()),
                key_prefix: "erpgw:dev:".to_string(),
                operation_timeout_ms: 500,
            },
        }
    }

    /// Load configuration preset from environment or use defaults
    pub fn from_environment() -> Self {
        let environment = env::var("ERP_GATEWAY_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "production".to_string());

        let config = match environment.as_str() {
            "test" => {
                info!("Loading test query cache configuration (rapid invalidation)");
                Self::for_test()
            }
            "development" => {
                info!("Loading development query cache configuration");
                Self::for_development()
            }
            _ => {
                info!("Loading production query cache configuration");
                Self::default()
            }
        };

        config.with_env_overrides()
    }

    /// Apply environment variable overrides to configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(enabled) = env::var("ERP_GATEWAY_QUERY_CACHE_ENABLED") {
            self.enabled = enabled.parse().unwrap_or(self.enabled);
            info!("Query cache enabled override: {}", self.enabled);
        }

        if let Ok(ttl) = env::var("ERP_GATEWAY_QUERY_CACHE_DEFAULT_TTL_SECONDS") {
            if let Ok(seconds) = ttl.parse::<u64>() {
                self.default_ttl_seconds = seconds;
                info!("Query cache default TTL override: {}s", seconds);
            }
        }

        if let Ok(url) = env::var("ERP_GATEWAY_REDIS_URL") {
            if !url.is_empty() {
                self.l2.backend = L2Backend::Redis;
                self.l2.url = Some(url);
                info!("Query cache L2 redis URL override applied");
            }
        }

        self
    }

    /// Check if query caching is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Log current configuration for debugging
    pub fn log_configuration(&self) {
        info!("Query Cache Configuration:");
        info!("  Enabled: {}", self.enabled);
        info!("  Default TTL: {}s", self.default_ttl_seconds);
        info!(
            "  L1: {} max entries, sweep every {}ms",
            self.l1.max_entries, self.l1.sweep_interval_ms
        );
        info!(
            "  L2: {:?} backend, prefix '{}', {}ms op timeout",
            self.l2.backend, self.l2.key_prefix, self.l2.operation_timeout_ms
        );
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.l1.sweep_interval_ms == 0 {
            return Err("L1 sweep interval must be greater than 0".to_string());
        }

        if self.l2.backend == L2Backend::Redis && self.l2.url.is_none() {
            return Err("L2 redis backend requires a url".to_string());
        }

        if self.l2.operation_timeout_ms == 0 {
            return Err("L2 operation timeout must be greater than 0".to_string());
        }

        if self.default_ttl_seconds == 0 {
            warn!("Query cache default TTL is 0 - caching effectively disabled");
        }

        if self.l1.max_entries == 0 {
            warn!("Query cache L1 max entries is 0 - L1 effectively disabled");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(QueryCacheConfig::default().validate().is_ok());
        assert!(QueryCacheConfig::for_test().validate().is_ok());
        assert!(QueryCacheConfig::for_development().validate().is_ok());
    }

    #[test]
    fn test_redis_without_url_is_rejected() {
        let mut config = QueryCacheConfig::default();
        config.l2.backend = L2Backend::Redis;
        config.l2.url = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_deserializes_snake_case() {
        let backend: L2Backend = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(backend, L2Backend::Memory);
    }
}
