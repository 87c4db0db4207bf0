//! # Gateway Configuration System
//!
//! Layered, validated configuration for the resilient database-access core.
//!
//! ## Architecture
//!
//! - **Base file**: `config/erp-gateway.toml`
//! - **Environment overlay**: `config/erp-gateway-{environment}.toml`
//! - **Environment variables**: `ERP_GATEWAY__SECTION__FIELD` overrides
//! - **Explicit Validation**: every section validates itself before use
//!
//! ## Usage
//!
//! ```rust,no_run
//! use erp_gateway::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let emp = &manager.config().databases.emp;
//! println!("EMP pool max: {}", emp.pool.max_connections);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;
pub mod query_cache_config;

use crate::database::{DriverKind, LogicalDb};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;
pub use query_cache_config::{L1Config, L2Backend, L2Config, QueryCacheConfig};

/// Root configuration structure mirroring erp-gateway.toml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Wire protocol used for every logical database
    pub driver: DriverKind,

    /// Connection settings per logical database
    pub databases: DatabasesConfig,

    /// Retry and backoff behavior
    pub retry: RetryConfig,

    /// Circuit breaker configuration for resilience patterns
    pub circuit_breakers: CircuitBreakerConfig,

    /// Two-tier query cache configuration
    pub query_cache: QueryCacheConfig,

    /// Fault injection harness
    pub chaos: ChaosConfig,

    /// Startup probing and degraded-mode fallback
    pub startup: StartupConfig,

    /// Telemetry sink selection
    pub telemetry: TelemetryConfig,
}

impl GatewayConfig {
    /// Configuration tuned for fast-failing tests
    pub fn for_test() -> Self {
        Self {
            driver: DriverKind::Tds,
            databases: DatabasesConfig::default(),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 5,
                max_delay_ms: 50,
                backoff_factor: 2.0,
                jitter_enabled: false,
                jitter_factor: 0.0,
            },
            circuit_breakers: CircuitBreakerConfig {
                enabled: true,
                default_config: CircuitBreakerComponentConfig {
                    failure_threshold: 5,
                    window_ms: 10_000,
                    cool_down_ms: 100,
                },
                component_configs: HashMap::new(),
            },
            query_cache: QueryCacheConfig::for_test(),
            chaos: ChaosConfig::default(),
            startup: StartupConfig {
                max_attempts: 3,
                probe_query: "SELECT 1".to_string(),
            },
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.databases.emp.validate(LogicalDb::Emp, self.driver)?;
        self.databases.mult.validate(LogicalDb::Mult, self.driver)?;
        self.retry.validate()?;
        self.circuit_breakers.validate()?;
        self.query_cache
            .validate()
            .map_err(ConfigurationError::validation_error)?;
        self.startup.validate()?;
        Ok(())
    }

    /// Database settings for a logical database
    pub fn database(&self, db: LogicalDb) -> &DatabaseConfig {
        match db {
            LogicalDb::Emp => &self.databases.emp,
            LogicalDb::Mult => &self.databases.mult,
        }
    }
}

/// Connection settings for both logical databases
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabasesConfig {
    pub emp: DatabaseConfig,
    pub mult: DatabaseConfig,
}

/// Connection configuration for one logical database.
///
/// ODBC connections use `dsn`; TDS connections use `host`, `port` and
/// `database`. Both share credentials, pool bounds and timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// ODBC data-source name or full connection string
    pub dsn: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed server certificates (legacy ERP hosts)
    pub trust_cert: bool,
    pub pool: PoolConfig,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            host: "localhost".to_string(),
            port: 1433,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            trust_cert: true,
            pool: PoolConfig::default(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Endpoint description safe for logs
    pub fn endpoint_label(&self, driver: DriverKind) -> String {
        match driver {
            DriverKind::Odbc => match &self.dsn {
                Some(dsn) => redact_connection_string(dsn),
                None => "<missing dsn>".to_string(),
            },
            DriverKind::Tds => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }

    pub fn validate(&self, db: LogicalDb, driver: DriverKind) -> ConfigResult<()> {
        let context = format!("databases.{}", db.config_key());
        match driver {
            DriverKind::Odbc => {
                if self.dsn.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigurationError::missing_required_field("dsn", context));
                }
            }
            DriverKind::Tds => {
                if self.host.is_empty() {
                    return Err(ConfigurationError::missing_required_field("host", context));
                }
                if self.port == 0 {
                    return Err(ConfigurationError::invalid_value(
                        "port",
                        "0",
                        format!("{context}: port must be greater than 0"),
                    ));
                }
            }
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "connect_timeout_ms",
                "0",
                format!("{context}: timeout must be greater than 0"),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "request_timeout_ms",
                "0",
                format!("{context}: timeout must be greater than 0"),
            ));
        }
        self.pool.validate(&context)
    }
}

/// Pool bounds and acquisition limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are discarded on checkout
    pub idle_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            idle_timeout_seconds: 300,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn validate(&self, context: &str) -> ConfigResult<()> {
        if self.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "pool.max_connections",
                "0",
                format!("{context}: pool must allow at least one connection"),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigurationError::invalid_value(
                "pool.min_connections",
                self.min_connections.to_string(),
                format!(
                    "{context}: min_connections exceeds max_connections ({})",
                    self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_enabled: bool,
    /// Fraction of the computed delay used as the jitter band (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                "0",
                "at least one attempt is required",
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_factor",
                self.backoff_factor.to_string(),
                "backoff factor must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigurationError::invalid_value(
                "retry.jitter_factor",
                self.jitter_factor.to_string(),
                "jitter factor must be between 0.0 and 1.0",
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "retry.initial_delay_ms",
                self.initial_delay_ms.to_string(),
                format!("initial delay exceeds max delay ({}ms)", self.max_delay_ms),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration with per-component overrides.
///
/// Components are connection ids (`EMP`, `MULT`) plus the shared cache tier
/// (`cache`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether circuit breakers gate calls at all
    pub enabled: bool,

    /// Default configuration for new circuit breakers
    pub default_config: CircuitBreakerComponentConfig,

    /// Specific configurations for named components
    pub component_configs: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_config: CircuitBreakerComponentConfig::default(),
            component_configs: HashMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Get configuration for a specific component
    pub fn config_for_component(&self, component_name: &str) -> CircuitBreakerComponentConfig {
        self.component_configs
            .get(component_name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.default_config
            .to_resilience_config()
            .validate()
            .map_err(|e| ConfigurationError::validation_error(format!("circuit_breakers: {e}")))?;
        for (name, component) in &self.component_configs {
            component.to_resilience_config().validate().map_err(|e| {
                ConfigurationError::validation_error(format!("circuit_breakers.{name}: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Serialized form of a single breaker's thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub cool_down_ms: u64,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cool_down_ms: 30_000,
        }
    }
}

impl CircuitBreakerComponentConfig {
    /// Convert to resilience module's format
    pub fn to_resilience_config(&self) -> crate::resilience::config::CircuitBreakerConfig {
        crate::resilience::config::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            window: Duration::from_millis(self.window_ms),
            cool_down: Duration::from_millis(self.cool_down_ms),
        }
    }
}

/// Fault injection harness configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Install the fault-injecting driver decorator at startup
    pub enabled: bool,
    /// Fixed RNG seed for reproducible experiment runs
    pub seed: Option<u64>,
}

/// Startup probing before declaring the manager ready
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Probe attempts per logical database before degrading
    pub max_attempts: u32,
    pub probe_query: String,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            probe_query: "SELECT 1".to_string(),
        }
    }
}

impl StartupConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "startup.max_attempts",
                "0",
                "at least one startup probe is required",
            ));
        }
        if self.probe_query.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "probe_query",
                "startup",
            ));
        }
        Ok(())
    }
}

/// Telemetry sink selection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit structured tracing events for every telemetry record
    pub tracing_events: bool,
    /// Record OpenTelemetry counters/histograms through the global meter
    pub otel_metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            tracing_events: true,
            otel_metrics: false,
        }
    }
}

/// Mask the password component of an ODBC connection string
pub fn redact_connection_string(conn: &str) -> String {
    conn.split(';')
        .map(|part| {
            let lower = part.trim().to_ascii_lowercase();
            if lower.starts_with("pwd=") || lower.starts_with("password=") {
                match part.split_once('=') {
                    Some((key, _)) => format!("{key}=***"),
                    None => part.to_string(),
                }
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}
