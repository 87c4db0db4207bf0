#![allow(clippy::doc_markdown)] // Allow technical terms like ODBC, TDS in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # ERP Gateway Core
//!
//! Resilient database access for the legacy ERP's two SQL Server databases,
//! `EMP` (item master) and `MULT` (multi-company ledger).
//!
//! ## Overview
//!
//! Every ERP query flows through one [`ConnectionManager`], which owns a
//! bounded pool per logical database, retries transient failures with
//! jittered exponential backoff, and sheds load through a per-connection
//! circuit breaker. When the databases are unreachable at startup the
//! manager falls back to degraded mode and answers with mock rows so the
//! application stays up.
//!
//! Reads can be fronted by the two-tier [`QueryCache`]: a process-local L1
//! map in front of an optional shared L2 store (Redis or in-memory), with
//! single-flight origin fetches and glob-pattern invalidation.
//!
//! ## Module Organization
//!
//! - [`config`] - Layered TOML/env configuration and validation
//! - [`database`] - Drivers, pools and the connection manager
//! - [`resilience`] - Circuit breakers and the retry policy
//! - [`cache`] - Two-tier query cache
//! - [`chaos`] - Fault injection for resilience drills
//! - [`telemetry`] - Query, breaker, retry and cache events
//! - [`error`] - Structured error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use erp_gateway::config::ConfigManager;
//! use erp_gateway::database::{ConnectionManager, LogicalDb};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! erp_gateway::logging::init_structured_logging();
//! let config = ConfigManager::load()?.config().clone();
//! let manager = ConnectionManager::new(config)?;
//!
//! let items = manager
//!     .execute(LogicalDb::Emp, "SELECT ItemID, Descr FROM Items WHERE ItemID = ?", &["7530110".into()])
//!     .await?;
//! println!("{} rows", items.len());
//!
//! manager.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit tests live beside each module; integration tests under `tests/`
//! drive the manager through [`test_utils::ScriptedDriver`]:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod cache;
pub mod chaos;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod resilience;
pub mod telemetry;
pub mod test_utils;

pub use cache::{CacheError, CacheStats, InvalidationReport, QueryCache};
pub use chaos::{ChaosExperiment, FaultInjector, FaultType};
pub use config::{ConfigManager, GatewayConfig, QueryCacheConfig};
pub use database::{
    ConnectionManager, ConnectionStatus, DriverKind, LogicalDb, ManagerMode, QueryResult, Row,
    SqlParam,
};
pub use error::{GatewayError, Result};
pub use resilience::{CircuitBreaker, CircuitBreakerManager, CircuitState, RetryPolicy};
pub use telemetry::TelemetrySink;
