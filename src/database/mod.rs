//! # Database Access
//!
//! Pooled, resilient access to the two logical ERP databases (EMP and MULT)
//! through either an ODBC DSN or a native TDS connection.
//!
//! ## Key Components
//!
//! - [`manager`] - `ConnectionManager`, the single entry point for queries
//! - [`pool`] - bounded per-database connection pools
//! - [`driver`] - the driver seam plus the `drivers` implementations
//! - [`degraded`] - the fixed record served while the databases are unreachable
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use erp_gateway::config::ConfigManager;
//! use erp_gateway::database::{ConnectionManager, LogicalDb};
//!
//! # async fn example() -> erp_gateway::error::Result<()> {
//! let config = ConfigManager::load()?.config().clone();
//! let manager = ConnectionManager::new(config)?;
//! manager.initialize().await?;
//!
//! let items = manager
//!     .execute(LogicalDb::Mult, "SELECT * FROM item WHERE sku = ?", &["7530110".into()])
//!     .await?;
//! println!("{} rows", items.len());
//!
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod degraded;
pub mod driver;
pub mod drivers;
pub mod manager;
pub mod pool;
pub mod pool_stats;
pub mod types;

pub use driver::{create_driver, ConnectionDriver, DriverConnection};
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ConnectionStatus, ManagerMode};
pub use pool::{ConnectionPool, PooledConnection};
pub use pool_stats::{AtomicPoolStats, PoolStatsSnapshot};
pub use types::{DriverKind, LogicalDb, QueryResult, Row, SqlParam};
