//! # Driver Capability Interface
//!
//! Both ERP wire protocols sit behind one pair of traits:
//!
//! - [`ConnectionDriver`] opens connections for a logical database
//! - [`DriverConnection`] runs queries on one live connection
//!
//! The concrete driver is chosen once at startup from [`DriverKind`]; callers
//! above the pool never see which protocol is in use.

use crate::config::DatabaseConfig;
use crate::database::types::{DriverKind, LogicalDb, QueryResult, SqlParam};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// A live connection owned by exactly one pool slot
#[async_trait]
pub trait DriverConnection: Send {
    /// Run one statement with positional parameters
    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult>;

    /// Cheap liveness check used when recycling idle connections
    async fn is_valid(&mut self) -> bool;

    /// Close the underlying transport
    async fn close(self: Box<Self>);
}

/// Factory for connections speaking one wire protocol
#[async_trait]
pub trait ConnectionDriver: Send + Sync + Debug {
    fn kind(&self) -> DriverKind;

    async fn connect(
        &self,
        db: LogicalDb,
        config: &DatabaseConfig,
    ) -> Result<Box<dyn DriverConnection>>;
}

/// Build the driver selected by configuration.
///
/// Fails with a configuration error when the requested protocol was not
/// compiled in.
pub fn create_driver(kind: DriverKind) -> Result<Arc<dyn ConnectionDriver>> {
    match kind {
        DriverKind::Tds => create_tds_driver(),
        DriverKind::Odbc => create_odbc_driver(),
    }
}

#[cfg(feature = "tds")]
fn create_tds_driver() -> Result<Arc<dyn ConnectionDriver>> {
    Ok(Arc::new(crate::database::drivers::TdsDriver::new()))
}

#[cfg(not(feature = "tds"))]
fn create_tds_driver() -> Result<Arc<dyn ConnectionDriver>> {
    Err(GatewayError::Configuration(
        "TDS driver requested but the 'tds' feature is not enabled".to_string(),
    ))
}

#[cfg(feature = "odbc")]
fn create_odbc_driver() -> Result<Arc<dyn ConnectionDriver>> {
    Ok(Arc::new(crate::database::drivers::OdbcDriver::new()))
}

#[cfg(not(feature = "odbc"))]
fn create_odbc_driver() -> Result<Arc<dyn ConnectionDriver>> {
    Err(GatewayError::Configuration(
        "ODBC driver requested but the 'odbc' feature is not enabled".to_string(),
    ))
}

/// Map a client-side I/O failure into the transient taxonomy
pub fn classify_io_error(err: &std::io::Error, context: &str) -> GatewayError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            GatewayError::Timeout(format!("{context}: {err}"))
        }
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => GatewayError::ConnectionReset(format!("{context}: {err}")),
        _ => GatewayError::Connection(format!("{context}: {err}")),
    }
}
