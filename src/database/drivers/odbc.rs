//! ODBC DSN driver built on `odbc-api`.
//!
//! ODBC calls block, so every connect, statement and liveness check runs on
//! the blocking thread pool. Values are fetched as text; the ERP's ODBC
//! catalogue exposes most columns as character data anyway.

use crate::config::DatabaseConfig;
use crate::database::driver::{ConnectionDriver, DriverConnection};
use crate::database::types::{DriverKind, LogicalDb, QueryResult, Row, SqlParam};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use odbc_api::buffers::TextRowSet;
use odbc_api::parameter::InputParameter;
use odbc_api::{Bit, Connection, ConnectionOptions, Cursor, Environment, IntoParameter, Nullable};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};

const FETCH_BATCH_SIZE: usize = 256;
const MAX_TEXT_BYTES: usize = 8_192;

static ODBC_ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

fn environment() -> Result<&'static Environment> {
    if let Some(env) = ODBC_ENVIRONMENT.get() {
        return Ok(env);
    }
    let env = Environment::new()
        .map_err(|e| GatewayError::Driver(format!("failed to allocate ODBC environment: {e}")))?;
    Ok(ODBC_ENVIRONMENT.get_or_init(|| env))
}

/// Build the ODBC connection string for a database entry.
///
/// A `dsn` containing `=` is taken as a complete connection string;
/// otherwise it names a DSN and credentials are appended.
pub fn connection_string(config: &DatabaseConfig) -> Result<String> {
    let dsn = config
        .dsn
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| GatewayError::Configuration("ODBC driver requires a dsn".to_string()))?;

    if dsn.contains('=') {
        return Ok(dsn.to_string());
    }

    let mut out = format!("DSN={dsn};");
    if !config.username.is_empty() {
        out.push_str(&format!("UID={};PWD={};", config.username, config.password));
    }
    if !config.database.is_empty() {
        out.push_str(&format!("DATABASE={};", config.database));
    }
    Ok(out)
}

/// Opens ODBC connections through a configured DSN
#[derive(Debug, Default)]
pub struct OdbcDriver;

impl OdbcDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionDriver for OdbcDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Odbc
    }

    async fn connect(
        &self,
        db: LogicalDb,
        config: &DatabaseConfig,
    ) -> Result<Box<dyn DriverConnection>> {
        let conn_str = connection_string(config)?;
        let env = environment()?;

        let conn = tokio::task::spawn_blocking(move || {
            env.connect_with_connection_string(&conn_str, ConnectionOptions::default())
                .map_err(|e| map_odbc_error(e, &format!("{db} connect")))
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("ODBC connect task failed: {e}")))??;

        debug!(db = %db, endpoint = %config.endpoint_label(DriverKind::Odbc), "ODBC connection established");
        Ok(Box::new(OdbcConnection {
            db,
            conn: Some(conn),
        }))
    }
}

struct OdbcConnection {
    db: LogicalDb,
    /// `None` once a blocking task failed while holding the connection
    conn: Option<Connection<'static>>,
}

impl OdbcConnection {
    /// Run `work` on the blocking pool with exclusive use of the connection
    async fn with_connection<T, F>(&mut self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection<'static>) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.take().ok_or_else(|| {
            GatewayError::ConnectionReset(format!("{}: ODBC connection lost", self.db))
        })?;

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = work(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| GatewayError::ConnectionReset(format!("{}: ODBC task failed: {e}", self.db)))?;

        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl DriverConnection for OdbcConnection {
    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let sql = sql.to_string();
        let params = params.to_vec();
        let context = format!("{} query", self.db);
        self.with_connection(move |conn| run_statement(conn, &sql, &params, &context))
            .await
    }

    async fn is_valid(&mut self) -> bool {
        self.with_connection(|conn| Ok(!conn.is_dead().unwrap_or(true)))
            .await
            .unwrap_or(false)
    }

    async fn close(mut self: Box<Self>) {
        let db = self.db;
        if let Some(conn) = self.conn.take() {
            let closed = tokio::task::spawn_blocking(move || drop(conn)).await;
            if let Err(e) = closed {
                warn!(db = %db, error = %e, "Error closing ODBC connection");
            }
        }
    }
}

fn bind_param(param: &SqlParam) -> Box<dyn InputParameter> {
    match param {
        SqlParam::Null => Box::new(Nullable::<i64>::null()),
        SqlParam::Bool(value) => Box::new(Bit::from_bool(*value)),
        SqlParam::Int(value) => Box::new(*value),
        SqlParam::Float(value) => Box::new(*value),
        SqlParam::Text(value) => Box::new(value.clone().into_parameter()),
    }
}

fn run_statement(
    conn: &Connection<'static>,
    sql: &str,
    params: &[SqlParam],
    context: &str,
) -> Result<QueryResult> {
    let bound: Vec<Box<dyn InputParameter>> = params.iter().map(bind_param).collect();
    let mut statement = conn
        .preallocate()
        .map_err(|e| map_odbc_error(e, context))?;

    let cursor = statement
        .execute(sql, bound.as_slice())
        .map_err(|e| map_odbc_error(e, context))?;

    let Some(mut cursor) = cursor else {
        let affected = statement
            .row_count()
            .map_err(|e| map_odbc_error(e, context))?
            .unwrap_or(0);
        return Ok(QueryResult {
            rows_affected: affected as u64,
            ..QueryResult::default()
        });
    };

    let columns: Vec<String> = cursor
        .column_names()
        .map_err(|e| map_odbc_error(e, context))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| map_odbc_error(e, context))?;

    let buffer = TextRowSet::for_cursor(FETCH_BATCH_SIZE, &mut cursor, Some(MAX_TEXT_BYTES))
        .map_err(|e| map_odbc_error(e, context))?;
    let mut row_cursor = cursor
        .bind_buffer(buffer)
        .map_err(|e| map_odbc_error(e, context))?;

    let mut rows = Vec::new();
    while let Some(batch) = row_cursor.fetch().map_err(|e| map_odbc_error(e, context))? {
        for row_index in 0..batch.num_rows() {
            let row: Row = columns
                .iter()
                .enumerate()
                .map(|(col_index, name)| {
                    let value = batch
                        .at(col_index, row_index)
                        .map_or(Value::Null, |bytes| {
                            Value::String(String::from_utf8_lossy(bytes).into_owned())
                        });
                    (name.clone(), value)
                })
                .collect();
            rows.push(row);
        }
    }

    Ok(QueryResult::from_rows(columns, rows))
}

/// Classify by SQLSTATE class where a diagnostic record is available
fn map_odbc_error(err: odbc_api::Error, context: &str) -> GatewayError {
    let message = format!("{context}: {err}");
    let odbc_api::Error::Diagnostics { record, .. } = &err else {
        return GatewayError::Driver(message);
    };
    classify_sqlstate(record.state.as_str(), message)
}

fn classify_sqlstate(state: &str, message: String) -> GatewayError {
    match state {
        "08S01" => GatewayError::ConnectionReset(message),
        "HYT00" | "HYT01" | "40001" => GatewayError::Timeout(message),
        "28000" => GatewayError::Authentication(message),
        s if s.starts_with("08") => GatewayError::Connection(message),
        s if s.starts_with("42") => GatewayError::MalformedQuery(message),
        s if s.starts_with("23") || s.starts_with("22") => GatewayError::Validation(message),
        _ => GatewayError::Driver(message),
    }
}
