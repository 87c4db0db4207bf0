//! Native TDS driver built on `tiberius`.

use crate::config::DatabaseConfig;
use crate::database::driver::{classify_io_error, ConnectionDriver, DriverConnection};
use crate::database::drivers::rewrite_positional_placeholders;
use crate::database::types::{operation_kind, DriverKind, LogicalDb, QueryResult, Row, SqlParam};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::borrow::Cow;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

const APPLICATION_NAME: &str = "erp-gateway";

impl ToSql for SqlParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlParam::Null => ColumnData::String(None),
            SqlParam::Bool(value) => ColumnData::Bit(Some(*value)),
            SqlParam::Int(value) => ColumnData::I64(Some(*value)),
            SqlParam::Float(value) => ColumnData::F64(Some(*value)),
            SqlParam::Text(value) => ColumnData::String(Some(Cow::Borrowed(value.as_str()))),
        }
    }
}

/// Opens TDS connections from host/port/database settings
#[derive(Debug, Default)]
pub struct TdsDriver;

impl TdsDriver {
    pub fn new() -> Self {
        Self
    }

    fn client_config(config: &DatabaseConfig) -> Config {
        let mut tds = Config::new();
        tds.host(&config.host);
        tds.port(config.port);
        if !config.database.is_empty() {
            tds.database(&config.database);
        }
        tds.application_name(APPLICATION_NAME);
        tds.authentication(AuthMethod::sql_server(&config.username, &config.password));
        if config.trust_cert {
            tds.trust_cert();
        }
        tds
    }
}

#[async_trait]
impl ConnectionDriver for TdsDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Tds
    }

    async fn connect(
        &self,
        db: LogicalDb,
        config: &DatabaseConfig,
    ) -> Result<Box<dyn DriverConnection>> {
        let tds = Self::client_config(config);
        let context = format!("{db} connect to {}", config.endpoint_label(DriverKind::Tds));

        let tcp = TcpStream::connect(tds.get_addr())
            .await
            .map_err(|e| classify_io_error(&e, &context))?;
        tcp.set_nodelay(true)
            .map_err(|e| classify_io_error(&e, &context))?;

        let client = Client::connect(tds, tcp.compat_write())
            .await
            .map_err(|e| map_tds_error(e, &context))?;

        debug!(db = %db, endpoint = %config.endpoint_label(DriverKind::Tds), "TDS connection established");
        Ok(Box::new(TdsConnection { db, client }))
    }
}

struct TdsConnection {
    db: LogicalDb,
    client: Client<Compat<TcpStream>>,
}

impl TdsConnection {
    async fn fetch(&mut self, sql: &str, params: &[&dyn ToSql]) -> tiberius::Result<QueryResult> {
        let mut stream = self.client.query(sql, params).await?;
        let columns: Vec<String> = stream
            .columns()
            .await?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = stream
            .into_first_result()
            .await?
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.into_iter().map(column_to_json))
                    .collect::<Row>()
            })
            .collect();

        Ok(QueryResult::from_rows(columns, rows))
    }
}

#[async_trait]
impl DriverConnection for TdsConnection {
    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let statement = rewrite_positional_placeholders(sql);
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let context = format!("{} query", self.db);

        match operation_kind(sql) {
            "insert" | "update" | "delete" | "merge" => {
                let outcome = self
                    .client
                    .execute(statement.as_str(), &refs)
                    .await
                    .map_err(|e| map_tds_error(e, &context))?;
                Ok(QueryResult {
                    rows_affected: outcome.total(),
                    ..QueryResult::default()
                })
            }
            _ => self
                .fetch(&statement, &refs)
                .await
                .map_err(|e| map_tds_error(e, &context)),
        }
    }

    async fn is_valid(&mut self) -> bool {
        match self.client.simple_query("SELECT 1").await {
            Ok(stream) => stream.into_results().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn close(self: Box<Self>) {
        let db = self.db;
        if let Err(e) = self.client.close().await {
            warn!(db = %db, error = %e, "Error closing TDS connection");
        }
    }
}

fn column_to_json(data: ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I16(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I32(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I64(v) => v.map_or(Value::Null, Value::from),
        ColumnData::F32(v) => v.map_or(Value::Null, Value::from),
        ColumnData::F64(v) => v.map_or(Value::Null, Value::from),
        ColumnData::Bit(v) => v.map_or(Value::Null, Value::from),
        ColumnData::String(v) => v.map_or(Value::Null, |s| Value::String(s.into_owned())),
        ColumnData::Guid(v) => v.map_or(Value::Null, |g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v.map_or(Value::Null, |b| Value::String(hex::encode(b))),
        ColumnData::Numeric(v) => v.map_or(Value::Null, |n| {
            let text = n.to_string();
            text.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::String(text), Value::Number)
        }),
        ColumnData::Xml(v) => v.map_or(Value::Null, |x| Value::String(x.into_owned().into_string())),
        ref temporal @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => chrono::NaiveDateTime::from_sql(temporal)
            .ok()
            .flatten()
            .map_or(Value::Null, |t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        ref date @ ColumnData::Date(_) => chrono::NaiveDate::from_sql(date)
            .ok()
            .flatten()
            .map_or(Value::Null, |d| Value::String(d.to_string())),
        ref time @ ColumnData::Time(_) => chrono::NaiveTime::from_sql(time)
            .ok()
            .flatten()
            .map_or(Value::Null, |t| Value::String(t.to_string())),
        ref offset @ ColumnData::DateTimeOffset(_) => {
            chrono::DateTime::<chrono::Utc>::from_sql(offset)
                .ok()
                .flatten()
                .map_or(Value::Null, |t| Value::String(t.to_rfc3339()))
        }
        #[allow(unreachable_patterns)]
        other => Value::String(format!("{other:?}")),
    }
}

/// Map `tiberius` failures onto the gateway taxonomy using SQL Server error
/// numbers where the server supplied one
fn map_tds_error(err: tiberius::error::Error, context: &str) -> GatewayError {
    use tiberius::error::Error as TdsError;

    match err {
        TdsError::Io { kind, message } => {
            classify_io_error(&std::io::Error::new(kind, message), context)
        }
        TdsError::Server(token) => {
            let message = format!("{context}: [{}] {}", token.code(), token.message());
            match token.code() {
                18452 | 18456 | 18486 | 18487 | 18488 => GatewayError::Authentication(message),
                102 | 156 | 207 | 208 | 2812 | 8144 => GatewayError::MalformedQuery(message),
                515 | 547 | 2601 | 2627 | 8152 => GatewayError::Validation(message),
                1205 | 1222 => GatewayError::Timeout(message),
                4060 | 233 | 10054 => GatewayError::Connection(message),
                _ => GatewayError::Driver(message),
            }
        }
        TdsError::Tls(message) => GatewayError::Connection(format!("{context}: TLS {message}")),
        TdsError::Routing { host, port } => {
            GatewayError::Connection(format!("{context}: server redirected to {host}:{port}"))
        }
        TdsError::Protocol(message) => {
            GatewayError::ConnectionReset(format!("{context}: protocol error {message}"))
        }
        other => GatewayError::Driver(format!("{context}: {other}")),
    }
}
