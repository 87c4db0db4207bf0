//! Shared value types for the database-access layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two logical ERP databases fronted by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalDb {
    #[serde(rename = "EMP", alias = "emp")]
    Emp,
    #[serde(rename = "MULT", alias = "mult")]
    Mult,
}

impl LogicalDb {
    pub const ALL: [LogicalDb; 2] = [LogicalDb::Emp, LogicalDb::Mult];

    /// Connection id used for pools, breakers and chaos targeting
    pub fn connection_id(&self) -> &'static str {
        match self {
            LogicalDb::Emp => "EMP",
            LogicalDb::Mult => "MULT",
        }
    }

    /// Section name inside `[databases]`
    pub fn config_key(&self) -> &'static str {
        match self {
            LogicalDb::Emp => "emp",
            LogicalDb::Mult => "mult",
        }
    }
}

impl fmt::Display for LogicalDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.connection_id())
    }
}

impl FromStr for LogicalDb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EMP" => Ok(LogicalDb::Emp),
            "MULT" => Ok(LogicalDb::Mult),
            other => Err(format!("unknown logical database '{other}'")),
        }
    }
}

/// Wire protocol used to reach the ERP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Protocol A: ODBC-style DSN connections
    Odbc,
    /// Protocol B: native TDS connections
    #[default]
    Tds,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Odbc => f.write_str("odbc"),
            DriverKind::Tds => f.write_str("tds"),
        }
    }
}

/// Positional query parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlParam {
    /// Stable textual form used in query fingerprints
    pub fn fingerprint_repr(&self) -> String {
        match self {
            SqlParam::Null => "null".to_string(),
            SqlParam::Bool(b) => format!("b:{b}"),
            SqlParam::Int(i) => format!("i:{i}"),
            SqlParam::Float(f) => format!("f:{f}"),
            SqlParam::Text(s) => format!("s:{}:{s}", s.len()),
        }
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Int(i64::from(value))
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlParam::Null, Into::into)
    }
}

/// One result row keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows returned by a query, with the driver's column order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows affected for statements that do not return a result set
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Leading keyword of a statement, used as the telemetry operation label
pub fn operation_kind(sql: &str) -> &'static str {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match keyword.as_str() {
        "SELECT" | "WITH" => "select",
        "INSERT" => "insert",
        "UPDATE" => "update",
        "DELETE" => "delete",
        "MERGE" => "merge",
        "EXEC" | "EXECUTE" | "CALL" => "procedure",
        _ => "other",
    }
}
