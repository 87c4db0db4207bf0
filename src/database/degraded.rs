//! Fixed payload served while the manager runs in degraded mode.
//!
//! Every query returns the same single record regardless of text or
//! parameters, so callers keep working through a total startup outage.

use crate::database::types::{LogicalDb, QueryResult, Row};
use serde_json::json;

pub const MOCK_ITEM_ID: &str = "MOCK-0001";

/// The single mock record returned for any query against `db`
pub fn mock_result(db: LogicalDb) -> QueryResult {
    let mut row = Row::new();
    row.insert("id".to_string(), json!(MOCK_ITEM_ID));
    row.insert("description".to_string(), json!("Degraded mode placeholder record"));
    row.insert("database".to_string(), json!(db.connection_id()));
    row.insert("mock".to_string(), json!(true));

    QueryResult::from_rows(
        vec![
            "id".to_string(),
            "description".to_string(),
            "database".to_string(),
            "mock".to_string(),
        ],
        vec![row],
    )
}
