//! # Test Utilities
//!
//! In-memory stand-ins used by unit and integration tests:
//!
//! - [`ScriptedDriver`]: a [`ConnectionDriver`] whose connect and query
//!   outcomes can be scripted, with call counters
//! - [`RecordingSink`]: a [`TelemetrySink`] that keeps every event
//! - [`test_config`]: fast-failing gateway configuration

use crate::config::{DatabaseConfig, GatewayConfig};
use crate::database::driver::{ConnectionDriver, DriverConnection};
use crate::database::{DriverKind, LogicalDb, QueryResult, Row, SqlParam};
use crate::error::{GatewayError, Result};
use crate::telemetry::{BreakerTransition, CacheEvent, QueryEvent, RetryEvent, TelemetrySink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Gateway configuration with short timeouts and no jitter
pub fn test_config() -> GatewayConfig {
    GatewayConfig::for_test()
}

/// Result returned by [`ScriptedDriver`] unless overridden
pub fn default_result() -> QueryResult {
    let mut row = Row::new();
    row.insert("value".to_string(), serde_json::json!(1));
    QueryResult::from_rows(vec!["value".to_string()], vec![row])
}

#[derive(Debug, Default)]
struct Script {
    connect_failures: VecDeque<GatewayError>,
    connect_always: Option<GatewayError>,
    query_failures: VecDeque<GatewayError>,
    query_always: Option<GatewayError>,
    query_delay: Duration,
    executed: Vec<(LogicalDb, String)>,
    connect_attempts: Vec<LogicalDb>,
}

#[derive(Debug, Default)]
struct ScriptState {
    connects: AtomicU32,
    queries: AtomicU32,
    closes: AtomicU32,
    script: Mutex<Script>,
}

/// Driver whose behavior is scripted per test
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    kind: DriverKind,
    state: Arc<ScriptState>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical connections opened
    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connect calls made for `db`, failed ones included
    pub fn connect_attempts(&self, db: LogicalDb) -> usize {
        self.state
            .script
            .lock()
            .connect_attempts
            .iter()
            .filter(|attempted| **attempted == db)
            .count()
    }

    /// Queries that reached the driver
    pub fn queries(&self) -> u32 {
        self.state.queries.load(Ordering::SeqCst)
    }

    /// Connections closed through `DriverConnection::close`
    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Statements executed, in order
    pub fn executed(&self) -> Vec<(LogicalDb, String)> {
        self.state.script.lock().executed.clone()
    }

    pub fn fail_next_connects(&self, count: usize, error: GatewayError) {
        let mut script = self.state.script.lock();
        script
            .connect_failures
            .extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_connects_always(&self, error: GatewayError) {
        self.state.script.lock().connect_always = Some(error);
    }

    pub fn fail_next_queries(&self, count: usize, error: GatewayError) {
        let mut script = self.state.script.lock();
        script
            .query_failures
            .extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_queries_always(&self, error: GatewayError) {
        self.state.script.lock().query_always = Some(error);
    }

    /// Remove every scripted failure
    pub fn heal(&self) {
        let mut script = self.state.script.lock();
        script.connect_failures.clear();
        script.connect_always = None;
        script.query_failures.clear();
        script.query_always = None;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.state.script.lock().query_delay = delay;
    }
}

#[async_trait]
impl ConnectionDriver for ScriptedDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    async fn connect(
        &self,
        db: LogicalDb,
        _config: &DatabaseConfig,
    ) -> Result<Box<dyn DriverConnection>> {
        let failure = {
            let mut script = self.state.script.lock();
            script.connect_attempts.push(db);
            script
                .connect_failures
                .pop_front()
                .or_else(|| script.connect_always.clone())
        };
        if let Some(error) = failure {
            return Err(error);
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            db,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedConnection {
    db: LogicalDb,
    state: Arc<ScriptState>,
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    async fn query(&mut self, sql: &str, _params: &[SqlParam]) -> Result<QueryResult> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        let (delay, outcome) = {
            let mut script = self.state.script.lock();
            script.executed.push((self.db, sql.to_string()));
            let failure = script
                .query_failures
                .pop_front()
                .or_else(|| script.query_always.clone());
            let outcome = match failure {
                Some(error) => Err(error),
                None => Ok(default_result()),
            };
            (script.query_delay, outcome)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn is_valid(&mut self) -> bool {
        true
    }

    async fn close(self: Box<Self>) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Telemetry sink that records every event for assertions
#[derive(Debug, Default)]
pub struct RecordingSink {
    queries: Mutex<Vec<QueryEvent>>,
    transitions: Mutex<Vec<BreakerTransition>>,
    cache: Mutex<Vec<CacheEvent>>,
    retries: Mutex<Vec<RetryEvent>>,
}

impl RecordingSink {
    pub fn queries(&self) -> Vec<QueryEvent> {
        self.queries.lock().clone()
    }

    pub fn transitions(&self) -> Vec<BreakerTransition> {
        self.transitions.lock().clone()
    }

    pub fn cache_events(&self) -> Vec<CacheEvent> {
        self.cache.lock().clone()
    }

    pub fn retries(&self) -> Vec<RetryEvent> {
        self.retries.lock().clone()
    }
}

impl TelemetrySink for RecordingSink {
    fn on_query(&self, event: &QueryEvent) {
        self.queries.lock().push(event.clone());
    }

    fn on_breaker_transition(&self, event: &BreakerTransition) {
        self.transitions.lock().push(event.clone());
    }

    fn on_cache(&self, event: &CacheEvent) {
        self.cache.lock().push(event.clone());
    }

    fn on_retry(&self, event: &RetryEvent) {
        self.retries.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let driver = ScriptedDriver::new();
        driver.fail_next_connects(1, GatewayError::Connection("refused".into()));

        let config = DatabaseConfig::default();
        assert!(driver.connect(LogicalDb::Emp, &config).await.is_err());

        let mut conn = driver.connect(LogicalDb::Emp, &config).await.unwrap();
        driver.fail_next_queries(1, GatewayError::Timeout("slow".into()));
        assert!(conn.query("SELECT 1", &[]).await.is_err());
        assert_eq!(conn.query("SELECT 1", &[]).await.unwrap(), default_result());

        conn.close().await;
        assert_eq!(driver.connects(), 1);
        assert_eq!(driver.queries(), 2);
        assert_eq!(driver.closes(), 1);
    }
}
