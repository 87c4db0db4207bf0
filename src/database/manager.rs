//! # Connection Manager
//!
//! Entry point for every ERP query. Owns one bounded pool per logical
//! database, the per-connection circuit breakers and the retry policy.
//!
//! ## Lifecycle
//!
//! 1. `initialize()` runs once, however many callers race it. Each logical
//!    database is probed with the startup query; if any probe still fails
//!    after `startup.max_attempts`, the manager switches to degraded mode and
//!    serves a fixed mock record for every query.
//! 2. `execute()` runs the retry loop. Every attempt passes the breaker
//!    gate, checks out a pooled connection, runs the statement and releases
//!    the handle on every path.
//! 3. `close()` closes both pools. Later calls fail fast with
//!    `GatewayError::ManagerClosed`.

use crate::chaos::{ChaosDriver, FaultInjector};
use crate::config::GatewayConfig;
use crate::database::degraded;
use crate::database::driver::{create_driver, ConnectionDriver};
use crate::database::pool::ConnectionPool;
use crate::database::pool_stats::PoolStatsSnapshot;
use crate::database::types::{operation_kind, DriverKind, LogicalDb, QueryResult, SqlParam};
use crate::error::{GatewayError, Result};
use crate::resilience::{CircuitBreaker, CircuitBreakerManager, CircuitState, RetryPolicy, TripsBreaker};
use crate::telemetry::{sink_from_config, QueryEvent, TelemetrySink};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use crate::logging::log_error;
use tracing::{debug, info, instrument, warn};

/// Operating mode decided at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerMode {
    Normal,
    Degraded,
}

/// Health snapshot consumed by status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub driver_kind: DriverKind,
    pub mode: ManagerMode,
    pub last_error: Option<String>,
    pub initialized: bool,
    pub closed: bool,
    pub chaos_enabled: bool,
    pub pools: Vec<PoolStatsSnapshot>,
    pub breakers: HashMap<String, CircuitState>,
}

#[derive(Debug)]
struct ManagerState {
    mode: ManagerMode,
    emp: ConnectionPool,
    mult: ConnectionPool,
}

impl ManagerState {
    fn pool(&self, db: LogicalDb) -> &ConnectionPool {
        match db {
            LogicalDb::Emp => &self.emp,
            LogicalDb::Mult => &self.mult,
        }
    }

    fn pools(&self) -> [&ConnectionPool; 2] {
        [&self.emp, &self.mult]
    }
}

/// Builder for [`ConnectionManager`]; every component defaults from config
#[derive(Debug)]
pub struct ConnectionManagerBuilder {
    config: GatewayConfig,
    driver: Option<Arc<dyn ConnectionDriver>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    breakers: Option<CircuitBreakerManager>,
    fault_injector: Option<Arc<FaultInjector>>,
}

impl ConnectionManagerBuilder {
    /// Use a specific driver instead of the one named by `config.driver`
    pub fn driver(mut self, driver: Arc<dyn ConnectionDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Share an existing breaker map (for example across tests)
    pub fn circuit_breakers(mut self, breakers: CircuitBreakerManager) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Install a fault injector in front of the driver regardless of
    /// `chaos.enabled`
    pub fn fault_injector(mut self, injector: Arc<FaultInjector>) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    pub fn build(self) -> Result<ConnectionManager> {
        let config = self.config;
        config.validate()?;

        let telemetry = self
            .telemetry
            .unwrap_or_else(|| sink_from_config(&config.telemetry));
        let breakers = self.breakers.unwrap_or_else(|| {
            CircuitBreakerManager::with_telemetry(&config.circuit_breakers, Arc::clone(&telemetry))
        });

        let base_driver = match self.driver {
            Some(driver) => driver,
            None => create_driver(config.driver)?,
        };

        let fault_injector = match self.fault_injector {
            Some(injector) => Some(injector),
            None if config.chaos.enabled => Some(Arc::new(FaultInjector::from_config(&config.chaos))),
            None => None,
        };

        let driver: Arc<dyn ConnectionDriver> = match &fault_injector {
            Some(injector) => {
                warn!("Chaos fault injection installed in front of the ERP driver");
                Arc::new(ChaosDriver::new(base_driver, Arc::clone(injector)))
            }
            None => base_driver,
        };

        let retry = match config.chaos.seed {
            Some(seed) => RetryPolicy::with_seed(config.retry.clone(), seed),
            None => RetryPolicy::new(config.retry.clone()),
        };

        Ok(ConnectionManager {
            driver,
            breakers,
            retry,
            telemetry,
            fault_injector,
            state: OnceCell::new(),
            closed: AtomicBool::new(false),
            last_error: RwLock::new(None),
            config,
        })
    }
}

/// Resilient access to the EMP and MULT databases
#[derive(Debug)]
pub struct ConnectionManager {
    config: GatewayConfig,
    driver: Arc<dyn ConnectionDriver>,
    breakers: CircuitBreakerManager,
    retry: RetryPolicy,
    telemetry: Arc<dyn TelemetrySink>,
    fault_injector: Option<Arc<FaultInjector>>,
    state: OnceCell<ManagerState>,
    closed: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl ConnectionManager {
    pub fn builder(config: GatewayConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            driver: None,
            telemetry: None,
            breakers: None,
            fault_injector: None,
        }
    }

    /// Manager with every component derived from configuration
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Initialize pools and probe both databases. Idempotent; concurrent
    /// callers share one initialization.
    pub async fn initialize(&self) -> Result<ManagerMode> {
        if self.is_closed() {
            return Err(GatewayError::ManagerClosed);
        }
        Ok(self.state().await.mode)
    }

    async fn state(&self) -> &ManagerState {
        self.state.get_or_init(|| self.bootstrap()).await
    }

    async fn bootstrap(&self) -> ManagerState {
        info!(
            driver = %self.driver.kind(),
            probe_query = %self.config.startup.probe_query,
            max_attempts = self.config.startup.max_attempts,
            "Initializing ERP connection manager"
        );

        let state = ManagerState {
            mode: ManagerMode::Normal,
            emp: self.create_pool(LogicalDb::Emp),
            mult: self.create_pool(LogicalDb::Mult),
        };

        let mut mode = ManagerMode::Normal;
        for pool in state.pools() {
            if let Err(err) = self.probe(pool).await {
                log_error(
                    &format!("pool.{}", pool.db()),
                    "startup_probe",
                    &err.to_string(),
                    Some("switching to degraded mode"),
                );
                *self.last_error.write() = Some(err.to_string());
                mode = ManagerMode::Degraded;
            }
        }

        if mode == ManagerMode::Normal {
            for pool in state.pools() {
                let opened = pool.warm_up().await;
                debug!(db = %pool.db(), opened, "Pool warmed up");
            }
        }

        if self.is_closed() {
            for pool in state.pools() {
                pool.close().await;
            }
        }

        info!(mode = ?mode, "ERP connection manager ready");
        ManagerState { mode, ..state }
    }

    fn create_pool(&self, db: LogicalDb) -> ConnectionPool {
        ConnectionPool::new(db, Arc::clone(&self.driver), self.config.database(db).clone())
    }

    async fn probe(&self, pool: &ConnectionPool) -> Result<()> {
        let max_attempts = self.config.startup.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.probe_once(pool).await {
                Ok(()) => {
                    debug!(db = %pool.db(), attempt, "Startup probe succeeded");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        db = %pool.db(),
                        attempt,
                        max_attempts,
                        error = %err,
                        "Startup probe failed"
                    );
                    last_error = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(GatewayError::MaxRetriesExceeded {
            attempts: max_attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| GatewayError::Internal("no probe attempted".into())),
            ),
        })
    }

    async fn probe_once(&self, pool: &ConnectionPool) -> Result<()> {
        let mut conn = pool.acquire(None).await?;
        let request_timeout = self.config.database(pool.db()).request_timeout();
        let result =
            tokio::time::timeout(request_timeout, conn.query(&self.config.startup.probe_query, &[]))
                .await
                .unwrap_or_else(|_| {
                    Err(GatewayError::Timeout(format!(
                        "{}: startup probe timed out",
                        pool.db()
                    )))
                });
        if result.is_err() {
            conn.mark_broken();
        }
        conn.release().await;
        result.map(|_| ())
    }

    /// Run a statement against a logical database
    pub async fn execute(&self, db: LogicalDb, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        self.run(db, sql, params, None).await
    }

    /// Run a statement with a caller deadline bounding the retry loop and
    /// pool acquisition
    pub async fn execute_with_timeout(
        &self,
        db: LogicalDb,
        sql: &str,
        params: &[SqlParam],
        timeout: Duration,
    ) -> Result<QueryResult> {
        self.run(db, sql, params, Some(Instant::now() + timeout)).await
    }

    #[instrument(skip(self, sql, params), fields(db = %db))]
    async fn run(
        &self,
        db: LogicalDb,
        sql: &str,
        params: &[SqlParam],
        deadline: Option<Instant>,
    ) -> Result<QueryResult> {
        if self.is_closed() {
            return Err(GatewayError::ManagerClosed);
        }
        let state = self.state().await;
        if self.is_closed() {
            return Err(GatewayError::ManagerClosed);
        }

        let operation = operation_kind(sql);
        let started = Instant::now();

        if state.mode == ManagerMode::Degraded {
            self.telemetry.on_query(&QueryEvent {
                db,
                operation,
                duration: started.elapsed(),
                success: true,
                retries: 0,
                error: None,
                degraded: true,
            });
            return Ok(degraded::mock_result(db));
        }

        let pool = state.pool(db);
        let breaker = self
            .breakers
            .is_enabled()
            .then(|| self.breakers.get_circuit_breaker(db.connection_id()));

        let outcome = self
            .retry
            .execute(
                db.connection_id(),
                deadline,
                self.telemetry.as_ref(),
                |_attempt| self.attempt(pool, breaker.as_deref(), sql, params, deadline),
            )
            .await;

        if let Err(err) = &outcome.result {
            if !matches!(err, GatewayError::ManagerClosed) {
                *self.last_error.write() = Some(err.to_string());
            }
        }

        self.telemetry.on_query(&QueryEvent {
            db,
            operation,
            duration: started.elapsed(),
            success: outcome.result.is_ok(),
            retries: outcome.retries(),
            error: outcome.result.as_ref().err().map(ToString::to_string),
            degraded: false,
        });

        outcome.result
    }

    /// One attempt: breaker gate, checkout, statement, release
    async fn attempt(
        &self,
        pool: &ConnectionPool,
        breaker: Option<&CircuitBreaker>,
        sql: &str,
        params: &[SqlParam],
        deadline: Option<Instant>,
    ) -> Result<QueryResult> {
        if self.is_closed() {
            return Err(GatewayError::ManagerClosed);
        }

        let permit = match breaker {
            Some(breaker) => Some(breaker.try_acquire()?),
            None => None,
        };

        let result = self.run_on_pool(pool, sql, params, deadline).await;

        if let (Some(breaker), Some(permit)) = (breaker, permit) {
            match &result {
                Err(err) if err.trips_breaker() => breaker.record_failure(permit),
                _ => breaker.record_success(permit),
            }
        }
        result
    }

    async fn run_on_pool(
        &self,
        pool: &ConnectionPool,
        sql: &str,
        params: &[SqlParam],
        deadline: Option<Instant>,
    ) -> Result<QueryResult> {
        let mut conn = pool.acquire(deadline).await?;
        let request_timeout = self.config.database(pool.db()).request_timeout();

        let result = match tokio::time::timeout(request_timeout, conn.query(sql, params)).await {
            Ok(result) => result,
            Err(_) => {
                conn.mark_broken();
                Err(GatewayError::SlowQuery(format!(
                    "{}: query exceeded request timeout of {}ms",
                    pool.db(),
                    request_timeout.as_millis()
                )))
            }
        };

        conn.release().await;
        result
    }

    /// Close every pool. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(state) = self.state.get() {
            for pool in state.pools() {
                pool.close().await;
            }
        }
        info!("ERP connection manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mode once initialized
    pub fn mode(&self) -> Option<ManagerMode> {
        self.state.get().map(|state| state.mode)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let state = self.state.get();
        ConnectionStatus {
            driver_kind: self.driver.kind(),
            mode: state.map_or(ManagerMode::Normal, |s| s.mode),
            last_error: self.last_error.read().clone(),
            initialized: state.is_some(),
            closed: self.is_closed(),
            chaos_enabled: self
                .fault_injector
                .as_ref()
                .is_some_and(|injector| injector.is_enabled()),
            pools: state
                .map(|s| s.pools().iter().map(|pool| pool.stats()).collect())
                .unwrap_or_default(),
            breakers: self.breakers.states(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    /// Admin handle to the installed fault injector, if chaos is wired in
    pub fn fault_injector(&self) -> Option<&Arc<FaultInjector>> {
        self.fault_injector.as_ref()
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }
}
