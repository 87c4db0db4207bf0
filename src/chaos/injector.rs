//! # Fault Injector
//!
//! Holds the registered experiments and applies them to guarded calls.
//! [`ChaosDriver`] is the decorator that puts an injector in front of any
//! [`ConnectionDriver`]; both `connect` and `query` are guarded.
//!
//! When the injector is disabled a guarded call costs one atomic load.

use crate::chaos::experiment::{ChaosExperiment, ExperimentStats, FaultType, RegisteredExperiment};
use crate::config::{ChaosConfig, DatabaseConfig};
use crate::database::driver::{ConnectionDriver, DriverConnection};
use crate::database::{DriverKind, LogicalDb, QueryResult, SqlParam};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry and evaluator for chaos experiments
#[derive(Debug)]
pub struct FaultInjector {
    enabled: AtomicBool,
    /// Registration order decides which experiment wins when several trigger
    experiments: RwLock<Vec<Arc<RegisteredExperiment>>>,
    rng: Mutex<fastrand::Rng>,
}

impl FaultInjector {
    /// Disabled injector with a random seed
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            experiments: RwLock::new(Vec::new()),
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Disabled injector with a fixed seed for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
            ..Self::new()
        }
    }

    pub fn from_config(config: &ChaosConfig) -> Self {
        let injector = match config.seed {
            Some(seed) => Self::with_seed(seed),
            None => Self::new(),
        };
        injector.enabled.store(config.enabled, Ordering::Release);
        injector
    }

    pub fn enable(&self) {
        info!("Chaos fault injection enabled");
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        info!("Chaos fault injection disabled");
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Register a new experiment. Names are unique.
    pub fn register_experiment(&self, experiment: ChaosExperiment) -> Result<()> {
        experiment.validate()?;
        let mut experiments = self.experiments.write();
        if experiments
            .iter()
            .any(|existing| existing.definition.name == experiment.name)
        {
            return Err(GatewayError::Validation(format!(
                "chaos experiment '{}' already registered",
                experiment.name
            )));
        }

        info!(
            experiment = %experiment.name,
            fault = experiment.fault.label(),
            probability = experiment.probability,
            targets = ?experiment.targets,
            "Registered chaos experiment"
        );
        experiments.push(Arc::new(RegisteredExperiment::new(experiment)));
        Ok(())
    }

    pub fn list_experiments(&self) -> Vec<ChaosExperiment> {
        self.experiments
            .read()
            .iter()
            .map(|registered| registered.snapshot())
            .collect()
    }

    /// Pause an experiment without losing its counters
    pub fn stop_experiment(&self, name: &str) -> Result<()> {
        self.find(name)?.enabled.store(false, Ordering::Release);
        info!(experiment = name, "Stopped chaos experiment");
        Ok(())
    }

    /// Resume a stopped experiment
    pub fn start_experiment(&self, name: &str) -> Result<()> {
        self.find(name)?.enabled.store(true, Ordering::Release);
        info!(experiment = name, "Started chaos experiment");
        Ok(())
    }

    pub fn remove_experiment(&self, name: &str) -> Result<ChaosExperiment> {
        let mut experiments = self.experiments.write();
        let index = experiments
            .iter()
            .position(|registered| registered.definition.name == name)
            .ok_or_else(|| GatewayError::NotFound(format!("chaos experiment '{name}'")))?;
        let removed = experiments.remove(index);
        info!(experiment = name, "Removed chaos experiment");
        Ok(removed.snapshot())
    }

    pub fn experiment_stats(&self, name: &str) -> Option<ExperimentStats> {
        self.find(name).ok().map(|registered| registered.stats())
    }

    pub fn all_stats(&self) -> Vec<ExperimentStats> {
        self.experiments
            .read()
            .iter()
            .map(|registered| registered.stats())
            .collect()
    }

    pub fn reset_stats(&self) {
        for registered in self.experiments.read().iter() {
            registered.reset();
        }
    }

    fn find(&self, name: &str) -> Result<Arc<RegisteredExperiment>> {
        self.experiments
            .read()
            .iter()
            .find(|registered| registered.definition.name == name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("chaos experiment '{name}'")))
    }

    /// Pick the first active experiment for `connection_id` that triggers
    fn select(&self, connection_id: &str) -> Option<(String, FaultType)> {
        let experiments = self.experiments.read();
        for registered in experiments.iter() {
            if !registered.is_enabled() || !registered.definition.applies_to(connection_id) {
                continue;
            }
            registered.calls_observed.fetch_add(1, Ordering::Relaxed);
            let draw = self.rng.lock().f64();
            if draw < registered.definition.probability {
                registered.triggered.fetch_add(1, Ordering::Relaxed);
                return Some((
                    registered.definition.name.clone(),
                    registered.definition.fault.clone(),
                ));
            }
        }
        None
    }

    /// Guard one call. `Ok(())` means the call should proceed.
    pub async fn apply(&self, connection_id: &str) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let Some((experiment, fault)) = self.select(connection_id) else {
            return Ok(());
        };

        debug!(
            experiment = %experiment,
            connection_id,
            fault = fault.label(),
            "Injecting fault"
        );

        match fault {
            FaultType::Latency { min_ms, max_ms } => {
                let delay = self.rng.lock().u64(min_ms..=max_ms);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(())
            }
            FaultType::Timeout { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Err(GatewayError::Timeout(format!(
                    "{connection_id}: injected timeout after {delay_ms}ms ({experiment})"
                )))
            }
            FaultType::Error { message } => Err(GatewayError::Connection(format!(
                "{connection_id}: {message} ({experiment})"
            ))),
            FaultType::PoolExhaustion => Err(GatewayError::PoolExhausted(format!(
                "{connection_id}: injected pool exhaustion ({experiment})"
            ))),
            FaultType::SlowQuery { delay_ms } => {
                warn!(
                    experiment = %experiment,
                    connection_id,
                    delay_ms,
                    "Injected slow query"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(())
            }
        }
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver decorator applying a [`FaultInjector`] to every connect and query
#[derive(Debug)]
pub struct ChaosDriver {
    inner: Arc<dyn ConnectionDriver>,
    injector: Arc<FaultInjector>,
}

impl ChaosDriver {
    pub fn new(inner: Arc<dyn ConnectionDriver>, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }
}

#[async_trait]
impl ConnectionDriver for ChaosDriver {
    fn kind(&self) -> DriverKind {
        self.inner.kind()
    }

    async fn connect(
        &self,
        db: LogicalDb,
        config: &DatabaseConfig,
    ) -> Result<Box<dyn DriverConnection>> {
        self.injector.apply(db.connection_id()).await?;
        let inner = self.inner.connect(db, config).await?;
        Ok(Box::new(ChaosConnection {
            inner,
            connection_id: db.connection_id(),
            injector: Arc::clone(&self.injector),
        }))
    }
}

struct ChaosConnection {
    inner: Box<dyn DriverConnection>,
    connection_id: &'static str,
    injector: Arc<FaultInjector>,
}

#[async_trait]
impl DriverConnection for ChaosConnection {
    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        self.injector.apply(self.connection_id).await?;
        self.inner.query(sql, params).await
    }

    async fn is_valid(&mut self) -> bool {
        self.inner.is_valid().await
    }

    async fn close(self: Box<Self>) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedDriver;

    #[tokio::test]
    async fn test_disabled_injector_passes_through() {
        let injector = FaultInjector::with_seed(7);
        injector
            .register_experiment(ChaosExperiment::new("always", FaultType::PoolExhaustion))
            .unwrap();

        assert!(injector.apply("EMP").await.is_ok());
        assert_eq!(injector.experiment_stats("always").unwrap().calls_observed, 0);
    }

    #[tokio::test]
    async fn test_error_fault_targets_only_listed_connection() {
        let injector = FaultInjector::with_seed(7);
        injector.enable();
        injector
            .register_experiment(
                ChaosExperiment::new(
                    "mult-down",
                    FaultType::Error {
                        message: "injected".to_string(),
                    },
                )
                .targeting(["MULT"]),
            )
            .unwrap();

        assert!(injector.apply("EMP").await.is_ok());
        let err = injector.apply("MULT").await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert!(err.is_retryable());

        let stats = injector.experiment_stats("mult-down").unwrap();
        assert_eq!((stats.calls_observed, stats.triggered), (1, 1));
    }

    #[tokio::test]
    async fn test_probability_zero_never_triggers() {
        let injector = FaultInjector::with_seed(1);
        injector.enable();
        injector
            .register_experiment(
                ChaosExperiment::new("never", FaultType::PoolExhaustion).with_probability(0.0),
            )
            .unwrap();

        for _ in 0..50 {
            assert!(injector.apply("EMP").await.is_ok());
        }
        let stats = injector.experiment_stats("never").unwrap();
        assert_eq!((stats.calls_observed, stats.triggered), (50, 0));
    }

    #[tokio::test]
    async fn test_admin_surface() {
        let injector = FaultInjector::new();
        injector.enable();
        injector
            .register_experiment(ChaosExperiment::new("a", FaultType::PoolExhaustion))
            .unwrap();
        assert!(injector
            .register_experiment(ChaosExperiment::new("a", FaultType::PoolExhaustion))
            .is_err());

        injector.stop_experiment("a").unwrap();
        assert!(injector.apply("EMP").await.is_ok());
        assert!(!injector.list_experiments()[0].enabled);

        injector.start_experiment("a").unwrap();
        assert!(injector.apply("EMP").await.is_err());

        injector.reset_stats();
        assert_eq!(injector.experiment_stats("a").unwrap().triggered, 0);

        injector.remove_experiment("a").unwrap();
        assert!(injector.list_experiments().is_empty());
        assert!(matches!(
            injector.stop_experiment("a"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_fault_delays_then_fails() {
        let injector = FaultInjector::new();
        injector.enable();
        injector
            .register_experiment(ChaosExperiment::new(
                "slow-timeout",
                FaultType::Timeout { delay_ms: 20 },
            ))
            .unwrap();

        let started = std::time::Instant::now();
        let err = injector.apply("EMP").await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_chaos_driver_guards_queries() {
        let scripted = Arc::new(ScriptedDriver::new());
        let injector = Arc::new(FaultInjector::new());
        let driver = ChaosDriver::new(scripted.clone(), Arc::clone(&injector));

        let mut conn = driver
            .connect(LogicalDb::Emp, &DatabaseConfig::default())
            .await
            .unwrap();
        assert!(conn.query("SELECT 1", &[]).await.is_ok());

        injector.enable();
        injector
            .register_experiment(ChaosExperiment::new("exhaust", FaultType::PoolExhaustion))
            .unwrap();
        assert!(matches!(
            conn.query("SELECT 1", &[]).await,
            Err(GatewayError::PoolExhausted(_))
        ));
        assert_eq!(scripted.queries(), 1);
        assert_eq!(driver.kind(), DriverKind::Tds);
    }
}
