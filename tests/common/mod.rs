//! Shared helpers for the integration tests

#![allow(dead_code)]

pub mod strategies;

use erp_gateway::cache::{MemoryStore, QueryCache, SharedTier};
use erp_gateway::config::GatewayConfig;
use erp_gateway::database::ConnectionManager;
use erp_gateway::test_utils::{test_config, RecordingSink, ScriptedDriver};
use std::sync::Arc;
use tracing::Level;

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Manager wired to a scripted driver and a recording sink
pub struct TestGateway {
    pub manager: Arc<ConnectionManager>,
    pub driver: ScriptedDriver,
    pub sink: Arc<RecordingSink>,
}

impl TestGateway {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        Self::with_driver(config, ScriptedDriver::new())
    }

    /// Use a driver that was scripted before the manager exists
    pub fn with_driver(config: GatewayConfig, driver: ScriptedDriver) -> Self {
        init_tracing();
        let sink = Arc::new(RecordingSink::default());
        let manager = ConnectionManager::builder(config)
            .driver(Arc::new(driver.clone()))
            .telemetry(sink.clone())
            .build()
            .expect("test configuration is valid");
        Self {
            manager: Arc::new(manager),
            driver,
            sink,
        }
    }
}

/// Query cache over an in-process shared tier, plus handles on both
pub struct TestCache {
    pub cache: QueryCache,
    pub store: MemoryStore,
    pub sink: Arc<RecordingSink>,
}

impl TestCache {
    pub fn new() -> Self {
        let config = test_config().query_cache;
        let store = MemoryStore::new();
        let sink = Arc::new(RecordingSink::default());
        let cache = QueryCache::new(
            config.clone(),
            SharedTier::memory(store.clone(), &config),
            sink.clone(),
        );
        Self { cache, store, sink }
    }
}
