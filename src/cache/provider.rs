//! Shared (L2) tier with integrated circuit breaker.
//!
//! Enum dispatch over the configured store. Every round trip is bounded by
//! the configured operation timeout and, for real stores, gated by the
//! `cache` circuit breaker so an unreachable store is skipped without paying
//! the timeout on every lookup.

use super::errors::{CacheError, CacheResult};
use super::providers::{MemoryStore, NoOpStore};
use super::traits::SharedStore;
use crate::config::{CircuitBreakerConfig, L2Backend, QueryCacheConfig};
use crate::resilience::{self, CircuitBreaker, CircuitState};
use crate::telemetry::TelemetrySink;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(feature = "cache-redis")]
use super::providers::RedisStore;

/// Breaker component name for the shared tier
pub const CACHE_COMPONENT: &str = "cache";

#[derive(Debug, Clone)]
enum StoreBackend {
    #[cfg(feature = "cache-redis")]
    Redis(Box<RedisStore>),
    Memory(MemoryStore),
    NoOp(NoOpStore),
}

impl StoreBackend {
    fn provider_name(&self) -> &'static str {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.provider_name(),
            Self::Memory(s) => s.provider_name(),
            Self::NoOp(s) => s.provider_name(),
        }
    }

    fn is_distributed(&self) -> bool {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.is_distributed(),
            Self::Memory(s) => s.is_distributed(),
            Self::NoOp(s) => s.is_distributed(),
        }
    }

    fn is_enabled(&self) -> bool {
        !matches!(self, Self::NoOp(_))
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.get(key).await,
            Self::Memory(s) => s.get(key).await,
            Self::NoOp(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.set(key, value, ttl).await,
            Self::Memory(s) => s.set(key, value, ttl).await,
            Self::NoOp(s) => s.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.delete(key).await,
            Self::Memory(s) => s.delete(key).await,
            Self::NoOp(s) => s.delete(key).await,
        }
    }

    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.delete_pattern(pattern).await,
            Self::Memory(s) => s.delete_pattern(pattern).await,
            Self::NoOp(s) => s.delete_pattern(pattern).await,
        }
    }

    async fn health_check(&self) -> CacheResult<bool> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.health_check().await,
            Self::Memory(s) => s.health_check().await,
            Self::NoOp(s) => s.health_check().await,
        }
    }
}

/// The shared cache tier as seen by `QueryCache`
#[derive(Clone)]
pub struct SharedTier {
    backend: StoreBackend,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    key_prefix: String,
    operation_timeout: Duration,
}

impl std::fmt::Debug for SharedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTier")
            .field("backend", &self.backend.provider_name())
            .field("key_prefix", &self.key_prefix)
            .field(
                "circuit_breaker",
                &self.circuit_breaker.as_ref().map(|cb| cb.state()),
            )
            .finish()
    }
}

impl SharedTier {
    /// Build the configured tier, falling back to no-op when the store cannot
    /// be reached. The gateway never fails to start because of the cache.
    pub async fn from_config_graceful(
        config: &QueryCacheConfig,
        breakers: &CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let backend = Self::create_backend(config).await;
        let tier = Self::with_backend(backend, config);

        if tier.backend.is_enabled() && breakers.enabled {
            let breaker_config = breakers
                .component_configs
                .get(CACHE_COMPONENT)
                .map(|c| c.to_resilience_config())
                .unwrap_or_else(resilience::CircuitBreakerConfig::for_cache);
            info!(
                failure_threshold = breaker_config.failure_threshold,
                cool_down_ms = breaker_config.cool_down.as_millis() as u64,
                "Shared cache circuit breaker initialized"
            );
            tier.with_circuit_breaker(Arc::new(CircuitBreaker::with_telemetry(
                CACHE_COMPONENT.to_string(),
                breaker_config,
                telemetry,
            )))
        } else {
            tier
        }
    }

    async fn create_backend(config: &QueryCacheConfig) -> StoreBackend {
        if !config.enabled {
            info!("Query cache disabled by configuration");
            return StoreBackend::NoOp(NoOpStore::new());
        }

        match config.l2.backend {
            L2Backend::Redis => Self::create_redis_backend(config).await,
            L2Backend::Memory => {
                info!(backend = "memory", "Shared cache tier using in-process store");
                StoreBackend::Memory(MemoryStore::new())
            }
            L2Backend::None => {
                info!("Shared cache tier disabled, L1 only");
                StoreBackend::NoOp(NoOpStore::new())
            }
        }
    }

    #[cfg(feature = "cache-redis")]
    async fn create_redis_backend(config: &QueryCacheConfig) -> StoreBackend {
        let Some(url) = config.l2.url.as_deref() else {
            warn!("Redis shared tier selected but no l2.url configured, falling back to NoOp");
            return StoreBackend::NoOp(NoOpStore::new());
        };

        let connect = RedisStore::connect(url);
        match tokio::time::timeout(config.l2.operation_timeout() * 8, connect).await {
            Ok(Ok(store)) => {
                info!(backend = "redis", "Shared cache tier initialized");
                StoreBackend::Redis(Box::new(store))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to connect to Redis, shared tier disabled (graceful degradation)");
                StoreBackend::NoOp(NoOpStore::new())
            }
            Err(_) => {
                warn!("Timed out connecting to Redis, shared tier disabled (graceful degradation)");
                StoreBackend::NoOp(NoOpStore::new())
            }
        }
    }

    #[cfg(not(feature = "cache-redis"))]
    async fn create_redis_backend(_config: &QueryCacheConfig) -> StoreBackend {
        warn!("Redis shared tier requested but 'cache-redis' feature not enabled, using NoOp");
        StoreBackend::NoOp(NoOpStore::new())
    }

    fn with_backend(backend: StoreBackend, config: &QueryCacheConfig) -> Self {
        Self {
            backend,
            circuit_breaker: None,
            key_prefix: config.l2.key_prefix.clone(),
            operation_timeout: config.l2.operation_timeout(),
        }
    }

    /// Tier backed by an existing in-process store (shared between clones)
    pub fn memory(store: MemoryStore, config: &QueryCacheConfig) -> Self {
        Self::with_backend(StoreBackend::Memory(store), config)
    }

    #[cfg(feature = "cache-redis")]
    pub fn redis(store: RedisStore, config: &QueryCacheConfig) -> Self {
        Self::with_backend(StoreBackend::Redis(Box::new(store)), config)
    }

    pub fn noop() -> Self {
        Self {
            backend: StoreBackend::NoOp(NoOpStore::new()),
            circuit_breaker: None,
            key_prefix: String::new(),
            operation_timeout: Duration::from_millis(1),
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    pub fn is_distributed(&self) -> bool {
        self.backend.is_distributed()
    }

    pub fn provider_name(&self) -> &'static str {
        self.backend.provider_name()
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.circuit_breaker.as_ref().map(|cb| cb.state())
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    /// Breaker gate, timeout bound and outcome recording around one round trip
    async fn guarded<T, Fut>(&self, operation: &'static str, fut: Fut) -> CacheResult<T>
    where
        Fut: Future<Output = CacheResult<T>>,
    {
        let permit = match &self.circuit_breaker {
            Some(cb) => match cb.try_acquire() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(operation, "Shared cache circuit open, skipping tier");
                    return Err(CacheError::CircuitOpen);
                }
            },
            None => None,
        };

        let result = match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(format!(
                "{operation} exceeded {}ms",
                self.operation_timeout.as_millis()
            ))),
        };

        if let (Some(cb), Some(permit)) = (&self.circuit_breaker, permit) {
            if result.is_ok() {
                cb.record_success(permit);
            } else {
                cb.record_failure(permit);
            }
        }
        result
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let key = self.prefixed(key);
        self.guarded("get", self.backend.get(&key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let key = self.prefixed(key);
        self.guarded("set", self.backend.set(&key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let key = self.prefixed(key);
        self.guarded("delete", self.backend.delete(&key)).await
    }

    /// Delete keys matching `pattern` (the prefix is applied to the pattern)
    pub async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let pattern = self.prefixed(pattern);
        self.guarded("delete_pattern", self.backend.delete_pattern(&pattern))
            .await
    }

    pub async fn health_check(&self) -> CacheResult<bool> {
        self.guarded("health_check", self.backend.health_check()).await
    }
}
