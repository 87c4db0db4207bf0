//! # Query Cache
//!
//! Two-tier result cache keyed by query fingerprint.
//!
//! ## Tiers
//!
//! - **L1**: process-local `DashMap` with per-entry TTL and a sweep task
//! - **L2**: shared store (Redis, an in-process stand-in, or disabled),
//!   guarded by the `cache` circuit breaker and a per-operation timeout
//!
//! Origin fetches are single-flight per key. Tier failures are absorbed and
//! never surface to callers.
//!
//! ```rust,no_run
//! use erp_gateway::cache::{family_fingerprint, QueryCache};
//! use erp_gateway::config::GatewayConfig;
//! use erp_gateway::database::{ConnectionManager, LogicalDb};
//! use erp_gateway::telemetry::TracingSink;
//! use std::sync::Arc;
//!
//! # async fn example(config: GatewayConfig) -> erp_gateway::error::Result<()> {
//! let manager = Arc::new(ConnectionManager::new(config.clone())?);
//! let cache = QueryCache::from_config(
//!     &config.query_cache,
//!     &config.circuit_breakers,
//!     Arc::new(TracingSink),
//! )
//! .await;
//!
//! let sql = "SELECT * FROM item WHERE sku = ?";
//! let items = cache
//!     .cached_execute(&manager, "item", LogicalDb::Mult, sql, &["7530110".into()], None)
//!     .await?;
//!
//! // After a write to the item table
//! cache.invalidate_pattern("item:*").await;
//! # let _ = (items, family_fingerprint("item", sql, &[]));
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod fingerprint;
pub mod glob;
pub mod l1;
pub mod provider;
pub mod providers;
pub mod query_cache;
pub mod traits;

pub use errors::{CacheError, CacheResult};
pub use fingerprint::{family_fingerprint, fingerprint, normalize_sql};
pub use glob::glob_match;
pub use l1::L1Cache;
pub use provider::{SharedTier, CACHE_COMPONENT};
pub use providers::{MemoryStore, NoOpStore};
pub use query_cache::{CacheStats, InvalidationReport, QueryCache};
pub use traits::SharedStore;

#[cfg(feature = "cache-redis")]
pub use providers::RedisStore;
