//! Shared-tier store interface.

use super::errors::CacheResult;
use std::time::Duration;

/// Operations every shared (L2) store provides.
///
/// Values are opaque strings; expiry is the store's own responsibility.
pub trait SharedStore: Send + Sync {
    /// `Ok(Some(value))` on hit, `Ok(None)` on miss
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = CacheResult<Option<String>>> + Send;

    /// Write a value that the store expires after `ttl`
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = CacheResult<()>> + Send;

    fn delete(&self, key: &str) -> impl std::future::Future<Output = CacheResult<()>> + Send;

    /// Delete every key matching a glob pattern, returning how many went
    fn delete_pattern(
        &self,
        pattern: &str,
    ) -> impl std::future::Future<Output = CacheResult<u64>> + Send;

    fn health_check(&self) -> impl std::future::Future<Output = CacheResult<bool>> + Send;

    fn provider_name(&self) -> &'static str;

    /// Whether state is shared across processes (and so involves the network)
    fn is_distributed(&self) -> bool {
        false
    }
}
