//! In-process stand-in for the shared store.
//!
//! Behaves like the shared tier (string values, native per-key TTL, glob
//! deletes) without a network hop. Clones share one map, so two `QueryCache`
//! instances built from the same store see each other's writes, the way two
//! gateway processes share one Redis.

use crate::cache::errors::{CacheError, CacheResult};
use crate::cache::glob::glob_match;
use crate::cache::traits::SharedStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct MemoryInner {
    entries: DashMap<String, (String, Instant)>,
    unavailable: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Release);
    }

    /// Live (unexpired) keys currently held
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.value().1 > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.inner.unavailable.load(Ordering::Acquire) {
            return Err(CacheError::ConnectionError(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let hit = self
            .inner
            .entries
            .get(key)
            .and_then(|entry| (entry.value().1 > now).then(|| entry.value().0.clone()));
        if hit.is_none() {
            self.inner.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check_available()?;
        self.inner
            .entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.check_available()?;
        self.inner.entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        self.check_available()?;
        let now = Instant::now();
        let mut deleted = 0u64;
        self.inner.entries.retain(|key, (_, expires)| {
            if glob_match(pattern, key) {
                if *expires > now {
                    deleted += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(!self.inner.unavailable.load(Ordering::Acquire))
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_native_ttl() {
        let store = MemoryStore::new();
        store.set("item:1", "v", Duration::from_secs(2)).await.unwrap();
        assert_eq!(store.get("item:1").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get("k").await.is_err());
        assert!(store.set("k", "v", Duration::from_secs(1)).await.is_err());
        assert!(!store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_pattern_counts_live_keys() {
        let store = MemoryStore::new();
        for key in ["family:1", "family:2", "other:1"] {
            store.set(key, "v", Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(store.delete_pattern("family:*").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }
}
