//! Process-local cache tier.
//!
//! A `DashMap` of JSON payloads with per-entry TTL. Expiry is checked on
//! every read and by a periodic sweep; when full, expired entries are purged
//! first and then the entry closest to expiry is evicted.

use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::glob::glob_match;

#[derive(Debug, Clone)]
struct L1Entry {
    value: Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl L1Entry {
    fn expires_at(&self) -> Instant {
        self.inserted_at + self.ttl
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }
}

/// In-process tier keyed by fingerprint
#[derive(Debug)]
pub struct L1Cache {
    entries: DashMap<String, L1Entry>,
    max_entries: usize,
}

impl L1Cache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Live value for `key`; an expired entry is removed and reported absent
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    pub fn insert(&self, key: &str, value: Value, ttl: Duration) {
        if self.max_entries == 0 || ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries.insert(
            key.to_string(),
            L1Entry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    fn make_room(&self) {
        if self.sweep_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at())
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            debug!(key = %key, "L1 full, evicting entry closest to expiry");
            self.entries.remove(&key);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key matching the glob `pattern`
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_match(pattern, key));
        before.saturating_sub(self.entries.len())
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_on_read() {
        let l1 = L1Cache::new(10);
        l1.insert("item:1", json!({"sku": "1"}), Duration::from_secs(5));
        assert_eq!(l1.get("item:1"), Some(json!({"sku": "1"})));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(l1.get("item:1"), None);
        assert!(l1.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let l1 = L1Cache::new(10);
        l1.insert("short", json!(1), Duration::from_secs(1));
        l1.insert("long", json!(2), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(l1.sweep_expired(), 1);
        assert_eq!(l1.get("long"), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_soonest_expiry() {
        let l1 = L1Cache::new(2);
        l1.insert("a", json!(1), Duration::from_secs(10));
        l1.insert("b", json!(2), Duration::from_secs(100));
        l1.insert("c", json!(3), Duration::from_secs(100));

        assert_eq!(l1.len(), 2);
        assert_eq!(l1.get("a"), None);
        assert!(l1.get("b").is_some());
        assert!(l1.get("c").is_some());
    }

    #[test]
    fn test_remove_matching() {
        let l1 = L1Cache::new(10);
        l1.insert("item:1", json!(1), Duration::from_secs(60));
        l1.insert("item:2", json!(2), Duration::from_secs(60));
        l1.insert("vendor:1", json!(3), Duration::from_secs(60));

        assert_eq!(l1.remove_matching("item:*"), 2);
        assert!(l1.get("vendor:1").is_some());
    }
}
