//! Two-tier query cache: coalescing, invalidation precision and expiry

mod common;

use common::strategies::cache_key_strategy;
use common::{TestCache, TestGateway};
use erp_gateway::cache::{family_fingerprint, MemoryStore, QueryCache, SharedTier};
use erp_gateway::telemetry::{CacheOutcome, CacheTier};
use erp_gateway::test_utils::{test_config, RecordingSink, ScriptedDriver};
use erp_gateway::{GatewayError, LogicalDb, Result, SqlParam};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_misses_coalesce_into_one_origin_fetch() {
    let tc = TestCache::new();
    let origin_calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let cache = tc.cache.clone();
        let calls = Arc::clone(&origin_calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_fetch("item:7530110", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, GatewayError>(serde_json::json!({"ItemID": "7530110", "Descr": "Hex bolt M8"}))
                })
                .await
        }));
    }

    for handle in handles {
        let value = handle.await.unwrap().unwrap();
        assert_eq!(value["ItemID"], "7530110");
    }

    assert_eq!(origin_calls.load(Ordering::SeqCst), 1);
    let stats = tc.cache.stats();
    assert_eq!(stats.origin_fetches, 1);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.coalesced_waits >= 1);
    assert!(tc
        .sink
        .cache_events()
        .iter()
        .any(|e| e.outcome == CacheOutcome::Coalesced && e.tier == CacheTier::Origin));
}

#[tokio::test]
async fn test_failed_origin_fetch_reaches_every_waiter() {
    let tc = TestCache::new();
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let cache = tc.cache.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_fetch("item:404", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err::<u32, _>(GatewayError::ConnectionReset("origin down".into()))
                })
                .await
        }));
    }
    for handle in handles {
        assert!(matches!(
            handle.await.unwrap(),
            Err(GatewayError::ConnectionReset(_))
        ));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(tc.cache.get::<u32>("item:404").await, None);
}

#[tokio::test]
async fn test_pattern_invalidation_is_precise() {
    let tc = TestCache::new();
    for key in ["item:1", "item:2", "itemx:1", "vendor:1", "ledger:item:1"] {
        tc.cache.set(key, &key.to_string(), None).await.unwrap();
    }

    let report = tc.cache.invalidate_pattern("item:*").await;
    assert_eq!(report.l1_removed, 2);
    assert_eq!(report.l2_removed, 2);

    assert_eq!(tc.cache.get::<String>("item:1").await, None);
    assert_eq!(tc.cache.get::<String>("item:2").await, None);
    for survivor in ["itemx:1", "vendor:1", "ledger:item:1"] {
        assert_eq!(
            tc.cache.get::<String>(survivor).await.as_deref(),
            Some(survivor),
            "{survivor} should survive item:*"
        );
    }
}

#[tokio::test]
async fn test_single_key_invalidation_reaches_shared_tier() {
    let store = MemoryStore::new();
    let config = test_config().query_cache;
    let peer = QueryCache::new(
        config.clone(),
        SharedTier::memory(store.clone(), &config),
        Arc::new(RecordingSink::default()),
    );
    let tc = TestCache {
        cache: QueryCache::new(
            config.clone(),
            SharedTier::memory(store.clone(), &config),
            Arc::new(RecordingSink::default()),
        ),
        store,
        sink: Arc::new(RecordingSink::default()),
    };

    tc.cache.set("vendor:77", &"Acme".to_string(), None).await.unwrap();
    let report = peer.invalidate("vendor:77").await;
    assert_eq!(report.l1_removed, 0);
    assert_eq!(report.l2_removed, 1);

    // The writer's own L1 copy lives on until it expires or is invalidated
    tc.cache.clear_local();
    assert_eq!(tc.cache.get::<String>("vendor:77").await, None);
    assert!(tc.store.is_empty());
}

#[tokio::test]
async fn test_invalidation_during_fetch_keeps_result_out_of_cache() {
    let tc = TestCache::new();
    let origin_calls = Arc::new(AtomicU32::new(0));

    let cache = tc.cache.clone();
    let calls = Arc::clone(&origin_calls);
    let in_flight = tokio::spawn(async move {
        cache
            .get_or_fetch("item:1", None, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, GatewayError>("before-write".to_string())
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tc.cache.stats().in_flight, 1);
    tc.cache.invalidate_pattern("item:*").await;
    assert_eq!(tc.cache.stats().in_flight, 0);

    // Waiters on the detached fetch still get its result
    assert_eq!(in_flight.await.unwrap().unwrap(), "before-write");
    assert_eq!(tc.cache.get::<String>("item:1").await, None);
    assert!(tc.store.is_empty());

    let calls = Arc::clone(&origin_calls);
    let fresh: String = tc
        .cache
        .get_or_fetch("item:1", None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("after-write".to_string())
        })
        .await
        .unwrap();
    assert_eq!(fresh, "after-write");
    assert_eq!(origin_calls.load(Ordering::SeqCst), 2);
    assert_eq!(tc.cache.get::<String>("item:1").await, Some("after-write".to_string()));
}

#[tokio::test]
async fn test_single_key_invalidation_during_fetch_spares_other_keys() {
    let tc = TestCache::new();

    let slow = |value: &'static str| {
        move || async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok::<_, GatewayError>(value.to_string())
        }
    };
    let (a, b) = (tc.cache.clone(), tc.cache.clone());
    let first = tokio::spawn(async move { a.get_or_fetch("vendor:1", None, slow("acme")).await });
    let second = tokio::spawn(async move { b.get_or_fetch("vendor:2", None, slow("globex")).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    tc.cache.invalidate("vendor:1").await;

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(tc.cache.get::<String>("vendor:1").await, None);
    assert_eq!(tc.cache.get::<String>("vendor:2").await, Some("globex".to_string()));
}

#[tokio::test]
async fn test_entries_expire_from_both_tiers() {
    let tc = TestCache::new();
    tc.cache
        .set("item:ttl", &1u32, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(tc.cache.get::<u32>("item:ttl").await, Some(1));

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(tc.cache.get::<u32>("item:ttl").await, None);
    tc.cache.clear_local();
    assert_eq!(tc.cache.get::<u32>("item:ttl").await, None);
}

#[tokio::test]
async fn test_cached_execute_normalizes_and_invalidates_by_family() {
    let gw = TestGateway::new();
    let tc = TestCache::new();

    let sql = "SELECT Descr FROM Items WHERE ItemID = ?";
    let params = [SqlParam::from("7530110")];
    for text in [sql, "select descr\n  from items where ItemID = ?;"] {
        let result = tc
            .cache
            .cached_execute(&gw.manager, "item", LogicalDb::Emp, text, &params, None)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }
    let reached: Vec<_> = gw
        .driver
        .executed()
        .into_iter()
        .filter(|(_, s)| s.to_lowercase().contains("items"))
        .collect();
    assert_eq!(reached.len(), 1);

    let key = family_fingerprint("item", sql, &params);
    assert!(key.starts_with("item:"));
    assert!(tc.cache.get::<serde_json::Value>(&key).await.is_some());

    tc.cache.invalidate_pattern("item:*").await;
    tc.cache
        .cached_execute(&gw.manager, "item", LogicalDb::Emp, sql, &params, None)
        .await
        .unwrap();
    assert_eq!(
        gw.driver.executed().iter().filter(|(_, s)| s.to_lowercase().contains("items")).count(),
        2
    );
}

#[tokio::test]
async fn test_degraded_results_are_never_cached() {
    let driver = ScriptedDriver::new();
    driver.fail_connects_always(GatewayError::Connection("down".into()));
    let gw = TestGateway::with_driver(test_config(), driver);
    let tc = TestCache::new();

    let params = [SqlParam::from("7530110")];
    let result = tc
        .cache
        .cached_execute(&gw.manager, "item", LogicalDb::Emp, "SELECT * FROM Items WHERE ItemID = ?", &params, None)
        .await
        .unwrap();
    assert_eq!(result.len(), 1);

    let stats = tc.cache.stats();
    assert_eq!(stats.l1_entries, 0);
    assert!(tc.store.is_empty());
}

#[tokio::test]
async fn test_shared_tier_outage_falls_back_to_origin() {
    let tc = TestCache::new();
    tc.store.set_unavailable(true);

    let value: Result<u32> = tc
        .cache
        .get_or_fetch("ledger:1", None, || async { Ok(11) })
        .await;
    assert_eq!(value.unwrap(), 11);
    assert!(tc.cache.stats().l2_errors >= 1);

    // L1 still serves the value
    assert_eq!(tc.cache.get::<u32>("ledger:1").await, Some(11));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn invalidated_keys_are_gone_from_both_tiers(keys in prop::collection::hash_set(cache_key_strategy(), 1..10)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let tc = TestCache::new();
            for key in &keys {
                tc.cache.set(key, &key.len(), None).await.unwrap();
            }
            for key in &keys {
                let report = tc.cache.invalidate(key).await;
                assert_eq!(report.l1_removed, 1);
                assert_eq!(tc.cache.get::<usize>(key).await, None);
            }
            assert!(tc.store.is_empty());
        });
    }
}
