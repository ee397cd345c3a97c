//! Integration tests for single-flight fetch coalescing
//!
//! Tests that concurrent misses for one key share a single upstream call

mod common;

use common::*;
use lopan_cache::{CacheState, CachedResult, TierTtl};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

const CALLERS: u32 = 20;

fn ttl() -> TierTtl {
    TierTtl::new(Duration::from_secs(300), Duration::from_secs(86_400))
}

/// Test that concurrent misses trigger a single fetch
#[tokio::test]
async fn test_cache_stampede_protection() {
    let t = setup_cache().await;
    let key = test_key("stampede");
    let fetch_count = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(Notify::new());

    let mut tasks = JoinSet::new();
    for _ in 0..CALLERS {
        let cache = t.cache.clone();
        let key = key.clone();
        let fetch_count = Arc::clone(&fetch_count);
        let gate = Arc::clone(&gate);

        tasks.spawn(async move {
            cache
                .get(&key, ttl(), move || async move {
                    fetch_count.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok::<_, anyhow::Error>(test_data::page(0, 10))
                })
                .await
        });
    }

    // Hold the fetch open until every caller has joined it
    let cache = t.cache.clone();
    let joined = wait_for(
        || cache.statistics().coalesced_requests == u64::from(CALLERS - 1),
        5_000,
    )
    .await;
    assert!(joined, "callers did not coalesce onto one fetch");
    gate.notify_one();

    while let Some(result) = tasks.join_next().await {
        let result = result.unwrap_or_else(|_| panic!("Task failed"));
        assert_eq!(result.state(), CacheState::Fresh);
        assert_eq!(result.value(), Some(&test_data::page(0, 10)));
    }

    assert_eq!(fetch_count.load(Ordering::SeqCst), 1, "Fetch should run only once");
    let stats = t.cache.statistics();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.in_flight, 0);
}

/// Every waiter receives the same error when the shared fetch fails
#[tokio::test]
async fn test_shared_fetch_failure() {
    let t = setup_cache().await;
    let key = test_key("shared_failure");
    let gate = Arc::new(Notify::new());

    let mut tasks = JoinSet::new();
    for _ in 0..CALLERS {
        let cache = t.cache.clone();
        let key = key.clone();
        let gate = Arc::clone(&gate);

        tasks.spawn(async move {
            cache
                .get(&key, ttl(), move || async move {
                    gate.notified().await;
                    Err::<u64, _>(anyhow::anyhow!("inventory service unavailable"))
                })
                .await
        });
    }

    let cache = t.cache.clone();
    assert!(wait_for(|| cache.statistics().coalesced_requests == u64::from(CALLERS - 1), 5_000).await);
    gate.notify_one();

    let mut errors = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap_or_else(|_| panic!("Task failed")) {
            CachedResult::Error { error, fallback } => {
                assert!(fallback.is_none());
                errors.push(error);
            }
            other => panic!("expected error, got {:?}", other.state()),
        }
    }

    assert_eq!(errors.len(), CALLERS as usize);
    assert!(errors.iter().all(|e| Arc::ptr_eq(e, &errors[0])));
    assert_eq!(errors[0].to_string(), "inventory service unavailable");
    assert_eq!(t.cache.statistics().fetch_failures, 1);
    assert!(!t.cache.contains(&key).await);
}

/// A fetch whose only caller gave up still completes and is written back
#[tokio::test]
async fn test_abandoned_fetch_still_writes_back() {
    let t = setup_cache().await;
    let key = test_key("abandoned");

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        t.cache.get(&key, ttl(), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, anyhow::Error>(42u64)
        }),
    )
    .await;
    assert!(abandoned.is_err(), "caller should have timed out");

    let memory = Arc::clone(t.cache.memory());
    assert!(wait_for(|| memory.contains(&key), 5_000).await);

    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);
    let cached = t
        .cache
        .get(&key, ttl(), move || async move {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(0u64)
        })
        .await;
    assert_eq!(cached.value(), Some(&42));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_fetch_becomes_error() {
    let t = setup_cache().await;
    let key = test_key("panic");

    let result = t
        .cache
        .get(&key, ttl(), || async {
            if key_is_poisoned() {
                panic!("fetch exploded");
            }
            Ok::<_, anyhow::Error>(1u32)
        })
        .await;

    assert!(result.is_error());
    assert!(
        result
            .error()
            .is_some_and(|e| e.to_string().contains("panicked"))
    );
    assert_eq!(t.cache.in_flight(), 0);

    // The key is usable again afterwards
    let recovered = t.cache.get(&key, ttl(), || async { Ok::<_, anyhow::Error>(2u32) }).await;
    assert_eq!(recovered.value(), Some(&2));
}

fn key_is_poisoned() -> bool {
    true
}

/// Stale hits from many callers start only one background refresh
#[tokio::test]
async fn test_stale_readers_share_one_refresh() {
    let t = setup_cache().await;
    let key = test_key("stale_refresh");
    t.cache
        .set(&key, &1u32, ttl())
        .await
        .unwrap_or_else(|e| panic!("set failed: {e}"));
    t.clock.advance(Duration::from_secs(200));

    let refreshes = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(Notify::new());
    for _ in 0..CALLERS {
        let refreshes = Arc::clone(&refreshes);
        let gate = Arc::clone(&gate);
        let result = t
            .cache
            .get(&key, ttl(), move || async move {
                refreshes.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok::<_, anyhow::Error>(2u32)
            })
            .await;
        assert_eq!(result.state(), CacheState::Stale);
        assert_eq!(result.value(), Some(&1));
    }

    let stats = t.cache.statistics();
    assert_eq!(stats.stale_served, u64::from(CALLERS));
    assert_eq!(stats.background_refreshes, 1);

    let mut events = t.cache.subscribe();
    gate.notify_one();
    let _ = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap_or_else(|_| panic!("refresh never landed"));
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}
