//! Integration tests for non-blocking reads, events and lifecycle
//!
//! Tests `get_or_schedule`, the event channel, maintenance and shutdown

mod common;

use common::*;
use lopan_cache::{CacheEvent, CacheState, CacheTier, TierTtl};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

fn ttl() -> TierTtl {
    TierTtl::new(Duration::from_secs(300), Duration::from_secs(86_400))
}

async fn next_event(events: &mut broadcast::Receiver<CacheEvent>) -> CacheEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap_or_else(|_| panic!("no event within 5s"))
        .unwrap_or_else(|e| panic!("event channel closed: {e}"))
}

/// First sight of a key is `Loading`; a key with history is `Fetching`
#[tokio::test]
async fn test_loading_then_fetching() {
    let t = setup_cache().await;
    let key = test_key("schedule");
    let mut events = t.cache.subscribe();

    let first = t
        .cache
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>(1u32) })
        .await;
    assert_eq!(first.state(), CacheState::Loading);
    assert!(first.value().is_none());
    assert_eq!(next_event(&mut events).await, CacheEvent::Refreshed { key: key.clone() });

    let landed = t
        .cache
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>(2u32) })
        .await;
    assert_eq!(landed.state(), CacheState::Fresh);
    assert_eq!(landed.value(), Some(&1));

    t.cache.invalidate(&key).await;
    assert_eq!(next_event(&mut events).await, CacheEvent::Invalidated { key: key.clone() });

    let again = t
        .cache
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>(3u32) })
        .await;
    assert_eq!(again.state(), CacheState::Fetching);
    assert_eq!(next_event(&mut events).await, CacheEvent::Refreshed { key: key.clone() });

    // Clearing everything forgets history too
    t.cache.invalidate_all().await;
    assert_eq!(next_event(&mut events).await, CacheEvent::Cleared);
    let fresh_start = t
        .cache
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>(4u32) })
        .await;
    assert_eq!(fresh_start.state(), CacheState::Loading);
}

/// Callers joining the very first fetch for a key still see `Loading`
#[tokio::test]
async fn test_joining_first_fetch_reports_loading() {
    let t = setup_cache().await;
    let key = test_key("first_fetch");
    let mut events = t.cache.subscribe();
    let gate = Arc::new(Notify::new());
    let fetch_gate = Arc::clone(&gate);

    let first = t
        .cache
        .get_or_schedule(&key, ttl(), move || async move {
            fetch_gate.notified().await;
            Ok::<_, anyhow::Error>(1u32)
        })
        .await;
    let second = t
        .cache
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>(2u32) })
        .await;
    assert_eq!(first.state(), CacheState::Loading);
    assert_eq!(second.state(), CacheState::Loading);
    assert_eq!(t.cache.in_flight(), 1);

    gate.notify_one();
    assert_eq!(next_event(&mut events).await, CacheEvent::Refreshed { key: key.clone() });
    let landed = t
        .cache
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>(3u32) })
        .await;
    assert_eq!(landed.value(), Some(&1));
}

/// A failed first fetch leaves no history behind
#[tokio::test]
async fn test_retry_after_failed_first_fetch_reports_loading() {
    let t = setup_cache().await;
    let key = test_key("failed_first");

    let failed = t
        .cache
        .get(&key, ttl(), || async { Err::<u32, _>(anyhow::anyhow!("upstream timeout")) })
        .await;
    assert!(failed.is_error());

    let retry = t
        .cache
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>(5u32) })
        .await;
    assert_eq!(retry.state(), CacheState::Loading);
}

/// An expired copy on disk also counts as history
#[tokio::test]
async fn test_expired_copy_reports_fetching() {
    let t = setup_cache().await;
    let key = test_key("expired_copy");
    t.cache
        .set(&key, &"old", TierTtl::uniform(Duration::from_secs(10)))
        .await
        .unwrap_or_else(|e| panic!("set failed: {e}"));
    t.clock.advance(Duration::from_secs(11));

    // A different coordinator over the same directory has no key history
    let restarted = lopan_cache::CacheCoordinatorBuilder::new()
        .with_config(small_config())
        .with_clock(t.clock.clone())
        .with_disk_directory(t.dir.path())
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build coordinator: {e}"));

    let result = restarted
        .get_or_schedule(&key, ttl(), || async { Ok::<_, anyhow::Error>("new".to_owned()) })
        .await;
    assert_eq!(result.state(), CacheState::Fetching);
}

#[tokio::test]
async fn test_failed_refresh_publishes_event() {
    let t = setup_cache().await;
    let key = test_key("failed_refresh");
    let mut events = t.cache.subscribe();

    let scheduled = t
        .cache
        .get_or_schedule(&key, ttl(), || async {
            Err::<u32, _>(anyhow::anyhow!("warehouse API returned 503"))
        })
        .await;
    assert_eq!(scheduled.state(), CacheState::Loading);

    match next_event(&mut events).await {
        CacheEvent::RefreshFailed { key: failed, error } => {
            assert_eq!(failed, key);
            assert!(error.contains("503"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!t.cache.contains(&key).await);
}

#[tokio::test]
async fn test_events_serialize_tagged() {
    let event = CacheEvent::PrefixInvalidated {
        prefix: "oos:list".into(),
    };
    let json = serde_json::to_value(&event).unwrap_or_else(|e| panic!("serialize failed: {e}"));
    assert_eq!(
        json,
        serde_json::json!({ "event": "prefix_invalidated", "prefix": "oos:list" })
    );
}

/// Writes made while a fetch is in flight win over the fetch
#[tokio::test]
async fn test_set_detaches_in_flight_fetch() {
    let t = setup_cache().await;
    let key = test_key("detach");
    let gate = Arc::new(Notify::new());
    let fetch_gate = Arc::clone(&gate);

    let pending = t
        .cache
        .get_or_schedule(&key, ttl(), move || async move {
            fetch_gate.notified().await;
            Ok::<_, anyhow::Error>(1u32)
        })
        .await;
    assert_eq!(pending.state(), CacheState::Loading);
    assert_eq!(t.cache.in_flight(), 1);

    t.cache
        .set(&key, &2u32, ttl())
        .await
        .unwrap_or_else(|e| panic!("set failed: {e}"));
    assert_eq!(t.cache.in_flight(), 0);
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = t
        .cache
        .get(&key, ttl(), || async { Ok::<_, anyhow::Error>(3u32) })
        .await;
    assert_eq!(result.value(), Some(&2));
}

/// After shutdown callers still get their fetched value but nothing is stored
#[tokio::test]
async fn test_shutdown_stops_write_back() {
    let t = setup_cache().await;
    let key = test_key("shutdown");
    let gate = Arc::new(Notify::new());

    let cache = t.cache.clone();
    let fetch_gate = Arc::clone(&gate);
    let caller_key = key.clone();
    let caller = tokio::spawn(async move {
        cache
            .get(&caller_key, ttl(), move || async move {
                fetch_gate.notified().await;
                Ok::<_, anyhow::Error>(vec![1u32, 2])
            })
            .await
    });

    let cache = t.cache.clone();
    assert!(wait_for(|| cache.in_flight() == 1, 5_000).await);
    t.cache.shutdown();
    gate.notify_one();

    let result = caller.await.unwrap_or_else(|_| panic!("caller panicked"));
    assert_eq!(result.value(), Some(&vec![1, 2]));
    assert!(!t.cache.memory().contains(&key));
    assert_eq!(t.cache.statistics().l2.entries, 0);
}

#[tokio::test]
async fn test_maintenance_removes_expired_entries() {
    let t = setup_cache().await;
    for i in 0..3 {
        t.cache
            .set(&format!("oos:count|c:C{i}"), &i, TierTtl::uniform(Duration::from_secs(10)))
            .await
            .unwrap_or_else(|e| panic!("set failed: {e}"));
    }
    t.cache
        .set("oos:count|c:live", &9, ttl())
        .await
        .unwrap_or_else(|e| panic!("set failed: {e}"));
    t.clock.advance(Duration::from_secs(60));

    t.cache.spawn_maintenance(Duration::from_millis(20));
    let cache = t.cache.clone();
    let cleaned = wait_for(
        || {
            let stats = cache.statistics();
            stats.l1.entries == 1 && stats.l2.entries == 1
        },
        5_000,
    )
    .await;
    assert!(cleaned, "maintenance did not remove expired entries");
    assert!(t.cache.contains("oos:count|c:live").await);

    // Running it by hand finds nothing left
    assert_eq!(t.cache.evict_expired().await, 0);
    t.cache.shutdown();
}

/// An invalidation that lands while a fetch is still writing to disk is not undone
#[tokio::test]
async fn test_invalidate_during_write_back_is_not_undone() {
    let slow = Arc::new(SlowTier::new(Duration::from_millis(200)));
    let (cache, _clock) = setup_cache_with_disk(slow.clone()).await;
    let key = test_key("slow_invalidate");

    let reader = cache.clone();
    let read_key = key.clone();
    let first = tokio::spawn(async move {
        reader
            .get(&read_key, ttl(), || async { Ok::<_, anyhow::Error>(1u32) })
            .await
    });

    // Fetch finished, disk write under way
    assert!(wait_for(|| slow.stores_started() == 1, 5_000).await);
    cache.invalidate(&key).await;

    let first = first.await.unwrap_or_else(|_| panic!("reader panicked"));
    assert_eq!(first.value(), Some(&1));
    assert!(!cache.contains(&key).await);

    let second = cache
        .get(&key, ttl(), || async { Ok::<_, anyhow::Error>(2u32) })
        .await;
    assert_eq!(second.state(), CacheState::Fresh);
    assert_eq!(second.value(), Some(&2));
}

/// A `set` that lands while a fetch is still writing to disk replaces it in both tiers
#[tokio::test]
async fn test_set_during_write_back_wins_on_disk() {
    let slow = Arc::new(SlowTier::new(Duration::from_millis(200)));
    let (cache, _clock) = setup_cache_with_disk(slow.clone()).await;
    let key = test_key("slow_set");

    let reader = cache.clone();
    let read_key = key.clone();
    let first = tokio::spawn(async move {
        reader
            .get(&read_key, ttl(), || async { Ok::<_, anyhow::Error>(1u32) })
            .await
    });

    assert!(wait_for(|| slow.stores_started() == 1, 5_000).await);
    cache
        .set(&key, &7u32, ttl())
        .await
        .unwrap_or_else(|e| panic!("set failed: {e}"));
    first.await.unwrap_or_else(|_| panic!("reader panicked"));

    // Force the next read to come from disk
    cache
        .memory()
        .invalidate(&key)
        .await
        .unwrap_or_else(|e| panic!("memory invalidate failed: {e}"));
    let result = cache
        .get(&key, ttl(), || async { Ok::<_, anyhow::Error>(3u32) })
        .await;
    assert_eq!(result.value(), Some(&7));
    assert_eq!(slow.stores_started(), 2);
}

/// A demand read that joins a prefetch gets the value persisted to disk
#[tokio::test]
async fn test_demand_read_joining_prefetch_reaches_disk() {
    let t = setup_cache().await;
    let key = test_key("joined_prefetch");
    let gate = Arc::new(Notify::new());

    let cache = t.cache.clone();
    let prefetch_key = key.clone();
    let fetch_gate = Arc::clone(&gate);
    let prefetch = tokio::spawn(async move {
        cache
            .prefetch(&prefetch_key, ttl(), move || async move {
                fetch_gate.notified().await;
                Ok::<_, anyhow::Error>(11u32)
            })
            .await
    });
    let cache = t.cache.clone();
    assert!(wait_for(|| cache.in_flight() == 1, 5_000).await);

    let cache = t.cache.clone();
    let read_key = key.clone();
    let reader = tokio::spawn(async move {
        cache
            .get(&read_key, ttl(), || async { Ok::<_, anyhow::Error>(99u32) })
            .await
    });
    let cache = t.cache.clone();
    assert!(wait_for(|| cache.statistics().coalesced_requests == 1, 5_000).await);
    gate.notify_one();

    assert!(prefetch.await.unwrap_or_else(|_| panic!("prefetch panicked")));
    let result = reader.await.unwrap_or_else(|_| panic!("reader panicked"));
    assert_eq!(result.value(), Some(&11));
    assert_eq!(t.cache.statistics().l2.entries, 1);
}
