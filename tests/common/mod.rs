//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Coordinators over temporary directories driven by a manual clock
//! - Test data generators
//! - Tier test doubles
//! - Polling helpers for background work

#![allow(dead_code)]

use lopan_cache::error::Result;
use lopan_cache::{
    CacheBudget, CacheConfig, CacheCoordinator, CacheCoordinatorBuilder, CacheEntry, CacheMetadata,
    CacheSource, CacheTier, ManualClock, MemoryCache, SystemClock, TierLookup, TierStats, async_trait,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// A coordinator plus the pieces a test needs to drive it
pub struct TestCache {
    pub cache: CacheCoordinator,
    pub clock: Arc<ManualClock>,
    /// Keeps the disk directory alive for the duration of the test
    pub dir: TempDir,
}

pub fn small_config() -> CacheConfig {
    CacheConfig {
        budget: CacheBudget {
            max_memory_entries: 100,
            max_memory_bytes: 1024 * 1024,
            max_disk_bytes: 4 * 1024 * 1024,
        },
        ..CacheConfig::default()
    }
}

/// Coordinator over a fresh temporary directory and a manual clock
pub async fn setup_cache() -> TestCache {
    setup_cache_with(small_config()).await
}

pub async fn setup_cache_with(config: CacheConfig) -> TestCache {
    init_tracing();
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("Failed to create temp dir: {e}"));
    let clock = Arc::new(ManualClock::new());
    let cache = CacheCoordinatorBuilder::new()
        .with_config(config)
        .with_clock(clock.clone())
        .with_disk_directory(dir.path())
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build coordinator: {e}"));
    TestCache { cache, clock, dir }
}

/// Coordinator whose disk tier is `disk`
pub async fn setup_cache_with_disk(disk: Arc<dyn CacheTier>) -> (CacheCoordinator, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let cache = CacheCoordinatorBuilder::new()
        .with_config(small_config())
        .with_clock(clock.clone())
        .with_disk_tier(disk)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build coordinator: {e}"));
    (cache, clock)
}

/// Disk tier double that fails every write and never finds anything
#[derive(Debug, Default)]
pub struct FailingTier;

#[async_trait]
impl CacheTier for FailingTier {
    async fn lookup(&self, _key: &str) -> TierLookup {
        TierLookup::Miss
    }

    async fn store(&self, _entry: CacheEntry<serde_json::Value>) -> Result<()> {
        Err(std::io::Error::other("disk full").into())
    }

    async fn invalidate(&self, _key: &str) -> Result<()> {
        Err(std::io::Error::other("disk gone").into())
    }

    async fn invalidate_prefix(&self, _prefix: &str) -> Result<usize> {
        Ok(0)
    }

    async fn invalidate_all(&self) -> Result<()> {
        Ok(())
    }

    async fn evict_expired(&self) -> usize {
        0
    }

    fn stats(&self) -> TierStats {
        TierStats {
            name: "failing".into(),
            ..TierStats::default()
        }
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Disk tier double whose writes take `delay` to land
#[derive(Debug)]
pub struct SlowTier {
    inner: MemoryCache,
    delay: Duration,
    stores_started: AtomicU32,
}

impl SlowTier {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryCache::new(&small_config(), Arc::new(SystemClock)),
            delay,
            stores_started: AtomicU32::new(0),
        }
    }

    /// Number of writes that have begun
    pub fn stores_started(&self) -> u32 {
        self.stores_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheTier for SlowTier {
    async fn lookup(&self, key: &str) -> TierLookup {
        self.inner.lookup(key).await
    }

    async fn store(&self, entry: CacheEntry<serde_json::Value>) -> Result<()> {
        self.stores_started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.store(entry).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.inner.invalidate(key).await
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        self.inner.invalidate_prefix(prefix).await
    }

    async fn invalidate_all(&self) -> Result<()> {
        self.inner.invalidate_all().await
    }

    async fn evict_expired(&self) -> usize {
        self.inner.evict_expired().await
    }

    fn stats(&self) -> TierStats {
        TierStats {
            name: "slow".into(),
            ..self.inner.stats()
        }
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

/// Disk tier double holding a value of the wrong shape that it refuses to delete
#[derive(Debug, Default)]
pub struct UndecodableTier {
    pub invalidations: AtomicU32,
}

#[async_trait]
impl CacheTier for UndecodableTier {
    async fn lookup(&self, key: &str) -> TierLookup {
        TierLookup::Hit(CacheEntry::new(
            serde_json::json!({ "legacy": "shape" }),
            CacheMetadata::new(key, chrono::Utc::now(), Duration::from_secs(3_600), CacheSource::Disk, 20),
        ))
    }

    async fn store(&self, _entry: CacheEntry<serde_json::Value>) -> Result<()> {
        Ok(())
    }

    async fn invalidate(&self, _key: &str) -> Result<()> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Err(std::io::Error::other("read-only volume").into())
    }

    async fn invalidate_prefix(&self, _prefix: &str) -> Result<usize> {
        Ok(0)
    }

    async fn invalidate_all(&self) -> Result<()> {
        Ok(())
    }

    async fn evict_expired(&self) -> usize {
        0
    }

    fn stats(&self) -> TierStats {
        TierStats {
            name: "undecodable".into(),
            ..TierStats::default()
        }
    }

    fn name(&self) -> &'static str {
        "undecodable"
    }
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct OutOfStockRecord {
        pub id: u64,
        pub customer: String,
        pub product: String,
        pub quantity: u32,
    }

    impl OutOfStockRecord {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                customer: format!("Customer {}", id % 7),
                product: format!("Product {id}"),
                quantity: (id % 50) as u32 + 1,
            }
        }
    }

    /// One page of records
    pub fn page(page: u32, size: u32) -> Vec<OutOfStockRecord> {
        let start = u64::from(page) * u64::from(size);
        (start..start + u64::from(size)).map(OutOfStockRecord::new).collect()
    }

    /// Generate JSON test data with specified size
    pub fn json_data_sized(size_kb: usize) -> serde_json::Value {
        let data_string = "x".repeat(size_kb * 1024);
        serde_json::json!({
            "data": data_string,
            "size_kb": size_kb
        })
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::sleep;

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = test_key("user");
        let key2 = test_key("user");
        assert_ne!(key1, key2, "Keys should be unique");
        assert!(key1.starts_with("test_user_"));
    }

    #[test]
    fn test_page_generation() {
        let page = test_data::page(2, 10);
        assert_eq!(page.len(), 10);
        assert_eq!(page[0].id, 20);
    }
}
