//! Out-of-Stock Dashboard Example
//!
//! Simulates the customer out-of-stock screen: paging through a list, reading
//! the total count, going offline and recovering from cached values.
//!
//! Run with: cargo run --example out_of_stock_dashboard

use futures_util::FutureExt;
use lopan_cache::keys::{OutOfStockFilterCriteria, OutOfStockStatus};
use lopan_cache::{
    CacheConfig, CacheCoordinatorBuilder, CacheStrategy, CachedResult, Loader, OutOfStockCache,
    OutOfStockCacheService, SmartCache, SmartConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutOfStockRecord {
    id: u64,
    customer: String,
    product: String,
    quantity: u32,
}

/// Stand-in for the inventory API
struct InventoryApi {
    online: AtomicBool,
    calls: AtomicU32,
}

impl InventoryApi {
    async fn page(&self, criteria: OutOfStockFilterCriteria) -> anyhow::Result<Vec<OutOfStockRecord>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(40)).await;
        if !self.online.load(Ordering::Relaxed) {
            anyhow::bail!("inventory API unreachable");
        }
        let page = u64::from(criteria.page_number().unwrap_or(0));
        let size = u64::from(criteria.page_size_value().unwrap_or(10));
        Ok((page * size..(page + 1) * size)
            .map(|id| OutOfStockRecord {
                id,
                customer: criteria.customer_id().unwrap_or("all").to_owned(),
                product: format!("SKU-{id:05}"),
                quantity: (id % 12) as u32 + 1,
            })
            .collect())
    }

    async fn count(&self) -> anyhow::Result<u64> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !self.online.load(Ordering::Relaxed) {
            anyhow::bail!("inventory API unreachable");
        }
        Ok(137)
    }
}

fn describe<T>(label: &str, result: &CachedResult<T>, len: impl Fn(&T) -> String) {
    match result {
        CachedResult::Fresh { data, metadata } | CachedResult::Stale { data, metadata } => {
            println!(
                "  {label}: {} ({:?}, from {})",
                len(data),
                result.state(),
                metadata.source
            );
        }
        CachedResult::Error { error, fallback } => {
            let shown = fallback.as_ref().map_or_else(|| "nothing".to_owned(), &len);
            println!("  {label}: error '{error}', showing {shown}");
        }
        CachedResult::Loading | CachedResult::Fetching => println!("  {label}: {:?}", result.state()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!("=== Lopan Cache: Out-of-Stock Dashboard ===\n");

    let dir = std::env::temp_dir().join("lopan-cache-demo");
    let coordinator = CacheCoordinatorBuilder::new()
        .with_config(CacheConfig::default())
        .with_disk_directory(&dir)
        .build()
        .await?;
    coordinator.spawn_maintenance(Duration::from_secs(60));
    coordinator.invalidate_all().await;

    let smart = SmartCache::new(coordinator.clone(), SmartConfig::default());
    let service: OutOfStockCache<OutOfStockRecord> =
        OutOfStockCache::with_ttls(smart, CacheStrategy::ShortTerm, CacheStrategy::RealTime);

    let api = Arc::new(InventoryApi {
        online: AtomicBool::new(true),
        calls: AtomicU32::new(0),
    });
    let records: Loader<Vec<OutOfStockRecord>> = {
        let api = Arc::clone(&api);
        Arc::new(move |criteria: OutOfStockFilterCriteria| {
            let api = Arc::clone(&api);
            async move { api.page(criteria).await }.boxed()
        })
    };
    let count: Loader<u64> = {
        let api = Arc::clone(&api);
        Arc::new(move |_: OutOfStockFilterCriteria| {
            let api = Arc::clone(&api);
            async move { api.count().await }.boxed()
        })
    };

    let query = OutOfStockFilterCriteria::new()
        .customer("C-1042")
        .status(OutOfStockStatus::Pending)
        .page_size(10);
    let rows = |records: &Vec<OutOfStockRecord>| format!("{} rows", records.len());
    let total = |n: &u64| format!("{n} total");

    // 1. Page through the list; the next pages get prefetched
    println!("Paging through the list...");
    for page in 0..3 {
        let result = service.records(&query.clone().page(page), Arc::clone(&records)).await;
        describe(&format!("page {page}"), &result, rows);
    }
    let result = service.count(&query, Arc::clone(&count)).await;
    describe("count", &result, total);
    println!("  API calls so far: {}\n", api.calls.load(Ordering::Relaxed));

    // 2. Give prefetches a moment, then read ahead
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("Reading ahead...");
    let result = service.records(&query.clone().page(3), Arc::clone(&records)).await;
    describe("page 3", &result, rows);
    println!("  API calls so far: {}\n", api.calls.load(Ordering::Relaxed));

    // 3. Go offline: cached pages still render
    println!("Going offline...");
    api.online.store(false, Ordering::Relaxed);
    let result = service.records(&query.clone().page(1), Arc::clone(&records)).await;
    describe("page 1", &result, rows);
    let result = service.records(&query.clone().page(20), Arc::clone(&records)).await;
    describe("page 20", &result, rows);
    println!();

    // 4. A write elsewhere invalidates the lists
    api.online.store(true, Ordering::Relaxed);
    let removed = service.invalidate_lists().await;
    println!("Invalidated {removed} cached lists and counts\n");

    let stats = service.statistics();
    println!("=== Cache Statistics ===");
    println!("Total requests: {}", stats.coordinator.total_requests);
    println!("L1 hits: {}", stats.coordinator.l1_hits);
    println!("L2 hits: {}", stats.coordinator.l2_hits);
    println!("Misses: {}", stats.coordinator.misses);
    println!("Hit rate: {:.2}%", stats.coordinator.overall_hit_rate);
    println!("Prefetches issued: {}", stats.prefetches_issued);
    println!("Prefetch hits: {}", stats.prefetch_hits);
    println!("Hot keys: {}", stats.hot_keys);

    coordinator.shutdown();
    Ok(())
}
