//! Lopan Cache
//!
//! Multi-tier stale-while-revalidate cache for the customer out-of-stock read path:
//! - **L1 Cache**: Bounded in-memory tier with LRU or frequency/recency scored eviction
//! - **L2 Cache**: Disk-persisted tier with atomic writes and a byte budget
//! - **Stale-While-Revalidate**: Aging data is served at once while a refresh runs
//! - **Single-Flight Fetches**: Concurrent misses for a key share one upstream call
//! - **Predictive Prefetch**: Adjacent list pages loaded ahead of demand
//! - **Comprehensive Statistics**: Hit rates, evictions, promotions, in-flight tracking
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use lopan_cache::{CacheCoordinatorBuilder, CacheStrategy, CachedResult};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheCoordinatorBuilder::new()
//!         .with_disk_directory("/tmp/lopan-cache")
//!         .build()
//!         .await?;
//!
//!     let result = cache
//!         .get("oos:count|c:C1", CacheStrategy::ShortTerm, || async {
//!             // Query the authoritative store here
//!             Ok::<u64, anyhow::Error>(17)
//!         })
//!         .await;
//!
//!     match result {
//!         CachedResult::Fresh { data, .. } | CachedResult::Stale { data, .. } => {
//!             tracing::info!("Out of stock: {}", data);
//!         }
//!         CachedResult::Error { error, fallback } => {
//!             tracing::warn!("Fetch failed: {error}, fallback: {fallback:?}");
//!         }
//!         CachedResult::Loading | CachedResult::Fetching => {}
//!     }
//!
//!     let stats = cache.statistics();
//!     tracing::info!("Hit rate: {:.2}%", stats.overall_hit_rate);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → L1 (memory) → L2 (disk) → Fetch (single-flight)
//!           ↓ Hit          ↓ Hit        ↓ Success
//!           Fresh/Stale    Promote      Store in L2 + L1
//!                          to L1        ↓ Failure
//!                                       Error + expired fallback
//! ```
//!
//! Stale hits (more than half the TTL elapsed) are returned immediately and
//! refreshed in the background. [`SmartCache`] layers access-pattern tracking
//! and prefetch on top of [`CacheCoordinator`]; [`OutOfStockCache`] is the
//! service the application uses.

pub mod builder;
pub mod clock;
pub mod codecs;
pub mod config;
pub mod coordinator;
pub mod disk_cache;
pub mod entry;
pub mod error;
pub mod keys;
pub mod memory_cache;
pub mod result;
pub mod service;
pub mod smart;
pub mod stats;
pub mod traits;

pub use builder::CacheCoordinatorBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codecs::JsonCodec;
pub use config::{
    CacheBudget, CacheConfig, CacheStrategy, EvictionPolicy, ScoreWeights, SmartConfig, TierTtl,
};
pub use coordinator::{CacheCoordinator, CacheEvent};
pub use disk_cache::DiskCache;
pub use entry::{CacheEntry, CacheMetadata, CacheSource};
pub use error::CacheError;
pub use keys::{CacheKey, OutOfStockFilterCriteria, OutOfStockStatus, SortOrder};
pub use memory_cache::{MemoryCache, Priority};
pub use result::{CacheState, CachedResult};
pub use service::{OutOfStockCache, OutOfStockCacheService};
pub use smart::{AccessPattern, Loader, SmartCache};
pub use stats::{CacheStatistics, SmartStatistics, TierStats};
pub use traits::{CacheCodec, CacheTier, TierLookup};

// Re-export async_trait for custom tier implementations
pub use async_trait::async_trait;
