//! Out-of-Stock Cache Service
//!
//! The boundary the application talks to. [`OutOfStockCacheService`] is the
//! trait callers depend on; [`OutOfStockCache`] is the production
//! implementation over [`SmartCache`]. Tests substitute their own
//! implementation of the trait.

use crate::config::{CacheStrategy, TierTtl};
use crate::error::Result;
use crate::keys::{COUNT_NAMESPACE, LIST_NAMESPACE, OutOfStockFilterCriteria};
use crate::result::CachedResult;
use crate::smart::{Loader, SmartCache};
use crate::stats::SmartStatistics;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tracing::debug;

/// Cached access to out-of-stock records and counts
///
/// `T` is the record type; the cache treats it as an opaque serializable value.
#[async_trait]
pub trait OutOfStockCacheService<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// One page of records matching `criteria`
    async fn records(
        &self,
        criteria: &OutOfStockFilterCriteria,
        loader: Loader<Vec<T>>,
    ) -> CachedResult<Vec<T>>;

    /// Total number of records matching the filters of `criteria`
    async fn count(&self, criteria: &OutOfStockFilterCriteria, loader: Loader<u64>) -> CachedResult<u64>;

    /// Overwrite the cached page for `criteria`
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be serialized.
    async fn store_records(&self, criteria: &OutOfStockFilterCriteria, records: &[T]) -> Result<()>;

    /// Overwrite the cached count for `criteria`
    ///
    /// # Errors
    ///
    /// Returns an error if the count cannot be serialized.
    async fn store_count(&self, criteria: &OutOfStockFilterCriteria, count: u64) -> Result<()>;

    /// Drop the cached page and count for `criteria`
    async fn invalidate(&self, criteria: &OutOfStockFilterCriteria);

    /// Drop every cached page and count, returning how many keys were removed
    async fn invalidate_lists(&self) -> usize;

    async fn invalidate_all(&self);

    fn statistics(&self) -> SmartStatistics;
}

/// Production [`OutOfStockCacheService`]
pub struct OutOfStockCache<T> {
    smart: SmartCache,
    list_ttl: TierTtl,
    count_ttl: TierTtl,
    _records: PhantomData<fn() -> T>,
}

impl<T> OutOfStockCache<T> {
    /// Lists and counts both use the short-term strategy
    pub fn new(smart: SmartCache) -> Self {
        Self::with_ttls(smart, CacheStrategy::ShortTerm, CacheStrategy::ShortTerm)
    }

    pub fn with_ttls(smart: SmartCache, list_ttl: impl Into<TierTtl>, count_ttl: impl Into<TierTtl>) -> Self {
        Self {
            smart,
            list_ttl: list_ttl.into(),
            count_ttl: count_ttl.into(),
            _records: PhantomData,
        }
    }

    pub fn smart(&self) -> &SmartCache {
        &self.smart
    }
}

impl<T> Clone for OutOfStockCache<T> {
    fn clone(&self) -> Self {
        Self {
            smart: self.smart.clone(),
            list_ttl: self.list_ttl,
            count_ttl: self.count_ttl,
            _records: PhantomData,
        }
    }
}

// ===== Trait Implementations =====

#[async_trait]
impl<T> OutOfStockCacheService<T> for OutOfStockCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn records(
        &self,
        criteria: &OutOfStockFilterCriteria,
        loader: Loader<Vec<T>>,
    ) -> CachedResult<Vec<T>> {
        self.smart.get_page(criteria, self.list_ttl, loader).await
    }

    async fn count(&self, criteria: &OutOfStockFilterCriteria, loader: Loader<u64>) -> CachedResult<u64> {
        let key = criteria.count_key();
        let criteria = criteria.clone();
        self.smart
            .get(&key, self.count_ttl, move || loader(criteria))
            .await
    }

    async fn store_records(&self, criteria: &OutOfStockFilterCriteria, records: &[T]) -> Result<()> {
        self.smart
            .coordinator()
            .set(&criteria.list_key(), &records, self.list_ttl)
            .await
    }

    async fn store_count(&self, criteria: &OutOfStockFilterCriteria, count: u64) -> Result<()> {
        self.smart
            .coordinator()
            .set(&criteria.count_key(), &count, self.count_ttl)
            .await
    }

    async fn invalidate(&self, criteria: &OutOfStockFilterCriteria) {
        let coordinator = self.smart.coordinator();
        coordinator.invalidate(&criteria.list_key()).await;
        coordinator.invalidate(&criteria.count_key()).await;
    }

    async fn invalidate_lists(&self) -> usize {
        let coordinator = self.smart.coordinator();
        let lists = coordinator.invalidate_prefix(LIST_NAMESPACE).await;
        let counts = coordinator.invalidate_prefix(COUNT_NAMESPACE).await;
        debug!(lists, counts, "Invalidated out-of-stock lists and counts");
        lists + counts
    }

    async fn invalidate_all(&self) {
        self.smart.coordinator().invalidate_all().await;
    }

    fn statistics(&self) -> SmartStatistics {
        self.smart.statistics()
    }
}
