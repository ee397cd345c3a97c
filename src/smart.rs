//! Smart Cache - Access-pattern tracking and predictive prefetch
//!
//! A decorator over [`CacheCoordinator`]. It watches how often each key is
//! read and whether list pages are walked in order, and uses that to:
//!
//! - prefetch neighbouring pages (N±1 up to `prefetch_distance`) into memory
//! - mark frequently read keys [`Priority::Hot`] so eviction takes them last
//!
//! Nothing here affects correctness. With `SmartConfig::enabled` false every
//! call goes straight to the coordinator.

use crate::config::{SmartConfig, TierTtl};
use crate::coordinator::CacheCoordinator;
use crate::entry::CacheSource;
use crate::keys::OutOfStockFilterCriteria;
use crate::memory_cache::Priority;
use crate::result::CachedResult;
use crate::stats::{Counter, SmartStatistics};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Loads the authoritative value for a set of criteria
pub type Loader<R> =
    Arc<dyn Fn(OutOfStockFilterCriteria) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Read history of a single key
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPattern {
    intervals: VecDeque<Duration>,
    window: usize,
    access_count: u64,
    last_access: DateTime<Utc>,
    sequential: bool,
}

impl AccessPattern {
    fn new(now: DateTime<Utc>, window: usize) -> Self {
        Self {
            intervals: VecDeque::with_capacity(window),
            window: window.max(1),
            access_count: 1,
            last_access: now,
            sequential: false,
        }
    }

    fn record(&mut self, now: DateTime<Utc>) {
        let interval = (now - self.last_access).to_std().unwrap_or_default();
        if self.intervals.len() == self.window {
            self.intervals.pop_front();
        }
        self.intervals.push_back(interval);
        self.access_count += 1;
        self.last_access = now;
    }

    /// Accesses per minute over the rolling window; zero until the second access
    pub fn frequency(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let total: Duration = self.intervals.iter().sum();
        let mean = total.as_secs_f64() / self.intervals.len() as f64;
        // Bursts within the same millisecond count as very frequent, not infinite
        60.0 / mean.max(0.001)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }

    /// The previous read in the same query family was an adjacent page
    pub fn is_sequential(&self) -> bool {
        self.sequential
    }
}

#[derive(Debug, Default)]
struct PatternTable {
    keys: HashMap<String, AccessPattern>,
    /// family key -> (last page read, when)
    families: HashMap<String, (u32, DateTime<Utc>)>,
}

/// Outcome of recording one access
#[derive(Debug, Clone, Copy)]
struct Access {
    frequency: f64,
    sequential: bool,
}

struct SmartInner {
    coordinator: CacheCoordinator,
    config: SmartConfig,
    patterns: Mutex<PatternTable>,
    permits: Arc<Semaphore>,
    prefetches_issued: Counter,
    prefetches_skipped: Counter,
    prefetch_hits: Counter,
}

/// Predictive decorator over a [`CacheCoordinator`]
///
/// # Example
///
/// ```rust,no_run
/// use lopan_cache::{CacheCoordinatorBuilder, SmartCache, SmartConfig, CacheStrategy, Loader};
/// use lopan_cache::keys::OutOfStockFilterCriteria;
/// use futures_util::FutureExt;
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let coordinator = CacheCoordinatorBuilder::new().build().await?;
/// let smart = SmartCache::new(coordinator, SmartConfig::default());
///
/// let loader: Loader<Vec<String>> = Arc::new(|criteria: OutOfStockFilterCriteria| {
///     async move { Ok(vec![format!("page {:?}", criteria.page_number())]) }.boxed()
/// });
/// let page = smart
///     .get_page(&OutOfStockFilterCriteria::new().page(1), CacheStrategy::ShortTerm, loader)
///     .await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SmartCache {
    inner: Arc<SmartInner>,
}

impl std::fmt::Debug for SmartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartCache")
            .field("config", &self.inner.config)
            .field("tracked_patterns", &self.inner.patterns.lock().keys.len())
            .finish_non_exhaustive()
    }
}

impl SmartCache {
    pub fn new(coordinator: CacheCoordinator, config: SmartConfig) -> Self {
        debug!(enabled = config.enabled, "Initializing smart cache layer");
        Self {
            inner: Arc::new(SmartInner {
                coordinator,
                permits: Arc::new(Semaphore::new(config.max_concurrent_prefetches.max(1))),
                config,
                patterns: Mutex::new(PatternTable::default()),
                prefetches_issued: Counter::default(),
                prefetches_skipped: Counter::default(),
                prefetch_hits: Counter::default(),
            }),
        }
    }

    /// Underlying coordinator
    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.inner.coordinator
    }

    pub fn config(&self) -> &SmartConfig {
        &self.inner.config
    }

    /// Read a key through the coordinator, tracking its access pattern
    pub async fn get<T, F, Fut>(&self, key: &str, ttl: impl Into<TierTtl>, fetch: F) -> CachedResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if !self.inner.config.enabled {
            return self.inner.coordinator.get(key, ttl, fetch).await;
        }
        let access = self.record_access(key, None);
        let result = self.inner.coordinator.get(key, ttl, fetch).await;
        self.after_read(key, &result, access);
        result
    }

    /// Read one page of a list query, prefetching its neighbours when the
    /// query is being paged through or read often
    ///
    /// # Arguments
    ///
    /// * `criteria` - Query; its list key identifies the page
    /// * `ttl` - Per-tier TTLs, also used for prefetched pages
    /// * `loader` - Authoritative source, called with the criteria of each page it loads
    pub async fn get_page<T>(
        &self,
        criteria: &OutOfStockFilterCriteria,
        ttl: impl Into<TierTtl>,
        loader: Loader<T>,
    ) -> CachedResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let ttl = ttl.into();
        let key = criteria.list_key();
        let fetch = {
            let loader = Arc::clone(&loader);
            let criteria = criteria.clone();
            move || loader(criteria)
        };

        if !self.inner.config.enabled {
            return self.inner.coordinator.get(&key, ttl, fetch).await;
        }

        let access = self.record_access(&key, Some(criteria));
        let result = self.inner.coordinator.get(&key, ttl, fetch).await;
        self.after_read(&key, &result, access);

        let wants_prefetch = access.sequential
            || access.frequency >= self.inner.config.prefetch_frequency_threshold;
        if wants_prefetch && (result.is_fresh() || result.is_stale()) {
            self.prefetch_neighbours(criteria, ttl, &loader);
        }
        result
    }

    /// Current pattern for a key, if tracked
    pub fn pattern(&self, key: &str) -> Option<AccessPattern> {
        self.inner.patterns.lock().keys.get(key).cloned()
    }

    /// Forget patterns idle for longer than `pattern_idle_timeout`
    ///
    /// Returns how many were dropped. Dropped keys lose their hot status.
    pub fn prune_idle(&self) -> usize {
        let now = self.inner.coordinator.now();
        let idle = self.inner.config.pattern_idle_timeout;
        let dropped: Vec<String> = {
            let mut table = self.inner.patterns.lock();
            let dropped: Vec<String> = table
                .keys
                .iter()
                .filter(|(_, pattern)| is_idle(pattern.last_access, now, idle))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &dropped {
                table.keys.remove(key);
            }
            table.families.retain(|_, (_, at)| !is_idle(*at, now, idle));
            dropped
        };
        for key in &dropped {
            self.inner.coordinator.set_priority(key, Priority::Warm);
        }
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "[Smart] Pruned idle access patterns");
        }
        dropped.len()
    }

    pub fn statistics(&self) -> SmartStatistics {
        let inner = &self.inner;
        let coordinator = inner.coordinator.statistics();
        SmartStatistics {
            tracked_patterns: inner.patterns.lock().keys.len(),
            hot_keys: inner.coordinator.memory().hot_count(),
            prefetches_issued: inner.prefetches_issued.get(),
            prefetches_skipped: inner.prefetches_skipped.get(),
            prefetch_hits: inner.prefetch_hits.get(),
            coordinator,
        }
    }

    fn record_access(&self, key: &str, criteria: Option<&OutOfStockFilterCriteria>) -> Access {
        let now = self.inner.coordinator.now();
        let config = &self.inner.config;
        let (access, over_capacity) = {
            let mut table = self.inner.patterns.lock();

            let sequential = match criteria.and_then(|c| c.page_number().map(|page| (c, page))) {
                Some((criteria, page)) => {
                    let family = criteria.family_key().into_string();
                    let previous = table.families.insert(family, (page, now));
                    previous.is_some_and(|(last, _)| last.abs_diff(page) == 1)
                }
                None => false,
            };

            let pattern = table
                .keys
                .entry(key.to_owned())
                .and_modify(|pattern| pattern.record(now))
                .or_insert_with(|| AccessPattern::new(now, config.interval_window));
            pattern.sequential = sequential;
            let access = Access {
                frequency: pattern.frequency(),
                sequential,
            };
            trace!(key = %key, frequency = access.frequency, sequential, "[Smart] Recorded access");

            (access, table.keys.len() > config.max_tracked_patterns)
        };

        if over_capacity {
            self.prune_idle();
            self.trim_to_capacity();
        }
        access
    }

    /// Drop least recently used patterns beyond `max_tracked_patterns`
    fn trim_to_capacity(&self) {
        let cap = self.inner.config.max_tracked_patterns;
        let mut table = self.inner.patterns.lock();
        let excess = table.keys.len().saturating_sub(cap);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(DateTime<Utc>, String)> = table
            .keys
            .iter()
            .map(|(key, pattern)| (pattern.last_access, key.clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(excess) {
            table.keys.remove(&key);
        }
    }

    fn after_read<T>(&self, key: &str, result: &CachedResult<T>, access: Access) {
        if result
            .metadata()
            .is_some_and(|meta| meta.source == CacheSource::Prefetch)
        {
            self.inner.prefetch_hits.inc();
        }

        let priority = if access.frequency >= self.inner.config.hot_frequency_threshold {
            Priority::Hot
        } else {
            Priority::Warm
        };
        if self.inner.coordinator.memory().priority(key).is_some_and(|p| p != priority)
            && self.inner.coordinator.set_priority(key, priority)
        {
            debug!(key = %key, ?priority, frequency = access.frequency, "[Smart] Changed key priority");
        }
    }

    fn prefetch_neighbours<T>(&self, criteria: &OutOfStockFilterCriteria, ttl: TierTtl, loader: &Loader<T>)
    where
        T: Serialize + Send + 'static,
    {
        let Some(page) = criteria.page_number() else {
            return;
        };

        for distance in 1..=self.inner.config.prefetch_distance {
            for neighbour in [page.checked_add(distance), page.checked_sub(distance)]
                .into_iter()
                .flatten()
            {
                let next = criteria.clone().page(neighbour);
                let key = next.list_key();
                if self.inner.coordinator.memory().contains(&key) {
                    continue;
                }

                let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                    self.inner.prefetches_skipped.inc();
                    trace!(key = %key, "[Smart] Prefetch skipped, no permit");
                    continue;
                };

                self.inner.prefetches_issued.inc();
                let coordinator = self.inner.coordinator.clone();
                let loader = Arc::clone(loader);
                tokio::spawn(async move {
                    let _permit = permit;
                    let loaded = coordinator
                        .prefetch(&key, ttl, move || loader(next))
                        .await;
                    trace!(key = %key, loaded, "[Smart] Prefetch finished");
                });
            }
        }
    }
}

fn is_idle(last: DateTime<Utc>, now: DateTime<Utc>, idle: Duration) -> bool {
    (now - last).to_std().unwrap_or_default() > idle
}
