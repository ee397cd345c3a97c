//! Cache Coordinator - Read-through orchestration over the memory and disk tiers
//!
//! Read path for a key:
//!
//! ```text
//! memory ── hit ──▶ Fresh / Stale (+ background refresh)
//!   │ miss / expired (kept as fallback)
//!   ▼
//! disk ──── hit ──▶ promote to memory ──▶ Fresh / Stale
//!   │ miss / expired (kept as fallback)
//!   ▼
//! fetch (single-flight) ──▶ write back to both tiers ──▶ Fresh
//!   │ failure
//!   ▼
//! Error { fallback: newest expired copy, if any }
//! ```
//!
//! Concurrent misses for the same key share one fetch. The fetch runs in its
//! own task so it completes (and is written back) even if every caller that
//! asked for it has gone away. An invalidation while a fetch is in flight
//! detaches it: callers still receive its result but it is not written back.
//!
//! Compound writes to a key (write-back, `set`, invalidation, promotion) run
//! under a per-key async lock, so the memory and disk writes of one never
//! interleave with another. Prefix and full invalidation wait for every key
//! lock to be released.

use crate::clock::Clock;
use crate::config::{CacheConfig, TierTtl};
use crate::entry::{CacheEntry, CacheMetadata, CacheSource};
use crate::error::{CacheError, Result};
use crate::memory_cache::{Priority, MemoryCache};
use crate::result::CachedResult;
use crate::stats::{CacheStatistics, CoordinatorCounters, percentage};
use crate::traits::{CacheTier, TierLookup};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock, RwLockReadGuard, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type FetchOutcome = std::result::Result<CacheEntry<serde_json::Value>, Arc<anyhow::Error>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

const HEALTH_CHECK_KEY: &str = "__lopan_cache_health_check__";

/// Notification published on the coordinator's event channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// A fetch completed and its value was written back
    Refreshed { key: String },
    /// A fetch failed; cached values (if any) were left untouched
    RefreshFailed { key: String, error: String },
    Invalidated { key: String },
    PrefixInvalidated { prefix: String },
    Cleared,
}

/// Where a completed fetch is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteBack {
    AllTiers,
    /// Speculative loads stay out of the disk tier
    MemoryOnly,
}

struct InFlight {
    id: u64,
    fut: SharedFetch,
    /// Raised when a caller that wants the value on disk joins a memory-only flight
    persist: Arc<AtomicBool>,
}

/// Removes the in-flight entry for a fetch when it finishes, unless it has
/// already been detached or replaced
struct InFlightGuard<'a> {
    map: &'a DashMap<String, InFlight>,
    key: &'a str,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove_if(self.key, |_, in_flight| in_flight.id == self.id);
    }
}

type KeyLocks = DashMap<String, Arc<AsyncMutex<()>>>;

/// Exclusive access to one key's tier contents
///
/// The lock map entry is dropped with the last holder.
struct KeyLock<'a> {
    locks: &'a KeyLocks,
    key: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
    _scope: RwLockReadGuard<'a, ()>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// What the tiers had for a key
enum TierRead<T> {
    Found {
        data: T,
        metadata: CacheMetadata,
        stale: bool,
    },
    Missing {
        fallback: Option<T>,
        had_copy: bool,
    },
}

struct Inner {
    memory: Arc<MemoryCache>,
    disk: Arc<dyn CacheTier>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    in_flight: DashMap<String, InFlight>,
    next_fetch_id: AtomicU64,
    key_locks: KeyLocks,
    /// Held for reading by every key lock, for writing by bulk invalidation
    scope: RwLock<()>,
    /// Keys that have held a value at some point
    history: DashSet<String>,
    events: broadcast::Sender<CacheEvent>,
    counters: CoordinatorCounters,
    live: AtomicBool,
    maintenance: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Multi-tier stale-while-revalidate cache
///
/// Cheap to clone; clones share the same tiers, in-flight fetches and
/// statistics.
///
/// # Example
///
/// ```rust,no_run
/// use lopan_cache::{CacheCoordinatorBuilder, CacheStrategy};
///
/// # async fn example() -> lopan_cache::error::Result<()> {
/// let cache = CacheCoordinatorBuilder::new().build().await?;
///
/// let result = cache
///     .get("oos:count|c:C1", CacheStrategy::ShortTerm, || async {
///         Ok::<u64, anyhow::Error>(42)
///     })
///     .await;
/// assert_eq!(result.value(), Some(&42));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("namespace", &self.inner.config.namespace)
            .field("memory_entries", &self.inner.memory.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl CacheCoordinator {
    /// Assemble a coordinator from already constructed tiers
    ///
    /// Most callers should use [`CacheCoordinatorBuilder`](crate::CacheCoordinatorBuilder).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: CacheConfig,
        memory: Arc<MemoryCache>,
        disk: Arc<dyn CacheTier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        info!(
            namespace = %config.namespace,
            memory_tier = memory.name(),
            disk_tier = disk.name(),
            "Cache coordinator initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                memory,
                disk,
                clock,
                config,
                in_flight: DashMap::new(),
                next_fetch_id: AtomicU64::new(1),
                key_locks: DashMap::new(),
                scope: RwLock::new(()),
                history: DashSet::new(),
                events,
                counters: CoordinatorCounters::default(),
                live: AtomicBool::new(true),
                maintenance: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Read through both tiers, fetching from the authoritative source on a miss
    ///
    /// A stale hit is returned immediately and `fetch` runs in the background.
    /// On a miss the caller waits for the fetch; concurrent callers for the
    /// same key share it.
    ///
    /// # Arguments
    ///
    /// * `key` - Cache key
    /// * `ttl` - Per-tier TTLs (a [`CacheStrategy`](crate::CacheStrategy) converts)
    /// * `fetch` - Loads the authoritative value; only called on a miss or stale hit
    ///
    /// # Returns
    ///
    /// `Fresh` or `Stale` with data, or `Error` carrying the newest expired
    /// copy as a fallback. Never `Loading` or `Fetching`.
    pub async fn get<T, F, Fut>(&self, key: &str, ttl: impl Into<TierTtl>, fetch: F) -> CachedResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ttl = ttl.into();

        match self.inner.read_tiers::<T>(key, ttl).await {
            TierRead::Found {
                data,
                metadata,
                stale,
            } => self.found(key, ttl, fetch, data, metadata, stale),
            TierRead::Missing { fallback, .. } => {
                let (fut, _) = self.inner.start_fetch(key, ttl, fetch, WriteBack::AllTiers);
                match fut.await {
                    Ok(entry) => match decode::<T>(&entry.data) {
                        Ok(data) => CachedResult::Fresh {
                            data,
                            metadata: entry.metadata,
                        },
                        Err(e) => CachedResult::Error {
                            error: Arc::new(anyhow::Error::new(e).context("decoding fetched value")),
                            fallback,
                        },
                    },
                    Err(error) => CachedResult::Error { error, fallback },
                }
            }
        }
    }

    /// Non-blocking read: like [`get`](Self::get) but never waits for a fetch
    ///
    /// On a miss the fetch is started in the background and the call returns
    /// `Loading` (no value has ever been stored for the key) or `Fetching`
    /// (a value existed before, even if it has since expired or been invalidated).
    /// Subscribe to [`events`](Self::subscribe) to learn when it lands.
    pub async fn get_or_schedule<T, F, Fut>(
        &self,
        key: &str,
        ttl: impl Into<TierTtl>,
        fetch: F,
    ) -> CachedResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ttl = ttl.into();

        match self.inner.read_tiers::<T>(key, ttl).await {
            TierRead::Found {
                data,
                metadata,
                stale,
            } => self.found(key, ttl, fetch, data, metadata, stale),
            TierRead::Missing { had_copy, .. } => {
                self.inner.start_fetch(key, ttl, fetch, WriteBack::AllTiers);
                if had_copy || self.inner.history.contains(key) {
                    CachedResult::Fetching
                } else {
                    CachedResult::Loading
                }
            }
        }
    }

    fn found<T, F, Fut>(
        &self,
        key: &str,
        ttl: TierTtl,
        fetch: F,
        data: T,
        metadata: CacheMetadata,
        stale: bool,
    ) -> CachedResult<T>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if !stale {
            return CachedResult::Fresh { data, metadata };
        }

        self.inner.counters.stale_served.inc();
        let (_, leader) = self.inner.start_fetch(key, ttl, fetch, WriteBack::AllTiers);
        if leader {
            self.inner.counters.background_refreshes.inc();
            debug!(key = %key, "Serving stale value, refreshing in background");
        }
        CachedResult::Stale { data, metadata }
    }

    /// Write a value to both tiers, replacing whatever is cached
    ///
    /// Detaches any in-flight fetch for the key so it cannot overwrite this
    /// value. Tier write failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Json`] if `value` cannot be serialized.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: impl Into<TierTtl>) -> Result<()> {
        let ttl = ttl.into();
        let (data, size) = encode(value)?;

        let _lock = self.inner.lock_key(key).await;
        self.inner.in_flight.remove(key);
        let now = self.inner.clock.now();
        let entry = CacheEntry::new(data, CacheMetadata::new(key, now, ttl.memory, CacheSource::Memory, size));
        self.inner.write_back(&entry, ttl, WriteBack::AllTiers).await;
        Ok(())
    }

    /// Remove a key from both tiers and detach its in-flight fetch
    pub async fn invalidate(&self, key: &str) {
        let inner = &self.inner;
        let lock = inner.lock_key(key).await;
        inner.in_flight.remove(key);
        if let Err(e) = inner.memory.invalidate(key).await {
            warn!(key = %key, error = %e, "Memory invalidation failed");
        }
        if let Err(e) = inner.disk.invalidate(key).await {
            warn!(key = %key, error = %e, "Disk invalidation failed");
        }
        drop(lock);
        debug!(key = %key, "Invalidated key");
        inner.publish(CacheEvent::Invalidated { key: key.to_owned() });
    }

    /// Remove every key starting with `prefix` from both tiers
    ///
    /// # Returns
    ///
    /// The larger of the per-tier removal counts.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let inner = &self.inner;
        let scope = inner.scope.write().await;
        inner.in_flight.retain(|key, _| !key.starts_with(prefix));

        let memory = inner.memory.invalidate_prefix(prefix).await.unwrap_or_else(|e| {
            warn!(prefix = %prefix, error = %e, "Memory prefix invalidation failed");
            0
        });
        let disk = inner.disk.invalidate_prefix(prefix).await.unwrap_or_else(|e| {
            warn!(prefix = %prefix, error = %e, "Disk prefix invalidation failed");
            0
        });
        drop(scope);

        info!(prefix = %prefix, memory, disk, "Invalidated keys by prefix");
        inner.publish(CacheEvent::PrefixInvalidated {
            prefix: prefix.to_owned(),
        });
        memory.max(disk)
    }

    /// Empty both tiers and forget key history
    pub async fn invalidate_all(&self) {
        let inner = &self.inner;
        let scope = inner.scope.write().await;
        inner.in_flight.clear();
        inner.history.clear();
        if let Err(e) = inner.memory.invalidate_all().await {
            warn!(error = %e, "Memory clear failed");
        }
        if let Err(e) = inner.disk.invalidate_all().await {
            warn!(error = %e, "Disk clear failed");
        }
        drop(scope);
        info!("Cleared all cache tiers");
        inner.publish(CacheEvent::Cleared);
    }

    /// Load a key into memory ahead of demand
    ///
    /// Skipped when the key is already resident or being fetched. The loaded
    /// entry is tagged [`CacheSource::Prefetch`] and not written to disk.
    ///
    /// # Returns
    ///
    /// `true` if this call loaded the value.
    pub async fn prefetch<T, F, Fut>(&self, key: &str, ttl: impl Into<TierTtl>, fetch: F) -> bool
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.inner.memory.contains(key) || self.inner.in_flight.contains_key(key) {
            return false;
        }
        let (fut, leader) = self.inner.start_fetch(key, ttl.into(), fetch, WriteBack::MemoryOnly);
        if !leader {
            return false;
        }
        self.inner.counters.prefetches.inc();
        fut.await.is_ok()
    }

    /// Change the eviction priority of a resident memory entry
    pub fn set_priority(&self, key: &str, priority: Priority) -> bool {
        self.inner.memory.set_priority(key, priority)
    }

    /// True if either tier holds a live entry for `key`
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.memory.contains(key) || self.inner.disk.lookup(key).await.is_hit()
    }

    /// Remove expired entries from both tiers
    pub async fn evict_expired(&self) -> usize {
        self.inner.evict_expired().await
    }

    /// Run [`evict_expired`](Self::evict_expired) every `interval` until shutdown
    ///
    /// Replaces any previously started maintenance task.
    pub fn spawn_maintenance(&self, interval: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.live.load(Ordering::Acquire) {
                    break;
                }
                let removed = inner.evict_expired().await;
                if removed > 0 {
                    debug!(removed, "Maintenance pass removed expired entries");
                }
            }
        });
        if let Some(previous) = self.inner.maintenance.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Receive [`CacheEvent`]s published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Round-trip a probe entry through both tiers
    pub async fn health_check(&self) -> bool {
        let inner = &self.inner;
        let now = inner.clock.now();
        let probe = CacheEntry::new(
            serde_json::json!("ok"),
            CacheMetadata::new(HEALTH_CHECK_KEY, now, Duration::from_secs(60), CacheSource::Memory, 4),
        );

        let mut healthy = true;
        for tier in [Arc::clone(&inner.memory) as Arc<dyn CacheTier>, Arc::clone(&inner.disk)] {
            let ok = tier.store(probe.clone()).await.is_ok()
                && matches!(tier.lookup(HEALTH_CHECK_KEY).await, TierLookup::Hit(ref e) if e.data == probe.data);
            let _ = tier.invalidate(HEALTH_CHECK_KEY).await;
            if !ok {
                warn!(tier = tier.name(), "Health check failed");
            }
            healthy &= ok;
        }
        healthy
    }

    /// Stop background work; in-flight fetches still resolve for their
    /// callers but are no longer written back
    pub fn shutdown(&self) {
        self.inner.live.store(false, Ordering::Release);
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
        self.inner.in_flight.clear();
        info!(namespace = %self.inner.config.namespace, "Cache coordinator shut down");
    }

    /// Number of fetches currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Memory tier handle
    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.inner.memory
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Get comprehensive cache statistics
    pub fn statistics(&self) -> CacheStatistics {
        let inner = &self.inner;
        let c = &inner.counters;
        let l1 = inner.memory.stats();
        let l2 = inner.disk.stats();

        let total = c.requests.get();
        let l1_hits = c.l1_hits.get();
        let l2_hits = c.l2_hits.get();
        let last_eviction_at = match (l1.last_eviction_at, l2.last_eviction_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        CacheStatistics {
            total_requests: total,
            l1_hits,
            l2_hits,
            misses: c.misses.get(),
            l1_hit_rate: percentage(l1_hits, total),
            l2_hit_rate: percentage(l2_hits, total.saturating_sub(l1_hits)),
            overall_hit_rate: percentage(l1_hits + l2_hits, total),
            stale_served: c.stale_served.get(),
            fetches: c.fetches.get(),
            fetch_failures: c.fetch_failures.get(),
            coalesced_requests: c.coalesced.get(),
            background_refreshes: c.background_refreshes.get(),
            promotions: c.promotions.get(),
            prefetches: c.prefetches.get(),
            in_flight: inner.in_flight.len(),
            total_evictions: l1.evictions + l2.evictions,
            last_eviction_at,
            memory_usage_bytes: l1.bytes,
            l1,
            l2,
        }
    }
}

impl Inner {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn publish(&self, event: CacheEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }

    async fn lock_key<'a>(&'a self, key: &'a str) -> KeyLock<'a> {
        let scope = self.scope.read().await;
        let lock = Arc::clone(self.key_locks.entry(key.to_owned()).or_default().value());
        let guard = lock.lock_owned().await;
        KeyLock {
            locks: &self.key_locks,
            key,
            guard: Some(guard),
            _scope: scope,
        }
    }

    async fn read_tiers<T: DeserializeOwned>(&self, key: &str, ttl: TierTtl) -> TierRead<T> {
        self.counters.requests.inc();
        let threshold = self.config.staleness_threshold;
        let mut fallback: Option<CacheEntry<serde_json::Value>> = None;

        match self.memory.lookup(key).await {
            TierLookup::Hit(entry) => match decode::<T>(&entry.data) {
                Ok(data) => {
                    self.counters.l1_hits.inc();
                    let stale = entry.metadata.is_stale(self.clock.now(), threshold);
                    return TierRead::Found {
                        data,
                        metadata: entry.metadata,
                        stale,
                    };
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Memory entry does not decode, dropping");
                    if let Err(e) = self.memory.invalidate(key).await {
                        warn!(key = %key, error = %e, "Failed to drop undecodable memory entry");
                    }
                }
            },
            TierLookup::Expired(entry) => fallback = Some(entry),
            TierLookup::Miss => {}
        }

        // Promotion writes memory from disk; hold the key so an invalidation
        // cannot land between the disk read and the memory write
        let _lock = self.lock_key(key).await;
        match self.disk.lookup(key).await {
            TierLookup::Hit(entry) => match decode::<T>(&entry.data) {
                Ok(data) => {
                    self.counters.l2_hits.inc();
                    self.history.insert(key.to_owned());
                    let now = self.clock.now();
                    let stale = entry.metadata.is_stale(now, threshold);
                    self.promote(&entry, ttl, now).await;
                    return TierRead::Found {
                        data,
                        metadata: entry.metadata,
                        stale,
                    };
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Disk entry does not decode, dropping");
                    if let Err(e) = self.disk.invalidate(key).await {
                        warn!(key = %key, error = %e, "Failed to drop undecodable disk entry");
                    }
                }
            },
            TierLookup::Expired(entry) => {
                let newer = fallback
                    .as_ref()
                    .is_none_or(|current| entry.metadata.cached_at > current.metadata.cached_at);
                if newer {
                    fallback = Some(entry);
                }
            }
            TierLookup::Miss => {}
        }

        self.counters.misses.inc();
        let had_copy = fallback.is_some();
        if had_copy {
            self.history.insert(key.to_owned());
        }
        TierRead::Missing {
            fallback: fallback.and_then(|entry| decode::<T>(&entry.data).ok()),
            had_copy,
        }
    }

    /// Copy a disk hit into memory without extending its lifetime
    async fn promote(&self, entry: &CacheEntry<serde_json::Value>, ttl: TierTtl, now: DateTime<Utc>) {
        if !self.is_live() {
            return;
        }
        let promoted_ttl = ttl.memory.min(entry.metadata.remaining(now));
        if promoted_ttl.is_zero() {
            return;
        }
        let promoted = CacheEntry::new(
            entry.data.clone(),
            CacheMetadata::new(
                entry.key(),
                now,
                promoted_ttl,
                CacheSource::Disk,
                entry.metadata.size_bytes,
            ),
        );
        match self.memory.store(promoted).await {
            Ok(()) => {
                self.counters.promotions.inc();
                debug!(key = %entry.key(), ttl_secs = promoted_ttl.as_secs(), "Promoted disk entry to memory");
            }
            Err(e) => warn!(key = %entry.key(), error = %e, "Failed to promote disk entry"),
        }
    }

    /// Join the in-flight fetch for `key` or start a new one
    ///
    /// Returns the shared fetch and whether this call started it.
    fn start_fetch<T, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: TierTtl,
        fetch: F,
        mode: WriteBack,
    ) -> (SharedFetch, bool)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let fut = match self.in_flight.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                self.counters.coalesced.inc();
                let in_flight = occupied.get();
                if mode == WriteBack::AllTiers {
                    in_flight.persist.store(true, Ordering::Release);
                }
                return (in_flight.fut.clone(), false);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let persist = Arc::new(AtomicBool::new(mode == WriteBack::AllTiers));
                let inner = Arc::clone(self);
                let owned_key = key.to_owned();
                let flag = Arc::clone(&persist);
                let fut = async move { inner.run_fetch(id, owned_key, ttl, fetch, flag).await }
                    .boxed()
                    .shared();
                vacant.insert(InFlight {
                    id,
                    fut: fut.clone(),
                    persist,
                });
                fut
            }
        };

        // Drive the fetch independently of the callers awaiting it
        tokio::spawn(fut.clone());
        (fut, true)
    }

    async fn run_fetch<T, F, Fut>(
        self: Arc<Self>,
        id: u64,
        key: String,
        ttl: TierTtl,
        fetch: F,
        persist: Arc<AtomicBool>,
    ) -> FetchOutcome
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let _guard = InFlightGuard {
            map: &self.in_flight,
            key: &key,
            id,
        };
        self.counters.fetches.inc();
        debug!(key = %key, fetch_id = id, "Fetching from authoritative source");

        let fetched = match AssertUnwindSafe(fetch()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("fetch for {key} panicked")),
        };
        let outcome = fetched.and_then(|value| {
            let (data, size) = encode(&value)?;
            let now = self.clock.now();
            Ok(CacheEntry::new(
                data,
                CacheMetadata::new(key.as_str(), now, ttl.memory, CacheSource::Network, size),
            ))
        });

        match outcome {
            Ok(entry) => {
                let _lock = self.lock_key(&key).await;
                let current = self
                    .in_flight
                    .get(&key)
                    .is_some_and(|in_flight| in_flight.id == id);
                if current && self.is_live() {
                    let mode = if persist.load(Ordering::Acquire) {
                        WriteBack::AllTiers
                    } else {
                        WriteBack::MemoryOnly
                    };
                    self.write_back(&entry, ttl, mode).await;

                    // Joiners raise `persist` under the map's shard lock, so
                    // after retiring the flight the flag is final
                    self.in_flight.remove_if(&key, |_, in_flight| in_flight.id == id);
                    if mode == WriteBack::MemoryOnly && persist.load(Ordering::Acquire) {
                        self.write_disk(&entry, ttl).await;
                    }
                    self.publish(CacheEvent::Refreshed { key: key.clone() });
                } else {
                    debug!(key = %key, fetch_id = id, "Fetch detached, skipping write-back");
                }
                Ok(entry)
            }
            Err(e) => {
                self.counters.fetch_failures.inc();
                warn!(key = %key, error = %e, "Fetch failed");
                self.publish(CacheEvent::RefreshFailed {
                    key: key.clone(),
                    error: format!("{e:#}"),
                });
                Err(Arc::new(e))
            }
        }
    }

    /// Store a value in memory (and disk, for `AllTiers`), absorbing tier errors
    async fn write_back(&self, entry: &CacheEntry<serde_json::Value>, ttl: TierTtl, mode: WriteBack) {
        if !self.is_live() {
            return;
        }
        self.history.insert(entry.metadata.cache_key.clone());
        let meta = &entry.metadata;
        let memory_source = match mode {
            WriteBack::AllTiers => CacheSource::Memory,
            WriteBack::MemoryOnly => CacheSource::Prefetch,
        };

        let memory_entry = CacheEntry::new(
            entry.data.clone(),
            CacheMetadata::new(meta.cache_key.as_str(), meta.cached_at, ttl.memory, memory_source, meta.size_bytes),
        );
        if let Err(e) = self.memory.store(memory_entry).await {
            warn!(key = %meta.cache_key, error = %e, "Memory write-back failed");
        }

        if mode == WriteBack::AllTiers {
            self.write_disk(entry, ttl).await;
        }
    }

    async fn write_disk(&self, entry: &CacheEntry<serde_json::Value>, ttl: TierTtl) {
        let meta = &entry.metadata;
        let disk_entry = CacheEntry::new(
            entry.data.clone(),
            CacheMetadata::new(meta.cache_key.as_str(), meta.cached_at, ttl.disk, CacheSource::Disk, meta.size_bytes),
        );
        if let Err(e) = self.disk.store(disk_entry).await {
            warn!(key = %meta.cache_key, error = %e, "Disk write-back failed, continuing with memory only");
        }
    }

    async fn evict_expired(&self) -> usize {
        self.memory.evict_expired().await + self.disk.evict_expired().await
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> std::result::Result<(serde_json::Value, usize), CacheError> {
    let data = serde_json::to_value(value)?;
    let size = serde_json::to_vec(&data)?.len();
    Ok((data, size))
}

fn decode<T: DeserializeOwned>(data: &serde_json::Value) -> serde_json::Result<T> {
    T::deserialize(data)
}
