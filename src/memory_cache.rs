//! Memory Cache - In-process L1 tier
//!
//! Bounded by both entry count and approximate bytes. When an insert would
//! exceed either bound, entries are evicted until occupancy drops to the
//! configured target ratio (75% by default) so eviction does not run on every
//! insert once the cache is full.
//!
//! Expired entries are removed on read but handed back to the caller as
//! [`TierLookup::Expired`] so the coordinator can still serve them as a
//! fallback when the authoritative fetch fails.

use crate::clock::Clock;
use crate::config::{CacheConfig, EvictionPolicy, ScoreWeights};
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::stats::{Counter, TierStats};
use crate::traits::{CacheTier, TierLookup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Eviction priority of a memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Warm,
    /// Frequently accessed; evicted only after every warm entry
    Hot,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry<serde_json::Value>,
    /// Position in the recency order
    seq: u64,
    access_count: u64,
    last_access: DateTime<Utc>,
    priority: Priority,
}

impl Slot {
    fn cost(&self) -> usize {
        entry_cost(&self.entry)
    }
}

fn entry_cost(entry: &CacheEntry<serde_json::Value>) -> usize {
    entry.metadata.size_bytes + entry.key().len()
}

#[derive(Debug, Default)]
struct MemoryState {
    slots: HashMap<String, Slot>,
    /// seq -> key, oldest access first
    order: BTreeMap<u64, String>,
    next_seq: u64,
    bytes: usize,
    evictions: u64,
    expirations: u64,
    last_eviction_at: Option<DateTime<Utc>>,
}

impl MemoryState {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn touch(&mut self, key: &str, now: DateTime<Utc>) {
        let seq = self.bump_seq();
        if let Some(slot) = self.slots.get_mut(key) {
            self.order.remove(&slot.seq);
            slot.seq = seq;
            slot.access_count += 1;
            slot.last_access = now;
            self.order.insert(seq, key.to_owned());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.seq);
        self.bytes = self.bytes.saturating_sub(slot.cost());
        Some(slot)
    }
}

/// Bounded in-memory cache tier
///
/// **Features**:
/// - Count and byte bounds with hysteresis
/// - LRU or frequency/recency scored eviction
/// - Hot entries evicted last under either policy
/// - Expired entries returned once as fallback candidates
///
/// **Example**:
/// ```rust
/// use lopan_cache::{CacheConfig, MemoryCache, CacheTier, TierLookup};
/// use lopan_cache::clock::SystemClock;
/// use lopan_cache::entry::{CacheEntry, CacheMetadata, CacheSource};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> lopan_cache::error::Result<()> {
/// let clock = Arc::new(SystemClock);
/// let cache = MemoryCache::new(&CacheConfig::default(), clock.clone());
/// let meta = CacheMetadata::new("oos:list|pg:1", chrono::Utc::now(), Duration::from_secs(60), CacheSource::Memory, 2);
/// cache.store(CacheEntry::new(serde_json::json!([]), meta)).await?;
/// assert!(cache.lookup("oos:list|pg:1").await.is_hit());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    max_bytes: usize,
    policy: EvictionPolicy,
    weights: ScoreWeights,
    target_ratio: f64,
    hits: Counter,
    misses: Counter,
    sets: Counter,
}

impl MemoryCache {
    /// Create a memory tier sized from `config.budget`
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            max_entries = config.budget.max_memory_entries,
            max_bytes = config.budget.max_memory_bytes,
            policy = ?config.eviction_policy,
            "Initializing memory cache"
        );

        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            max_entries: config.budget.max_memory_entries.max(1),
            max_bytes: config.budget.max_memory_bytes.max(1),
            policy: config.eviction_policy,
            weights: config.score_weights,
            target_ratio: config.eviction_target_ratio,
            hits: Counter::default(),
            misses: Counter::default(),
            sets: Counter::default(),
        }
    }

    /// Number of entries currently held (expired ones included until read)
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }

    /// Approximate bytes held
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// True if a live entry exists; does not count as an access
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .slots
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired(now))
    }

    /// Read an entry without recording an access or removing it when expired
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<CacheEntry<serde_json::Value>> {
        self.state.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Change the eviction priority of a resident entry
    ///
    /// Returns `false` if the key is not resident.
    pub fn set_priority(&self, key: &str, priority: Priority) -> bool {
        let mut state = self.state.lock();
        match state.slots.get_mut(key) {
            Some(slot) => {
                slot.priority = priority;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn priority(&self, key: &str) -> Option<Priority> {
        self.state.lock().slots.get(key).map(|slot| slot.priority)
    }

    /// Number of resident hot entries
    #[must_use]
    pub fn hot_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| slot.priority == Priority::Hot)
            .count()
    }

    /// Make room for an entry of `incoming` bytes
    fn evict_for(&self, state: &mut MemoryState, incoming: usize, now: DateTime<Utc>) {
        let count_bound = state.slots.len() >= self.max_entries;
        let bytes_bound = state.bytes + incoming > self.max_bytes;
        if !count_bound && !bytes_bound {
            return;
        }

        let entry_goal = if count_bound {
            ((self.max_entries as f64 * self.target_ratio).floor() as usize).min(self.max_entries - 1)
        } else {
            self.max_entries - 1
        };
        let byte_room = self.max_bytes - incoming;
        let byte_goal = if bytes_bound {
            ((self.max_bytes as f64 * self.target_ratio).floor() as usize).min(byte_room)
        } else {
            byte_room
        };

        let mut evicted = 0usize;
        for key in self.victims(state, now) {
            if state.slots.len() <= entry_goal && state.bytes <= byte_goal {
                break;
            }
            if state.remove(&key).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            state.evictions += evicted as u64;
            state.last_eviction_at = Some(now);
            debug!(
                evicted,
                remaining = state.slots.len(),
                bytes = state.bytes,
                "[Memory] Evicted entries"
            );
        }
    }

    /// Eviction order: expired, then warm by policy, then hot by policy
    fn victims(&self, state: &MemoryState, now: DateTime<Utc>) -> Vec<String> {
        let mut ranked: Vec<(u8, f64, u64, &String)> = match self.policy {
            EvictionPolicy::Lru => state
                .order
                .iter()
                .filter_map(|(seq, key)| {
                    let slot = state.slots.get(key)?;
                    Some((band(slot, now), 0.0, *seq, key))
                })
                .collect(),
            EvictionPolicy::Scored => {
                let max_count = state
                    .slots
                    .values()
                    .map(|slot| slot.access_count)
                    .max()
                    .unwrap_or(0)
                    .max(1);
                state
                    .slots
                    .iter()
                    .map(|(key, slot)| (band(slot, now), self.score(slot, max_count, now), slot.seq, key))
                    .collect()
            }
        };

        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        ranked.into_iter().map(|(_, _, _, key)| key.clone()).collect()
    }

    /// Retention score; lower is evicted first
    fn score(&self, slot: &Slot, max_count: u64, now: DateTime<Utc>) -> f64 {
        let frequency = slot.access_count as f64 / max_count as f64;
        let since = (now - slot.last_access)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let horizon = self.weights.recency_horizon.as_secs_f64().max(f64::EPSILON);
        let recency = 1.0 - (since / horizon).min(1.0);
        self.weights.frequency * frequency + self.weights.recency * recency
    }
}

fn band(slot: &Slot, now: DateTime<Utc>) -> u8 {
    if slot.entry.is_expired(now) {
        0
    } else if slot.priority == Priority::Hot {
        2
    } else {
        1
    }
}

// ===== Trait Implementations =====

#[async_trait]
impl CacheTier for MemoryCache {
    async fn lookup(&self, key: &str) -> TierLookup {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let expired = match state.slots.get(key) {
            None => {
                self.misses.inc();
                return TierLookup::Miss;
            }
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            self.misses.inc();
            state.expirations += 1;
            return match state.remove(key) {
                Some(slot) => {
                    debug!(key = %key, "[Memory] Dropped expired entry on read");
                    TierLookup::Expired(slot.entry)
                }
                None => TierLookup::Miss,
            };
        }

        state.touch(key, now);
        self.hits.inc();
        match state.slots.get(key) {
            Some(slot) => TierLookup::Hit(slot.entry.clone()),
            None => TierLookup::Miss,
        }
    }

    async fn store(&self, entry: CacheEntry<serde_json::Value>) -> Result<()> {
        let now = self.clock.now();
        let cost = entry_cost(&entry);
        if cost > self.max_bytes {
            warn!(
                key = %entry.key(),
                size = cost,
                max_bytes = self.max_bytes,
                "[Memory] Entry larger than the whole memory budget, not caching"
            );
            return Ok(());
        }

        let key = entry.key().to_owned();
        let ttl_secs = entry.metadata.ttl.as_secs();
        let mut state = self.state.lock();

        // Overwrites keep the access history and priority of the old entry
        let previous = state.remove(&key);
        self.evict_for(&mut state, cost, now);

        let seq = state.bump_seq();
        let (access_count, priority) = previous
            .map(|slot| (slot.access_count, slot.priority))
            .unwrap_or_default();
        state.order.insert(seq, key.clone());
        state.bytes += cost;
        state.slots.insert(
            key.clone(),
            Slot {
                entry,
                seq,
                access_count,
                last_access: now,
                priority,
            },
        );
        self.sets.inc();
        debug!(key = %key, ttl_secs, "[Memory] Cached key with TTL");
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.state.lock().remove(key);
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .slots
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        Ok(keys.len())
    }

    async fn invalidate_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        let cleared = state.slots.len();
        state.slots.clear();
        state.order.clear();
        state.bytes = 0;
        info!(cleared, "[Memory] Cleared all entries");
        Ok(())
    }

    async fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        state.expirations += expired.len() as u64;
        if !expired.is_empty() {
            debug!(count = expired.len(), "[Memory] Cleaned up expired entries");
        }
        expired.len()
    }

    fn stats(&self) -> TierStats {
        let state = self.state.lock();
        TierStats {
            name: self.name().to_owned(),
            hits: self.hits.get(),
            misses: self.misses.get(),
            sets: self.sets.get(),
            entries: state.slots.len(),
            bytes: state.bytes as u64,
            evictions: state.evictions,
            expirations: state.expirations,
            corruptions: 0,
            last_eviction_at: state.last_eviction_at,
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
