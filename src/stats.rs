//! Cache statistics
//!
//! Counters are for diagnostics and adaptive sizing only; nothing in the read
//! or write path depends on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one tier's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub entries: usize,
    /// Approximate bytes held by the tier
    pub bytes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
    pub last_eviction_at: Option<DateTime<Utc>>,
}

impl TierStats {
    /// Hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        percentage(self.hits, self.hits + self.misses)
    }
}

/// Aggregate statistics exposed by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub total_requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    /// Requests that missed both tiers and went to the authoritative source
    pub misses: u64,
    /// L1 hits over all requests (percentage)
    pub l1_hit_rate: f64,
    /// L2 hits over requests that reached L2 (percentage)
    pub l2_hit_rate: f64,
    /// Hits on either tier over all requests (percentage)
    pub overall_hit_rate: f64,
    pub stale_served: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    /// Callers that attached to an already in-flight fetch
    pub coalesced_requests: u64,
    pub background_refreshes: u64,
    pub promotions: u64,
    pub prefetches: u64,
    pub in_flight: usize,
    pub total_evictions: u64,
    pub last_eviction_at: Option<DateTime<Utc>>,
    pub memory_usage_bytes: u64,
    pub l1: TierStats,
    pub l2: TierStats,
}

/// Statistics for the predictive layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmartStatistics {
    pub tracked_patterns: usize,
    pub hot_keys: usize,
    pub prefetches_issued: u64,
    pub prefetches_skipped: u64,
    /// Reads served from an entry the predictive layer loaded
    pub prefetch_hits: u64,
    pub coordinator: CacheStatistics,
}

pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

/// Relaxed monotonically increasing counter
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Coordinator-level counters
#[derive(Debug, Default)]
pub(crate) struct CoordinatorCounters {
    pub(crate) requests: Counter,
    pub(crate) l1_hits: Counter,
    pub(crate) l2_hits: Counter,
    pub(crate) misses: Counter,
    pub(crate) stale_served: Counter,
    pub(crate) fetches: Counter,
    pub(crate) fetch_failures: Counter,
    pub(crate) coalesced: Counter,
    pub(crate) background_refreshes: Counter,
    pub(crate) promotions: Counter,
    pub(crate) prefetches: Counter,
}
