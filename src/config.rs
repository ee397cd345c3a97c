//! Cache configuration
//!
//! Everything tunable lives here: per-tier TTL strategies, memory/disk budgets,
//! eviction policy and scoring weights, and the predictive layer thresholds.
//! The numeric defaults (half-TTL staleness, 75% eviction target, 0.7/0.3
//! frequency/recency weighting) are starting points, not invariants.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
const GIB: u64 = 1024 * 1024 * 1024;

/// Time-to-live for the memory and disk tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTtl {
    pub memory: Duration,
    pub disk: Duration,
}

impl TierTtl {
    pub const fn new(memory: Duration, disk: Duration) -> Self {
        Self { memory, disk }
    }

    /// Same TTL on both tiers
    pub const fn uniform(ttl: Duration) -> Self {
        Self::new(ttl, ttl)
    }
}

impl From<Duration> for TierTtl {
    fn from(ttl: Duration) -> Self {
        Self::uniform(ttl)
    }
}

impl Default for TierTtl {
    fn default() -> Self {
        CacheStrategy::Default.ttl()
    }
}

/// Cache strategies for different data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Rapidly changing data - 10 seconds in memory, 1 minute on disk
    RealTime,
    /// List screens - 5 minutes in memory, 1 day on disk
    ShortTerm,
    /// Reference data - 1 hour in memory, 3 days on disk
    MediumTerm,
    /// Rarely changing data - 3 hours in memory, 7 days on disk
    LongTerm,
    /// Custom per-tier TTL
    Custom(TierTtl),
    /// Default strategy (same as `ShortTerm`)
    Default,
}

impl CacheStrategy {
    /// Convert strategy to per-tier TTLs
    pub fn ttl(&self) -> TierTtl {
        match self {
            Self::RealTime => TierTtl::new(Duration::from_secs(10), Duration::from_secs(60)),
            Self::ShortTerm | Self::Default => {
                TierTtl::new(Duration::from_secs(300), Duration::from_secs(86_400))
            }
            Self::MediumTerm => {
                TierTtl::new(Duration::from_secs(3_600), Duration::from_secs(3 * 86_400))
            }
            Self::LongTerm => {
                TierTtl::new(Duration::from_secs(10_800), Duration::from_secs(7 * 86_400))
            }
            Self::Custom(ttl) => *ttl,
        }
    }
}

impl From<CacheStrategy> for TierTtl {
    fn from(strategy: CacheStrategy) -> Self {
        strategy.ttl()
    }
}

/// Eviction ordering for the memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently used first
    #[default]
    Lru,
    /// Lowest frequency/recency score first, hot entries last
    Scored,
}

/// Weights for the scored eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub frequency: f64,
    pub recency: f64,
    /// Recency decays linearly to zero over this horizon
    pub recency_horizon: Duration,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            frequency: 0.7,
            recency: 0.3,
            recency_horizon: Duration::from_secs(3_600),
        }
    }
}

/// Capacity limits for the memory and disk tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheBudget {
    pub max_memory_entries: usize,
    pub max_memory_bytes: usize,
    pub max_disk_bytes: u64,
}

impl CacheBudget {
    /// Size the cache from the amount of device memory
    ///
    /// Pure function intended to be called once at startup.
    pub fn for_device_memory(device_memory_bytes: u64) -> Self {
        let (entries, memory_mib) = match device_memory_bytes {
            b if b < 2 * GIB => (50, 8),
            b if b < 4 * GIB => (100, 16),
            b if b < 8 * GIB => (200, 32),
            _ => (400, 64),
        };
        Self {
            max_memory_entries: entries,
            max_memory_bytes: memory_mib * MIB,
            max_disk_bytes: (memory_mib * MIB * 4) as u64,
        }
    }
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self::for_device_memory(4 * GIB)
    }
}

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disk namespace; also the default directory name
    pub namespace: String,
    /// Explicit disk directory; `None` uses the platform cache directory
    pub disk_directory: Option<PathBuf>,
    pub budget: CacheBudget,
    pub eviction_policy: EvictionPolicy,
    pub score_weights: ScoreWeights,
    /// Fraction of TTL after which entries are served as stale
    pub staleness_threshold: f64,
    /// Eviction continues until occupancy is at or below this fraction of the cap
    pub eviction_target_ratio: f64,
    /// Capacity of the cache event broadcast channel
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "customer-out-of-stock".to_owned(),
            disk_directory: None,
            budget: CacheBudget::default(),
            eviction_policy: EvictionPolicy::Lru,
            score_weights: ScoreWeights::default(),
            staleness_threshold: crate::entry::DEFAULT_STALENESS_THRESHOLD,
            eviction_target_ratio: 0.75,
            event_capacity: 64,
        }
    }
}

impl CacheConfig {
    /// Check ranges and reject unusable settings
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CacheError::InvalidConfig(msg));

        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return invalid(format!(
                "namespace {:?} must be non-empty and contain only [A-Za-z0-9_-]",
                self.namespace
            ));
        }
        if self.budget.max_memory_entries == 0 || self.budget.max_memory_bytes == 0 {
            return invalid("memory budget must allow at least one entry and one byte".into());
        }
        if self.budget.max_disk_bytes == 0 {
            return invalid("disk budget must be non-zero".into());
        }
        if !(self.staleness_threshold > 0.0 && self.staleness_threshold <= 1.0) {
            return invalid(format!(
                "staleness_threshold {} must be in (0, 1]",
                self.staleness_threshold
            ));
        }
        if !(self.eviction_target_ratio > 0.0 && self.eviction_target_ratio < 1.0) {
            return invalid(format!(
                "eviction_target_ratio {} must be in (0, 1)",
                self.eviction_target_ratio
            ));
        }
        let weights = self.score_weights;
        if weights.frequency < 0.0 || weights.recency < 0.0 || weights.frequency + weights.recency <= 0.0
        {
            return invalid("score weights must be non-negative and not both zero".into());
        }
        if weights.recency_horizon.is_zero() {
            return invalid("recency_horizon must be non-zero".into());
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be non-zero".into());
        }
        Ok(())
    }

    /// Directory owned by the disk tier for this namespace
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CacheDirectoryNotFound`] if no directory was
    /// configured and the platform has no cache directory.
    pub fn resolve_disk_directory(&self) -> Result<PathBuf> {
        match &self.disk_directory {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .ok_or(CacheError::CacheDirectoryNotFound)
                .map(|dir| dir.join("lopan").join(&self.namespace)),
        }
    }
}

/// Settings for the predictive layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartConfig {
    /// When false the predictive layer is a pure pass-through
    pub enabled: bool,
    /// Accesses per minute at or above which adjacent pages are prefetched
    pub prefetch_frequency_threshold: f64,
    /// Accesses per minute at or above which a key is held in the hot set
    pub hot_frequency_threshold: f64,
    /// How many pages on each side of the current one to prefetch
    pub prefetch_distance: u32,
    pub max_concurrent_prefetches: usize,
    /// Number of inter-access intervals kept per key
    pub interval_window: usize,
    /// Patterns idle for longer than this are forgotten
    pub pattern_idle_timeout: Duration,
    pub max_tracked_patterns: usize,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefetch_frequency_threshold: 4.0,
            hot_frequency_threshold: 8.0,
            prefetch_distance: 2,
            max_concurrent_prefetches: 2,
            interval_window: 10,
            pattern_idle_timeout: Duration::from_secs(3_600),
            max_tracked_patterns: 1_024,
        }
    }
}
