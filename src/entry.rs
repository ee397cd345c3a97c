//! Cache entries and their freshness metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Fraction of the TTL after which an entry is served as stale
pub const DEFAULT_STALENESS_THRESHOLD: f64 = 0.5;

/// Where a cached value was produced or last stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// In-process memory tier
    Memory,
    /// Disk-persisted tier
    Disk,
    /// Authoritative source (fresh fetch)
    Network,
    /// Speculatively loaded by the predictive layer
    Prefetch,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Prefetch => "prefetch",
        };
        f.write_str(name)
    }
}

/// Provenance and freshness information for one cached value
///
/// Immutable once created; age, expiry and freshness ratio are derived from a
/// caller-supplied `now` rather than stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
    pub source: CacheSource,
    /// Approximate payload size (encoded bytes)
    pub size_bytes: usize,
    pub cache_key: String,
}

impl CacheMetadata {
    pub fn new(
        cache_key: impl Into<String>,
        cached_at: DateTime<Utc>,
        ttl: Duration,
        source: CacheSource,
        size_bytes: usize,
    ) -> Self {
        Self {
            cached_at,
            ttl,
            source,
            size_bytes,
            cache_key: cache_key.into(),
        }
    }

    /// Time elapsed since the value was cached (zero if `now` is earlier)
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.cached_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// `age / ttl`; infinite for a zero TTL
    pub fn freshness_ratio(&self, now: DateTime<Utc>) -> f64 {
        if self.ttl.is_zero() {
            return f64::INFINITY;
        }
        self.age(now).as_secs_f64() / self.ttl.as_secs_f64()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_zero() || self.age(now) > self.ttl
    }

    /// More than `threshold` of the TTL has elapsed
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: f64) -> bool {
        self.freshness_ratio(now) > threshold
    }

    /// Time left before expiry
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.ttl.saturating_sub(self.age(now))
    }

    /// Instant at which the entry expires
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.cached_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A cached payload together with its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub metadata: CacheMetadata,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, metadata: CacheMetadata) -> Self {
        Self { data, metadata }
    }

    pub fn key(&self) -> &str {
        &self.metadata.cache_key
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.is_expired(now)
    }

    /// Stale under the default half-TTL policy
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.metadata.is_stale(now, DEFAULT_STALENESS_THRESHOLD)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(self.data),
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(now: DateTime<Utc>, ttl_secs: u64) -> CacheMetadata {
        CacheMetadata::new("k", now, Duration::from_secs(ttl_secs), CacheSource::Network, 1)
    }

    #[test]
    fn test_freshness_boundaries() {
        let start = Utc::now();
        let meta = metadata(start, 300);
        let at = |secs: i64| start + chrono::TimeDelta::seconds(secs);

        assert!(!meta.is_stale(at(150), DEFAULT_STALENESS_THRESHOLD));
        assert!(meta.is_stale(at(151), DEFAULT_STALENESS_THRESHOLD));
        assert!(!meta.is_expired(at(300)));
        assert!(meta.is_expired(at(301)));
        assert_eq!(meta.remaining(at(200)), Duration::from_secs(100));
    }

    #[test]
    fn test_zero_ttl_is_expired() {
        let now = Utc::now();
        let meta = metadata(now, 0);
        assert!(meta.is_expired(now));
        assert!(meta.freshness_ratio(now).is_infinite());
    }

    #[test]
    fn test_clock_skew_counts_as_zero_age() {
        let now = Utc::now();
        let meta = metadata(now + chrono::TimeDelta::seconds(10), 60);
        assert_eq!(meta.age(now), Duration::ZERO);
        assert!(!meta.is_expired(now));
    }
}
