//! Cache Tier Traits
//!
//! This module defines the seams of the cache:
//!
//! - `CacheTier`: storage tier the coordinator reads through and writes back to
//! - `TierLookup`: what a tier found for a key (live, expired, or nothing)
//! - `CacheCodec`: pluggable serialization for persisted entries
//!
//! The memory and disk tiers are the production implementations. Tests inject
//! their own `CacheTier` to simulate failing or slow storage.
//!
//! # Example: Custom Tier
//!
//! ```rust,ignore
//! use lopan_cache::{CacheTier, TierLookup, CacheEntry, TierStats, async_trait};
//! use lopan_cache::error::Result;
//!
//! struct MyTier { /* ... */ }
//!
//! #[async_trait]
//! impl CacheTier for MyTier {
//!     async fn lookup(&self, key: &str) -> TierLookup { TierLookup::Miss }
//!     async fn store(&self, entry: CacheEntry<serde_json::Value>) -> Result<()> { Ok(()) }
//!     async fn invalidate(&self, key: &str) -> Result<()> { Ok(()) }
//!     async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> { Ok(0) }
//!     async fn invalidate_all(&self) -> Result<()> { Ok(()) }
//!     async fn evict_expired(&self) -> usize { 0 }
//!     fn stats(&self) -> TierStats { TierStats::default() }
//! }
//! ```

use crate::entry::CacheEntry;
use crate::error::Result;
use crate::stats::TierStats;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Result of looking a key up in one tier
#[derive(Debug, Clone, PartialEq)]
pub enum TierLookup {
    /// Live (non-expired) entry
    Hit(CacheEntry<serde_json::Value>),
    /// Entry exists but its TTL has elapsed; absent as far as the tier is
    /// concerned, handed back so the coordinator can use it as a fallback
    Expired(CacheEntry<serde_json::Value>),
    /// Nothing stored, or the stored entry was unreadable
    Miss,
}

impl TierLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Trait for cache value serialization/deserialization
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access
/// across async tasks and provide debugging capabilities.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Codec name for logging
    fn name(&self) -> &'static str;
}

/// One level of the cache hierarchy
///
/// # Required Operations
///
/// - `lookup`: classify the stored entry for a key
/// - `store`: insert or overwrite an entry (key taken from its metadata)
/// - `invalidate` / `invalidate_prefix` / `invalidate_all`: explicit removal
/// - `evict_expired`: idempotent maintenance pass
/// - `stats`: counters snapshot
///
/// # Failure Semantics
///
/// A tier must fail soft: unreadable data is reported as `Miss`, never as an
/// error. Errors from mutating operations are logged by the coordinator and
/// otherwise ignored.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn lookup(&self, key: &str) -> TierLookup;

    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    async fn store(&self, entry: CacheEntry<serde_json::Value>) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the backing storage could not be updated.
    async fn invalidate(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`, returning how many were removed
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage could not be updated.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize>;

    /// # Errors
    ///
    /// Returns an error if the backing storage could not be reset.
    async fn invalidate_all(&self) -> Result<()>;

    /// Remove expired entries, returning how many were removed
    async fn evict_expired(&self) -> usize;

    fn stats(&self) -> TierStats;

    /// Tier name for logging and statistics
    fn name(&self) -> &'static str {
        "unknown"
    }
}
