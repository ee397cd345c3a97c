//! Disk Cache - Persistent L2 tier
//!
//! One file per key under a directory owned by the cache. Writes go to a
//! temporary file that is synced and then renamed over the target, so a crash
//! leaves either the old entry or the new one, never a torn file.
//!
//! An in-memory index (size, expiry, last access) is rebuilt from the
//! directory on open and drives budget eviction: expired entries go first,
//! longest expired first, then least recently used.
//!
//! Expired files are not deleted on read. They stay available as fallback
//! values until [`CacheTier::evict_expired`] or budget pressure removes them.

use crate::clock::Clock;
use crate::codecs::JsonCodec;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::stats::{Counter, TierStats};
use crate::traits::{CacheCodec, CacheTier, TierLookup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";
/// Escaped names longer than this are replaced by a digest
const MAX_FILE_STEM: usize = 150;

#[derive(Debug, Clone)]
struct IndexEntry {
    size: u64,
    cached_at: DateTime<Utc>,
    ttl: Duration,
    last_access: DateTime<Utc>,
}

impl IndexEntry {
    fn from_entry(entry: &CacheEntry<serde_json::Value>, size: u64, last_access: DateTime<Utc>) -> Self {
        Self {
            size,
            cached_at: entry.metadata.cached_at,
            ttl: entry.metadata.ttl,
            last_access,
        }
    }

    fn expires_at(&self) -> DateTime<Utc> {
        chrono::TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.cached_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_zero() || now > self.expires_at()
    }
}

#[derive(Debug, Default)]
struct DiskIndex {
    entries: HashMap<String, IndexEntry>,
    total_bytes: u64,
    evictions: u64,
    expirations: u64,
    last_eviction_at: Option<DateTime<Utc>>,
}

impl DiskIndex {
    fn insert(&mut self, key: String, entry: IndexEntry) {
        self.total_bytes += entry.size;
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size);
        }
    }

    fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        let old = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(old.size);
        Some(old)
    }

    /// Keys to delete so that `incoming` more bytes fit under `max_bytes`
    fn victims_for(&mut self, incoming: u64, max_bytes: u64, now: DateTime<Utc>) -> Vec<String> {
        if self.total_bytes + incoming <= max_bytes {
            return Vec::new();
        }
        let goal = max_bytes.saturating_sub(incoming);

        let mut ranked: Vec<(bool, DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                if entry.is_expired(now) {
                    (false, entry.expires_at(), key.clone())
                } else {
                    (true, entry.last_access, key.clone())
                }
            })
            .collect();
        // Expired (false) before live; oldest expiry / access first
        ranked.sort();

        let mut victims = Vec::new();
        for (_, _, key) in ranked {
            if self.total_bytes <= goal {
                break;
            }
            if self.remove(&key).is_some() {
                victims.push(key);
            }
        }
        if !victims.is_empty() {
            self.evictions += victims.len() as u64;
            self.last_eviction_at = Some(now);
        }
        victims
    }
}

/// File-backed cache tier
///
/// **Features**:
/// - Atomic writes (temp file, fsync, rename)
/// - Byte budget with expired-first, then LRU eviction
/// - Index rebuilt on open; corrupt and partial files are removed
/// - Pluggable serialization via [`CacheCodec`]
///
/// **Example**:
/// ```rust,no_run
/// use lopan_cache::{DiskCache, CacheTier};
/// use lopan_cache::clock::SystemClock;
/// use std::sync::Arc;
///
/// # async fn example() -> lopan_cache::error::Result<()> {
/// let disk = DiskCache::open("/tmp/oos-cache", 64 * 1024 * 1024, Arc::new(SystemClock)).await?;
/// let _ = disk.lookup("oos:list|pg:1").await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DiskCache<C: CacheCodec = JsonCodec> {
    dir: PathBuf,
    codec: C,
    clock: Arc<dyn Clock>,
    max_bytes: u64,
    index: Mutex<DiskIndex>,
    hits: Counter,
    misses: Counter,
    sets: Counter,
    corruptions: Counter,
}

impl DiskCache<JsonCodec> {
    /// Open (or create) a JSON-encoded disk tier at `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub async fn open(dir: impl AsRef<Path>, max_bytes: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_codec(dir, max_bytes, JsonCodec, clock).await
    }
}

impl<C: CacheCodec> DiskCache<C> {
    /// Open (or create) a disk tier with a specific codec
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory owned exclusively by this cache
    /// * `max_bytes` - Budget for the sum of entry file sizes
    /// * `codec` - Encoding of entry files
    /// * `clock` - Time source for expiry and access tracking
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub async fn with_codec(
        dir: impl AsRef<Path>,
        max_bytes: u64,
        codec: C,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let cache = Self {
            dir,
            codec,
            clock,
            max_bytes: max_bytes.max(1),
            index: Mutex::new(DiskIndex::default()),
            hits: Counter::default(),
            misses: Counter::default(),
            sets: Counter::default(),
            corruptions: Counter::default(),
        };
        cache.rebuild_index().await?;

        let over_budget = {
            let now = cache.clock.now();
            cache.index.lock().victims_for(0, cache.max_bytes, now)
        };
        cache.delete_files(&over_budget).await;

        let (entries, bytes) = {
            let index = cache.index.lock();
            (index.entries.len(), index.total_bytes)
        };
        info!(
            dir = ?cache.dir,
            entries,
            bytes,
            max_bytes = cache.max_bytes,
            codec = cache.codec.name(),
            "Initialized disk cache"
        );
        Ok(cache)
    }

    /// Directory holding the entry files
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Path of the file that stores `key`
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXTENSION}", file_stem(key)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.lock().entries.is_empty()
    }

    /// Sum of indexed entry file sizes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    async fn rebuild_index(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut rebuilt = DiskIndex::default();
        let mut removed = 0usize;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with('.') && name.ends_with(TEMP_EXTENSION) {
                // Left behind by an interrupted write
                remove_quietly(&path).await;
                removed += 1;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }

            let decoded = match tokio::fs::read(&path).await {
                Ok(bytes) => self
                    .codec
                    .deserialize::<CacheEntry<serde_json::Value>>(&bytes)
                    .ok()
                    .map(|entry| (entry, bytes.len() as u64)),
                Err(e) => {
                    warn!(path = ?path, error = %e, "[Disk] Unreadable entry during index rebuild");
                    None
                }
            };

            match decoded {
                Some((entry, size)) if self.file_path(entry.key()) == path => {
                    let last_access = item
                        .metadata()
                        .await
                        .and_then(|m| m.modified())
                        .map(DateTime::<Utc>::from)
                        .unwrap_or(entry.metadata.cached_at);
                    let key = entry.key().to_owned();
                    rebuilt.insert(key, IndexEntry::from_entry(&entry, size, last_access));
                }
                _ => {
                    self.corruptions.inc();
                    remove_quietly(&path).await;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            warn!(removed, "[Disk] Removed corrupt or partial files during index rebuild");
        }
        *self.index.lock() = rebuilt;
        Ok(())
    }

    async fn delete_files(&self, keys: &[String]) {
        for key in keys {
            remove_quietly(&self.file_path(key)).await;
        }
        if !keys.is_empty() {
            debug!(count = keys.len(), "[Disk] Evicted entries to stay within budget");
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(ENTRY_EXTENSION);
        let tmp = self
            .dir
            .join(format!(".{stem}.{}.{TEMP_EXTENSION}", uuid::Uuid::new_v4().simple()));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Treat an unreadable file as absent and delete it
    async fn discard_corrupt(&self, key: &str, path: &Path, reason: &str) {
        self.corruptions.inc();
        warn!(key = %key, reason, "[Disk] Discarding corrupt entry");
        self.index.lock().remove(key);
        remove_quietly(path).await;
    }
}

// ===== Trait Implementations =====

#[async_trait]
impl<C: CacheCodec + 'static> CacheTier for DiskCache<C> {
    async fn lookup(&self, key: &str) -> TierLookup {
        let path = self.file_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "[Disk] Read failed");
                }
                self.index.lock().remove(key);
                self.misses.inc();
                return TierLookup::Miss;
            }
        };

        let entry: CacheEntry<serde_json::Value> = match self.codec.deserialize(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.discard_corrupt(key, &path, &e.to_string()).await;
                self.misses.inc();
                return TierLookup::Miss;
            }
        };

        if entry.key() != key {
            // Digest collision or a foreign file; leave it for its owner
            warn!(key = %key, stored = %entry.key(), "[Disk] Stored key does not match");
            self.misses.inc();
            return TierLookup::Miss;
        }

        let now = self.clock.now();
        if entry.is_expired(now) {
            self.misses.inc();
            trace!(key = %key, "[Disk] Found expired entry");
            return TierLookup::Expired(entry);
        }

        {
            let mut index = self.index.lock();
            match index.entries.get_mut(key) {
                Some(indexed) => indexed.last_access = now,
                None => index.insert(
                    key.to_owned(),
                    IndexEntry::from_entry(&entry, bytes.len() as u64, now),
                ),
            }
        }
        self.hits.inc();
        TierLookup::Hit(entry)
    }

    async fn store(&self, entry: CacheEntry<serde_json::Value>) -> Result<()> {
        let bytes = self.codec.serialize(&entry)?;
        let size = bytes.len() as u64;
        let key = entry.key().to_owned();
        if size > self.max_bytes {
            warn!(
                key = %key,
                size,
                max_bytes = self.max_bytes,
                "[Disk] Entry larger than the whole disk budget, not caching"
            );
            return Ok(());
        }

        let now = self.clock.now();
        let victims = {
            let mut index = self.index.lock();
            index.remove(&key);
            index.victims_for(size, self.max_bytes, now)
        };
        self.delete_files(&victims).await;

        let path = self.file_path(&key);
        self.write_atomic(&path, &bytes).await?;

        self.index
            .lock()
            .insert(key.clone(), IndexEntry::from_entry(&entry, size, now));
        self.sets.inc();
        debug!(key = %key, ttl_secs = entry.metadata.ttl.as_secs(), size, "[Disk] Cached key with TTL");
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.index.lock().remove(key);
        match tokio::fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let keys: Vec<String> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            for key in &keys {
                index.remove(key);
            }
            keys
        };
        for key in &keys {
            remove_quietly(&self.file_path(key)).await;
        }
        Ok(keys.len())
    }

    async fn invalidate_all(&self) -> Result<()> {
        *self.index.lock() = DiskIndex::default();
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        info!(dir = ?self.dir, "[Disk] Cleared all entries");
        Ok(())
    }

    async fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let mut index = self.index.lock();
            let expired: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                index.remove(key);
            }
            index.expirations += expired.len() as u64;
            expired
        };
        for key in &expired {
            remove_quietly(&self.file_path(key)).await;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "[Disk] Cleaned up expired entries");
        }
        expired.len()
    }

    fn stats(&self) -> TierStats {
        let index = self.index.lock();
        TierStats {
            name: self.name().to_owned(),
            hits: self.hits.get(),
            misses: self.misses.get(),
            sets: self.sets.get(),
            entries: index.entries.len(),
            bytes: index.total_bytes,
            evictions: index.evictions,
            expirations: index.expirations,
            corruptions: self.corruptions.get(),
            last_eviction_at: index.last_eviction_at,
        }
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}

/// File stem for a key: percent-escaped, or a SHA-256 digest when the escaped
/// form is too long or would be a hidden file
fn file_stem(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }

    if escaped.is_empty() || escaped.len() > MAX_FILE_STEM || escaped.starts_with('.') {
        let digest = Sha256::digest(key.as_bytes());
        let mut hashed = String::with_capacity(2 + digest.len() * 2);
        hashed.push_str("h-");
        for byte in digest {
            let _ = write!(hashed, "{byte:02x}");
        }
        return hashed;
    }
    escaped
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "[Disk] Failed to remove file");
        }
    }
}
