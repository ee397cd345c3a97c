//! Cache Coordinator Builder
//!
//! Assembles a [`CacheCoordinator`] from configuration, a time source and an
//! optional custom disk tier.
//!
//! # Example: Default Tiers
//!
//! ```rust,no_run
//! use lopan_cache::CacheCoordinatorBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheCoordinatorBuilder::new()
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Disk Tier
//!
//! ```rust,ignore
//! use lopan_cache::CacheCoordinatorBuilder;
//! use std::sync::Arc;
//!
//! let cache = CacheCoordinatorBuilder::new()
//!     .with_disk_tier(Arc::new(MySqliteTier::new()))
//!     .build()
//!     .await?;
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::coordinator::CacheCoordinator;
use crate::disk_cache::DiskCache;
use crate::error::Result;
use crate::memory_cache::MemoryCache;
use crate::traits::CacheTier;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Builder for constructing a [`CacheCoordinator`]
///
/// # Default Behavior
///
/// - **Memory tier**: [`MemoryCache`] sized from `config.budget`
/// - **Disk tier**: JSON [`DiskCache`] in `config.resolve_disk_directory()`
/// - **Clock**: [`SystemClock`]
pub struct CacheCoordinatorBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    disk_tier: Option<Arc<dyn CacheTier>>,
}

impl CacheCoordinatorBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            clock: None,
            disk_tier: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific time source (a `ManualClock` in tests)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Store disk entries under `dir` instead of the platform cache directory
    pub fn with_disk_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.disk_directory = Some(dir.into());
        self
    }

    /// Configure a custom disk tier
    ///
    /// # Arguments
    ///
    /// * `tier` - Any type implementing [`CacheTier`]; the directory settings
    ///   in the configuration are then ignored
    pub fn with_disk_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.disk_tier = Some(tier);
        self
    }

    /// Build the coordinator
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the disk directory
    /// cannot be created.
    pub async fn build(self) -> Result<CacheCoordinator> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let memory = Arc::new(MemoryCache::new(&self.config, Arc::clone(&clock)));

        let disk: Arc<dyn CacheTier> = match self.disk_tier {
            Some(tier) => {
                info!(tier = tier.name(), "Using custom disk tier");
                tier
            }
            None => {
                let dir = self.config.resolve_disk_directory()?;
                Arc::new(DiskCache::open(dir, self.config.budget.max_disk_bytes, Arc::clone(&clock)).await?)
            }
        };

        CacheCoordinator::new(self.config, memory, disk, clock)
    }
}

impl Default for CacheCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
