//! Result envelope for cache reads
//!
//! `CachedResult` tells the caller not just *what* it got but *why*: fresh data,
//! usable-but-aging data with a refresh under way, nothing yet, or a failure
//! that still carries the last known good value.

use crate::entry::CacheMetadata;
use std::sync::Arc;

/// Outcome of a cache read
#[derive(Debug, Clone)]
pub enum CachedResult<T> {
    /// Within the staleness window
    Fresh { data: T, metadata: CacheMetadata },
    /// Past the staleness threshold; a background refresh was triggered
    Stale { data: T, metadata: CacheMetadata },
    /// No value has ever been cached for this key; first fetch in progress
    Loading,
    /// Cache missed but the key has history; fetch in progress
    Fetching,
    /// The authoritative fetch failed
    Error {
        error: Arc<anyhow::Error>,
        fallback: Option<T>,
    },
}

/// Discriminant of a [`CachedResult`], useful for assertions and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    Fresh,
    Stale,
    Loading,
    Fetching,
    Error,
}

impl<T> CachedResult<T> {
    pub fn state(&self) -> CacheState {
        match self {
            Self::Fresh { .. } => CacheState::Fresh,
            Self::Stale { .. } => CacheState::Stale,
            Self::Loading => CacheState::Loading,
            Self::Fetching => CacheState::Fetching,
            Self::Error { .. } => CacheState::Error,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// True while a fetch is outstanding and nothing can be shown yet
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Loading | Self::Fetching)
    }

    /// Best value available: fresh, stale, or the error fallback
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Fresh { data, .. } | Self::Stale { data, .. } => Some(data),
            Self::Error { fallback, .. } => fallback.as_ref(),
            Self::Loading | Self::Fetching => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Fresh { data, .. } | Self::Stale { data, .. } => Some(data),
            Self::Error { fallback, .. } => fallback,
            Self::Loading | Self::Fetching => None,
        }
    }

    pub fn metadata(&self) -> Option<&CacheMetadata> {
        match self {
            Self::Fresh { metadata, .. } | Self::Stale { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Error { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CachedResult<U> {
        match self {
            Self::Fresh { data, metadata } => CachedResult::Fresh {
                data: f(data),
                metadata,
            },
            Self::Stale { data, metadata } => CachedResult::Stale {
                data: f(data),
                metadata,
            },
            Self::Loading => CachedResult::Loading,
            Self::Fetching => CachedResult::Fetching,
            Self::Error { error, fallback } => CachedResult::Error {
                error,
                fallback: fallback.map(f),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheSource;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_value_prefers_fallback_on_error() {
        let result: CachedResult<u32> = CachedResult::Error {
            error: Arc::new(anyhow::anyhow!("offline")),
            fallback: Some(7),
        };
        assert_eq!(result.state(), CacheState::Error);
        assert_eq!(result.value(), Some(&7));
        assert_eq!(result.error().map(ToString::to_string).as_deref(), Some("offline"));
    }

    #[test]
    fn test_map_keeps_metadata() {
        let metadata =
            CacheMetadata::new("k", Utc::now(), Duration::from_secs(5), CacheSource::Disk, 3);
        let result = CachedResult::Stale {
            data: 2_u32,
            metadata: metadata.clone(),
        }
        .map(|v| v * 10);
        assert!(result.is_stale());
        assert_eq!(result.value(), Some(&20));
        assert_eq!(result.metadata(), Some(&metadata));
        assert!(CachedResult::<u32>::Loading.is_pending());
    }
}
