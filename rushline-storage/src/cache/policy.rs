//! Consistency policies and read results for the cache-aside engine.
//!
//! Each policy defends against one failure mode, and callers pick it per
//! read. The result carries where the value came from and, for logical
//! expiration, whether a rebuild is running.

use serde::{Deserialize, Serialize};

/// How a cache miss or stale entry is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Penetration defense.
    ///
    /// On miss, call the loader. A missing value is cached as the negative
    /// sentinel with the short null TTL so repeated lookups for
    /// nonexistent ids stop reaching durable storage.
    PassThrough,

    /// Breakdown defense.
    ///
    /// On miss, only the holder of the per-id lock loads. Everyone else
    /// waits a fixed interval and retries the read, up to a retry cap.
    Mutex,

    /// Avalanche defense.
    ///
    /// Entries never physically expire. A logically expired entry is still
    /// served while at most one background rebuild refreshes it. Reads
    /// never block on the loader.
    LogicalExpiration,
}

impl CachePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::PassThrough => "pass_through",
            CachePolicy::Mutex => "mutex",
            CachePolicy::LogicalExpiration => "logical_expiration",
        }
    }
}

/// Where the answer of a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// A cached value.
    Cache,
    /// The negative sentinel: the id is known not to exist.
    NegativeCache,
    /// The bloom pre-filter has never seen the id.
    BloomFilter,
    /// The loader, on a miss.
    Loader,
    /// Nothing cached and nothing loaded (logical expiration only).
    Absent,
}

/// State of the background rebuild for a logically expired entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStatus {
    /// Entry was fresh, or the policy does not rebuild in the background.
    NotNeeded,
    /// This read acquired the rebuild lock and started the rebuild.
    Started,
    /// Another rebuild holds the lock; stale data is being served.
    InProgress,
}

/// Result of a cache read, carrying provenance metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: Option<T>,
    source: CacheSource,
    stale: bool,
    rebuild: RebuildStatus,
}

impl<T> CacheRead<T> {
    pub fn hit(value: T) -> Self {
        Self {
            value: Some(value),
            source: CacheSource::Cache,
            stale: false,
            rebuild: RebuildStatus::NotNeeded,
        }
    }

    pub fn loaded(value: Option<T>) -> Self {
        Self {
            value,
            source: CacheSource::Loader,
            stale: false,
            rebuild: RebuildStatus::NotNeeded,
        }
    }

    pub fn absent(source: CacheSource) -> Self {
        Self {
            value: None,
            source,
            stale: false,
            rebuild: RebuildStatus::NotNeeded,
        }
    }

    /// A logically expired value served while `rebuild` refreshes it.
    pub fn stale(value: T, rebuild: RebuildStatus) -> Self {
        Self {
            value: Some(value),
            source: CacheSource::Cache,
            stale: true,
            rebuild,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn source(&self) -> CacheSource {
        self.source
    }

    /// Whether the value is past its logical expiry.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn rebuild_status(&self) -> RebuildStatus {
        self.rebuild
    }

    /// Whether the caller is looking at data another task is refreshing.
    pub fn rebuild_in_progress(&self) -> bool {
        matches!(self.rebuild, RebuildStatus::Started | RebuildStatus::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_read_reports_rebuild() {
        let read = CacheRead::stale("v", RebuildStatus::InProgress);
        assert!(read.is_stale());
        assert!(read.rebuild_in_progress());
        assert_eq!(read.source(), CacheSource::Cache);
        assert_eq!(read.into_value(), Some("v"));
    }

    #[test]
    fn test_absent_read() {
        let read: CacheRead<u32> = CacheRead::absent(CacheSource::NegativeCache);
        assert!(read.value().is_none());
        assert!(!read.rebuild_in_progress());
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&CachePolicy::LogicalExpiration).unwrap();
        assert_eq!(json, "\"logical_expiration\"");
        assert_eq!(CachePolicy::Mutex.as_str(), "mutex");
    }
}
