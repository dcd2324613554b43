//! Cache-aside engine with three consistency policies.
//!
//! Callers choose a [`CachePolicy`] per read:
//!
//! - [`CachePolicy::PassThrough`] caches misses as a negative sentinel
//!   (penetration).
//! - [`CachePolicy::Mutex`] lets one loader run per id while others wait and
//!   retry (breakdown).
//! - [`CachePolicy::LogicalExpiration`] serves stale data while a single
//!   background rebuild refreshes it (avalanche).
//!
//! # Example
//!
//! ```ignore
//! let loader = Arc::new(FnLoader::new(|id: u64| async move { repo.shop(id).await }));
//! let shop: Option<Shop> = cache
//!     .query_cached("cache:shop:", &id, ttl, CachePolicy::Mutex, &loader)
//!     .await?;
//! ```

pub mod bloom;
pub mod entry;
pub mod loader;
pub mod policy;
pub mod store;

pub use bloom::BloomFilter;
pub use entry::{LogicalEntry, NULL_SENTINEL};
pub use loader::{CacheId, CacheableValue, FnLoader, Loader};
pub use policy::{CachePolicy, CacheRead, CacheSource, RebuildStatus};
pub use store::{CacheStats, CacheStatsSnapshot, CacheStore};
