//! Rushline Storage - store contracts and concurrency primitives
//!
//! This crate defines the two store seams and the primitives built on them:
//!
//! - [`KvStore`]: the shared key-value store (in-memory, or Redis with the
//!   `redis` feature).
//! - [`OrderRepository`]: the durable relational store (in-memory, or
//!   PostgreSQL with the `postgres` feature).
//! - [`DistributedLock`], [`SequenceGenerator`] and [`CacheStore`], which only
//!   talk to a [`KvStore`].

pub mod cache;
pub mod kv;
pub mod lock;
pub mod repository;
pub mod sequence;

pub use cache::{
    BloomFilter, CacheId, CachePolicy, CacheRead, CacheSource, CacheStats, CacheStatsSnapshot,
    CacheStore, CacheableValue, FnLoader, Loader, LogicalEntry, RebuildStatus, NULL_SENTINEL,
};
pub use kv::{InMemoryKvStore, KvStore, StreamEntry};
#[cfg(feature = "redis")]
pub use kv::{RedisKvStore, RedisSettings};
pub use lock::DistributedLock;
#[cfg(feature = "postgres")]
pub use repository::{DbConfig, PgOrderRepository, SCHEMA_SQL};
pub use repository::{InMemoryOrderRepository, OrderRepository};
pub use sequence::{compose_id, decompose_id, SequenceGenerator, MAX_COUNTER_BITS};
