//! Shared key-value store: contract and backends.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod traits;

pub use memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use redis_backend::{RedisKvStore, RedisSettings};
pub use traits::{KvStore, StreamEntry};
