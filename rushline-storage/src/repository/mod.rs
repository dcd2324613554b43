//! Durable order store: contract and backends.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;

pub use memory::InMemoryOrderRepository;
#[cfg(feature = "postgres")]
pub use postgres::{DbConfig, PgOrderRepository, SCHEMA_SQL};
pub use traits::OrderRepository;
