//! Error types for Rushline operations

use crate::{UserId, VoucherId};
use thiserror::Error;

/// Shared key-value store and durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Script {script} failed: {reason}")]
    Script { script: String, reason: String },

    #[error("Query failed: {reason}")]
    Query { reason: String },

    #[error("Codec error: {reason}")]
    Codec { reason: String },
}

impl StoreError {
    /// Shorthand for a transient outage of the named backend.
    pub fn unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::Unavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}

/// Distributed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock {key} is held by another owner")]
    Busy { key: String },

    #[error("Lock {key} not acquired after {attempts} attempts")]
    Timeout { key: String, attempts: u32 },
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Loader failed for {key}: {reason}")]
    Loader { key: String, reason: String },
}

/// Order persistence errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("Persistence conflict for user {user_id} on voucher {voucher_id}: durable stock guard failed after admission")]
    PersistenceConflict { user_id: UserId, voucher_id: VoucherId },

    #[error("Order queue unavailable: {reason}")]
    QueueUnavailable { reason: String },

    #[error("Order persistence aborted: {reason}")]
    PersistenceAborted { reason: String },
}

/// Sequence allocation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Clock at {now_secs}s is before the id origin {origin_secs}s")]
    ClockBeforeOrigin { now_secs: i64, origin_secs: i64 },

    #[error("Counter for {namespace} exhausted at {counter}")]
    CounterExhausted { namespace: String, counter: i64 },

    #[error("Id layout with {counter_bits} counter bits cannot hold {elapsed_secs}s")]
    LayoutOverflow { elapsed_secs: u64, counter_bits: u32 },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Rushline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RushlineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl RushlineError {
    /// Whether the caller may retry the operation with back-off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RushlineError::Store(StoreError::Unavailable { .. }) | RushlineError::Lock(_)
        )
    }
}

/// Result type alias for Rushline operations.
pub type RushlineResult<T> = Result<T, RushlineError>;

// =============================================================================
// TESTS
// =============================================================================
