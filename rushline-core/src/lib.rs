//! Rushline Core - Entity Types
//!
//! Pure data structures shared by the storage and admission crates.
//! This crate contains no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod order;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    AdmissionSettings, CacheSettings, DispatchMode, LockSettings, RushlineConfig,
    SequenceSettings, WorkerSettings,
};
pub use error::{
    CacheError, ConfigError, LockError, OrderError, RushlineError, RushlineResult, SequenceError,
    StoreError,
};
pub use lock::{Acquired, Lock, LockData, LockState, Released};
pub use order::{
    AdmissionVerdict, Order, OrderRequest, PersistOutcome, QueueTask, RejectReason,
    RequestContext, SubmitOutcome, VoucherStock,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

macro_rules! define_numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

define_numeric_id!(
    /// Identifier of an authenticated caller.
    UserId
);

define_numeric_id!(
    /// Identifier of a flash-sale voucher.
    VoucherId
);

define_numeric_id!(
    /// Order identifier allocated by the sequence generator.
    ///
    /// Layout: `(seconds since origin) << counter_bits | per-day counter`.
    OrderId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_parse() {
        let id = VoucherId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<VoucherId>().unwrap(), id);
        assert!("x42".parse::<VoucherId>().is_err());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let json = serde_json::to_string(&OrderId::new(7)).unwrap();
        assert_eq!(json, "7");
        let back: UserId = serde_json::from_str("19").unwrap();
        assert_eq!(back.get(), 19);
    }
}
