//! Stored cache entry formats.

use serde::{Deserialize, Serialize};

/// Negative-cache marker. Any blank value read back is treated as this.
pub const NULL_SENTINEL: &str = "";

/// A value wrapped with a logical expiry, stored without a physical TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalEntry<T> {
    pub data: T,
    /// Unix milliseconds after which the entry is stale.
    pub expire_at_ms: i64,
}

impl<T> LogicalEntry<T> {
    pub fn new(data: T, expire_at_ms: i64) -> Self {
        Self { data, expire_at_ms }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expire_at_ms
    }
}

pub(crate) fn is_negative(raw: &str) -> bool {
    raw.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_entry_expiry_boundary() {
        let entry = LogicalEntry::new(5u32, 1_000);
        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1_000));
    }

    #[test]
    fn test_logical_entry_json_shape() {
        let json = serde_json::to_value(LogicalEntry::new("shop", 42)).unwrap();
        assert_eq!(json["data"], "shop");
        assert_eq!(json["expire_at_ms"], 42);
    }

    #[test]
    fn test_blank_values_are_negative() {
        assert!(is_negative(NULL_SENTINEL));
        assert!(is_negative("  "));
        assert!(!is_negative("{}"));
    }
}
