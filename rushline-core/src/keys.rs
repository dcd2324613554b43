//! Key naming for the shared key-value store.
//!
//! Per-voucher admission keys carry a `{voucher}` hash tag so that a
//! clustered store places the stock counter and the admission markers in the
//! same slot, which the admission script requires.

use crate::VoucherId;

/// Prefix for lock keys.
pub const LOCK_PREFIX: &str = "lock:";

/// Prefix for sequence counters.
pub const SEQUENCE_PREFIX: &str = "icr:";

/// Key for a cached entity.
pub fn cache_key(prefix: &str, id: &str) -> String {
    format!("{}{}", prefix, id)
}

/// Key for the rebuild/mutex lock guarding a cached entity.
pub fn cache_lock_key(prefix: &str, id: &str) -> String {
    format!("{}{}{}", LOCK_PREFIX, prefix, id)
}

/// Key for the per-user order lock used by the synchronous path.
pub fn order_lock_key(user_id: crate::UserId) -> String {
    format!("{}order:{}", LOCK_PREFIX, user_id)
}

/// Key for a namespace's counter on a calendar day (`yyyy:MM:dd`).
pub fn sequence_key(namespace: &str, day: &str) -> String {
    format!("{}{}:{}", SEQUENCE_PREFIX, namespace, day)
}

/// Hash holding a voucher's in-memory stock and sale window.
pub fn voucher_stock_key(voucher_id: VoucherId) -> String {
    format!("seckill:{{{}}}:stock", voucher_id)
}

/// Set of users already admitted for a voucher.
pub fn voucher_orders_key(voucher_id: VoucherId) -> String {
    format!("seckill:{{{}}}:orders", voucher_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;

    #[test]
    fn test_voucher_keys_share_hash_tag() {
        let id = VoucherId::new(12);
        assert_eq!(voucher_stock_key(id), "seckill:{12}:stock");
        assert_eq!(voucher_orders_key(id), "seckill:{12}:orders");
    }

    #[test]
    fn test_lock_and_sequence_keys() {
        assert_eq!(cache_key("cache:shop:", "1"), "cache:shop:1");
        assert_eq!(cache_lock_key("cache:shop:", "1"), "lock:cache:shop:1");
        assert_eq!(order_lock_key(UserId::new(8)), "lock:order:8");
        assert_eq!(sequence_key("order", "2024:03:09"), "icr:order:2024:03:09");
    }
}
