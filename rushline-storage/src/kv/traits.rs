//! Shared key-value store contract.

use async_trait::async_trait;
use rushline_core::{AdmissionVerdict, RushlineResult, UserId, VoucherId, VoucherStock};
use std::time::Duration;

/// One delivered stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned entry id, used for acknowledgement.
    pub id: String,
    /// The `payload` field of the entry.
    pub payload: String,
    /// How many times the entry has been delivered to a consumer, this one included.
    pub delivery_count: u64,
}

/// Primitives required from the shared key-value store.
///
/// Every method is a single round trip. Methods documented as atomic must
/// be executed server-side (a script in a Redis-compatible store) so that no
/// two invocations interleave.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Backend name for logs and errors.
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &str) -> RushlineResult<Option<String>>;

    /// Unconditional write. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RushlineResult<()>;

    /// `SET key value NX PX ttl`. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RushlineResult<bool>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> RushlineResult<bool>;

    /// Atomic increment, creating the key at zero first.
    async fn incr(&self, key: &str) -> RushlineResult<i64>;

    /// Atomic: delete `key` only if its value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> RushlineResult<bool>;

    /// Seed the in-memory stock counter and sale window of a voucher in one
    /// atomic step. The admission markers are replaced by `buyers`, the users
    /// that already hold a durable order.
    async fn publish_voucher(
        &self,
        voucher: &VoucherStock,
        buyers: &[UserId],
    ) -> RushlineResult<()>;

    /// Atomic admission check.
    ///
    /// Checks, in order: the voucher is published, `now_ms` is inside the
    /// sale window, the user has not been admitted, stock is positive. On
    /// success decrements stock and records the admission marker.
    async fn admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        now_ms: i64,
    ) -> RushlineResult<AdmissionVerdict>;

    /// Atomic compensation for an admission that could not be dispatched:
    /// removes the marker and, if one was removed, restores one unit of stock.
    async fn revoke_admission(&self, voucher_id: VoucherId, user_id: UserId)
        -> RushlineResult<bool>;

    /// Create the consumer group (and the stream) if missing. Idempotent.
    async fn stream_ensure_group(&self, stream: &str, group: &str) -> RushlineResult<()>;

    /// Append an entry with a single `payload` field. Returns the entry id.
    async fn stream_append(&self, stream: &str, payload: &str) -> RushlineResult<String>;

    /// Read entries never delivered to the group, blocking up to `block`.
    /// Delivered entries join `consumer`'s pending list until acknowledged.
    async fn stream_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> RushlineResult<Vec<StreamEntry>>;

    /// Re-read `consumer`'s own delivered-but-unacknowledged entries,
    /// oldest first. Never blocks.
    async fn stream_read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> RushlineResult<Vec<StreamEntry>>;

    /// Move entries that have sat unacknowledged for at least `min_idle` in
    /// any consumer's pending list to `consumer`, oldest first, and return
    /// them. Picks up work left behind by consumers that no longer run.
    /// Never blocks.
    async fn stream_claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> RushlineResult<Vec<StreamEntry>>;

    /// Returns whether the entry was pending.
    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> RushlineResult<bool>;

    /// Size of the group's pending list across all consumers.
    async fn stream_pending_count(&self, stream: &str, group: &str) -> RushlineResult<u64>;
}
