//! Rushline Test Utilities
//!
//! Centralized test infrastructure for the Rushline workspace:
//! - Proptest generators for ids, vouchers and request batches
//! - Fixtures for published vouchers, clocks and wired-up stores
//! - Instrumented cache loaders
//! - Assertions for Rushline-specific results

pub use rushline_core::{
    CacheError, FixedClock, OrderRequest, RejectReason, RequestContext, RushlineConfig,
    RushlineError, RushlineResult, StoreError, SubmitOutcome, Timestamp, UserId, VoucherId,
    VoucherStock,
};
pub use rushline_storage::{CacheableValue, InMemoryKvStore, InMemoryOrderRepository, Loader};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// LOADERS
// ============================================================================

/// Loader over a fixed table that counts its invocations.
///
/// With a delay it stands in for a slow durable query, which is what the
/// concurrent-miss tests need.
pub struct CountingLoader<T> {
    rows: HashMap<u64, T>,
    delay: Duration,
    calls: AtomicUsize,
}

impl<T> CountingLoader<T> {
    pub fn new(rows: impl IntoIterator<Item = (u64, T)>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: CacheableValue> Loader<u64, T> for CountingLoader<T> {
    async fn load(&self, id: &u64) -> RushlineResult<Option<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.rows.get(id).cloned())
    }
}

/// Loader that always fails, optionally by panicking.
pub struct FailingLoader {
    panic: bool,
    calls: AtomicUsize,
}

impl FailingLoader {
    pub fn erroring() -> Self {
        Self {
            panic: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: CacheableValue> Loader<u64, T> for FailingLoader {
    async fn load(&self, id: &u64) -> RushlineResult<Option<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("loader panicked for {}", id);
        }
        Err(StoreError::unavailable("durable store", format!("load {} failed", id)).into())
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Rushline types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a UserId from a small range so batches contain repeats.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        (1u64..64).prop_map(UserId::new)
    }

    pub fn arb_voucher_id() -> impl Strategy<Value = VoucherId> {
        (1u64..1_000_000).prop_map(VoucherId::new)
    }

    /// Generate a Timestamp within 2024-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_704_067_200i64..1_893_456_000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a voucher whose sale window is open at `now`.
    pub fn arb_open_voucher(now: Timestamp) -> impl Strategy<Value = VoucherStock> {
        (arb_voucher_id(), 0i64..32, 1i64..3600, 1i64..3600).prop_map(
            move |(voucher_id, stock, before, after)| {
                VoucherStock::new(
                    voucher_id,
                    stock,
                    now - chrono::Duration::seconds(before),
                    now + chrono::Duration::seconds(after),
                )
            },
        )
    }

    /// Generate any voucher: the window may be open, future or past.
    pub fn arb_voucher_stock() -> impl Strategy<Value = VoucherStock> {
        (arb_voucher_id(), 0i64..1000, arb_timestamp(), 1i64..86_400).prop_map(
            |(voucher_id, stock, begin_at, length)| {
                VoucherStock::new(
                    voucher_id,
                    stock,
                    begin_at,
                    begin_at + chrono::Duration::seconds(length),
                )
            },
        )
    }

    /// Generate the users behind a burst of purchase requests.
    pub fn arb_request_batch(max: usize) -> impl Strategy<Value = Vec<UserId>> {
        prop::collection::vec(arb_user_id(), 1..=max.max(1))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// A voucher with `stock` units whose window opened an hour ago and
    /// closes in an hour.
    pub fn open_voucher(id: u64, stock: i64) -> VoucherStock {
        let now = Utc::now();
        VoucherStock::new(
            VoucherId::new(id),
            stock,
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
        )
    }

    /// A voucher whose window opens in an hour.
    pub fn upcoming_voucher(id: u64, stock: i64) -> VoucherStock {
        let now = Utc::now();
        VoucherStock::new(
            VoucherId::new(id),
            stock,
            now + chrono::Duration::hours(1),
            now + chrono::Duration::hours(2),
        )
    }

    /// A voucher whose window closed an hour ago.
    pub fn ended_voucher(id: u64, stock: i64) -> VoucherStock {
        let now = Utc::now();
        VoucherStock::new(
            VoucherId::new(id),
            stock,
            now - chrono::Duration::hours(2),
            now - chrono::Duration::hours(1),
        )
    }

    /// Clock pinned to the current time.
    pub fn fixed_clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc::now()))
    }

    pub fn request_context(user: u64) -> RequestContext {
        RequestContext::new(UserId::new(user))
    }

    /// Development configuration: short retry intervals, leases and blocks.
    pub fn test_config() -> RushlineConfig {
        RushlineConfig::development()
    }

    /// Fresh in-memory stores.
    pub fn memory_stores() -> (Arc<InMemoryKvStore>, Arc<InMemoryOrderRepository>) {
        (
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryOrderRepository::new()),
        )
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Rushline results.

    use super::*;

    /// Assert the outcome is an admission and return its order id.
    pub fn assert_admitted(outcome: &SubmitOutcome) -> rushline_core::OrderId {
        match outcome {
            SubmitOutcome::Admitted { order_id } => *order_id,
            SubmitOutcome::Rejected { reason } => {
                panic!("Expected admission, got rejection: {}", reason)
            }
        }
    }

    pub fn assert_rejected(outcome: &SubmitOutcome, expected: RejectReason) {
        assert_eq!(
            outcome.reason(),
            Some(expected),
            "Expected rejection {}, got {:?}",
            expected,
            outcome
        );
    }

    pub fn assert_lock_timeout<T: std::fmt::Debug>(result: &RushlineResult<T>) {
        assert!(
            matches!(
                result,
                Err(RushlineError::Lock(rushline_core::LockError::Timeout { .. }))
            ),
            "Expected LockError::Timeout, got {:?}",
            result
        );
    }

    pub fn assert_loader_error<T: std::fmt::Debug>(result: &RushlineResult<T>) {
        assert!(
            matches!(
                result,
                Err(RushlineError::Cache(CacheError::Loader { .. })) | Err(RushlineError::Store(_))
            ),
            "Expected a loader failure, got {:?}",
            result
        );
    }
}
