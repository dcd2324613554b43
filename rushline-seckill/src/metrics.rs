//! Pipeline counters.

use rushline_core::RejectReason;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// METRICS
// ============================================================================

/// Counters shared by the admission pipeline and the worker pool.
///
/// One instance is shared through an `Arc`; every counter is monotonic since
/// startup.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Requests that passed the atomic admission check
    pub admitted: AtomicU64,

    pub rejected_out_of_stock: AtomicU64,
    pub rejected_not_started: AtomicU64,
    pub rejected_ended: AtomicU64,
    pub rejected_duplicate: AtomicU64,
    pub rejected_not_found: AtomicU64,

    /// Admitted requests appended to the durable stream
    pub enqueued: AtomicU64,

    /// Admitted requests pushed to the in-process buffer
    pub buffered: AtomicU64,

    /// Orders written inline by the synchronous path
    pub sync_persisted: AtomicU64,

    /// Stream appends that failed over to the synchronous path
    pub fallbacks: AtomicU64,

    /// Admissions compensated because the request could not be dispatched
    pub revoked: AtomicU64,

    /// Orders written by a worker
    pub persisted: AtomicU64,

    /// Deliveries whose order already existed
    pub duplicates_skipped: AtomicU64,

    /// Durable stock guard failures after admission
    pub persistence_conflicts: AtomicU64,

    /// Deliveries taken from a pending list
    pub redelivered: AtomicU64,

    pub acked: AtomicU64,

    /// Failed reads, handles and dispatches
    pub errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::OutOfStock => &self.rejected_out_of_stock,
            RejectReason::NotStarted => &self.rejected_not_started,
            RejectReason::Ended => &self.rejected_ended,
            RejectReason::DuplicateOrder => &self.rejected_duplicate,
            RejectReason::VoucherNotFound => &self.rejected_not_found,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> PipelineSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineSnapshot {
            admitted: load(&self.admitted),
            rejected_out_of_stock: load(&self.rejected_out_of_stock),
            rejected_not_started: load(&self.rejected_not_started),
            rejected_ended: load(&self.rejected_ended),
            rejected_duplicate: load(&self.rejected_duplicate),
            rejected_not_found: load(&self.rejected_not_found),
            enqueued: load(&self.enqueued),
            buffered: load(&self.buffered),
            sync_persisted: load(&self.sync_persisted),
            fallbacks: load(&self.fallbacks),
            revoked: load(&self.revoked),
            persisted: load(&self.persisted),
            duplicates_skipped: load(&self.duplicates_skipped),
            persistence_conflicts: load(&self.persistence_conflicts),
            redelivered: load(&self.redelivered),
            acked: load(&self.acked),
            errors: load(&self.errors),
        }
    }
}

/// Snapshot of pipeline counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub admitted: u64,
    pub rejected_out_of_stock: u64,
    pub rejected_not_started: u64,
    pub rejected_ended: u64,
    pub rejected_duplicate: u64,
    pub rejected_not_found: u64,
    pub enqueued: u64,
    pub buffered: u64,
    pub sync_persisted: u64,
    pub fallbacks: u64,
    pub revoked: u64,
    pub persisted: u64,
    pub duplicates_skipped: u64,
    pub persistence_conflicts: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub errors: u64,
}

impl PipelineSnapshot {
    pub fn rejected(&self) -> u64 {
        self.rejected_out_of_stock
            + self.rejected_not_started
            + self.rejected_ended
            + self.rejected_duplicate
            + self.rejected_not_found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_counted_per_reason() {
        let metrics = PipelineMetrics::new();
        metrics.record_rejection(RejectReason::OutOfStock);
        metrics.record_rejection(RejectReason::OutOfStock);
        metrics.record_rejection(RejectReason::DuplicateOrder);
        metrics.record_rejection(RejectReason::VoucherNotFound);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rejected_out_of_stock, 2);
        assert_eq!(snapshot.rejected_duplicate, 1);
        assert_eq!(snapshot.rejected_not_found, 1);
        assert_eq!(snapshot.rejected_ended, 0);
        assert_eq!(snapshot.rejected(), 4);
    }

    #[test]
    fn test_snapshot_starts_at_zero() {
        assert_eq!(PipelineMetrics::new().snapshot(), PipelineSnapshot::default());
    }
}
