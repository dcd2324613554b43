//! Transactional order persistence.
//!
//! The one function both the worker pool and the synchronous path use to
//! turn an admitted request into a durable order. It is idempotent on
//! `(user_id, voucher_id)`, so a redelivered request never writes twice.

use crate::metrics::PipelineMetrics;
use rushline_core::{
    Order, OrderError, OrderRequest, PersistOutcome, QueueTask, RushlineError, RushlineResult,
};
use rushline_storage::OrderRepository;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// What happened to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Stock decremented and the order written.
    Persisted,
    /// An order for the same user and voucher already existed.
    AlreadyPersisted,
    /// The durable `stock > 0` guard failed after admission. Nothing
    /// written, and retrying cannot succeed, so the entry is still acked.
    Conflict,
}

#[derive(Clone)]
pub struct OrderPersister {
    repo: Arc<dyn OrderRepository>,
    metrics: Arc<PipelineMetrics>,
}

impl OrderPersister {
    pub fn new(repo: Arc<dyn OrderRepository>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { repo, metrics }
    }

    /// Persist one admitted request.
    ///
    /// Checks for an existing order first, then runs the repository's
    /// single-transaction write. Store failures are returned so the caller
    /// can leave the entry pending for redelivery.
    pub async fn persist(&self, request: &OrderRequest) -> RushlineResult<HandleOutcome> {
        if self
            .repo
            .order_exists(request.user_id, request.voucher_id)
            .await?
        {
            self.metrics
                .duplicates_skipped
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                user_id = %request.user_id,
                voucher_id = %request.voucher_id,
                order_id = %request.order_id,
                "Order already persisted, skipping"
            );
            return Ok(HandleOutcome::AlreadyPersisted);
        }

        match self.repo.create_order(&Order::from(request)).await? {
            PersistOutcome::Persisted => {
                self.metrics.persisted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    user_id = %request.user_id,
                    voucher_id = %request.voucher_id,
                    order_id = %request.order_id,
                    "Order persisted"
                );
                Ok(HandleOutcome::Persisted)
            }
            PersistOutcome::AlreadyExists => {
                self.metrics
                    .duplicates_skipped
                    .fetch_add(1, Ordering::Relaxed);
                Ok(HandleOutcome::AlreadyPersisted)
            }
            PersistOutcome::StockExhausted => {
                self.metrics
                    .persistence_conflicts
                    .fetch_add(1, Ordering::Relaxed);
                let err = RushlineError::from(OrderError::PersistenceConflict {
                    user_id: request.user_id,
                    voucher_id: request.voucher_id,
                });
                tracing::error!(
                    order_id = %request.order_id,
                    error = %err,
                    "Admitted order rejected by the durable stock guard"
                );
                Ok(HandleOutcome::Conflict)
            }
        }
    }

    /// Persist a request delivered from the order queue.
    pub async fn handle(&self, task: &QueueTask) -> RushlineResult<HandleOutcome> {
        if task.redelivered {
            self.metrics.redelivered.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                entry_id = %task.entry_id,
                order_id = %task.request.order_id,
                "Reprocessing redelivered order"
            );
        }
        self.persist(&task.request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rushline_core::{OrderId, UserId, VoucherId, VoucherStock};
    use rushline_storage::InMemoryOrderRepository;

    async fn setup(stock: i64) -> (OrderPersister, Arc<InMemoryOrderRepository>, Arc<PipelineMetrics>) {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let now = Utc::now();
        repo.upsert_voucher(&VoucherStock::new(
            VoucherId::new(1),
            stock,
            now - Duration::hours(1),
            now + Duration::hours(1),
        ))
        .await
        .unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        (OrderPersister::new(repo.clone(), metrics.clone()), repo, metrics)
    }

    fn request(user: u64) -> OrderRequest {
        OrderRequest {
            order_id: OrderId::new(1000 + user),
            user_id: UserId::new(user),
            voucher_id: VoucherId::new(1),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_persist_then_duplicate() {
        let (persister, repo, metrics) = setup(5).await;

        assert_eq!(persister.persist(&request(7)).await.unwrap(), HandleOutcome::Persisted);
        assert_eq!(
            persister.persist(&request(7)).await.unwrap(),
            HandleOutcome::AlreadyPersisted
        );

        assert_eq!(repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);
        assert_eq!(repo.voucher(VoucherId::new(1)).await.unwrap().unwrap().stock, 4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.persisted, 1);
        assert_eq!(snapshot.duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn test_stock_guard_failure_is_conflict() {
        let (persister, repo, metrics) = setup(0).await;

        let outcome = persister.persist(&request(3)).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Conflict);
        assert_eq!(repo.count_orders(VoucherId::new(1)).await.unwrap(), 0);
        assert_eq!(repo.voucher(VoucherId::new(1)).await.unwrap().unwrap().stock, 0);
        assert_eq!(metrics.snapshot().persistence_conflicts, 1);
    }

    #[tokio::test]
    async fn test_redelivered_task_counted() {
        let (persister, _repo, metrics) = setup(2).await;
        let task = QueueTask {
            entry_id: "1-0".to_string(),
            request: request(9),
            redelivered: true,
        };

        assert_eq!(persister.handle(&task).await.unwrap(), HandleOutcome::Persisted);
        assert_eq!(
            persister.handle(&task).await.unwrap(),
            HandleOutcome::AlreadyPersisted
        );
        assert_eq!(metrics.snapshot().redelivered, 2);
    }
}
