//! Flash-sale order admission.
//!
//! A request goes through three steps:
//!
//! 1. The atomic admission script in the shared store checks the sale
//!    window, the duplicate marker and the stock, and on success decrements
//!    stock and records the marker. This is the only serialization point for
//!    admission; no lock is taken.
//! 2. An order id is allocated from the sequence generator.
//! 3. The admitted request is dispatched according to [`DispatchMode`] and
//!    the caller gets its order id back without waiting for persistence.
//!
//! Rejections are ordinary [`SubmitOutcome`] values. Errors are reserved for
//! store and dispatch failures.

use crate::buffer::LocalOrderBuffer;
use crate::metrics::PipelineMetrics;
use crate::persister::{HandleOutcome, OrderPersister};
use rushline_core::keys::order_lock_key;
use rushline_core::{
    Acquired, AdmissionSettings, AdmissionVerdict, Clock, DispatchMode, Lock, LockSettings, Order,
    OrderError, OrderId, OrderRequest, PersistOutcome, RejectReason, RequestContext,
    RushlineConfig, RushlineResult, SequenceSettings, StoreError, SubmitOutcome, SystemClock,
    VoucherId, VoucherStock,
};
use rushline_storage::{DistributedLock, KvStore, OrderRepository, SequenceGenerator};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Clone)]
pub struct OrderAdmissionPipeline {
    store: Arc<dyn KvStore>,
    repo: Arc<dyn OrderRepository>,
    lock: DistributedLock,
    sequence: SequenceGenerator,
    persister: OrderPersister,
    clock: Arc<dyn Clock>,
    admission: AdmissionSettings,
    lock_settings: LockSettings,
    sequence_settings: SequenceSettings,
    metrics: Arc<PipelineMetrics>,
    buffer: Option<Arc<LocalOrderBuffer>>,
}

impl OrderAdmissionPipeline {
    pub fn new(
        store: Arc<dyn KvStore>,
        repo: Arc<dyn OrderRepository>,
        config: &RushlineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            lock: DistributedLock::new(store.clone()).with_clock(clock.clone()),
            sequence: SequenceGenerator::new(store.clone(), clock.clone(), &config.sequence),
            persister: OrderPersister::new(repo.clone(), metrics.clone()),
            store,
            repo,
            clock,
            admission: config.admission.clone(),
            lock_settings: config.lock.clone(),
            sequence_settings: config.sequence.clone(),
            metrics,
            buffer: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.lock = self.lock.with_clock(clock.clone());
        self.sequence =
            SequenceGenerator::new(self.store.clone(), clock.clone(), &self.sequence_settings);
        self.clock = clock;
        self
    }

    /// Attach the buffer used in [`DispatchMode::LocalBuffer`]. The same
    /// buffer must be given to the worker pool that drains it.
    pub fn with_buffer(mut self, buffer: Arc<LocalOrderBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.admission.dispatch
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn persister(&self) -> &OrderPersister {
        &self.persister
    }

    /// Make a voucher available for sale: write the durable stock row, then
    /// seed the shared store's counter and window from it.
    ///
    /// Users that already hold a persisted order for the voucher are seeded
    /// as admitted, so publishing again never readmits a buyer. Orders still
    /// in flight when a voucher is republished are not covered; republish
    /// after the workers have drained.
    pub async fn publish_voucher(&self, voucher: &VoucherStock) -> RushlineResult<()> {
        self.repo.upsert_voucher(voucher).await?;
        let buyers = self.repo.buyers(voucher.voucher_id).await?;
        self.store.publish_voucher(voucher, &buyers).await?;
        tracing::info!(
            voucher_id = %voucher.voucher_id,
            stock = voucher.stock,
            buyers = buyers.len(),
            begin_at = %voucher.begin_at,
            end_at = %voucher.end_at,
            "Voucher published"
        );
        Ok(())
    }

    // ========================================================================
    // SUBMIT
    // ========================================================================

    /// Try to buy one unit of `voucher_id` for the caller.
    ///
    /// Once this returns `Admitted` the order will be persisted, even if the
    /// caller goes away.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        voucher_id: VoucherId,
    ) -> RushlineResult<SubmitOutcome> {
        if self.admission.dispatch == DispatchMode::Synchronous {
            return self.submit_synchronous(ctx, voucher_id).await;
        }

        let now = self.clock.now();
        let verdict = self
            .store
            .admit(voucher_id, ctx.user_id, now.timestamp_millis())
            .await?;
        if let AdmissionVerdict::Rejected(reason) = verdict {
            self.metrics.record_rejection(reason);
            tracing::debug!(
                request_id = %ctx.request_id,
                user_id = %ctx.user_id,
                voucher_id = %voucher_id,
                reason = %reason,
                "Order request rejected"
            );
            return Ok(reason.into());
        }
        self.metrics.admitted.fetch_add(1, Ordering::Relaxed);

        let order_id = match self
            .sequence
            .next_id(&self.sequence_settings.order_namespace)
            .await
        {
            Ok(id) => OrderId::new(id),
            Err(err) => {
                self.revoke(ctx, voucher_id).await;
                return Err(err);
            }
        };

        let request = OrderRequest {
            order_id,
            user_id: ctx.user_id,
            voucher_id,
            requested_at: now,
        };
        tracing::debug!(
            request_id = %ctx.request_id,
            user_id = %ctx.user_id,
            voucher_id = %voucher_id,
            order_id = %order_id,
            dispatch = %self.admission.dispatch,
            "Order request admitted"
        );

        match self.admission.dispatch {
            DispatchMode::LocalBuffer => self.push_to_buffer(ctx, request).await,
            _ => self.enqueue(ctx, request).await,
        }
    }

    async fn enqueue(
        &self,
        ctx: &RequestContext,
        request: OrderRequest,
    ) -> RushlineResult<SubmitOutcome> {
        let payload = serde_json::to_string(&request).map_err(|e| StoreError::Codec {
            reason: e.to_string(),
        })?;

        match self.store.stream_append(&self.admission.stream, &payload).await {
            Ok(entry_id) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(order_id = %request.order_id, entry_id = %entry_id, "Order enqueued");
                Ok(SubmitOutcome::Admitted {
                    order_id: request.order_id,
                })
            }
            Err(append_err) => {
                self.metrics.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    order_id = %request.order_id,
                    stream = %self.admission.stream,
                    error = %append_err,
                    "Order stream unavailable, persisting synchronously"
                );
                self.persist_fallback(ctx, request).await
            }
        }
    }

    /// Persist an already admitted request inline under the per-user lock,
    /// waiting up to `lock.max_retries` attempts for a concurrent holder.
    async fn persist_fallback(
        &self,
        ctx: &RequestContext,
        request: OrderRequest,
    ) -> RushlineResult<SubmitOutcome> {
        let voucher_id = request.voucher_id;
        let this = self.clone();
        let section = tokio::spawn(async move {
            let key = order_lock_key(request.user_id);
            let lock = this
                .lock
                .acquire_with_retry(
                    &key,
                    this.lock_settings.order_lock_lease,
                    this.lock_settings.max_retries,
                    this.lock_settings.retry_interval,
                )
                .await?;
            let result = this.persister.persist(&request).await;
            this.release_quietly(lock).await;
            result.map(|outcome| (request.order_id, outcome))
        });

        match join_section(section).await {
            Ok((order_id, HandleOutcome::Persisted)) => {
                self.metrics.sync_persisted.fetch_add(1, Ordering::Relaxed);
                Ok(SubmitOutcome::Admitted { order_id })
            }
            Ok((_, HandleOutcome::AlreadyPersisted)) => {
                self.metrics.record_rejection(RejectReason::DuplicateOrder);
                Ok(RejectReason::DuplicateOrder.into())
            }
            // Logged as a persistence conflict by the persister. The shared
            // store already gave this unit away, so it is not handed back.
            Ok((_, HandleOutcome::Conflict)) => {
                self.metrics.record_rejection(RejectReason::OutOfStock);
                Ok(RejectReason::OutOfStock.into())
            }
            Err(err) => {
                self.revoke(ctx, voucher_id).await;
                Err(err)
            }
        }
    }

    async fn push_to_buffer(
        &self,
        ctx: &RequestContext,
        request: OrderRequest,
    ) -> RushlineResult<SubmitOutcome> {
        let order_id = request.order_id;
        let voucher_id = request.voucher_id;
        let pushed = match &self.buffer {
            Some(buffer) => buffer.try_push(request),
            None => Err(OrderError::QueueUnavailable {
                reason: "no local buffer attached".to_string(),
            }
            .into()),
        };

        match pushed {
            Ok(()) => {
                self.metrics.buffered.fetch_add(1, Ordering::Relaxed);
                Ok(SubmitOutcome::Admitted { order_id })
            }
            Err(err) => {
                tracing::warn!(order_id = %order_id, error = %err, "Local order buffer rejected push");
                self.revoke(ctx, voucher_id).await;
                Err(err)
            }
        }
    }

    /// Undo an admission that was never dispatched.
    async fn revoke(&self, ctx: &RequestContext, voucher_id: VoucherId) {
        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
        match self.store.revoke_admission(voucher_id, ctx.user_id).await {
            Ok(revoked) => {
                if revoked {
                    self.metrics.revoked.fetch_add(1, Ordering::Relaxed);
                }
                tracing::warn!(
                    request_id = %ctx.request_id,
                    user_id = %ctx.user_id,
                    voucher_id = %voucher_id,
                    revoked,
                    "Admission revoked after dispatch failure"
                );
            }
            Err(e) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    user_id = %ctx.user_id,
                    voucher_id = %voucher_id,
                    error = %e,
                    "Admission could not be revoked"
                );
            }
        }
    }

    // ========================================================================
    // SYNCHRONOUS PATH
    // ========================================================================

    /// Buy one unit without the shared-store admission script or a queue.
    ///
    /// Takes the caller's order lock, checks window, duplicate and stock
    /// against durable storage, then writes the order in one transaction.
    /// A caller whose lock is already held has an order in flight and is
    /// rejected with `DuplicateOrder`.
    pub async fn submit_synchronous(
        &self,
        ctx: &RequestContext,
        voucher_id: VoucherId,
    ) -> RushlineResult<SubmitOutcome> {
        let this = self.clone();
        let ctx_owned = ctx.clone();
        let section = tokio::spawn(async move {
            let key = order_lock_key(ctx_owned.user_id);
            let Some(lock) = this
                .lock
                .try_acquire(&key, this.lock_settings.order_lock_lease)
                .await?
            else {
                return Ok(SubmitOutcome::from(RejectReason::DuplicateOrder));
            };
            let result = this.order_under_lock(&ctx_owned, voucher_id).await;
            this.release_quietly(lock).await;
            result
        });

        let outcome = join_section(section).await?;
        match outcome {
            SubmitOutcome::Admitted { order_id } => {
                self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                self.metrics.sync_persisted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    request_id = %ctx.request_id,
                    user_id = %ctx.user_id,
                    voucher_id = %voucher_id,
                    order_id = %order_id,
                    "Order persisted synchronously"
                );
            }
            SubmitOutcome::Rejected { reason } => {
                self.metrics.record_rejection(reason);
                tracing::debug!(
                    request_id = %ctx.request_id,
                    user_id = %ctx.user_id,
                    voucher_id = %voucher_id,
                    reason = %reason,
                    "Order request rejected"
                );
            }
        }
        Ok(outcome)
    }

    async fn order_under_lock(
        &self,
        ctx: &RequestContext,
        voucher_id: VoucherId,
    ) -> RushlineResult<SubmitOutcome> {
        let Some(voucher) = self.repo.voucher(voucher_id).await? else {
            return Ok(RejectReason::VoucherNotFound.into());
        };
        let now = self.clock.now();
        if let Some(reason) = voucher.window_rejection(now) {
            return Ok(reason.into());
        }
        if self.repo.order_exists(ctx.user_id, voucher_id).await? {
            return Ok(RejectReason::DuplicateOrder.into());
        }
        if !voucher.has_stock() {
            return Ok(RejectReason::OutOfStock.into());
        }

        let order_id = OrderId::new(
            self.sequence
                .next_id(&self.sequence_settings.order_namespace)
                .await?,
        );
        let order = Order {
            order_id,
            user_id: ctx.user_id,
            voucher_id,
            created_at: now,
        };
        // Stock is only re-checked per user here, so another user taking the
        // last unit in between is an ordinary sell-out, not a conflict.
        Ok(match self.repo.create_order(&order).await? {
            PersistOutcome::Persisted => SubmitOutcome::Admitted { order_id },
            PersistOutcome::AlreadyExists => RejectReason::DuplicateOrder.into(),
            PersistOutcome::StockExhausted => RejectReason::OutOfStock.into(),
        })
    }

    async fn release_quietly(&self, lock: Lock<Acquired>) {
        let key = lock.key().to_string();
        if let Err(e) = self.lock.release(lock).await {
            tracing::warn!(key = %key, error = %e, "Order lock release failed");
        }
    }
}

async fn join_section<T>(
    section: tokio::task::JoinHandle<RushlineResult<T>>,
) -> RushlineResult<T> {
    section.await.map_err(|e| {
        tracing::error!(error = %e, "Order persistence task aborted");
        OrderError::PersistenceAborted {
            reason: e.to_string(),
        }
    })?
}
