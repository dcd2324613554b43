//! Order Worker Pool
//!
//! Consumes admitted order requests and persists them through
//! [`OrderPersister`]. The pool is an owned resource with an explicit
//! lifecycle: build it once at process start, call [`OrderWorkerPool::start`],
//! and call [`OrderWorkerPool::shutdown`] before exit.
//!
//! # Delivery model
//!
//! With [`DispatchMode::DurableStream`] each worker is a named consumer in
//! the stream's consumer group. A read moves an entry into that consumer's
//! pending list, and only a successful handle acknowledges it. A worker that
//! dies between read and acknowledge leaves the entry pending; the recovery
//! sweep, run on start and after every failure, re-reads the consumer's own
//! pending list oldest-first and sends each entry through the same
//! idempotent persistence path.
//!
//! Entries pending on a consumer that no longer runs (the pool shrank, or a
//! host went away for good) are taken over by the claim sweep: every
//! `claim_idle`, each worker claims entries that have sat unacknowledged in
//! any consumer's list for at least that long and handles them the same way.
//!
//! With [`DispatchMode::LocalBuffer`] a single drain task empties the
//! in-process buffer. Nothing is redelivered on that path.
//!
//! [`DispatchMode::Synchronous`] persists inline in the admission pipeline,
//! so the pool starts no tasks.

use crate::buffer::LocalOrderBuffer;
use crate::metrics::PipelineMetrics;
use crate::persister::OrderPersister;
use rushline_core::{
    AdmissionSettings, ConfigError, DispatchMode, OrderRequest, QueueTask, RushlineError,
    RushlineResult, StoreError, WorkerSettings,
};
use rushline_storage::{KvStore, StreamEntry};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// SHARED WORKER STATE
// ============================================================================

struct WorkerShared {
    store: Arc<dyn KvStore>,
    persister: OrderPersister,
    stream: String,
    group: String,
    settings: WorkerSettings,
    metrics: Arc<PipelineMetrics>,
}

impl WorkerShared {
    fn decode(&self, entry: &StreamEntry, from_pending: bool) -> RushlineResult<QueueTask> {
        let request: OrderRequest =
            serde_json::from_str(&entry.payload).map_err(|e| StoreError::Codec {
                reason: format!("stream entry {}: {}", entry.id, e),
            })?;
        Ok(QueueTask {
            entry_id: entry.id.clone(),
            request,
            redelivered: from_pending || entry.delivery_count > 1,
        })
    }

    /// Handle a batch, acknowledging every entry that was handled.
    ///
    /// Entries that fail stay pending; the first failure is returned after
    /// the rest of the batch has been tried. Returns the number acknowledged.
    async fn process_entries(
        &self,
        consumer: &str,
        entries: Vec<StreamEntry>,
        from_pending: bool,
    ) -> RushlineResult<usize> {
        let mut acked = 0;
        let mut first_error: Option<RushlineError> = None;

        for entry in entries {
            let handled = match self.decode(&entry, from_pending) {
                Ok(task) => self.persister.handle(&task).await.map(|_| ()),
                Err(err) => {
                    // An undecodable entry can never succeed; drop it rather
                    // than let it sit at the head of the pending list.
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        consumer = %consumer,
                        entry_id = %entry.id,
                        error = %err,
                        "Discarding undecodable order entry"
                    );
                    Ok(())
                }
            };

            match handled {
                Ok(()) => {
                    if self
                        .store
                        .stream_ack(&self.stream, &self.group, &entry.id)
                        .await?
                    {
                        self.metrics.acked.fetch_add(1, Ordering::Relaxed);
                        acked += 1;
                    }
                }
                Err(err) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        consumer = %consumer,
                        entry_id = %entry.id,
                        error = %err,
                        "Order entry left pending after failure"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(acked),
        }
    }

    async fn process_once(&self, consumer: &str) -> RushlineResult<usize> {
        let entries = self
            .store
            .stream_read_new(
                &self.stream,
                &self.group,
                consumer,
                self.settings.read_count,
                self.settings.block,
            )
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }
        self.process_entries(consumer, entries, false).await
    }

    async fn recover_pending(&self, consumer: &str) -> RushlineResult<usize> {
        let mut recovered = 0;
        loop {
            let entries = self
                .store
                .stream_read_pending(
                    &self.stream,
                    &self.group,
                    consumer,
                    self.settings.pending_batch,
                )
                .await?;
            if entries.is_empty() {
                break;
            }
            let acked = self.process_entries(consumer, entries, true).await?;
            if acked == 0 {
                break;
            }
            recovered += acked;
        }

        if recovered > 0 {
            tracing::info!(
                consumer = %consumer,
                stream = %self.stream,
                recovered,
                "Pending order entries recovered"
            );
        }
        Ok(recovered)
    }

    async fn claim_idle(&self, consumer: &str) -> RushlineResult<usize> {
        let mut claimed = 0;
        loop {
            let entries = self
                .store
                .stream_claim_idle(
                    &self.stream,
                    &self.group,
                    consumer,
                    self.settings.claim_idle,
                    self.settings.pending_batch,
                )
                .await?;
            if entries.is_empty() {
                break;
            }
            let acked = self.process_entries(consumer, entries, true).await?;
            if acked == 0 {
                break;
            }
            claimed += acked;
        }

        if claimed > 0 {
            tracing::info!(
                consumer = %consumer,
                stream = %self.stream,
                claimed,
                "Idle order entries claimed from other consumers"
            );
        }
        Ok(claimed)
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

async fn consumer_task(
    shared: Arc<WorkerShared>,
    consumer: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!(
        consumer = %consumer,
        stream = %shared.stream,
        group = %shared.group,
        "Order worker started"
    );

    if let Err(e) = shared.recover_pending(&consumer).await {
        tracing::warn!(consumer = %consumer, error = %e, "Startup recovery sweep failed");
    }
    let mut last_claim = Instant::now();
    if let Err(e) = shared.claim_idle(&consumer).await {
        tracing::warn!(consumer = %consumer, error = %e, "Startup claim sweep failed");
    }

    while !*shutdown_rx.borrow() {
        if last_claim.elapsed() >= shared.settings.claim_idle {
            last_claim = Instant::now();
            if let Err(e) = shared.claim_idle(&consumer).await {
                tracing::warn!(consumer = %consumer, error = %e, "Claim sweep failed");
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            result = shared.process_once(&consumer) => {
                if let Err(e) = result {
                    shared.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(consumer = %consumer, error = %e, "Order worker read failed");
                    tokio::time::sleep(shared.settings.error_backoff).await;
                    if let Err(e) = shared.recover_pending(&consumer).await {
                        tracing::warn!(consumer = %consumer, error = %e, "Recovery sweep failed");
                    }
                }
            }
        }
    }

    tracing::info!(consumer = %consumer, "Order worker shutting down");
}

async fn buffer_drain_task(
    shared: Arc<WorkerShared>,
    mut rx: mpsc::Receiver<OrderRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!("Local order buffer drain started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            next = rx.recv() => {
                let Some(request) = next else { break };
                if let Err(e) = shared.persister.persist(&request).await {
                    // The buffer cannot redeliver, so this order is lost.
                    shared.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        order_id = %request.order_id,
                        user_id = %request.user_id,
                        voucher_id = %request.voucher_id,
                        error = %e,
                        "Buffered order could not be persisted"
                    );
                }
            }
        }
    }

    tracing::info!(dropped = rx.len(), "Local order buffer drain shutting down");
}

// ============================================================================
// POOL
// ============================================================================

pub struct OrderWorkerPool {
    shared: Arc<WorkerShared>,
    dispatch: DispatchMode,
    buffer: Option<Arc<LocalOrderBuffer>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderWorkerPool {
    pub fn new(
        store: Arc<dyn KvStore>,
        persister: OrderPersister,
        admission: &AdmissionSettings,
        settings: WorkerSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(WorkerShared {
                store,
                persister,
                stream: admission.stream.clone(),
                group: admission.group.clone(),
                settings,
                metrics,
            }),
            dispatch: admission.dispatch,
            buffer: None,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Attach the buffer the admission pipeline pushes to in
    /// [`DispatchMode::LocalBuffer`].
    pub fn with_buffer(mut self, buffer: Arc<LocalOrderBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.shared.metrics
    }

    pub fn is_running(&self) -> bool {
        !self.lock_handles().is_empty()
    }

    /// Spawn the workers for the configured dispatch mode.
    ///
    /// Creates the consumer group first in durable mode. Calling `start` on
    /// a running pool does nothing.
    pub async fn start(&self) -> RushlineResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.shutdown_tx.send_replace(false);

        let mut spawned = Vec::new();
        match self.dispatch {
            DispatchMode::DurableStream => {
                self.shared
                    .store
                    .stream_ensure_group(&self.shared.stream, &self.shared.group)
                    .await?;
                for i in 0..self.shared.settings.count.max(1) {
                    spawned.push(tokio::spawn(consumer_task(
                        self.shared.clone(),
                        format!("worker-{}", i),
                        self.shutdown_tx.subscribe(),
                    )));
                }
            }
            DispatchMode::LocalBuffer => {
                let buffer = self.buffer.as_ref().ok_or_else(|| ConfigError::MissingRequired {
                    field: "local order buffer".to_string(),
                })?;
                let rx = buffer.take_receiver().ok_or_else(|| ConfigError::InvalidValue {
                    field: "local order buffer".to_string(),
                    value: "taken".to_string(),
                    reason: "receiver already handed to another drain".to_string(),
                })?;
                spawned.push(tokio::spawn(buffer_drain_task(
                    self.shared.clone(),
                    rx,
                    self.shutdown_tx.subscribe(),
                )));
            }
            DispatchMode::Synchronous => {}
        }

        tracing::info!(
            dispatch = %self.dispatch,
            workers = spawned.len(),
            stream = %self.shared.stream,
            group = %self.shared.group,
            "Order worker pool started"
        );
        self.lock_handles().extend(spawned);
        Ok(())
    }

    /// Read and handle one batch of new entries as `consumer`.
    pub async fn process_once(&self, consumer: &str) -> RushlineResult<usize> {
        self.shared.process_once(consumer).await
    }

    /// Reprocess `consumer`'s pending entries until its pending list is
    /// empty. Returns how many were acknowledged.
    pub async fn recover_pending(&self, consumer: &str) -> RushlineResult<usize> {
        self.shared.recover_pending(consumer).await
    }

    /// Take over and handle entries idle for at least `claim_idle` in any
    /// consumer's pending list. Returns how many were acknowledged.
    pub async fn claim_idle(&self, consumer: &str) -> RushlineResult<usize> {
        self.shared.claim_idle(consumer).await
    }

    /// Entries delivered to any consumer and not yet acknowledged.
    pub async fn pending_count(&self) -> RushlineResult<u64> {
        self.shared
            .store
            .stream_pending_count(&self.shared.stream, &self.shared.group)
            .await
    }

    /// Signal every worker and wait for them to stop.
    ///
    /// An entry being handled when the signal arrives is left pending and
    /// picked up by the next recovery sweep.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<_> = self.lock_handles().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Order worker task failed");
            }
        }

        let snapshot = self.shared.metrics.snapshot();
        tracing::info!(
            persisted = snapshot.persisted,
            duplicates_skipped = snapshot.duplicates_skipped,
            persistence_conflicts = snapshot.persistence_conflicts,
            redelivered = snapshot.redelivered,
            acked = snapshot.acked,
            errors = snapshot.errors,
            "Order worker pool stopped"
        );
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rushline_core::{OrderId, UserId, VoucherId, VoucherStock};
    use rushline_storage::{InMemoryKvStore, InMemoryOrderRepository, OrderRepository};

    struct Fixture {
        store: Arc<InMemoryKvStore>,
        repo: Arc<InMemoryOrderRepository>,
        pool: OrderWorkerPool,
        admission: AdmissionSettings,
    }

    async fn fixture(stock: i64) -> Fixture {
        let store = Arc::new(InMemoryKvStore::new());
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
        let admission = AdmissionSettings::default();
        let settings = WorkerSettings {
            block: std::time::Duration::from_millis(20),
            ..WorkerSettings::default()
        };
        let pool = OrderWorkerPool::new(
            store.clone(),
            OrderPersister::new(repo.clone(), metrics.clone()),
            &admission,
            settings,
            metrics,
        );
        store
            .stream_ensure_group(&admission.stream, &admission.group)
            .await
            .unwrap();
        Fixture {
            store,
            repo,
            pool,
            admission,
        }
    }

    async fn append(fx: &Fixture, user: u64) -> String {
        let request = OrderRequest {
            order_id: OrderId::new(500 + user),
            user_id: UserId::new(user),
            voucher_id: VoucherId::new(1),
            requested_at: Utc::now(),
        };
        fx.store
            .stream_append(&fx.admission.stream, &serde_json::to_string(&request).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_once_persists_and_acks() {
        let fx = fixture(3).await;
        append(&fx, 1).await;

        assert_eq!(fx.pool.process_once("worker-0").await.unwrap(), 1);
        assert_eq!(fx.repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_read_returns_zero() {
        let fx = fixture(3).await;
        assert_eq!(fx.pool.process_once("worker-0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_dropped() {
        let fx = fixture(3).await;
        fx.store
            .stream_append(&fx.admission.stream, "not json")
            .await
            .unwrap();

        assert_eq!(fx.pool.process_once("worker-0").await.unwrap(), 1);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 0);
        assert_eq!(fx.pool.metrics().snapshot().errors, 1);
        assert_eq!(fx.repo.count_orders(VoucherId::new(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_pending_reprocesses_unacked_entry() {
        let fx = fixture(3).await;
        append(&fx, 4).await;

        // Simulated crash: delivered, never handled or acked.
        let delivered = fx
            .store
            .stream_read_new(
                &fx.admission.stream,
                &fx.admission.group,
                "worker-0",
                1,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 1);

        assert_eq!(fx.pool.recover_pending("worker-0").await.unwrap(), 1);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 0);
        assert_eq!(fx.repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);
        assert_eq!(fx.pool.metrics().snapshot().redelivered, 1);
    }

    #[tokio::test]
    async fn test_recover_only_touches_own_pending_list() {
        let fx = fixture(3).await;
        append(&fx, 5).await;
        fx.store
            .stream_read_new(
                &fx.admission.stream,
                &fx.admission.group,
                "worker-1",
                1,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(fx.pool.recover_pending("worker-0").await.unwrap(), 0);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recovery_skips_past_undecodable_head() {
        let fx = fixture(3).await;
        let batch = WorkerSettings::default().pending_batch;
        for _ in 0..batch + 4 {
            fx.store.stream_append(&fx.admission.stream, "").await.unwrap();
        }
        append(&fx, 6).await;

        fx.store
            .stream_read_new(
                &fx.admission.stream,
                &fx.admission.group,
                "worker-0",
                100,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(fx.pool.recover_pending("worker-0").await.unwrap(), batch + 5);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 0);
        assert_eq!(fx.repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_idle_takes_over_orphaned_entries() {
        let fx = fixture(3).await;
        append(&fx, 9).await;
        fx.store
            .stream_read_new(
                &fx.admission.stream,
                &fx.admission.group,
                "worker-7",
                1,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(fx.pool.claim_idle("worker-0").await.unwrap(), 0);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 1);

        tokio::time::advance(WorkerSettings::default().claim_idle).await;
        assert_eq!(fx.pool.claim_idle("worker-0").await.unwrap(), 1);
        assert_eq!(fx.pool.pending_count().await.unwrap(), 0);
        assert_eq!(fx.repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);
        assert_eq!(fx.pool.metrics().snapshot().redelivered, 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let fx = fixture(3).await;
        fx.pool.start().await.unwrap();
        assert!(fx.pool.is_running());

        append(&fx, 8).await;
        for _ in 0..100 {
            if fx.repo.count_orders(VoucherId::new(1)).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fx.repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);

        fx.pool.shutdown().await;
        assert!(!fx.pool.is_running());
    }

    #[tokio::test]
    async fn test_local_buffer_mode_requires_buffer() {
        let store = Arc::new(InMemoryKvStore::new());
        let repo = Arc::new(InMemoryOrderRepository::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let admission = AdmissionSettings {
            dispatch: DispatchMode::LocalBuffer,
            ..AdmissionSettings::default()
        };
        let pool = OrderWorkerPool::new(
            store,
            OrderPersister::new(repo, metrics.clone()),
            &admission,
            WorkerSettings::default(),
            metrics,
        );

        let err = pool.start().await.unwrap_err();
        assert!(matches!(
            err,
            RushlineError::Config(ConfigError::MissingRequired { .. })
        ));
        assert!(!pool.is_running());
    }
}
