//! Redelivery and crash recovery of queued orders.

use rushline_core::{DispatchMode, QueueTask, UserId, VoucherId};
use rushline_seckill::{
    HandleOutcome, OrderAdmissionPipeline, OrderPersister, OrderWorkerPool, PipelineMetrics,
};
use rushline_storage::{InMemoryKvStore, InMemoryOrderRepository, KvStore, OrderRepository};
use rushline_test_utils::assertions::assert_admitted;
use rushline_test_utils::fixtures::{memory_stores, open_voucher, request_context, test_config};
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    store: Arc<InMemoryKvStore>,
    repo: Arc<InMemoryOrderRepository>,
    pipeline: OrderAdmissionPipeline,
    pool: OrderWorkerPool,
    stream: String,
    group: String,
}

async fn rig() -> Rig {
    let (store, repo) = memory_stores();
    let mut config = test_config();
    config.admission.dispatch = DispatchMode::DurableStream;
    let metrics = Arc::new(PipelineMetrics::new());

    let pipeline =
        OrderAdmissionPipeline::new(store.clone(), repo.clone(), &config, metrics.clone());
    let pool = OrderWorkerPool::new(
        store.clone(),
        OrderPersister::new(repo.clone(), metrics.clone()),
        &config.admission,
        config.worker.clone(),
        metrics,
    );
    store
        .stream_ensure_group(&config.admission.stream, &config.admission.group)
        .await
        .unwrap();

    Rig {
        store,
        repo,
        pipeline,
        pool,
        stream: config.admission.stream,
        group: config.admission.group,
    }
}

#[tokio::test]
async fn test_crash_between_delivery_and_ack_is_recovered() {
    let rig = rig().await;
    rig.pipeline
        .publish_voucher(&open_voucher(1, 10))
        .await
        .unwrap();
    assert_admitted(
        &rig.pipeline
            .submit(&request_context(42), VoucherId::new(1))
            .await
            .unwrap(),
    );

    // The worker takes the entry and dies before persisting or acking.
    let delivered = rig
        .store
        .stream_read_new(&rig.stream, &rig.group, "worker-0", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(rig.pool.pending_count().await.unwrap(), 1);
    assert_eq!(rig.repo.count_orders(VoucherId::new(1)).await.unwrap(), 0);

    // Nothing new to read: the entry is only visible to its consumer.
    assert_eq!(rig.pool.process_once("worker-1").await.unwrap(), 0);

    assert_eq!(rig.pool.recover_pending("worker-0").await.unwrap(), 1);
    assert_eq!(rig.pool.pending_count().await.unwrap(), 0);
    assert_eq!(rig.repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);
    assert!(rig
        .repo
        .order_exists(UserId::new(42), VoucherId::new(1))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_crash_after_persist_before_ack_writes_once() {
    let rig = rig().await;
    rig.pipeline
        .publish_voucher(&open_voucher(2, 10))
        .await
        .unwrap();
    rig.pipeline
        .submit(&request_context(7), VoucherId::new(2))
        .await
        .unwrap();

    // Persisted, then died before the ack.
    let delivered = rig
        .store
        .stream_read_new(&rig.stream, &rig.group, "worker-0", 1, Duration::ZERO)
        .await
        .unwrap();
    let task = QueueTask {
        entry_id: delivered[0].id.clone(),
        request: serde_json::from_str(&delivered[0].payload).unwrap(),
        redelivered: false,
    };
    assert_eq!(
        rig.pipeline.persister().handle(&task).await.unwrap(),
        HandleOutcome::Persisted
    );

    assert_eq!(rig.pool.recover_pending("worker-0").await.unwrap(), 1);
    assert_eq!(rig.repo.count_orders(VoucherId::new(2)).await.unwrap(), 1);
    assert_eq!(
        rig.repo.voucher(VoucherId::new(2)).await.unwrap().unwrap().stock,
        9
    );

    let snapshot = rig.pool.metrics().snapshot();
    assert_eq!(snapshot.persisted, 1);
    assert_eq!(snapshot.duplicates_skipped, 1);
    assert_eq!(snapshot.redelivered, 1);
}

#[tokio::test]
async fn test_started_pool_sweeps_pending_on_startup() {
    let rig = rig().await;
    rig.pipeline
        .publish_voucher(&open_voucher(3, 10))
        .await
        .unwrap();
    for user in 1..=3u64 {
        rig.pipeline
            .submit(&request_context(user), VoucherId::new(3))
            .await
            .unwrap();
    }
    rig.store
        .stream_read_new(&rig.stream, &rig.group, "worker-0", 3, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(rig.pool.pending_count().await.unwrap(), 3);

    rig.pool.start().await.unwrap();
    for _ in 0..200 {
        if rig.pool.pending_count().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    rig.pool.shutdown().await;

    assert_eq!(rig.pool.pending_count().await.unwrap(), 0);
    assert_eq!(rig.repo.count_orders(VoucherId::new(3)).await.unwrap(), 3);
}

#[tokio::test]
async fn test_stock_guard_conflict_is_acked_not_retried() {
    let rig = rig().await;
    let voucher = open_voucher(4, 1);
    rig.pipeline.publish_voucher(&voucher).await.unwrap();
    // Durable stock drifts below what the shared store admitted.
    rig.repo
        .upsert_voucher(&rushline_core::VoucherStock {
            stock: 0,
            ..voucher
        })
        .await
        .unwrap();

    assert_admitted(
        &rig.pipeline
            .submit(&request_context(5), VoucherId::new(4))
            .await
            .unwrap(),
    );
    assert_eq!(rig.pool.process_once("worker-0").await.unwrap(), 1);

    assert_eq!(rig.pool.pending_count().await.unwrap(), 0);
    assert_eq!(rig.repo.count_orders(VoucherId::new(4)).await.unwrap(), 0);
    assert_eq!(rig.pool.metrics().snapshot().persistence_conflicts, 1);
}
