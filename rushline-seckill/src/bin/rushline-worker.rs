//! Rushline order worker entry point.
//!
//! Connects to Redis and PostgreSQL from the environment, makes sure the
//! schema exists, and runs the order worker pool until interrupted.

use rushline_core::{RushlineConfig, RushlineResult};
use rushline_seckill::{
    init_tracing, OrderPersister, OrderWorkerPool, PipelineMetrics, TelemetryConfig,
};
use rushline_storage::{DbConfig, PgOrderRepository, RedisKvStore, RedisSettings};
use std::sync::Arc;

#[tokio::main]
async fn main() -> RushlineResult<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let config = RushlineConfig::from_env();
    config.validate()?;

    let store = Arc::new(RedisKvStore::connect(&RedisSettings::from_env()).await?);
    let repo = Arc::new(PgOrderRepository::from_config(&DbConfig::from_env())?);
    repo.ensure_schema().await?;

    let metrics = Arc::new(PipelineMetrics::new());
    let pool = OrderWorkerPool::new(
        store,
        OrderPersister::new(repo, metrics.clone()),
        &config.admission,
        config.worker.clone(),
        metrics,
    );
    pool.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        tracing::info!("Shutdown signal received");
    }

    pool.shutdown().await;
    Ok(())
}
