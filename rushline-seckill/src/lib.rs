//! Rushline Seckill - flash-sale order admission
//!
//! [`OrderAdmissionPipeline`] admits or rejects purchase requests with one
//! atomic script in the shared store and hands admitted orders to the
//! [`OrderWorkerPool`], which persists them through the idempotent
//! [`OrderPersister`].

pub mod admission;
pub mod buffer;
pub mod metrics;
pub mod persister;
pub mod telemetry;
pub mod worker;

pub use admission::OrderAdmissionPipeline;
pub use buffer::LocalOrderBuffer;
pub use metrics::{PipelineMetrics, PipelineSnapshot};
pub use persister::{HandleOutcome, OrderPersister};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use worker::OrderWorkerPool;
