//! # Batchwork
//!
//! A durable, multi-tenant task queue backed by PostgreSQL.
//!
//! Producers submit a named set of tasks as a *queue*; workers claim tasks one at a
//! time under a time-bounded lease, run them, and report a result or an error. When
//! every task of a queue has reached a terminal state, the queue's callback URL (if
//! any) receives all results in a single POST, exactly once.
//!
//! ## Features
//!
//! - **Batched ingestion**: tasks are inserted in bulk batches of 1000 rows, all
//!   inside the transaction that creates the queue
//! - **Lease-based claiming**: `FOR UPDATE SKIP LOCKED` hands each task to at most one
//!   worker at a time; a task whose lease ran out becomes claimable again
//! - **Write-once results**: the first terminal outcome is kept, later submissions
//!   are rejected
//! - **Exactly-once completion callbacks**, optionally HMAC-signed
//! - **Prometheus metrics** (default feature `metrics`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "postgres")]
//! # #[tokio::main]
//! # async fn main() -> batchwork::Result<()> {
//! use batchwork::{
//!     BatchworkConfig, ClaimSelector, TaskService, Worker,
//!     registry::QueueOptions, worker::task_handler,
//! };
//! use serde_json::json;
//!
//! let config = BatchworkConfig::from_env()?;
//! let service = TaskService::connect(&config).await?;
//!
//! let tasks = [("first".to_string(), json!({"n": 1}))].into_iter().collect();
//! let options = QueueOptions::new()
//!     .with_callback("https://example.com/done")
//!     .with_expiry_time(60_000);
//! service.create_queue_and_enqueue("resize", options, tasks).await?;
//!
//! let handler = task_handler(|task| async move { Ok(task.params) });
//! let worker = Worker::new(service, ClaimSelector::Type("resize".into()), handler);
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
//! worker.run(shutdown_rx).await?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "postgres"))]
//! # fn main() {}
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL store and migrations
//! - `metrics` - Prometheus metrics collection (default)
//! - `callbacks` - HTTP completion callbacks with optional signing (default)
//! - `test` - in-memory [`queue::test::TestStore`] and a recording callback sender

pub mod batch;
pub mod config;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod migrations;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod results;
pub mod service;
pub mod task;
pub mod worker;

pub use batch::{IngestionBatcher, IngestionReport, TaskSet};
pub use config::{BatchworkConfig, LoggingConfig};
pub use error::BatchworkError;
pub use lease::LeaseManager;
pub use metrics::{MetricsConfig, PrometheusMetricsCollector};
pub use notify::{CallbackPayload, CallbackSender, CompletionNotifier, NotificationDelivery};
pub use queue::{TaskQueue, TaskStore};
pub use registry::{Queue, QueueId, QueueOptions, QueueRegistry};
pub use results::{ResultCollector, SubmissionReceipt};
pub use service::{QueueStatus, TaskService};
pub use task::{ClaimSelector, Task, TaskId, TaskOutcome, TaskStatus, TaskSubmission};
pub use worker::{TaskHandler, Worker};

#[cfg(feature = "callbacks")]
pub use notify::HttpCallbackSender;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BatchworkError>;
