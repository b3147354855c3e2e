//! Batched ingestion of tasks into a queue.
//!
//! A producer hands over a [`TaskSet`] (task key to params). The
//! [`IngestionBatcher`] snapshots one placeholder expiry timestamp, splits the set
//! into fixed-size [`TaskBatch`]es and writes each batch as a single bulk insert,
//! one batch after the other. Batches are applied in key order, so a duplicate-key
//! conflict is always reported for the same batch.
//!
//! Outside of [`QueueRegistry::create_queue_and_enqueue`](crate::registry::QueueRegistry::create_queue_and_enqueue)
//! the batches are not wrapped in a single transaction: a failure in batch `n`
//! leaves batches `0..n` persisted.
//!
//! # Examples
//!
//! ```rust
//! use batchwork::batch::{IngestionPlan, TaskSet};
//! use batchwork::registry::QueueOptions;
//! use serde_json::json;
//!
//! let mut tasks = TaskSet::new();
//! for i in 0..2500 {
//!     tasks.insert(format!("task-{:04}", i), json!({"n": i}));
//! }
//!
//! let plan = IngestionPlan::build(
//!     tasks,
//!     &QueueOptions::new(),
//!     chrono::Duration::minutes(2),
//!     1000,
//!     chrono::Utc::now(),
//! )
//! .unwrap();
//!
//! assert_eq!(plan.batch_count(), 3);
//! assert_eq!(plan.task_count(), 2500);
//! ```

use crate::{
    BatchworkError, Result,
    metrics::PrometheusMetricsCollector,
    queue::TaskStore,
    registry::{QueueId, QueueOptions},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tracing::{debug, error, info};

/// Number of tasks persisted per bulk insert.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Producer input: task key to params. Keys are unique by construction.
pub type TaskSet = BTreeMap<String, Value>;

/// Converts a JSON object into a [`TaskSet`], rejecting anything else.
pub fn parse_task_set(value: Value) -> Result<TaskSet> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(BatchworkError::Ingestion {
            message: format!(
                "tasks must be a JSON object of task id to params, got {}",
                json_kind(&other)
            ),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A task row waiting to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: String,
    pub params: Value,
}

/// One bulk insert worth of tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBatch {
    /// Zero-based position of the batch within its ingestion call.
    pub index: usize,
    pub tasks: Vec<NewTask>,
}

impl TaskBatch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A validated, chunked ingestion request.
#[derive(Debug, Clone)]
pub struct IngestionPlan {
    /// Placeholder expiry written to every new row. Overwritten on claim.
    pub expiry_time: DateTime<Utc>,
    pub lease: chrono::Duration,
    pub batch_size: usize,
    pub batches: Vec<TaskBatch>,
}

impl IngestionPlan {
    /// Validates `tasks` and splits it into batches of at most `batch_size`.
    pub fn build(
        tasks: TaskSet,
        options: &QueueOptions,
        default_lease: chrono::Duration,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if tasks.is_empty() {
            return Err(BatchworkError::Ingestion {
                message: "task set cannot be empty".to_string(),
            });
        }

        if let Some(key) = tasks.keys().find(|k| k.trim().is_empty()) {
            return Err(BatchworkError::Ingestion {
                message: format!("task id cannot be blank (got {:?})", key),
            });
        }

        let batch_size = batch_size.max(1);
        let lease = options.lease_duration(default_lease)?;
        let expiry_time = now
            .checked_add_signed(lease)
            .ok_or_else(|| BatchworkError::InvalidOptions {
                message: format!("lease of {}ms overflows the expiry time", lease.num_milliseconds()),
            })?;

        let entries: Vec<NewTask> = tasks
            .into_iter()
            .map(|(task_id, params)| NewTask { task_id, params })
            .collect();

        let batches = entries
            .chunks(batch_size)
            .enumerate()
            .map(|(index, chunk)| TaskBatch {
                index,
                tasks: chunk.to_vec(),
            })
            .collect();

        Ok(Self {
            expiry_time,
            lease,
            batch_size,
            batches,
        })
    }

    pub fn task_count(&self) -> u64 {
        self.batches.iter().map(|b| b.len() as u64).sum()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

/// Throughput summary of one ingestion call. Observational only.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub queue_id: QueueId,
    pub task_count: u64,
    pub batch_count: usize,
    pub batch_size: usize,
    pub elapsed: std::time::Duration,
}

impl IngestionReport {
    pub(crate) fn log(&self) {
        info!(
            queue_id = self.queue_id,
            "Total-time-taken: {:.3} seconds",
            self.elapsed.as_secs_f64()
        );
        info!(
            queue_id = self.queue_id,
            "Total tasks: {}, Total batches: {}, Batch size: {}",
            self.task_count,
            self.batch_count,
            self.batch_size
        );
    }
}

/// Chunks task sets and persists them batch by batch.
pub struct IngestionBatcher<S: TaskStore> {
    store: Arc<S>,
    batch_size: usize,
    default_lease: chrono::Duration,
    metrics: Option<Arc<PrometheusMetricsCollector>>,
}

impl<S: TaskStore> Clone for IngestionBatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            batch_size: self.batch_size,
            default_lease: self.default_lease,
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: TaskStore> IngestionBatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            default_lease: crate::registry::default_lease(),
            metrics: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_default_lease(mut self, lease: chrono::Duration) -> Self {
        self.default_lease = lease;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Builds an [`IngestionPlan`] against the store's clock.
    pub fn plan(&self, tasks: TaskSet, options: &QueueOptions) -> Result<IngestionPlan> {
        IngestionPlan::build(
            tasks,
            options,
            self.default_lease,
            self.batch_size,
            self.store.now(),
        )
    }

    /// Ingests `tasks` into an existing queue and returns the number of tasks written.
    pub async fn enqueue(
        &self,
        queue_id: QueueId,
        tasks: TaskSet,
        options: &QueueOptions,
    ) -> Result<u64> {
        Ok(self
            .enqueue_with_report(queue_id, tasks, options)
            .await?
            .task_count)
    }

    /// Like [`enqueue`](Self::enqueue) but returns the throughput report.
    pub async fn enqueue_with_report(
        &self,
        queue_id: QueueId,
        tasks: TaskSet,
        options: &QueueOptions,
    ) -> Result<IngestionReport> {
        let plan = self.plan(tasks, options)?;
        let total_batches = plan.batch_count();
        info!(queue_id, "Total Batches: {}", total_batches);

        let started = Instant::now();
        for batch in &plan.batches {
            let inserted = self
                .store
                .insert_task_batch(queue_id, batch, plan.expiry_time)
                .await
                .map_err(|e| {
                    error!(
                        queue_id,
                        batch = batch.index,
                        "Error inserting task batch: {}",
                        e
                    );
                    batch_failure(batch.index, total_batches, e)
                })?;
            debug!(queue_id, batch = batch.index, inserted, "Inserted task batch");
        }

        let report = IngestionReport {
            queue_id,
            task_count: plan.task_count(),
            batch_count: total_batches,
            batch_size: plan.batch_size,
            elapsed: started.elapsed(),
        };
        self.record(&report);
        Ok(report)
    }

    pub(crate) fn record(&self, report: &IngestionReport) {
        report.log();
        if let Some(metrics) = &self.metrics {
            metrics.record_ingestion(report);
        }
    }
}

/// Wraps a batch insert failure as an ingestion error naming the batch.
pub(crate) fn batch_failure(index: usize, total: usize, err: BatchworkError) -> BatchworkError {
    match err {
        BatchworkError::Ingestion { .. } => err,
        other => BatchworkError::Ingestion {
            message: format!("batch {} of {} failed: {}", index + 1, total, other),
        },
    }
}
