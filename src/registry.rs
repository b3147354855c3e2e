//! Queue creation and lookup.
//!
//! A queue is created once, tagged with a free-form `type` and an options bag,
//! and never modified afterwards (apart from the completion latch the notifier
//! sets once every task has finished).

use crate::{
    BatchworkError, Result,
    batch::{IngestionBatcher, IngestionReport, TaskSet},
    queue::TaskStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Instant};
use tracing::{error, info};

/// Store-generated identifier of a queue.
pub type QueueId = i64;

/// Lease duration used when a queue does not configure `expiryTime`.
pub const DEFAULT_LEASE_MS: u64 = 120_000;

/// Longest lease a queue may configure through `expiryTime` (one year).
pub const MAX_LEASE_MS: u64 = 365 * 24 * 60 * 60 * 1000;

pub(crate) fn default_lease() -> chrono::Duration {
    chrono::Duration::milliseconds(DEFAULT_LEASE_MS as i64)
}

/// Per-queue options. Unrecognized keys are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// URL notified with the aggregated results once the queue drains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,

    /// Lease duration in milliseconds.
    #[serde(
        rename = "expiryTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry_time: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback = Some(url.into());
        self
    }

    pub fn with_expiry_time(mut self, millis: u64) -> Self {
        self.expiry_time = Some(millis);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Rejects options that cannot be stored or leased against.
    pub fn validate(&self) -> Result<()> {
        self.lease_duration(default_lease()).map(|_| ())
    }

    /// The lease granted on claim: `expiryTime` if set, otherwise `default`.
    ///
    /// Fails when `expiryTime` exceeds [`MAX_LEASE_MS`].
    pub fn lease_duration(&self, default: chrono::Duration) -> Result<chrono::Duration> {
        let Some(ms) = self.expiry_time else {
            return Ok(default);
        };
        if ms > MAX_LEASE_MS {
            return Err(BatchworkError::InvalidOptions {
                message: format!("expiryTime must be at most {} ms (got {})", MAX_LEASE_MS, ms),
            });
        }
        i64::try_from(ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .ok_or_else(|| BatchworkError::InvalidOptions {
                message: format!("expiryTime out of range: {}", ms),
            })
    }

    /// Non-empty callback URL, if any.
    pub fn callback_url(&self) -> Option<&str> {
        self.callback.as_deref().filter(|url| !url.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    #[serde(rename = "type")]
    pub queue_type: String,
    pub options: QueueOptions,
    pub created_at: DateTime<Utc>,
    /// Set once, when the completion notifier observes the drained queue.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of [`QueueRegistry::create_queue_and_enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCreated {
    pub queue_id: QueueId,
    pub task_count: u64,
}

pub struct QueueRegistry<S: TaskStore> {
    store: Arc<S>,
    batcher: IngestionBatcher<S>,
}

impl<S: TaskStore> Clone for QueueRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            batcher: self.batcher.clone(),
        }
    }
}

impl<S: TaskStore> QueueRegistry<S> {
    pub fn new(store: Arc<S>, batcher: IngestionBatcher<S>) -> Self {
        Self { store, batcher }
    }

    /// Persists a new queue. Any `queue_type` string is accepted.
    pub async fn create_queue(&self, queue_type: &str, options: QueueOptions) -> Result<QueueId> {
        options
            .validate()
            .inspect_err(|e| error!(queue_type, "Error in create_queue: {}", e))?;
        let queue_id = self
            .store
            .create_queue(queue_type, &options)
            .await
            .inspect_err(|e| error!(queue_type, "Error in create_queue: {}", e))?;
        info!(queue_id, queue_type, "Created queue");
        Ok(queue_id)
    }

    /// Creates a queue and ingests `tasks` in one transaction.
    ///
    /// Either the queue and every batch become visible together, or nothing does.
    pub async fn create_queue_and_enqueue(
        &self,
        queue_type: &str,
        options: QueueOptions,
        tasks: TaskSet,
    ) -> Result<QueueCreated> {
        let plan = self
            .batcher
            .plan(tasks, &options)
            .inspect_err(|e| error!(queue_type, "Error in create_queue_and_enqueue: {}", e))?;
        info!(queue_type, "Total Batches: {}", plan.batch_count());

        let started = Instant::now();
        let queue_id = self
            .store
            .create_queue_with_tasks(queue_type, &options, &plan)
            .await
            .inspect_err(|e| error!(queue_type, "Error in create_queue_and_enqueue: {}", e))?;

        let report = IngestionReport {
            queue_id,
            task_count: plan.task_count(),
            batch_count: plan.batch_count(),
            batch_size: plan.batch_size,
            elapsed: started.elapsed(),
        };
        self.batcher.record(&report);

        Ok(QueueCreated {
            queue_id,
            task_count: report.task_count,
        })
    }

    pub async fn get_queue(&self, queue_id: QueueId) -> Result<Queue> {
        self.store
            .get_queue(queue_id)
            .await?
            .ok_or(BatchworkError::QueueNotFound { id: queue_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::test::TestStore;
    use serde_json::json;

    fn registry(store: &Arc<TestStore>) -> QueueRegistry<TestStore> {
        QueueRegistry::new(store.clone(), IngestionBatcher::new(store.clone()))
    }

    #[test]
    fn test_options_wire_format() {
        let options = QueueOptions::new()
            .with_callback("http://example/cb")
            .with_expiry_time(100)
            .with_option("owner", json!("team-a"));

        assert_eq!(
            serde_json::to_value(&options).unwrap(),
            json!({"callback": "http://example/cb", "expiryTime": 100, "owner": "team-a"})
        );

        let parsed: QueueOptions =
            serde_json::from_value(json!({"expiryTime": 250, "region": "eu"})).unwrap();
        assert_eq!(parsed.expiry_time, Some(250));
        assert_eq!(parsed.callback, None);
        assert_eq!(parsed.extra["region"], json!("eu"));
    }

    #[test]
    fn test_lease_duration_defaults() {
        assert_eq!(
            QueueOptions::new().lease_duration(default_lease()).unwrap(),
            chrono::Duration::milliseconds(120_000)
        );
        assert_eq!(
            QueueOptions::new()
                .with_expiry_time(100)
                .lease_duration(default_lease())
                .unwrap(),
            chrono::Duration::milliseconds(100)
        );
        assert_eq!(
            QueueOptions::new()
                .with_expiry_time(MAX_LEASE_MS)
                .lease_duration(default_lease())
                .unwrap(),
            chrono::Duration::days(365)
        );
    }

    #[test]
    fn test_oversized_expiry_time_is_rejected() {
        for ms in [MAX_LEASE_MS + 1, i64::MAX as u64 + 1, u64::MAX] {
            let options = QueueOptions::new().with_expiry_time(ms);
            assert!(matches!(
                options.lease_duration(default_lease()),
                Err(BatchworkError::InvalidOptions { .. })
            ));
            assert!(options.validate().is_err());
        }
    }

    #[tokio::test]
    async fn test_create_queue_rejects_oversized_expiry_time() {
        let store = Arc::new(TestStore::new());
        let registry = registry(&store);

        let err = registry
            .create_queue("lease", QueueOptions::new().with_expiry_time(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchworkError::InvalidOptions { .. }));

        let tasks: TaskSet = [("a".to_string(), json!(1))].into_iter().collect();
        let err = registry
            .create_queue_and_enqueue(
                "lease",
                QueueOptions::new().with_expiry_time(10_000_000_000_000_000),
                tasks,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatchworkError::InvalidOptions { .. }));
        assert_eq!(store.queue_count().await, 0);
    }

    #[test]
    fn test_blank_callback_is_ignored() {
        assert_eq!(QueueOptions::new().with_callback("  ").callback_url(), None);
        assert_eq!(
            QueueOptions::new().with_callback("http://cb").callback_url(),
            Some("http://cb")
        );
    }

    #[tokio::test]
    async fn test_create_and_get_queue() {
        let store = Arc::new(TestStore::new());
        let registry = registry(&store);

        let options = QueueOptions::new().with_expiry_time(500);
        let id = registry.create_queue("any-type-at-all", options.clone()).await.unwrap();

        let queue = registry.get_queue(id).await.unwrap();
        assert_eq!(queue.id, id);
        assert_eq!(queue.queue_type, "any-type-at-all");
        assert_eq!(queue.options, options);
        assert!(queue.completed_at.is_none());

        let missing = registry.get_queue(id + 100).await.unwrap_err();
        assert!(matches!(missing, BatchworkError::QueueNotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_queue_and_enqueue() {
        let store = Arc::new(TestStore::new());
        let registry = registry(&store);

        let tasks: TaskSet = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
            .into_iter()
            .collect();
        let created = registry
            .create_queue_and_enqueue("sum", QueueOptions::new(), tasks)
            .await
            .unwrap();

        assert_eq!(created.task_count, 2);
        assert_eq!(store.count_tasks(created.queue_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_create_queue_and_enqueue_rejects_empty_tasks() {
        let store = Arc::new(TestStore::new());
        let registry = registry(&store);

        let err = registry
            .create_queue_and_enqueue("sum", QueueOptions::new(), TaskSet::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BatchworkError::Ingestion { .. }));
        assert_eq!(store.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_queue_and_enqueue_leaves_no_orphan_queue() {
        let store = Arc::new(TestStore::new());
        store.fail_batch_insert(1).await;
        let registry = QueueRegistry::new(
            store.clone(),
            IngestionBatcher::new(store.clone()).with_batch_size(2),
        );

        let tasks: TaskSet = (0..5).map(|i| (format!("k{}", i), json!(i))).collect();
        let err = registry
            .create_queue_and_enqueue("sum", QueueOptions::new(), tasks)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchworkError::Ingestion { .. }));
        assert_eq!(store.queue_count().await, 0);
        assert_eq!(store.task_count().await, 0);
    }
}
