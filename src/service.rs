//! One handle over the whole task lifecycle.
//!
//! [`TaskService`] wires the registry, batcher, lease manager, result collector
//! and completion notifier around a single shared store. It holds no state of
//! its own beyond configuration; every coordination decision is made in the store.
//!
//! # Examples
//!
//! ```rust
//! # #[cfg(feature = "test")]
//! # #[tokio::main]
//! # async fn main() -> batchwork::Result<()> {
//! use batchwork::{TaskService, batch::TaskSet, registry::QueueOptions, task::TaskSubmission};
//! use batchwork::{notify::RecordingCallbackSender, queue::test::TestStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let sender = RecordingCallbackSender::new();
//! let service = TaskService::new(Arc::new(TestStore::new()), Arc::new(sender.clone()));
//!
//! let tasks: TaskSet = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
//!     .into_iter()
//!     .collect();
//! let options = QueueOptions::new().with_callback("http://example/cb");
//! let created = service.create_queue_and_enqueue("double", options, tasks).await?;
//!
//! while let Some(task) = service.claim_by_queue(created.queue_id).await? {
//!     let doubled = task.params.as_i64().unwrap_or_default() * 2;
//!     service.submit_result(TaskSubmission::success(task.id, json!(doubled))).await?;
//! }
//!
//! let results = service.get_results(created.queue_id).await?;
//! assert_eq!(results.len(), 2);
//! assert_eq!(sender.sent().len(), 1);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "test"))]
//! # fn main() {}
//! ```

use crate::{
    BatchworkError, Result,
    batch::{IngestionBatcher, IngestionReport, TaskSet},
    config::BatchworkConfig,
    lease::LeaseManager,
    metrics::PrometheusMetricsCollector,
    notify::{CallbackSender, CompletionCheck, CompletionNotifier},
    queue::TaskStore,
    registry::{Queue, QueueCreated, QueueId, QueueOptions, QueueRegistry},
    results::{ResultCollector, SubmissionReceipt},
    task::{ClaimSelector, Task, TaskId, TaskOutcome, TaskSubmission},
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// Progress snapshot of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue: Queue,
    pub total_tasks: u64,
    pub finished_tasks: u64,
    pub complete: bool,
}

pub struct TaskService<S: TaskStore> {
    store: Arc<S>,
    registry: QueueRegistry<S>,
    batcher: IngestionBatcher<S>,
    leases: LeaseManager<S>,
    collector: ResultCollector<S>,
    notifier: CompletionNotifier<S>,
    metrics: Option<Arc<PrometheusMetricsCollector>>,
    poll_interval: Duration,
}

impl<S: TaskStore> Clone for TaskService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            batcher: self.batcher.clone(),
            leases: self.leases.clone(),
            collector: self.collector.clone(),
            notifier: self.notifier.clone(),
            metrics: self.metrics.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl<S: TaskStore> TaskService<S> {
    /// Builds a service with default batch size and lease.
    pub fn new(store: Arc<S>, sender: Arc<dyn CallbackSender>) -> Self {
        Self::with_config(store, sender, &BatchworkConfig::default(), None)
    }

    pub fn with_config(
        store: Arc<S>,
        sender: Arc<dyn CallbackSender>,
        config: &BatchworkConfig,
        metrics: Option<Arc<PrometheusMetricsCollector>>,
    ) -> Self {
        let default_lease = config.default_lease();

        let mut batcher = IngestionBatcher::new(store.clone())
            .with_batch_size(config.ingestion.batch_size)
            .with_default_lease(default_lease);
        let mut leases = LeaseManager::new(store.clone()).with_default_lease(default_lease);
        let mut notifier = CompletionNotifier::new(store.clone(), sender);

        if let Some(metrics) = &metrics {
            batcher = batcher.with_metrics(metrics.clone());
            leases = leases.with_metrics(metrics.clone());
            notifier = notifier.with_metrics(metrics.clone());
        }

        let mut collector = ResultCollector::new(store.clone(), notifier.clone());
        if let Some(metrics) = &metrics {
            collector = collector.with_metrics(metrics.clone());
        }

        Self {
            registry: QueueRegistry::new(store.clone(), batcher.clone()),
            store,
            batcher,
            leases,
            collector,
            notifier,
            metrics,
            poll_interval: config.worker.poll_interval,
        }
    }

    /// Builds a service from configuration alone: HTTP callbacks when the
    /// `callbacks` feature is on, and a metrics collector when enabled.
    pub fn from_config(store: Arc<S>, config: &BatchworkConfig) -> Result<Self> {
        #[cfg(feature = "callbacks")]
        let sender: Arc<dyn CallbackSender> =
            Arc::new(crate::notify::HttpCallbackSender::new(&config.callbacks)?);
        #[cfg(not(feature = "callbacks"))]
        let sender: Arc<dyn CallbackSender> = Arc::new(crate::notify::DisabledCallbackSender);

        let metrics = if config.metrics.enabled {
            Some(Arc::new(PrometheusMetricsCollector::new(
                config.metrics.clone(),
            )?))
        } else {
            None
        };

        Ok(Self::with_config(store, sender, config, metrics))
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn metrics(&self) -> Option<&Arc<PrometheusMetricsCollector>> {
        self.metrics.as_ref()
    }

    /// Starts the Prometheus exposition server if metrics are enabled and an
    /// exposition address is configured. Returns the bound address.
    pub async fn start_metrics_server(&self) -> Result<Option<std::net::SocketAddr>> {
        match &self.metrics {
            Some(metrics) => metrics.start_exposition_server().await,
            None => Ok(None),
        }
    }

    /// Idle poll interval handed to workers built on this service.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn create_queue(&self, queue_type: &str, options: QueueOptions) -> Result<QueueId> {
        self.registry.create_queue(queue_type, options).await
    }

    /// Creates a queue and ingests `tasks` atomically.
    pub async fn create_queue_and_enqueue(
        &self,
        queue_type: &str,
        options: QueueOptions,
        tasks: TaskSet,
    ) -> Result<QueueCreated> {
        self.registry
            .create_queue_and_enqueue(queue_type, options, tasks)
            .await
    }

    /// Ingests `tasks` into an existing queue, batch by batch.
    ///
    /// Tasks added after the queue completed are stored and claimable, but the
    /// queue's callback is not sent a second time.
    pub async fn enqueue(&self, queue_id: QueueId, tasks: TaskSet) -> Result<u64> {
        Ok(self.enqueue_with_report(queue_id, tasks).await?.task_count)
    }

    pub async fn enqueue_with_report(
        &self,
        queue_id: QueueId,
        tasks: TaskSet,
    ) -> Result<IngestionReport> {
        let queue = self.registry.get_queue(queue_id).await?;
        self.batcher
            .enqueue_with_report(queue_id, tasks, &queue.options)
            .await
    }

    pub async fn claim_next(&self, selector: &ClaimSelector) -> Result<Option<Task>> {
        self.leases.claim_next(selector).await
    }

    pub async fn claim_by_queue(&self, queue_id: QueueId) -> Result<Option<Task>> {
        self.leases.claim_by_queue(queue_id).await
    }

    pub async fn claim_by_type(&self, queue_type: &str) -> Result<Option<Task>> {
        self.leases.claim_by_type(queue_type).await
    }

    pub async fn submit_result(&self, submission: TaskSubmission) -> Result<SubmissionReceipt> {
        self.collector.submit_result(submission).await
    }

    /// Outcomes of every finished task, keyed by task key. Callable at any time.
    pub async fn get_results(&self, queue_id: QueueId) -> Result<BTreeMap<String, TaskOutcome>> {
        self.registry.get_queue(queue_id).await?;
        self.notifier.collect_results(queue_id).await
    }

    pub async fn is_queue_complete(&self, queue_id: QueueId) -> Result<bool> {
        self.notifier.is_queue_complete(queue_id).await
    }

    /// Re-runs the completion check for one queue.
    ///
    /// Takes the latch and sends the callback if the queue is drained and no
    /// earlier check did; otherwise reports `completed = false`.
    pub async fn check_completion(&self, queue_id: QueueId) -> Result<CompletionCheck> {
        self.notifier.check_queue(queue_id).await
    }

    /// Re-runs the completion check for every drained, unlatched queue matching
    /// `selector`, returning the checks that took the latch.
    pub async fn check_pending_completions(
        &self,
        selector: &ClaimSelector,
    ) -> Result<Vec<CompletionCheck>> {
        self.notifier.check_pending(selector).await
    }

    pub async fn get_queue(&self, queue_id: QueueId) -> Result<Queue> {
        self.registry.get_queue(queue_id).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(BatchworkError::TaskNotFound { id: task_id })
    }

    pub async fn queue_status(&self, queue_id: QueueId) -> Result<QueueStatus> {
        let queue = self.registry.get_queue(queue_id).await?;
        let total_tasks = self.store.count_tasks(queue_id).await?;
        let finished_tasks = self.store.count_terminal_tasks(queue_id).await?;
        Ok(QueueStatus {
            queue,
            total_tasks,
            finished_tasks,
            complete: total_tasks == finished_tasks,
        })
    }
}

#[cfg(feature = "postgres")]
impl TaskService<crate::TaskQueue<sqlx::Postgres>> {
    /// Connects to the configured database and builds a service over it.
    ///
    /// Applies pending migrations when `database.auto_migrate` is set and
    /// starts the metrics exposition server when an address is configured.
    pub async fn connect(config: &BatchworkConfig) -> Result<Self> {
        let pool = config.database.connect().await?;
        let service = Self::from_config(Arc::new(crate::TaskQueue::new(pool)), config)?;
        if let Some(addr) = service.start_metrics_server().await? {
            tracing::info!(%addr, "Metrics exposition enabled");
        }
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{notify::RecordingCallbackSender, queue::test::TestStore, task::TaskStatus};
    use serde_json::json;

    fn service() -> (TaskService<TestStore>, RecordingCallbackSender) {
        let sender = RecordingCallbackSender::new();
        let service = TaskService::new(Arc::new(TestStore::new()), Arc::new(sender.clone()));
        (service, sender)
    }

    fn single_task() -> TaskSet {
        [("a".to_string(), json!(1))].into_iter().collect()
    }

    #[tokio::test]
    async fn test_enqueue_uses_queue_options_for_placeholder_expiry() {
        let (service, _) = service();
        let queue_id = service
            .create_queue("q", QueueOptions::new().with_expiry_time(250))
            .await
            .unwrap();

        let tasks: TaskSet = [("a".to_string(), json!(1))].into_iter().collect();
        assert_eq!(service.enqueue(queue_id, tasks).await.unwrap(), 1);

        let task = service.store().get_all_tasks().await.pop().unwrap();
        assert_eq!(
            task.expiry_time,
            service.store().now() + chrono::Duration::milliseconds(250)
        );
    }

    #[tokio::test]
    async fn test_enqueue_into_missing_queue() {
        let (service, _) = service();
        let tasks: TaskSet = [("a".to_string(), json!(1))].into_iter().collect();
        let err = service.enqueue(99, tasks).await.unwrap_err();
        assert!(matches!(err, BatchworkError::QueueNotFound { id: 99 }));
    }

    #[tokio::test]
    async fn test_queue_status_and_lookups() {
        let (service, _) = service();
        let tasks: TaskSet = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
            .into_iter()
            .collect();
        let created = service
            .create_queue_and_enqueue("q", QueueOptions::new(), tasks)
            .await
            .unwrap();

        let task = service.claim_by_type("q").await.unwrap().unwrap();
        service
            .submit_result(TaskSubmission::success(task.id, json!("ok")))
            .await
            .unwrap();

        let status = service.queue_status(created.queue_id).await.unwrap();
        assert_eq!(status.total_tasks, 2);
        assert_eq!(status.finished_tasks, 1);
        assert!(!status.complete);

        let fetched = service.get_task(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert!(matches!(
            service.get_task(task.id + 1000).await.unwrap_err(),
            BatchworkError::TaskNotFound { .. }
        ));

        let results = service.get_results(created.queue_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            service.get_results(created.queue_id + 1).await.unwrap_err(),
            BatchworkError::QueueNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_late_enqueue_does_not_renotify() {
        let (service, sender) = service();
        let options = QueueOptions::new().with_callback("http://example/cb");
        let tasks: TaskSet = [("a".to_string(), json!(1))].into_iter().collect();
        let created = service
            .create_queue_and_enqueue("q", options, tasks)
            .await
            .unwrap();

        let task = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
        let receipt = service
            .submit_result(TaskSubmission::success(task.id, json!(1)))
            .await
            .unwrap();
        assert!(receipt.queue_completed);

        let more: TaskSet = [("b".to_string(), json!(2))].into_iter().collect();
        service.enqueue(created.queue_id, more).await.unwrap();
        let late = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
        let receipt = service
            .submit_result(TaskSubmission::success(late.id, json!(2)))
            .await
            .unwrap();

        assert!(!receipt.queue_completed);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(service.get_results(created.queue_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_completion_check_is_recovered() {
        let (service, sender) = service();
        let options = QueueOptions::new().with_callback("http://example/cb");
        let tasks: TaskSet = [("a".to_string(), json!(1))].into_iter().collect();
        let created = service
            .create_queue_and_enqueue("q", options, tasks)
            .await
            .unwrap();

        let task = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
        service.store().fail_task_counts(1).await;
        let receipt = service
            .submit_result(TaskSubmission::success(task.id, json!("ok")))
            .await
            .unwrap();
        assert!(!receipt.queue_completed);
        assert!(sender.sent().is_empty());
        assert!(service.get_queue(created.queue_id).await.unwrap().completed_at.is_none());

        let check = service.check_completion(created.queue_id).await.unwrap();
        assert!(check.completed);
        assert!(check.delivery.unwrap().success);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(
            sender.sent()[0].payload.results["a"],
            TaskOutcome::Result(json!("ok"))
        );

        let again = service.check_completion(created.queue_id).await.unwrap();
        assert!(!again.completed);
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_completions_skip_unfinished_and_empty_queues() {
        let (service, sender) = service();
        let options = QueueOptions::new().with_callback("http://example/cb");
        let single = |key: &str| -> TaskSet { [(key.to_string(), json!(1))].into_iter().collect() };
        let drained = service
            .create_queue_and_enqueue("q", options.clone(), single("a"))
            .await
            .unwrap();
        let running = service
            .create_queue_and_enqueue("q", options.clone(), single("b"))
            .await
            .unwrap();
        service.create_queue("q", options).await.unwrap();

        let task = service.claim_by_queue(drained.queue_id).await.unwrap().unwrap();
        service.store().fail_task_counts(1).await;
        service
            .submit_result(TaskSubmission::success(task.id, json!("ok")))
            .await
            .unwrap();
        service.claim_by_queue(running.queue_id).await.unwrap().unwrap();

        let selector = ClaimSelector::Type("q".to_string());
        let latched = service.check_pending_completions(&selector).await.unwrap();
        assert_eq!(latched.len(), 1);
        assert_eq!(latched[0].queue_id, drained.queue_id);
        assert_eq!(sender.sent().len(), 1);

        assert!(service.check_pending_completions(&selector).await.unwrap().is_empty());
        assert!(matches!(
            service.check_completion(404).await.unwrap_err(),
            BatchworkError::QueueNotFound { id: 404 }
        ));
    }

    #[test]
    fn test_poll_interval_comes_from_config() {
        let config = BatchworkConfig::development();
        let service = TaskService::with_config(
            Arc::new(TestStore::new()),
            Arc::new(RecordingCallbackSender::new()),
            &config,
            None,
        );
        assert_eq!(service.poll_interval(), config.worker.poll_interval);
        assert_eq!(service.poll_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_metrics_server_needs_collector_and_address() {
        let (service, _) = service();
        assert_eq!(service.start_metrics_server().await.unwrap(), None);
    }

    #[cfg(all(feature = "metrics", feature = "callbacks"))]
    #[tokio::test]
    async fn test_from_config_starts_configured_metrics_server() {
        let mut config = BatchworkConfig::default();
        config.metrics.exposition_addr = Some("127.0.0.1:0".parse().unwrap());
        let service = TaskService::from_config(Arc::new(TestStore::new()), &config).unwrap();
        service
            .create_queue_and_enqueue("q", QueueOptions::new(), single_task())
            .await
            .unwrap();

        let addr = service.start_metrics_server().await.unwrap().unwrap();
        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("batchwork_tasks_ingested_total 1"));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_from_config_wires_metrics() {
        let service =
            TaskService::from_config(Arc::new(TestStore::new()), &BatchworkConfig::default())
                .unwrap();
        let tasks: TaskSet = [("a".to_string(), json!(1))].into_iter().collect();
        service
            .create_queue_and_enqueue("q", QueueOptions::new(), tasks)
            .await
            .unwrap();
        service.claim_by_type("q").await.unwrap();

        let text = service.metrics().unwrap().get_metrics_text().unwrap();
        assert!(text.contains("batchwork_tasks_ingested_total 1"));
        assert!(text.contains("batchwork_claims_total{outcome=\"claimed\"} 1"));
    }
}
