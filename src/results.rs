//! Result submission.
//!
//! A worker reports either a result or an error for a claimed task. The terminal
//! write happens in one statement; the completion check runs after it commits,
//! and nothing the notifier does can fail the submission. A check that errors
//! leaves the queue unlatched for a later
//! [`TaskService::check_completion`](crate::TaskService::check_completion).

use crate::{
    Result,
    metrics::PrometheusMetricsCollector,
    notify::CompletionNotifier,
    queue::TaskStore,
    registry::QueueId,
    task::{TaskId, TaskStatus, TaskSubmission},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What a successful submission reports back to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub task_id: TaskId,
    pub queue_id: QueueId,
    pub status: TaskStatus,
    /// True when this submission drained the queue and took the completion latch.
    pub queue_completed: bool,
}

pub struct ResultCollector<S: TaskStore> {
    store: Arc<S>,
    notifier: CompletionNotifier<S>,
    metrics: Option<Arc<PrometheusMetricsCollector>>,
}

impl<S: TaskStore> Clone for ResultCollector<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: TaskStore> ResultCollector<S> {
    pub fn new(store: Arc<S>, notifier: CompletionNotifier<S>) -> Self {
        Self {
            store,
            notifier,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Records the terminal outcome of a task.
    ///
    /// Fails with `TaskNotFound` for an unknown id and `TaskAlreadyFinished` for a
    /// task that already has an outcome; the stored outcome is never replaced.
    pub async fn submit_result(&self, submission: TaskSubmission) -> Result<SubmissionReceipt> {
        let outcome = submission.outcome();
        let receipt = self
            .store
            .record_outcome(submission.id, &outcome)
            .await
            .inspect_err(|e| {
                if e.is_submission_error() {
                    warn!(task_id = submission.id, "Rejected result submission: {}", e);
                } else {
                    error!(task_id = submission.id, "Error in submit_result: {}", e);
                }
            })?;

        debug!(
            task_id = receipt.task_id,
            queue_id = receipt.queue_id,
            status = %receipt.status,
            "Recorded task outcome"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_result(receipt.status);
        }

        let queue_completed = match self.notifier.on_task_finished(&receipt).await {
            Ok(check) => check.completed,
            Err(e) => {
                error!(
                    queue_id = receipt.queue_id,
                    "Error checking queue completion: {}", e
                );
                false
            }
        };

        Ok(SubmissionReceipt {
            task_id: receipt.task_id,
            queue_id: receipt.queue_id,
            status: receipt.status,
            queue_completed,
        })
    }
}
