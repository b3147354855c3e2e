use crate::{
    Result,
    queue::TaskStore,
    results::SubmissionReceipt,
    service::TaskService,
    task::{ClaimSelector, Task, TaskSubmission},
};
use serde_json::Value;
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    time::sleep,
};
use tracing::{debug, error, info, warn};

pub type TaskFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, Value>> + Send>>;

/// Processes one task. `Ok` is stored as the task's result, `Err` as its error.
pub type TaskHandler = Arc<dyn Fn(Task) -> TaskFuture + Send + Sync>;

/// Wraps an async closure as a [`TaskHandler`].
///
/// ```rust
/// use batchwork::worker::task_handler;
/// use serde_json::json;
///
/// let handler = task_handler(|task| async move {
///     match task.params.as_i64() {
///         Some(n) => Ok(json!(n * 2)),
///         None => Err(json!("expected a number")),
///     }
/// });
/// # let _ = handler;
/// ```
pub fn task_handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
{
    Arc::new(move |task| {
        let fut: TaskFuture = Box::pin(f(task));
        fut
    })
}

/// Claims tasks matching a selector and runs them through a handler.
///
/// A worker that dies mid-task leaves the task `processing`; it becomes
/// claimable again once its lease runs out. Shutdown is only observed between
/// tasks, so a task already claimed is always run and submitted.
pub struct Worker<S: TaskStore> {
    service: TaskService<S>,
    selector: ClaimSelector,
    handler: TaskHandler,
    poll_interval: Duration,
}

impl<S: TaskStore + 'static> Worker<S> {
    /// Builds a worker polling at the service's configured interval.
    pub fn new(service: TaskService<S>, selector: ClaimSelector, handler: TaskHandler) -> Self {
        let poll_interval = service.poll_interval();
        Self {
            service,
            selector,
            handler,
            poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("Worker started for {}", self.selector);

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if self.poll_once().await {
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!("Worker shutting down for {}", self.selector);
        Ok(())
    }

    /// Processes at most one task. Returns false when the worker should idle.
    async fn poll_once(&self) -> bool {
        match self.process_next().await {
            Ok(Some(_)) => true,
            Ok(None) => {
                if let Err(e) = self.service.check_pending_completions(&self.selector).await {
                    error!("Error re-checking completions for {}: {}", self.selector, e);
                }
                false
            }
            Err(e) => {
                error!("Error processing task for {}: {}", self.selector, e);
                false
            }
        }
    }

    /// Claims one task, runs the handler and submits its outcome.
    ///
    /// Returns `Ok(None)` when no task was available. A submission rejected
    /// because another worker already finished the task (after this worker's
    /// lease ran out) is logged and reported as `Ok(None)`.
    pub async fn process_next(&self) -> Result<Option<SubmissionReceipt>> {
        let Some(task) = self.service.claim_next(&self.selector).await? else {
            return Ok(None);
        };

        let task_id = task.id;
        debug!(task_id, queue_id = task.queue_id, "Processing task");

        let submission = match (self.handler)(task).await {
            Ok(result) => TaskSubmission::success(task_id, result),
            Err(error) => TaskSubmission::failure(task_id, error),
        };

        match self.service.submit_result(submission).await {
            Ok(receipt) => Ok(Some(receipt)),
            Err(e) if e.is_submission_error() => {
                warn!(task_id, "Discarding outcome: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
