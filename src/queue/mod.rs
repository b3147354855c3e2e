//! Persistent store for queues and tasks.
//!
//! The [`TaskStore`] trait is the contract the engine needs from its store:
//! transactional queue creation, bulk task inserts, an atomic claim that skips
//! rows locked by concurrent claimants, write-once terminal updates and the
//! aggregate reads used for completion detection. [`TaskQueue`] implements it on
//! PostgreSQL; [`test::TestStore`] implements it in memory.

use crate::{
    Result,
    batch::{IngestionPlan, TaskBatch},
    registry::{Queue, QueueId, QueueOptions},
    task::{ClaimSelector, Task, TaskId, TaskOutcome, TaskStatus},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use std::{collections::BTreeMap, marker::PhantomData};

#[cfg(feature = "postgres")]
pub mod postgres;


/// What a terminal write reports back: enough to run the completion check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeReceipt {
    pub task_id: TaskId,
    pub queue_id: QueueId,
    pub status: TaskStatus,
    pub callback_url: Option<String>,
}

/// Storage operations used by the task engine.
///
/// Implementations must guarantee:
/// - `claim_next` never hands the same task to two concurrent callers while
///   the first lease is valid, and never blocks on a row another claim holds.
/// - `record_outcome` moves a task to a terminal status at most once.
/// - `mark_queue_completed` returns `true` at most once per queue, and only
///   when no task of the queue is `available` or `processing`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Current time as seen by the store.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn create_queue(&self, queue_type: &str, options: &QueueOptions) -> Result<QueueId>;

    async fn get_queue(&self, queue_id: QueueId) -> Result<Option<Queue>>;

    /// Creates the queue and inserts every batch of `plan` in one transaction.
    async fn create_queue_with_tasks(
        &self,
        queue_type: &str,
        options: &QueueOptions,
        plan: &IngestionPlan,
    ) -> Result<QueueId>;

    /// Inserts one batch as a single bulk statement, status `available`.
    async fn insert_task_batch(
        &self,
        queue_id: QueueId,
        batch: &TaskBatch,
        expiry_time: DateTime<Utc>,
    ) -> Result<u64>;

    /// Atomically claims the lowest-id eligible task matching `selector`.
    ///
    /// Eligible means `available`, or `processing` with an elapsed lease. The
    /// claimed task is set to `processing` with `start_time = now` and a lease
    /// of the queue's `expiryTime` (or `default_lease`). `Ok(None)` means no
    /// work is available.
    async fn claim_next(
        &self,
        selector: &ClaimSelector,
        default_lease: chrono::Duration,
    ) -> Result<Option<Task>>;

    /// Writes the terminal status, `end_time` and result of a non-terminal task.
    async fn record_outcome(&self, task_id: TaskId, outcome: &TaskOutcome)
    -> Result<OutcomeReceipt>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>>;

    async fn count_tasks(&self, queue_id: QueueId) -> Result<u64>;

    async fn count_terminal_tasks(&self, queue_id: QueueId) -> Result<u64>;

    /// Stored outcomes of every terminal task of the queue, keyed by task key.
    async fn collect_results(&self, queue_id: QueueId) -> Result<BTreeMap<String, TaskOutcome>>;

    /// Sets the queue's completion latch if it is unset and the queue is drained.
    async fn mark_queue_completed(&self, queue_id: QueueId) -> Result<bool>;

    /// Ids of queues matching `selector` that have tasks, all of them terminal,
    /// and no completion latch yet. Ordered by id.
    async fn pending_completions(&self, selector: &ClaimSelector) -> Result<Vec<QueueId>>;
}

/// A database-backed task store.
///
/// # Examples
///
/// ```rust,no_run
/// use batchwork::{TaskQueue, queue::TaskStore, registry::QueueOptions};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # #[cfg(feature = "postgres")]
/// # {
/// let pool = sqlx::PgPool::connect("postgresql://localhost/batchwork").await?;
/// let store = TaskQueue::new(pool);
///
/// let queue_id = store.create_queue("thumbnails", &QueueOptions::new()).await?;
/// # }
/// # Ok(())
/// # }
/// ```
pub struct TaskQueue<DB: Database> {
    pub pool: Pool<DB>,
    pub(crate) _phantom: PhantomData<DB>,
}

impl<DB: Database> Clone for TaskQueue<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<DB: Database> TaskQueue<DB> {
    pub fn new(pool: Pool<DB>) -> Self {
        Self {
            pool,
            _phantom: PhantomData,
        }
    }

    pub fn get_pool(&self) -> &Pool<DB> {
        &self.pool
    }
}
