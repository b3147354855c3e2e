//! PostgreSQL implementation of the task store.
//!
//! Claims run in an explicit transaction: the candidate row is selected with
//! `FOR UPDATE SKIP LOCKED`, so concurrent claimants never wait on each other and
//! never receive the same row. Bulk inserts bind whole columns as arrays and
//! expand them with `UNNEST`, one statement per batch.

use super::{OutcomeReceipt, TaskStore};
use crate::{
    BatchworkError, Result,
    batch::{IngestionPlan, TaskBatch, batch_failure},
    registry::{Queue, QueueId, QueueOptions},
    task::{ClaimSelector, Task, TaskId, TaskOutcome},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, Postgres, Row};
use std::collections::BTreeMap;
use tracing::warn;

const TASK_COLUMNS: &str = "t.id, t.task_id, t.queue_id, t.params, t.status::text AS status, \
     t.attempts, t.expiry_time, t.start_time, t.end_time, t.result";

#[derive(FromRow, Clone)]
pub(crate) struct TaskRow {
    pub id: i64,
    pub task_id: String,
    pub queue_id: i64,
    pub params: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub expiry_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
}

impl TaskRow {
    pub fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            task_id: self.task_id,
            queue_id: self.queue_id,
            params: self.params,
            status: self.status.parse()?,
            attempts: self.attempts,
            expiry_time: self.expiry_time,
            start_time: self.start_time,
            end_time: self.end_time,
            result: self.result.map(serde_json::from_value).transpose()?,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct QueueRow {
    pub id: i64,
    pub queue_type: String,
    pub options: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueRow {
    pub fn into_queue(self) -> Result<Queue> {
        Ok(Queue {
            id: self.id,
            queue_type: self.queue_type,
            options: serde_json::from_value(self.options)?,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

async fn insert_queue(
    conn: &mut PgConnection,
    queue_type: &str,
    options: &QueueOptions,
) -> Result<QueueId> {
    let id: i64 = sqlx::query_scalar(
        r#"INSERT INTO queues ("type", options) VALUES ($1, $2) RETURNING id"#,
    )
    .bind(queue_type)
    .bind(serde_json::to_value(options)?)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

async fn insert_batch(
    conn: &mut PgConnection,
    queue_id: QueueId,
    batch: &TaskBatch,
    expiry_time: DateTime<Utc>,
) -> Result<u64> {
    let (keys, params): (Vec<String>, Vec<serde_json::Value>) = batch
        .tasks
        .iter()
        .map(|t| (t.task_id.clone(), t.params.clone()))
        .unzip();

    let result = sqlx::query(
        r#"
        INSERT INTO tasks (task_id, queue_id, params, expiry_time)
        SELECT u.task_id, $1, u.params, $4
        FROM UNNEST($2::text[], $3::jsonb[]) WITH ORDINALITY AS u(task_id, params, ord)
        ORDER BY u.ord
        "#,
    )
    .bind(queue_id)
    .bind(keys)
    .bind(params)
    .bind(expiry_time)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

async fn claim_in_transaction(
    conn: &mut PgConnection,
    selector: &ClaimSelector,
    default_lease: chrono::Duration,
) -> Result<Option<Task>> {
    let candidate: Option<i64> = match selector {
        ClaimSelector::Queue(queue_id) => {
            sqlx::query_scalar(
                r#"
                SELECT t.id FROM tasks t
                WHERE t.queue_id = $1
                  AND (t.status = 'available'
                       OR (t.status = 'processing' AND t.expiry_time < NOW()))
                ORDER BY t.id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(queue_id)
            .fetch_optional(&mut *conn)
            .await?
        }
        ClaimSelector::Type(queue_type) => {
            sqlx::query_scalar(
                r#"
                SELECT t.id FROM tasks t
                JOIN queues q ON q.id = t.queue_id
                WHERE q."type" = $1
                  AND (t.status = 'available'
                       OR (t.status = 'processing' AND t.expiry_time < NOW()))
                ORDER BY t.id
                LIMIT 1
                FOR UPDATE OF t SKIP LOCKED
                "#,
            )
            .bind(queue_type)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    let Some(task_id) = candidate else {
        return Ok(None);
    };

    let row: TaskRow = sqlx::query_as(&format!(
        r#"
        UPDATE tasks t
        SET status = 'processing',
            start_time = NOW(),
            attempts = t.attempts + 1,
            expiry_time = NOW() + (
                CASE WHEN jsonb_typeof(q.options->'expiryTime') = 'number'
                     THEN (q.options->>'expiryTime')::float8
                     ELSE $2::float8
                END) * INTERVAL '1 millisecond'
        FROM queues q
        WHERE t.id = $1 AND q.id = t.queue_id
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(task_id)
    .bind(default_lease.num_milliseconds() as f64)
    .fetch_one(&mut *conn)
    .await?;

    row.into_task().map(Some)
}

#[async_trait]
impl TaskStore for crate::queue::TaskQueue<Postgres> {
    async fn create_queue(&self, queue_type: &str, options: &QueueOptions) -> Result<QueueId> {
        let mut conn = self.pool.acquire().await?;
        insert_queue(&mut conn, queue_type, options).await
    }

    async fn get_queue(&self, queue_id: QueueId) -> Result<Option<Queue>> {
        let row: Option<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, "type" AS queue_type, options, created_at, completed_at
            FROM queues WHERE id = $1
            "#,
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueRow::into_queue).transpose()
    }

    async fn create_queue_with_tasks(
        &self,
        queue_type: &str,
        options: &QueueOptions,
        plan: &IngestionPlan,
    ) -> Result<QueueId> {
        let mut tx = self.pool.begin().await?;
        let total = plan.batch_count();

        let queue_id = match insert_queue(&mut tx, queue_type, options).await {
            Ok(id) => id,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        for batch in &plan.batches {
            if let Err(e) = insert_batch(&mut tx, queue_id, batch, plan.expiry_time).await {
                tx.rollback().await?;
                return Err(batch_failure(batch.index, total, e));
            }
        }

        tx.commit().await?;
        Ok(queue_id)
    }

    async fn insert_task_batch(
        &self,
        queue_id: QueueId,
        batch: &TaskBatch,
        expiry_time: DateTime<Utc>,
    ) -> Result<u64> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM queues WHERE id = $1)")
                .bind(queue_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(BatchworkError::QueueNotFound { id: queue_id });
        }

        let mut conn = self.pool.acquire().await?;
        insert_batch(&mut conn, queue_id, batch, expiry_time).await
    }

    async fn claim_next(
        &self,
        selector: &ClaimSelector,
        default_lease: chrono::Duration,
    ) -> Result<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        match claim_in_transaction(&mut tx, selector, default_lease).await {
            Ok(claimed) => {
                tx.commit().await?;
                Ok(claimed)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(%selector, "Rollback after failed claim also failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn record_outcome(
        &self,
        task_id: TaskId,
        outcome: &TaskOutcome,
    ) -> Result<OutcomeReceipt> {
        let status = outcome.status();

        let row = sqlx::query(
            r#"
            UPDATE tasks t
            SET status = $2::task_status, end_time = NOW(), result = $3
            FROM queues q
            WHERE t.id = $1 AND q.id = t.queue_id
              AND t.status IN ('available', 'processing')
            RETURNING t.queue_id, q.options->>'callback' AS callback_url
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(serde_json::to_value(outcome)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(OutcomeReceipt {
                task_id,
                queue_id: row.get("queue_id"),
                status,
                callback_url: row.get("callback_url"),
            }),
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tasks WHERE id = $1)")
                        .bind(task_id)
                        .fetch_one(&self.pool)
                        .await?;
                if exists {
                    Err(BatchworkError::TaskAlreadyFinished { id: task_id })
                } else {
                    Err(BatchworkError::TaskNotFound { id: task_id })
                }
            }
        }
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TaskRow::into_task).transpose()
    }

    async fn count_tasks(&self, queue_id: QueueId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE queue_id = $1")
            .bind(queue_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_terminal_tasks(&self, queue_id: QueueId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE queue_id = $1 AND status IN ('completed', 'error')",
        )
        .bind(queue_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn collect_results(&self, queue_id: QueueId) -> Result<BTreeMap<String, TaskOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, result FROM tasks
            WHERE queue_id = $1
              AND status IN ('completed', 'error')
              AND result IS NOT NULL
            ORDER BY id
            "#,
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        let mut results = BTreeMap::new();
        for row in rows {
            let task_id: String = row.get("task_id");
            let result: serde_json::Value = row.get("result");
            results.insert(task_id, serde_json::from_value(result)?);
        }
        Ok(results)
    }

    async fn mark_queue_completed(&self, queue_id: QueueId) -> Result<bool> {
        let latched: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE queues SET completed_at = NOW()
            WHERE id = $1
              AND completed_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM tasks
                  WHERE queue_id = $1 AND status IN ('available', 'processing')
              )
            RETURNING id
            "#,
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(latched.is_some())
    }

    async fn pending_completions(&self, selector: &ClaimSelector) -> Result<Vec<QueueId>> {
        let filter = match selector {
            ClaimSelector::Queue(_) => "q.id = $1",
            ClaimSelector::Type(_) => r#"q."type" = $1"#,
        };
        let sql = format!(
            r#"
            SELECT q.id FROM queues q
            WHERE {filter}
              AND q.completed_at IS NULL
              AND EXISTS (SELECT 1 FROM tasks t WHERE t.queue_id = q.id)
              AND NOT EXISTS (
                  SELECT 1 FROM tasks t
                  WHERE t.queue_id = q.id AND t.status IN ('available', 'processing')
              )
            ORDER BY q.id
            "#
        );

        let query = sqlx::query_scalar(&sql);
        let query = match selector {
            ClaimSelector::Queue(queue_id) => query.bind(*queue_id),
            ClaimSelector::Type(queue_type) => query.bind(queue_type.clone()),
        };
        Ok(query.fetch_all(&self.pool).await?)
    }
}
