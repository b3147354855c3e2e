//! Task data model: rows, statuses, outcomes and claim selectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::{BatchworkError, registry::QueueId};

/// Store-generated identifier of a task row.
pub type TaskId = i64;

/// Lifecycle state of a task.
///
/// `available -> processing -> {completed | error}`. An expired lease makes a
/// `processing` task claimable again without changing its stored status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Available,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Available => "available",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }

    /// `completed` and `error` are terminal; a task reaches one of them at most once.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = BatchworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(TaskStatus::Available),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "error" => Ok(TaskStatus::Error),
            other => Err(BatchworkError::Store {
                message: format!("unknown task status: {}", other),
            }),
        }
    }
}

/// Terminal payload of a task, stored as `{"result": ..}` or `{"error": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Result(Value),
    Error(Value),
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Result(_) => TaskStatus::Completed,
            TaskOutcome::Error(_) => TaskStatus::Error,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            TaskOutcome::Result(v) | TaskOutcome::Error(v) => v,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TaskOutcome::Error(_))
    }
}

/// A unit of work belonging to exactly one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    /// Producer-supplied key, unique within its queue; keys the aggregated results.
    pub task_id: String,
    pub queue_id: QueueId,
    pub params: Value,
    pub status: TaskStatus,
    /// Number of times the task has been claimed, reclaims included.
    pub attempts: i32,
    /// Lease deadline. Only meaningful while `status` is `processing`.
    pub expiry_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<TaskOutcome>,
}

impl Task {
    /// Whether a claimant may take this task at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Available => true,
            TaskStatus::Processing => self.expiry_time < now,
            TaskStatus::Completed | TaskStatus::Error => false,
        }
    }
}

/// Which tasks a claim may draw from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimSelector {
    Queue(QueueId),
    Type(String),
}

impl fmt::Display for ClaimSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimSelector::Queue(id) => write!(f, "queue {}", id),
            ClaimSelector::Type(queue_type) => write!(f, "type '{}'", queue_type),
        }
    }
}

/// A worker's report for a claimed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskSubmission {
    pub id: TaskId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl TaskSubmission {
    pub fn success(id: TaskId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A falsy `error` (see [`TaskSubmission::outcome`]) is stored as a `null` result.
    pub fn failure(id: TaskId, error: Value) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Resolves the stored outcome. A present error wins over a result. Falsy
    /// errors (`null`, `false`, `0` and `""`) count as absent.
    pub fn outcome(&self) -> TaskOutcome {
        match &self.error {
            Some(error) if is_meaningful(error) => TaskOutcome::Error(error.clone()),
            _ => TaskOutcome::Result(self.result.clone().unwrap_or(Value::Null)),
        }
    }
}

fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
