use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchworkError {
    #[error("Store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Ingestion error: {message}")]
    Ingestion { message: String },

    #[error("Invalid queue options: {message}")]
    InvalidOptions { message: String },

    #[error("Claim error: {message}")]
    Claim { message: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: i64 },

    #[error("Task already finished: {id}")]
    TaskAlreadyFinished { id: i64 },

    #[error("Queue not found: {id}")]
    QueueNotFound { id: i64 },

    #[error("Notification error: {message}")]
    Notification { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BatchworkError {
    /// True for failures raised by the persistence layer itself.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Store { .. })
    }

    /// True for the submission-side failures: unknown or already finished task.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. } | Self::TaskAlreadyFinished { .. }
        )
    }

    pub(crate) fn into_claim_error(self) -> Self {
        match self {
            Self::Claim { .. } => self,
            other => Self::Claim {
                message: other.to_string(),
            },
        }
    }
}

impl From<toml::de::Error> for BatchworkError {
    fn from(err: toml::de::Error) -> Self {
        BatchworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for BatchworkError {
    fn from(err: toml::ser::Error) -> Self {
        BatchworkError::Config(format!("TOML serialization error: {}", err))
    }
}
