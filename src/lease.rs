//! Claiming tasks under a lease.
//!
//! A claim hands one eligible task to exactly one caller and stamps it with a
//! lease deadline. A worker that crashes or stalls simply lets the lease run out;
//! the next claim picks the task up again. Nothing is ever blocked waiting on a
//! task another claimant is holding.

use crate::{
    Result,
    metrics::PrometheusMetricsCollector,
    queue::TaskStore,
    registry::QueueId,
    task::{ClaimSelector, Task},
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// How a claim attempt ended, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Empty,
    Failed,
}

impl ClaimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed => "claimed",
            ClaimOutcome::Empty => "empty",
            ClaimOutcome::Failed => "failed",
        }
    }
}

pub struct LeaseManager<S: TaskStore> {
    store: Arc<S>,
    default_lease: chrono::Duration,
    metrics: Option<Arc<PrometheusMetricsCollector>>,
}

impl<S: TaskStore> Clone for LeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            default_lease: self.default_lease,
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: TaskStore> LeaseManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            default_lease: crate::registry::default_lease(),
            metrics: None,
        }
    }

    /// Lease granted when a queue's options carry no `expiryTime`.
    pub fn with_default_lease(mut self, lease: chrono::Duration) -> Self {
        self.default_lease = lease;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn default_lease(&self) -> chrono::Duration {
        self.default_lease
    }

    /// Claims the next eligible task for `selector`.
    ///
    /// Returns `Ok(None)` when nothing is available. Store failures are rolled
    /// back by the store and surface as [`BatchworkError::Claim`](crate::BatchworkError::Claim).
    pub async fn claim_next(&self, selector: &ClaimSelector) -> Result<Option<Task>> {
        let claimed = self
            .store
            .claim_next(selector, self.default_lease)
            .await
            .map_err(|e| {
                error!(%selector, "Error in claim_next: {}", e);
                self.record(ClaimOutcome::Failed);
                e.into_claim_error()
            })?;

        match claimed {
            Some(task) => {
                if task.attempts > 1 {
                    info!(
                        task_id = task.id,
                        queue_id = task.queue_id,
                        attempts = task.attempts,
                        "Reclaimed task after lease expiry"
                    );
                } else {
                    debug!(task_id = task.id, queue_id = task.queue_id, "Claimed task");
                }
                self.record(ClaimOutcome::Claimed);
                Ok(Some(task))
            }
            None => {
                debug!(%selector, "No tasks available");
                self.record(ClaimOutcome::Empty);
                Ok(None)
            }
        }
    }

    pub async fn claim_by_queue(&self, queue_id: QueueId) -> Result<Option<Task>> {
        self.claim_next(&ClaimSelector::Queue(queue_id)).await
    }

    pub async fn claim_by_type(&self, queue_type: &str) -> Result<Option<Task>> {
        self.claim_next(&ClaimSelector::Type(queue_type.to_string()))
            .await
    }

    fn record(&self, outcome: ClaimOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_claim(outcome);
        }
    }
}
