//! Completion detection and callback delivery.
//!
//! After every terminal write the [`CompletionNotifier`] re-counts the queue. When
//! every task is terminal it tries to take the queue's completion latch; only the
//! caller that wins the latch posts the aggregated results, so concurrent final
//! submissions produce exactly one callback.
//!
//! Delivery is best-effort: one POST, no retries. A failed delivery is logged and
//! returned as a [`NotificationDelivery`] record; stored results are unaffected and
//! stay queryable.
//!
//! # Callback format
//!
//! ```text
//! POST <options.callback>
//! Content-Type: application/json
//! X-Batchwork-Queue: 42
//! X-Batchwork-Delivery: 2f0c...-uuid
//! X-Batchwork-Signature: sha256=<hex hmac of the body>   (only with a signing secret)
//!
//! {"results": {"a": {"result": 3}, "b": {"error": "division by zero"}}}
//! ```

use crate::{
    BatchworkError, Result,
    metrics::PrometheusMetricsCollector,
    queue::{OutcomeReceipt, TaskStore},
    registry::QueueId,
    task::{ClaimSelector, TaskOutcome},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(feature = "callbacks")]
use crate::config::CallbackConfig;

/// Body of a completion callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub results: BTreeMap<String, TaskOutcome>,
}

/// Record of one callback attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDelivery {
    pub delivery_id: Uuid,
    pub queue_id: QueueId,
    pub url: String,
    /// HTTP status code received, if any response arrived
    pub status_code: Option<u16>,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub attempted_at: DateTime<Utc>,
}

impl NotificationDelivery {
    pub fn failed(queue_id: QueueId, url: &str, message: impl Into<String>) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            queue_id,
            url: url.to_string(),
            status_code: None,
            success: false,
            error_message: Some(message.into()),
            duration_ms: 0,
            attempted_at: Utc::now(),
        }
    }
}

/// Transport for completion callbacks.
#[async_trait]
pub trait CallbackSender: Send + Sync {
    /// Makes a single delivery attempt. Failures are reported in the record.
    async fn send(
        &self,
        queue_id: QueueId,
        url: &str,
        payload: &CallbackPayload,
    ) -> NotificationDelivery;
}

/// Outcome of the completion check that follows a terminal write.
#[derive(Debug, Clone)]
pub struct CompletionCheck {
    pub queue_id: QueueId,
    /// True only for the caller that took the completion latch.
    pub completed: bool,
    pub delivery: Option<NotificationDelivery>,
}

impl CompletionCheck {
    fn pending(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            completed: false,
            delivery: None,
        }
    }
}

pub struct CompletionNotifier<S: TaskStore> {
    store: Arc<S>,
    sender: Arc<dyn CallbackSender>,
    metrics: Option<Arc<PrometheusMetricsCollector>>,
}

impl<S: TaskStore> Clone for CompletionNotifier<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sender: self.sender.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: TaskStore> CompletionNotifier<S> {
    pub fn new(store: Arc<S>, sender: Arc<dyn CallbackSender>) -> Self {
        Self {
            store,
            sender,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// True iff the queue's total task count equals its terminal task count.
    ///
    /// The two counts are separate reads, so the answer is only trustworthy once
    /// ingestion into the queue has finished.
    pub async fn is_queue_complete(&self, queue_id: QueueId) -> Result<bool> {
        let total = self.store.count_tasks(queue_id).await?;
        let terminal = self.store.count_terminal_tasks(queue_id).await?;
        debug!(queue_id, total, terminal, "Checked queue completion");
        Ok(total == terminal)
    }

    /// Stored outcomes of every terminal task, keyed by task key.
    pub async fn collect_results(&self, queue_id: QueueId) -> Result<BTreeMap<String, TaskOutcome>> {
        self.store.collect_results(queue_id).await
    }

    /// Posts `payload` to `url` once.
    ///
    /// Unlike the automatic path, a failed delivery is returned as
    /// [`BatchworkError::Notification`].
    pub async fn notify(
        &self,
        queue_id: QueueId,
        url: &str,
        payload: &CallbackPayload,
    ) -> Result<NotificationDelivery> {
        let delivery = self.dispatch(queue_id, url, payload).await;
        if delivery.success {
            Ok(delivery)
        } else {
            Err(BatchworkError::Notification {
                message: format!(
                    "callback to {} for queue {} failed: {}",
                    url,
                    queue_id,
                    delivery.error_message.as_deref().unwrap_or("unknown error")
                ),
            })
        }
    }

    /// Runs the completion check for the queue owning a freshly finished task.
    ///
    /// Safe to call from any number of concurrent submitters: the latch lets
    /// exactly one of them observe `completed = true` and send the callback.
    pub async fn on_task_finished(&self, receipt: &OutcomeReceipt) -> Result<CompletionCheck> {
        self.settle(receipt.queue_id, receipt.callback_url.as_deref()).await
    }

    /// Runs the completion check for `queue_id` outside of a submission.
    ///
    /// Picks up a drained queue whose check failed after its last terminal
    /// write. A queue that already holds the latch is left alone.
    pub async fn check_queue(&self, queue_id: QueueId) -> Result<CompletionCheck> {
        let queue = self
            .store
            .get_queue(queue_id)
            .await?
            .ok_or(BatchworkError::QueueNotFound { id: queue_id })?;

        if queue.completed_at.is_some() {
            return Ok(CompletionCheck::pending(queue_id));
        }
        self.settle(queue_id, queue.options.callback_url()).await
    }

    /// Re-checks every drained, unlatched queue matching `selector`.
    ///
    /// Returns the checks that took the latch.
    pub async fn check_pending(&self, selector: &ClaimSelector) -> Result<Vec<CompletionCheck>> {
        let mut latched = Vec::new();
        for queue_id in self.store.pending_completions(selector).await? {
            let check = self.check_queue(queue_id).await?;
            if check.completed {
                warn!(queue_id, "Completed queue on re-check");
                latched.push(check);
            }
        }
        Ok(latched)
    }

    async fn settle(&self, queue_id: QueueId, callback: Option<&str>) -> Result<CompletionCheck> {
        if !self.is_queue_complete(queue_id).await? {
            return Ok(CompletionCheck::pending(queue_id));
        }

        let callback = callback.filter(|url| !url.trim().is_empty());

        // Results are write-once, so reading them before the latch is safe.
        let results = match callback {
            Some(_) => Some(self.collect_results(queue_id).await?),
            None => None,
        };

        if !self.store.mark_queue_completed(queue_id).await? {
            debug!(queue_id, "Queue completion already handled");
            return Ok(CompletionCheck::pending(queue_id));
        }
        info!(queue_id, "All tasks finished");

        let delivery = match (callback, results) {
            (Some(url), Some(results)) => {
                let payload = CallbackPayload { results };
                Some(self.dispatch(queue_id, url, &payload).await)
            }
            _ => None,
        };

        Ok(CompletionCheck {
            queue_id,
            completed: true,
            delivery,
        })
    }

    async fn dispatch(
        &self,
        queue_id: QueueId,
        url: &str,
        payload: &CallbackPayload,
    ) -> NotificationDelivery {
        let delivery = self.sender.send(queue_id, url, payload).await;

        if delivery.success {
            info!(
                queue_id,
                url,
                results = payload.results.len(),
                duration_ms = delivery.duration_ms,
                "Delivered completion callback"
            );
        } else {
            error!(
                queue_id,
                url,
                status_code = delivery.status_code,
                "Completion callback failed: {}",
                delivery.error_message.as_deref().unwrap_or("unknown error")
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_notification(&delivery);
        }
        delivery
    }
}

/// Generates the hex HMAC-SHA256 of `payload` under `secret`.
#[cfg(feature = "callbacks")]
pub fn generate_signature(secret: &str, payload: &[u8]) -> Result<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| BatchworkError::Notification {
            message: format!("invalid signing key: {}", e),
        })?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a `sha256=<hex>` or bare hex signature in constant time.
#[cfg(feature = "callbacks")]
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = generate_signature(secret, payload) else {
        return false;
    };
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    expected.len() == signature.len()
        && expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Posts callbacks over HTTP with `reqwest`.
#[cfg(feature = "callbacks")]
pub struct HttpCallbackSender {
    client: reqwest::Client,
    signing_secret: Option<String>,
}

#[cfg(feature = "callbacks")]
impl HttpCallbackSender {
    pub fn new(config: &CallbackConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| BatchworkError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            signing_secret: config.signing_secret.clone(),
        })
    }
}

#[cfg(feature = "callbacks")]
#[async_trait]
impl CallbackSender for HttpCallbackSender {
    async fn send(
        &self,
        queue_id: QueueId,
        url: &str,
        payload: &CallbackPayload,
    ) -> NotificationDelivery {
        let delivery_id = Uuid::new_v4();
        let attempted_at = Utc::now();
        let start_time = std::time::Instant::now();

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => return NotificationDelivery::failed(queue_id, url, e.to_string()),
        };

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Batchwork-Queue", queue_id.to_string())
            .header("X-Batchwork-Delivery", delivery_id.to_string());

        if let Some(secret) = &self.signing_secret {
            match generate_signature(secret, &body) {
                Ok(signature) => {
                    request = request.header("X-Batchwork-Signature", format!("sha256={}", signature));
                }
                Err(e) => return NotificationDelivery::failed(queue_id, url, e.to_string()),
            }
        }

        let (status_code, success, error_message) = match request.body(body).send().await {
            Ok(response) => {
                let status = response.status();
                let error_message = if status.is_success() {
                    None
                } else {
                    Some(format!("HTTP {}", status.as_u16()))
                };
                (Some(status.as_u16()), status.is_success(), error_message)
            }
            Err(err) if err.is_timeout() => (None, false, Some("Request timeout".to_string())),
            Err(err) => (None, false, Some(err.to_string())),
        };

        NotificationDelivery {
            delivery_id,
            queue_id,
            url: url.to_string(),
            status_code,
            success,
            error_message,
            duration_ms: start_time.elapsed().as_millis() as u64,
            attempted_at,
        }
    }
}

/// Sender used when the crate is built without HTTP support.
pub struct DisabledCallbackSender;

#[async_trait]
impl CallbackSender for DisabledCallbackSender {
    async fn send(
        &self,
        queue_id: QueueId,
        url: &str,
        _payload: &CallbackPayload,
    ) -> NotificationDelivery {
        NotificationDelivery::failed(queue_id, url, "callback delivery is disabled")
    }
}

/// A sent callback captured by [`RecordingCallbackSender`].
#[cfg(any(test, feature = "test"))]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCallback {
    pub queue_id: QueueId,
    pub url: String,
    pub payload: CallbackPayload,
}

/// In-memory sender that records every callback instead of sending it.
#[cfg(any(test, feature = "test"))]
#[derive(Clone, Default)]
pub struct RecordingCallbackSender {
    sent: Arc<std::sync::Mutex<Vec<RecordedCallback>>>,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(any(test, feature = "test"))]
impl RecordingCallbackSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent deliveries report failure (they are still recorded).
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<RecordedCallback> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(any(test, feature = "test"))]
#[async_trait]
impl CallbackSender for RecordingCallbackSender {
    async fn send(
        &self,
        queue_id: QueueId,
        url: &str,
        payload: &CallbackPayload,
    ) -> NotificationDelivery {
        self.sent.lock().unwrap().push(RecordedCallback {
            queue_id,
            url: url.to_string(),
            payload: payload.clone(),
        });

        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return NotificationDelivery::failed(queue_id, url, "HTTP 503");
        }

        NotificationDelivery {
            delivery_id: Uuid::new_v4(),
            queue_id,
            url: url.to_string(),
            status_code: Some(200),
            success: true,
            error_message: None,
            duration_ms: 0,
            attempted_at: Utc::now(),
        }
    }
}
