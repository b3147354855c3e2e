use crate::{
    BatchworkError, Result, batch::IngestionReport, lease::ClaimOutcome,
    notify::NotificationDelivery, task::TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[cfg(feature = "metrics")]
use std::sync::Mutex;

#[cfg(feature = "metrics")]
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};

#[cfg(feature = "metrics")]
use warp::Filter;

/// Configuration for metrics collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether a collector is created at all
    pub enabled: bool,
    /// Prefix for every metric name
    pub namespace: String,
    /// HTTP server address for metrics exposition
    pub exposition_addr: Option<SocketAddr>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "batchwork".to_string(),
            exposition_addr: None,
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Prometheus exposition address
    pub fn with_prometheus_exporter(mut self, addr: SocketAddr) -> Self {
        self.exposition_addr = Some(addr);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[cfg(feature = "metrics")]
fn metrics_error(what: &str, e: prometheus::Error) -> BatchworkError {
    BatchworkError::Metrics {
        message: format!("Failed to {}: {}", what, e),
    }
}

/// Prometheus metrics collector for the task lifecycle
#[cfg(feature = "metrics")]
pub struct PrometheusMetricsCollector {
    config: MetricsConfig,
    registry: Registry,
    tasks_ingested_total: IntCounter,
    ingestion_batches_total: IntCounter,
    ingestion_duration: Histogram,
    claims_total: CounterVec,
    results_total: CounterVec,
    notifications_total: CounterVec,
    server: Mutex<Option<(SocketAddr, tokio::task::JoinHandle<()>)>>,
}

#[cfg(feature = "metrics")]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let name = |metric: &str| format!("{}_{}", config.namespace, metric);

        let tasks_ingested_total = IntCounter::new(
            name("tasks_ingested_total"),
            "Total number of tasks persisted by ingestion",
        )
        .map_err(|e| metrics_error("create tasks_ingested_total metric", e))?;

        let ingestion_batches_total = IntCounter::new(
            name("ingestion_batches_total"),
            "Total number of bulk insert batches written",
        )
        .map_err(|e| metrics_error("create ingestion_batches_total metric", e))?;

        let ingestion_duration = Histogram::with_opts(
            HistogramOpts::new(
                name("ingestion_duration_seconds"),
                "Wall time of one ingestion call in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .map_err(|e| metrics_error("create ingestion_duration metric", e))?;

        let claims_total = CounterVec::new(
            Opts::new(name("claims_total"), "Claim attempts by outcome"),
            &["outcome"],
        )
        .map_err(|e| metrics_error("create claims_total metric", e))?;

        let results_total = CounterVec::new(
            Opts::new(name("results_total"), "Terminal task results by status"),
            &["status"],
        )
        .map_err(|e| metrics_error("create results_total metric", e))?;

        let notifications_total = CounterVec::new(
            Opts::new(name("notifications_total"), "Completion callbacks by outcome"),
            &["outcome"],
        )
        .map_err(|e| metrics_error("create notifications_total metric", e))?;

        registry
            .register(Box::new(tasks_ingested_total.clone()))
            .map_err(|e| metrics_error("register tasks_ingested_total with registry", e))?;
        registry
            .register(Box::new(ingestion_batches_total.clone()))
            .map_err(|e| metrics_error("register ingestion_batches_total with registry", e))?;
        registry
            .register(Box::new(ingestion_duration.clone()))
            .map_err(|e| metrics_error("register ingestion_duration with registry", e))?;
        registry
            .register(Box::new(claims_total.clone()))
            .map_err(|e| metrics_error("register claims_total with registry", e))?;
        registry
            .register(Box::new(results_total.clone()))
            .map_err(|e| metrics_error("register results_total with registry", e))?;
        registry
            .register(Box::new(notifications_total.clone()))
            .map_err(|e| metrics_error("register notifications_total with registry", e))?;

        Ok(Self {
            config,
            registry,
            tasks_ingested_total,
            ingestion_batches_total,
            ingestion_duration,
            claims_total,
            results_total,
            notifications_total,
            server: Mutex::new(None),
        })
    }

    /// Start the Prometheus HTTP exposition server on `exposition_addr`.
    ///
    /// Returns the bound address, or `None` when no address is configured. A
    /// second call while the server is running is a no-op.
    pub async fn start_exposition_server(&self) -> Result<Option<SocketAddr>> {
        let Some(addr) = self.config.exposition_addr else {
            return Ok(None);
        };

        let mut running = self.server.lock().map_err(|_| BatchworkError::Metrics {
            message: "exposition server state poisoned".to_string(),
        })?;
        if let Some((bound, _)) = running.as_ref() {
            return Ok(Some(*bound));
        }

        let registry = self.registry.clone();
        let app = warp::path("metrics")
            .map(move || {
                let mut buffer = Vec::new();
                if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
                    tracing::error!("Failed to encode metrics: {}", e);
                }
                String::from_utf8(buffer).unwrap_or_default()
            })
            .with(warp::reply::with::header("content-type", "text/plain"));

        let (bound, server) = warp::serve(app)
            .try_bind_ephemeral(addr)
            .map_err(|e| BatchworkError::Metrics {
                message: format!("Failed to bind metrics server to {}: {}", addr, e),
            })?;
        *running = Some((bound, tokio::spawn(server)));
        tracing::info!(%bound, "Serving Prometheus metrics");

        Ok(Some(bound))
    }

    pub fn record_ingestion(&self, report: &IngestionReport) {
        self.tasks_ingested_total.inc_by(report.task_count);
        self.ingestion_batches_total.inc_by(report.batch_count as u64);
        self.ingestion_duration
            .observe(report.elapsed.as_secs_f64());
    }

    pub fn record_claim(&self, outcome: ClaimOutcome) {
        self.claims_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn record_result(&self, status: TaskStatus) {
        self.results_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn record_notification(&self, delivery: &NotificationDelivery) {
        let outcome = if delivery.success { "delivered" } else { "failed" };
        self.notifications_total.with_label_values(&[outcome]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn get_metrics_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metrics_error("encode metrics", e))?;

        String::from_utf8(buffer).map_err(|e| BatchworkError::Metrics {
            message: format!("Failed to convert metrics to string: {}", e),
        })
    }
}

#[cfg(feature = "metrics")]
impl Drop for PrometheusMetricsCollector {
    fn drop(&mut self) {
        if let Ok(running) = self.server.get_mut() {
            if let Some((_, handle)) = running.take() {
                handle.abort();
            }
        }
    }
}

/// No-op metrics collector when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct PrometheusMetricsCollector {
    _config: MetricsConfig,
}

#[cfg(not(feature = "metrics"))]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        Ok(Self { _config: config })
    }

    pub async fn start_exposition_server(&self) -> Result<Option<SocketAddr>> {
        Ok(None)
    }

    pub fn record_ingestion(&self, _report: &IngestionReport) {}

    pub fn record_claim(&self, _outcome: ClaimOutcome) {}

    pub fn record_result(&self, _status: TaskStatus) {}

    pub fn record_notification(&self, _delivery: &NotificationDelivery) {}

    pub fn get_metrics_text(&self) -> Result<String> {
        Ok("# Metrics collection disabled\n".to_string())
    }
}
