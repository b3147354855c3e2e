//! Configuration for the task engine and its binary.
//!
//! Settings can be built in code, loaded from a TOML file or read from
//! `BATCHWORK_*` environment variables. Durations are written as human-readable
//! strings such as `"500ms"`, `"30s"` or `"2m"`.

use crate::metrics::MetricsConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializes `std::time::Duration` as `"500ms"`, `"30s"`, `"2m"`, `"1h"`.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub(super) fn format(duration: &Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 {
            "0s".to_string()
        } else if millis % 1000 != 0 {
            format!("{}ms", millis)
        } else {
            let secs = duration.as_secs();
            if secs % 3600 == 0 {
                format!("{}h", secs / 3600)
            } else if secs % 60 == 0 {
                format!("{}m", secs / 60)
            } else {
                format!("{}s", secs)
            }
        }
    }

    /// Parses "500ms", "30s", "5m", "1h", "1d" or a bare number of seconds.
    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num) = s.strip_suffix("ms") {
            let millis: u64 = num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num))?;
            return Ok(Duration::from_millis(millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Top-level configuration.
///
/// # Examples
///
/// ```rust
/// use batchwork::config::BatchworkConfig;
/// use std::time::Duration;
///
/// let config = BatchworkConfig::new()
///     .with_database_url("postgresql://localhost/batchwork")
///     .with_batch_size(500)
///     .with_default_lease(Duration::from_secs(60));
///
/// assert_eq!(config.ingestion.batch_size, 500);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchworkConfig {
    pub database: DatabaseConfig,
    pub ingestion: IngestionConfig,
    pub lease: LeaseConfig,
    pub callbacks: CallbackConfig,
    pub worker: WorkerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl BatchworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_database_pool_size(mut self, size: u32) -> Self {
        self.database.pool_size = size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.ingestion.batch_size = batch_size;
        self
    }

    pub fn with_default_lease(mut self, lease: Duration) -> Self {
        self.lease.default_lease = lease;
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callbacks.timeout = timeout;
        self
    }

    pub fn with_auto_migrate(mut self, auto_migrate: bool) -> Self {
        self.database.auto_migrate = auto_migrate;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.worker.poll_interval = interval;
        self
    }

    /// Sign callback bodies with HMAC-SHA256 under `secret`.
    pub fn with_signing_secret(mut self, secret: &str) -> Self {
        self.callbacks.signing_secret = Some(secret.to_string());
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("BATCHWORK_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(pool_size) = std::env::var("BATCHWORK_DATABASE_POOL_SIZE") {
            config.database.pool_size = pool_size.parse().unwrap_or(config.database.pool_size);
        }
        if let Ok(auto_migrate) = std::env::var("BATCHWORK_AUTO_MIGRATE") {
            config.database.auto_migrate =
                matches!(auto_migrate.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(batch_size) = std::env::var("BATCHWORK_BATCH_SIZE") {
            config.ingestion.batch_size =
                batch_size.parse().unwrap_or(config.ingestion.batch_size);
        }

        if let Ok(lease) = std::env::var("BATCHWORK_DEFAULT_LEASE_MS") {
            if let Ok(millis) = lease.parse::<u64>() {
                config.lease.default_lease = Duration::from_millis(millis);
            }
        }

        if let Ok(timeout) = std::env::var("BATCHWORK_CALLBACK_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.callbacks.timeout = Duration::from_secs(seconds);
            }
        }
        if let Ok(secret) = std::env::var("BATCHWORK_CALLBACK_SECRET") {
            if !secret.is_empty() {
                config.callbacks.signing_secret = Some(secret);
            }
        }

        if let Ok(interval) = std::env::var("BATCHWORK_POLL_INTERVAL_MS") {
            if let Ok(millis) = interval.parse::<u64>() {
                config.worker.poll_interval = Duration::from_millis(millis);
            }
        }
        if let Ok(addr) = std::env::var("BATCHWORK_METRICS_ADDR") {
            let addr = addr.parse::<std::net::SocketAddr>().map_err(|e| {
                crate::BatchworkError::Config(format!(
                    "invalid BATCHWORK_METRICS_ADDR {:?}: {}",
                    addr, e
                ))
            })?;
            config.metrics.exposition_addr = Some(addr);
        }

        Ok(config)
    }

    /// Configuration for local development.
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/batchwork_dev".to_string(),
                pool_size: 5,
                auto_migrate: true,
                ..Default::default()
            },
            lease: LeaseConfig {
                default_lease: Duration::from_secs(30),
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(100),
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Configuration for production use.
    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 20,
                connection_timeout_secs: 60,
                auto_migrate: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// The lease default as a `chrono::Duration`, as the engine consumes it.
    pub fn default_lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease.default_lease)
            .unwrap_or_else(|_| crate::registry::default_lease())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Whether to run migrations on startup
    pub auto_migrate: bool,
}

#[cfg(feature = "postgres")]
impl DatabaseConfig {
    /// Opens a connection pool with the configured size and timeout.
    ///
    /// With `auto_migrate` set, pending migrations are applied before the pool
    /// is returned.
    pub async fn connect(&self) -> crate::Result<sqlx::PgPool> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(Duration::from_secs(self.connection_timeout_secs))
            .connect(&self.url)
            .await?;

        if self.auto_migrate {
            let runner = crate::migrations::postgres::PostgresMigrationRunner::new(pool.clone());
            let applied = crate::migrations::MigrationManager::new(Box::new(runner))
                .run_migrations()
                .await?;
            tracing::info!(applied, "Ran startup migrations");
        }

        Ok(pool)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/batchwork".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            auto_migrate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Tasks per bulk insert
    pub batch_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::batch::DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease used when a queue sets no `expiryTime`
    #[serde(with = "duration_str")]
    pub default_lease: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_millis(crate::registry::DEFAULT_LEASE_MS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Request timeout for one delivery attempt
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    pub user_agent: String,

    /// HMAC-SHA256 key for the `X-Batchwork-Signature` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("batchwork/{}", env!("CARGO_PKG_VERSION")),
            signing_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between claims when no task is available
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// Whether to emit structured JSON lines
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Installs the global `tracing` subscriber. `RUST_LOG` overrides `level`.
    pub fn init(&self) -> crate::Result<()> {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| crate::BatchworkError::Config(format!("invalid log filter: {}", e)))?;

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(self.include_location)
            .with_line_number(self.include_location);

        let installed = if self.json_format {
            builder.json().try_init()
        } else {
            builder.try_init()
        };

        installed.map_err(|e| {
            crate::BatchworkError::Config(format!("failed to install log subscriber: {}", e))
        })
    }
}
