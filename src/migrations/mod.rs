//! Versioned schema migrations.
//!
//! Each migration runs once, in version order, inside its own transaction. Applied
//! migrations are tracked in the `batchwork_migrations` table.
//!
//! ```bash
//! cargo batchwork migrate --database-url postgresql://localhost/batchwork
//! cargo batchwork status --database-url postgresql://localhost/batchwork
//! ```
//!
//! Applications can also apply migrations on startup:
//!
//! ```rust,no_run
//! # #[cfg(feature = "postgres")]
//! # #[tokio::main]
//! # async fn main() -> batchwork::Result<()> {
//! use batchwork::migrations::{MigrationManager, postgres::PostgresMigrationRunner};
//!
//! let pool = sqlx::PgPool::connect("postgresql://localhost/batchwork").await?;
//! let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(pool)));
//! manager.run_migrations().await?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "postgres"))]
//! # fn main() {}
//! ```

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Unique identifier, e.g. `001_create_queues_and_tasks`.
    pub id: String,
    pub description: String,
    /// Ordering key.
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl Migration {
    fn builtin(id: &str, description: &str, version: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            version,
            created_at,
        }
    }
}

/// A row of the tracking table.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

#[async_trait::async_trait]
pub trait MigrationRunner {
    /// Executes one migration's SQL atomically.
    async fn run_migration(&self, migration: &Migration, sql: &str) -> Result<()>;

    async fn migration_table_exists(&self) -> Result<bool>;

    async fn create_migration_table(&self) -> Result<()>;

    async fn get_executed_migrations(&self) -> Result<Vec<MigrationRecord>>;

    async fn record_migration(&self, migration: &Migration, execution_time_ms: u64) -> Result<()>;
}

pub struct MigrationManager {
    runner: Box<dyn MigrationRunner + Send + Sync>,
    migrations: BTreeMap<u32, (Migration, String)>,
}

impl MigrationManager {
    /// Creates a manager with the built-in migrations registered.
    pub fn new(runner: Box<dyn MigrationRunner + Send + Sync>) -> Self {
        let mut manager = Self {
            runner,
            migrations: BTreeMap::new(),
        };
        manager.register_builtin_migrations();
        manager
    }

    /// Registers a migration. A later registration with the same version replaces
    /// the earlier one.
    pub fn register_migration(&mut self, migration: Migration, sql: String) {
        self.migrations.insert(migration.version, (migration, sql));
    }

    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values().map(|(migration, _)| migration)
    }

    async fn executed_ids(&self) -> Result<HashSet<String>> {
        if !self.runner.migration_table_exists().await? {
            return Ok(HashSet::new());
        }
        Ok(self
            .runner
            .get_executed_migrations()
            .await?
            .into_iter()
            .map(|r| r.migration_id)
            .collect())
    }

    /// Runs every pending migration in version order and returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize> {
        info!("Starting migration process...");

        if !self.runner.migration_table_exists().await? {
            info!("Creating migration tracking table...");
            self.runner.create_migration_table().await?;
        }

        let executed = self.executed_ids().await?;
        let pending: Vec<_> = self
            .migrations
            .values()
            .filter(|(migration, _)| !executed.contains(&migration.id))
            .collect();

        if pending.is_empty() {
            info!("No pending migrations to run");
            return Ok(0);
        }

        info!("Found {} pending migrations", pending.len());

        for (migration, sql) in &pending {
            info!(
                "Running migration: {} - {}",
                migration.id, migration.description
            );
            let start_time = std::time::Instant::now();

            self.runner.run_migration(migration, sql).await?;

            let execution_time_ms = start_time.elapsed().as_millis() as u64;
            self.runner
                .record_migration(migration, execution_time_ms)
                .await?;

            info!(
                "Completed migration {} in {}ms",
                migration.id, execution_time_ms
            );
        }

        info!("All migrations completed successfully");
        Ok(pending.len())
    }

    /// Every registered migration with whether it has been applied.
    pub async fn get_migration_status(&self) -> Result<Vec<(Migration, bool)>> {
        let executed = self.executed_ids().await?;
        Ok(self
            .migrations
            .values()
            .map(|(migration, _)| (migration.clone(), executed.contains(&migration.id)))
            .collect())
    }

    fn register_builtin_migrations(&mut self) {
        self.register_migration(
            Migration::builtin(
                "001_create_queues_and_tasks",
                "Create task_status enum, queues and tasks tables",
                1,
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                    .single()
                    .unwrap_or_default(),
            ),
            include_str!("001_create_queues_and_tasks.postgres.sql").to_string(),
        );

        self.register_migration(
            Migration::builtin(
                "002_add_queue_completion",
                "Add the queue completion latch",
                2,
                Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0)
                    .single()
                    .unwrap_or_default(),
            ),
            include_str!("002_add_queue_completion.postgres.sql").to_string(),
        );
    }
}

/// Splits a migration script into statements on `;`, ignoring semicolons inside
/// single-quoted strings, dollar-quoted bodies and `--` comments. Comment-only
/// fragments are dropped.
#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
pub(crate) fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_line_comment = false;
    let mut dollar_tag: Option<String> = None;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);

        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
            }
            continue;
        }

        match ch {
            '-' if !in_single_quote && dollar_tag.is_none() && chars.peek() == Some(&'-') => {
                in_line_comment = true;
            }
            '\'' if dollar_tag.is_none() => in_single_quote = !in_single_quote,
            '$' if !in_single_quote => {
                let ahead: String = chars
                    .clone()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                let closes_tag = chars.clone().nth(ahead.chars().count()) == Some('$');
                if !closes_tag {
                    continue;
                }
                match &dollar_tag {
                    Some(open) if *open == ahead => dollar_tag = None,
                    Some(_) => continue,
                    None => dollar_tag = Some(ahead.clone()),
                }
                for _ in 0..=ahead.chars().count() {
                    if let Some(c) = chars.next() {
                        current.push(c);
                    }
                }
            }
            ';' if !in_single_quote && dollar_tag.is_none() => {
                if has_sql_content(&current) {
                    statements.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => {}
        }
    }

    if has_sql_content(&current) {
        statements.push(current.trim().to_string());
    }
    statements
}

#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
fn has_sql_content(fragment: &str) -> bool {
    fragment.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("--") && line != ";"
    })
}
