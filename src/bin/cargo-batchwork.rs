//! Cargo subcommand for Batchwork operations.
//!
//! Usage:
//!   cargo batchwork migrate --database-url postgresql://localhost/batchwork
//!   cargo batchwork status --database-url postgresql://localhost/batchwork
//!   cargo batchwork status --queue-id 42
//!   cargo batchwork results --queue-id 42
//!
//! Without `--database-url` the connection settings come from `BATCHWORK_*`
//! environment variables. With `BATCHWORK_AUTO_MIGRATE=true`, `status` and
//! `results` apply pending migrations before reading.

use batchwork::{
    BatchworkConfig, TaskQueue, TaskService,
    migrations::{MigrationManager, postgres::PostgresMigrationRunner},
    notify::DisabledCallbackSender,
};
use clap::{Args, Parser, Subcommand};
use std::{process, sync::Arc};
use tracing::error;

#[derive(Parser)]
#[command(
    name = "cargo",
    bin_name = "cargo",
    version,
    about = "Batchwork task queue management tool"
)]
struct Cli {
    #[command(subcommand)]
    command: CargoCommand,
}

#[derive(Subcommand)]
enum CargoCommand {
    #[command(name = "batchwork", about = "Batchwork task queue operations", version)]
    Batchwork {
        #[command(subcommand)]
        command: BatchworkCommand,
    },
}

#[derive(Args)]
struct Connection {
    #[arg(
        long = "database-url",
        help = "Database connection URL (defaults to BATCHWORK_DATABASE_URL)",
        value_name = "URL"
    )]
    database_url: Option<String>,
}

#[derive(Subcommand)]
enum BatchworkCommand {
    #[command(about = "Run pending database migrations")]
    Migrate {
        #[command(flatten)]
        connection: Connection,
    },

    #[command(about = "Show migration status, or the progress of one queue")]
    Status {
        #[command(flatten)]
        connection: Connection,

        #[arg(long = "queue-id", help = "Show progress of this queue instead")]
        queue_id: Option<i64>,
    },

    #[command(about = "Print the collected results of a queue as JSON")]
    Results {
        #[command(flatten)]
        connection: Connection,

        #[arg(long = "queue-id", help = "Queue to read results from")]
        queue_id: i64,
    },
}

#[tokio::main]
async fn main() {
    let Cli {
        command: CargoCommand::Batchwork { command },
    } = Cli::parse();

    let mut config = match BatchworkConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = config.logging.init() {
        eprintln!("Warning: {}", e);
    }

    let result = match command {
        BatchworkCommand::Migrate { connection } => {
            connection.apply(&mut config);
            run_migrations(&config).await
        }
        BatchworkCommand::Status {
            connection,
            queue_id,
        } => {
            connection.apply(&mut config);
            match queue_id {
                Some(queue_id) => show_queue_status(&config, queue_id).await,
                None => show_migration_status(&config).await,
            }
        }
        BatchworkCommand::Results {
            connection,
            queue_id,
        } => {
            connection.apply(&mut config);
            print_results(&config, queue_id).await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

impl Connection {
    fn apply(self, config: &mut BatchworkConfig) {
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
    }
}

async fn run_migrations(config: &BatchworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Running Batchwork migrations...");

    let mut database = config.database.clone();
    database.auto_migrate = false;
    let pool = database.connect().await?;
    let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(pool)));
    let applied = manager.run_migrations().await?;

    println!("Applied {} migration(s)", applied);
    Ok(())
}

async fn show_migration_status(config: &BatchworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pool = config.database.connect().await?;
    let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(pool)));

    println!("Batchwork migration status");
    println!();
    let status = manager.get_migration_status().await?;
    for (migration, applied) in &status {
        let marker = if *applied { "applied" } else { "pending" };
        println!(
            "  [{:>7}] {:03} {} - {}",
            marker, migration.version, migration.id, migration.description
        );
    }

    let pending = status.iter().filter(|(_, applied)| !applied).count();
    println!();
    if pending == 0 {
        println!("Database schema is up to date");
    } else {
        println!("{} pending migration(s); run `cargo batchwork migrate`", pending);
    }
    Ok(())
}

type PgService = TaskService<TaskQueue<sqlx::Postgres>>;

async fn service(config: &BatchworkConfig) -> batchwork::Result<PgService> {
    let pool = config.database.connect().await?;
    Ok(TaskService::with_config(
        Arc::new(TaskQueue::new(pool)),
        Arc::new(DisabledCallbackSender),
        config,
        None,
    ))
}

async fn show_queue_status(
    config: &BatchworkConfig,
    queue_id: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = service(config).await?.queue_status(queue_id).await?;

    println!("Queue {} ({})", status.queue.id, status.queue.queue_type);
    println!("  created:   {}", status.queue.created_at);
    println!(
        "  tasks:     {}/{} finished",
        status.finished_tasks, status.total_tasks
    );
    match status.queue.completed_at {
        Some(at) => println!("  completed: {}", at),
        None if status.complete => println!("  completed: yes (not yet latched)"),
        None => println!("  completed: no"),
    }
    if let Some(callback) = status.queue.options.callback_url() {
        println!("  callback:  {}", callback);
    }
    Ok(())
}

async fn print_results(
    config: &BatchworkConfig,
    queue_id: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let results = service(config).await?.get_results(queue_id).await?;
    let payload = batchwork::CallbackPayload { results };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
