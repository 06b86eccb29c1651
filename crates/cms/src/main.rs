//! CMS publication worker
//!
//! Main binary with subcommands:
//! - `worker`: Publish scheduled lessons on an interval until interrupted
//! - `sweep`: Run a single publication sweep and print its report
//! - `migrate`: Create the catalog schema
//! - `seed`: Insert demo programs, terms and lessons
//! - `set-status`: Move a lesson to draft, scheduled or published

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cms_publisher::{CatalogStore, Database, LessonId, LessonStatusChange, PublicationSweep};

mod seed;
mod worker;

#[derive(Parser)]
#[command(name = "cms")]
#[command(about = "Scheduled publication worker for the course CMS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct DatabaseArgs {
    /// Database URL: sqlite://path, a bare path, or postgres://...
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://cms_core.db")]
    database_url: String,

    /// Maximum pooled connections (Postgres only)
    #[arg(long, env = "CMS_DB_MAX_CONNECTIONS", default_value = "10")]
    max_connections: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the publication worker until SIGINT/SIGTERM
    Worker {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Seconds between sweeps
        #[arg(long, env = "CMS_SWEEP_INTERVAL_SECS", default_value = "60",
              value_parser = clap::value_parser!(u64).range(1..))]
        interval_secs: u64,

        /// Maximum lessons claimed per sweep (unbounded when unset)
        #[arg(long, env = "CMS_SWEEP_BATCH_LIMIT")]
        batch_limit: Option<u32>,
    },

    /// Run one sweep and exit
    Sweep {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Maximum lessons claimed (unbounded when unset)
        #[arg(long, env = "CMS_SWEEP_BATCH_LIMIT")]
        batch_limit: Option<u32>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create tables and indexes if missing
    Migrate {
        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// Insert demo data, including a lesson scheduled a couple of minutes out
    Seed {
        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// Change a lesson's status the way an editor would
    SetStatus {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Lesson id
        #[arg(long)]
        lesson: LessonId,

        /// draft, scheduled or published
        #[arg(long)]
        status: String,

        /// RFC 3339 publication time, required with --status scheduled
        #[arg(long)]
        publish_at: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cms=info,cms_publisher=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker {
            db,
            interval_secs,
            batch_limit,
        } => {
            worker::run(worker::WorkerConfig {
                db,
                interval: Duration::from_secs(interval_secs),
                batch_limit,
            })
            .await
        }

        Commands::Sweep {
            db,
            batch_limit,
            json,
        } => run_sweep(&db, batch_limit, json).await,

        Commands::Migrate { db } => {
            open_database(&db).await?;
            Ok(())
        }

        Commands::Seed { db } => {
            let database = open_database(&db).await?;
            seed::run(database.catalog()).await
        }

        Commands::SetStatus {
            db,
            lesson,
            status,
            publish_at,
        } => {
            let change = LessonStatusChange::from_parts(&status, publish_at)
                .map_err(|e| miette::miette!("{}", e))?;
            let database = open_database(&db).await?;
            let lesson = database
                .catalog()
                .set_lesson_status(lesson, change)
                .await
                .map_err(|e| miette::miette!("failed to update lesson {}: {}", lesson, e))?;
            let out = serde_json::to_string_pretty(&lesson)
                .map_err(|e| miette::miette!("failed to encode lesson: {}", e))?;
            println!("{}", out);
            Ok(())
        }
    }
}

/// Open the configured store and make sure its schema exists.
async fn open_database(args: &DatabaseArgs) -> Result<Database> {
    let url = cms_publisher::store::redact(&args.database_url);
    let database = Database::open(&args.database_url, args.max_connections)
        .await
        .map_err(|e| miette::miette!("failed to open database {}: {}", url, e))?;
    database
        .migrate()
        .await
        .map_err(|e| miette::miette!("failed to migrate database {}: {}", url, e))?;
    tracing::info!(backend = database.backend(), url = %url, "database ready");
    Ok(database)
}

async fn run_sweep(db: &DatabaseArgs, batch_limit: Option<u32>, json: bool) -> Result<()> {
    let database = open_database(db).await?;
    let report = PublicationSweep::new(database.publication_store())
        .with_batch_limit(batch_limit)
        .run()
        .await
        .map_err(|e| miette::miette!("publication sweep failed: {}", e))?;

    if json {
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| miette::miette!("failed to encode report: {}", e))?;
        println!("{}", out);
    } else {
        println!(
            "claimed {} lesson(s), published {} lesson(s), promoted {} program(s) in {} ms",
            report.claimed, report.lessons_published, report.programs_published, report.elapsed_ms
        );
    }
    Ok(())
}
