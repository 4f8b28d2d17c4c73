use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod coordinator;
mod db;
mod error;
mod models;
mod observations;
mod report;
mod scoring;
mod validator;
mod window;

use crate::config::{AnalysisSettings, ScoringSettings, DEFAULT_TIMEZONE};
use crate::coordinator::RunCoordinator;
use crate::db::PgStore;
use crate::models::Window;
use crate::scoring::OpenAiScoringClient;
use crate::validator::{ResultValidator, ScoreRanges};

#[derive(Parser)]
#[command(name = "mentor-chat-analysis")]
#[command(about = "Weekly AI scoring of anonymized mentoring chats", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load parameter definitions and demo chats for last week
    Seed {
        #[arg(long, env = "ANALYSIS_TIMEZONE", default_value = DEFAULT_TIMEZONE)]
        timezone: String,
    },
    /// Import sanitized chat messages from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print the window a scheduled run would analyse
    Window {
        #[arg(long, env = "ANALYSIS_TIMEZONE", default_value = DEFAULT_TIMEZONE)]
        timezone: String,
        /// Pretend the current instant is this RFC 3339 timestamp
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Score every chat in a window and record the observations
    Run {
        #[command(flatten)]
        analysis: AnalysisSettings,
        #[command(flatten)]
        scoring: ScoringSettings,
        /// Window start (RFC 3339); defaults to the previous full week
        #[arg(long, requires = "end")]
        start: Option<DateTime<Utc>>,
        /// Window end, exclusive (RFC 3339)
        #[arg(long, requires = "start")]
        end: Option<DateTime<Utc>>,
        /// Call the model for every chat but store nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate a markdown report for one run
    Report {
        #[arg(long)]
        run_id: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { timezone } => {
            let pool = connect().await?;
            let window = window::resolve(None, &timezone)?;
            db::seed(&pool, window).await?;
            println!("Seed data inserted for {window}.");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} messages from {}.", csv.display());
        }
        Commands::Window { timezone, at } => {
            let window = window::resolve_at(None, &timezone, at.unwrap_or_else(Utc::now))?;
            println!("{window}");
        }
        Commands::Run {
            analysis,
            scoring,
            start,
            end,
            dry_run,
        } => {
            analysis.validate()?;
            let window = match (start, end) {
                (Some(start), Some(end)) => Some(Window::new(start, end)?),
                _ => None,
            };

            let pool = connect().await?;
            let store = Arc::new(PgStore::new(pool));
            let definitions = store.load_parameter_definitions().await?;
            let ranges = ScoreRanges::from_definitions(&definitions)?;
            let client = Arc::new(OpenAiScoringClient::new(scoring)?);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    on_signal.cancel();
                }
            });

            let coordinator = RunCoordinator::new(store.clone(), store, client, analysis)
                .with_validator(ResultValidator::new(ranges));
            let run_id = coordinator.run(window, dry_run, &cancel).await?;

            info!(run_id, dry_run, "run finished");
            println!("Run {run_id} finished. Summarize it with `report --run-id {run_id}`.");
        }
        Commands::Report { run_id, out } => {
            let pool = connect().await?;
            let run = db::fetch_run(&pool, run_id).await?;
            let chats_scored = db::count_summaries(&pool, run_id).await?;
            let stats = db::fetch_parameter_stats(&pool, run_id).await?;
            let shifts = db::fetch_sentiment_shifts(&pool, run_id).await?;
            let report = report::build_report(&run, chats_scored, &stats, &shifts);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
