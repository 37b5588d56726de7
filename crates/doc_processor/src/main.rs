use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use doc_processor::database::Database;
use doc_processor::worker::{process_batch, DocStats, WorkerOptions};
use procurement_core::health::{HealthReport, JobStatus};
use procurement_core::lock::{JobLock, DEFAULT_ACQUIRE_WAIT};
use procurement_core::Config;

const JOB_TIMEOUT: Duration = Duration::from_secs(7200); // 2h
const DATASET: &str = "documents";

#[derive(Parser)]
#[command(
    name = "doc_processor",
    about = "Downloads and extracts queued tender documents",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, default_value = "50", help = "Batch size per run")]
    limit: i64,

    #[arg(long, help = "Concurrent workers (default from DOC_WORKERS)")]
    workers: Option<usize>,

    #[arg(long, help = "Reprocess documents that already succeeded")]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let lock_path = std::env::temp_dir().join("doc_processor.lock");
    let _lock = match JobLock::acquire(&lock_path, DATASET, DEFAULT_ACQUIRE_WAIT) {
        Ok(lock) => lock,
        Err(procurement_core::LockError::Contested) => {
            warn!("Another document-processing job holds the lock, skipping");
            std::process::exit(75);
        }
        Err(e) => return Err(e.into()),
    };

    let started = Utc::now();
    info!("=== DOCUMENT PROCESSOR STARTED ===");

    let workers = cli.workers.unwrap_or(config.doc_workers);
    let opts = WorkerOptions {
        limit: cli.limit,
        workers,
        force: cli.force,
    };

    let mut stats = DocStats::default();
    let status = tokio::select! {
        result = run(&config, &opts) => match result {
            Ok(batch_stats) => {
                stats = batch_stats;
                JobStatus::Success
            }
            Err(e) => {
                error!("Document processing failed: {:#}", e);
                JobStatus::Failure
            }
        },
        _ = tokio::time::sleep(JOB_TIMEOUT) => {
            error!("Wall-clock limit reached after {:?}", JOB_TIMEOUT);
            JobStatus::Timeout
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Termination signal received");
            JobStatus::Timeout
        }
    };

    let report = HealthReport {
        items_processed: stats.processed,
        error_count: stats.errors + stats.failed,
        ..HealthReport::new(DATASET, started)
    }
    .finish(status);
    if let Err(e) = report.write_to(&config.health_dir) {
        error!("Could not write health report: {}", e);
    }

    info!("=== DOCUMENT PROCESSOR COMPLETED ===");
    std::process::exit(report.exit_code);
}

async fn run(config: &Config, opts: &WorkerOptions) -> Result<DocStats> {
    let db = Arc::new(Database::new(&config.database_url).await?);
    process_batch(db, Arc::new(config.clone()), opts).await
}
