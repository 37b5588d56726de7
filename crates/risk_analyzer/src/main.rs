use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod database;
mod features;
mod rules;
mod types;

use database::Database;
use procurement_core::health::{HealthReport, JobStatus};
use procurement_core::lock::{JobLock, DEFAULT_ACQUIRE_WAIT};
use procurement_core::Config;

const JOB_TIMEOUT: Duration = Duration::from_secs(7200); // 2h
const DATASET: &str = "risk_analysis";

#[derive(Parser)]
#[command(
    name = "risk_analyzer",
    about = "Corruption-risk feature extraction and flag rules over the tender store",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Full refresh: recompute features and flags for every tender, then
    /// refresh the serving views.
    Analyze {
        #[arg(long, help = "Analyze at most this many tenders")]
        limit: Option<i64>,
    },
    /// Print flag distribution and the highest-risk tenders.
    Stats,
}

#[derive(Default, Clone)]
struct AnalyzeStats {
    processed: u64,
    flagged: u64,
    flags_total: u64,
    errors: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Analyze { limit } => analyze(&config, limit).await,
        Command::Stats => stats(&config).await,
    }
}

async fn stats(config: &Config) -> Result<()> {
    let db = Database::new(&config.database_url).await?;
    info!("Flag distribution:");
    for (flag_type, severity, count) in db.flag_stats().await? {
        info!("  {:<20} {:<10} {}", flag_type, severity, count);
    }
    info!("Highest-risk tenders:");
    for (number, year, score, flag_count) in db.top_risky(10).await? {
        info!("  {}/{}  score {:.4}  ({} flags)", number, year, score, flag_count);
    }
    Ok(())
}

async fn analyze(config: &Config, limit: Option<i64>) -> Result<()> {
    let lock_path = std::env::temp_dir().join("risk_analyzer.lock");
    let _lock = match JobLock::acquire(&lock_path, DATASET, DEFAULT_ACQUIRE_WAIT) {
        Ok(lock) => lock,
        Err(procurement_core::LockError::Contested) => {
            warn!("Another analyzer run holds the lock, skipping");
            std::process::exit(75);
        }
        Err(e) => return Err(e.into()),
    };

    let started = Utc::now();
    info!("=== RISK ANALYZER STARTED ===");

    let mut stats = AnalyzeStats::default();
    let status = tokio::select! {
        result = run_analysis(config, limit) => match result {
            Ok(run_stats) => {
                stats = run_stats;
                JobStatus::Success
            }
            Err(e) => {
                error!("Analysis failed: {:#}", e);
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
        error_count: stats.errors,
        ..HealthReport::new(DATASET, started)
    }
    .finish(status);
    if let Err(e) = report.write_to(&config.health_dir) {
        error!("Could not write health report: {}", e);
    }

    info!(
        "=== RISK ANALYZER COMPLETED: {} tenders, {} flagged, {} flags, {} errors ===",
        stats.processed, stats.flagged, stats.flags_total, stats.errors
    );
    std::process::exit(report.exit_code);
}

async fn run_analysis(config: &Config, limit: Option<i64>) -> Result<AnalyzeStats> {
    let db = Arc::new(Database::new(&config.database_url).await?);
    let ids = db.tender_ids(limit).await?;
    info!("Analyzing {} tenders", ids.len());

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let semaphore = Arc::new(Semaphore::new(workers));
    let stats = Arc::new(Mutex::new(AnalyzeStats::default()));

    let mut handles = Vec::with_capacity(ids.len());
    for tender_id in ids {
        let db = db.clone();
        let semaphore = semaphore.clone();
        let stats = stats.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            match analyze_one(&db, tender_id).await {
                Ok(flag_count) => {
                    let mut stats = stats.lock().await;
                    stats.processed += 1;
                    stats.flags_total += flag_count;
                    if flag_count > 0 {
                        stats.flagged += 1;
                    }
                }
                Err(e) => {
                    warn!("Tender {} analysis failed: {:#}", tender_id, e);
                    stats.lock().await.errors += 1;
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    // One writer, once per full run.
    db.refresh_views().await?;

    let stats = stats.lock().await.clone();
    Ok(stats)
}

async fn analyze_one(db: &Database, tender_id: i64) -> Result<u64> {
    let snapshot = match db.load_snapshot(tender_id).await? {
        Some(snapshot) => snapshot,
        None => return Ok(0),
    };
    let history = db.load_entity_history(&snapshot).await?;
    let features = features::compute_features(&snapshot, &history);
    let flags = rules::evaluate_all(&features);
    let ensemble = rules::ensemble_score(&flags);
    db.replace_flags(tender_id, &flags, ensemble).await?;
    debug!(
        "Analyzed {}/{} ({}): {} flags, ensemble {:.3}",
        snapshot.tender_number,
        snapshot.year,
        snapshot.entity_name,
        flags.len(),
        ensemble
    );
    Ok(flags.len() as u64)
}
