use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod crawler;
mod dossier;
mod listing;

use crawler::{Category, CrawlStats, CrawlerOptions, NabavkiCrawler};
use procurement_core::fetch::{FetchSession, LoginSpec, RetryPolicy};
use procurement_core::health::{HealthReport, JobStatus};
use procurement_core::lock::{JobLock, DEFAULT_ACQUIRE_WAIT};
use procurement_core::Config;
use tender_ingest::Store;

/// Wall-clock limit for a crawl job.
const JOB_TIMEOUT: Duration = Duration::from_secs(9000); // 2.5h

const LOGIN_URL: &str = "https://www.e-nabavki.gov.mk/PublicAccess/Login.aspx";

#[derive(Parser)]
#[command(
    name = "nabavki_crawler",
    about = "Crawler for the e-nabavki public procurement portal",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "active")]
    category: CategoryArg,

    #[arg(long, help = "Archive year (2008-2021) or recent year for reverse backfill")]
    year: Option<i32>,

    #[arg(long, help = "Stop after this many listing pages")]
    max_pages: Option<usize>,

    #[arg(long, help = "First listing page to process (1-based)")]
    start_page: Option<usize>,

    #[arg(long, help = "Iterate from the last page backwards")]
    reverse: bool,

    #[arg(long, help = "Ignore incremental freshness and refetch every dossier")]
    force_full_scan: bool,

    #[arg(long, help = "Stop after this many tenders")]
    max_items: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum CategoryArg {
    Active,
    Awarded,
    Cancelled,
    Historical,
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let dataset = match cli.category {
        CategoryArg::All => "enabavki_all".to_string(),
        CategoryArg::Active => "enabavki_active".to_string(),
        CategoryArg::Awarded => "enabavki_awarded".to_string(),
        CategoryArg::Cancelled => "enabavki_cancelled".to_string(),
        CategoryArg::Historical => "enabavki_historical".to_string(),
    };

    // One crawler job at a time, portal A or B.
    let lock_path = std::env::temp_dir().join("procurement_crawler.lock");
    let _lock = match JobLock::acquire(&lock_path, &dataset, DEFAULT_ACQUIRE_WAIT) {
        Ok(lock) => lock,
        Err(procurement_core::LockError::Contested) => {
            warn!("Another crawler job holds the lock, skipping this run");
            std::process::exit(75);
        }
        Err(e) => return Err(e.into()),
    };

    let started = Utc::now();
    info!("=== NABAVKI CRAWLER STARTED ({}) ===", dataset);

    let outcome = tokio::select! {
        result = run_crawl(&cli, &config) => result,
        _ = tokio::time::sleep(JOB_TIMEOUT) => {
            error!("Wall-clock limit reached after {:?}", JOB_TIMEOUT);
            Err(RunError::Timeout(CrawlStats::default()))
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Termination signal received");
            Err(RunError::Timeout(CrawlStats::default()))
        }
    };

    let (status, stats) = match outcome {
        Ok(stats) => (JobStatus::Success, stats),
        Err(RunError::Timeout(stats)) => (JobStatus::Timeout, stats),
        Err(RunError::Failed(stats, e)) => {
            error!("Crawl failed: {:#}", e);
            (JobStatus::Failure, stats)
        }
    };

    let report = HealthReport {
        items_processed: stats.tenders,
        error_count: stats.errors,
        log_path: config
            .log_dir
            .as_ref()
            .map(|d| d.join(format!("{}.log", dataset)).display().to_string()),
        ..HealthReport::new(&dataset, started)
    }
    .finish(status);
    if let Err(e) = report.write_to(&config.health_dir) {
        error!("Could not write health report: {}", e);
    }

    info!(
        "=== NABAVKI CRAWLER COMPLETED: {} pages, {} tenders ({} new, {} updated), {} skipped, {} errors ===",
        stats.pages, stats.tenders, stats.inserted, stats.updated, stats.skipped, stats.errors
    );
    std::process::exit(report.exit_code);
}

enum RunError {
    Timeout(CrawlStats),
    Failed(CrawlStats, anyhow::Error),
}

async fn run_crawl(cli: &Cli, config: &Config) -> Result<CrawlStats, RunError> {
    let stats_on_err = CrawlStats::default();

    let (username, password) = config
        .nabavki_credentials()
        .context("NABAVKI_USERNAME / NABAVKI_PASSWORD must be set")
        .map_err(|e| RunError::Failed(stats_on_err.clone(), e))?;

    let jar_path = std::env::temp_dir().join("nabavki_session_cookies.json");
    let session = FetchSession::authenticated_session(
        jar_path,
        username,
        password,
        LoginSpec {
            login_url: LOGIN_URL.to_string(),
            username_field: "ctl00$MainContent$txtUserName".to_string(),
            password_field: "ctl00$MainContent$txtPassword".to_string(),
        },
        RetryPolicy::default(),
    )
    .await
    .context("Portal login failed")
    .map_err(|e| RunError::Failed(stats_on_err.clone(), e))?;

    let store = Store::connect(&config.database_url)
        .await
        .map_err(|e| RunError::Failed(stats_on_err.clone(), e))?;

    let mut crawler = NabavkiCrawler::new(session, store)
        .await
        .map_err(|e| RunError::Failed(stats_on_err.clone(), e))?;

    let (category, all) = match cli.category {
        CategoryArg::All => (Category::Active, true),
        CategoryArg::Active => (Category::Active, false),
        CategoryArg::Awarded => (Category::Awarded, false),
        CategoryArg::Cancelled => (Category::Cancelled, false),
        CategoryArg::Historical => (Category::Historical, false),
    };

    let opts = CrawlerOptions {
        year: cli.year,
        max_pages: cli.max_pages,
        start_page: cli.start_page,
        reverse: cli.reverse,
        force_full_scan: cli.force_full_scan,
        max_items: cli.max_items,
        concurrency: config.crawl_concurrency,
    };

    let run_result = crawler.run(category, all, &opts).await;
    let stats = crawler.shutdown().await;
    match run_result {
        Ok(()) => Ok(stats),
        Err(e) => Err(RunError::Failed(stats, e)),
    }
}
