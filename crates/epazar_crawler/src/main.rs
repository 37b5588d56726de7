use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod portal;

use portal::{EpazarCategory, ListingPage};
use procurement_core::fetch::{FetchSession, RetryPolicy};
use procurement_core::health::{HealthReport, JobStatus};
use procurement_core::lock::{JobLock, DEFAULT_ACQUIRE_WAIT};
use procurement_core::types::Portal;
use procurement_core::Config;
use tender_ingest::{IngestOutcome, Store};

const JOB_TIMEOUT: Duration = Duration::from_secs(9000); // 2.5h

#[derive(Parser)]
#[command(
    name = "epazar_crawler",
    about = "Crawler for the e-pazar small-value procurement portal",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "active")]
    category: CategoryArg,

    #[arg(long, help = "Stop after this many listing pages")]
    max_pages: Option<i64>,

    #[arg(long, help = "Stop after this many tenders")]
    max_items: Option<usize>,

    #[arg(long, help = "Refetch every announcement regardless of freshness")]
    force_full_scan: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CategoryArg {
    Active,
    Finished,
    Contracts,
    All,
}

#[derive(Default)]
struct Stats {
    pages: u64,
    tenders: u64,
    errors: u64,
    skipped: u64,
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
        CategoryArg::All => "epazar_all",
        CategoryArg::Active => "epazar_active",
        CategoryArg::Finished => "epazar_finished",
        CategoryArg::Contracts => "epazar_contracts",
    }
    .to_string();

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
    info!("=== EPAZAR CRAWLER STARTED ({}) ===", dataset);

    let mut stats = Stats::default();
    let status = tokio::select! {
        result = run_crawl(&cli, &config, &mut stats) => match result {
            Ok(()) => JobStatus::Success,
            Err(e) => {
                error!("Crawl failed: {:#}", e);
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
        items_processed: stats.tenders,
        error_count: stats.errors,
        ..HealthReport::new(&dataset, started)
    }
    .finish(status);
    if let Err(e) = report.write_to(&config.health_dir) {
        error!("Could not write health report: {}", e);
    }

    info!(
        "=== EPAZAR CRAWLER COMPLETED: {} pages, {} tenders, {} skipped, {} errors ===",
        stats.pages, stats.tenders, stats.skipped, stats.errors
    );
    std::process::exit(report.exit_code);
}

async fn run_crawl(cli: &Cli, config: &Config, stats: &mut Stats) -> Result<()> {
    let mut session = FetchSession::new(RetryPolicy::default())?;
    let store = Store::connect(&config.database_url).await?;

    let categories: Vec<EpazarCategory> = match cli.category {
        CategoryArg::All => vec![
            EpazarCategory::Active,
            EpazarCategory::Finished,
            EpazarCategory::Contracts,
        ],
        CategoryArg::Active => vec![EpazarCategory::Active],
        CategoryArg::Finished => vec![EpazarCategory::Finished],
        CategoryArg::Contracts => vec![EpazarCategory::Contracts],
    };

    for category in categories {
        if let Err(e) = crawl_category(cli, &mut session, &store, category, stats).await {
            warn!("Category {} aborted: {}", category.as_str(), e);
            stats.errors += 1;
        }
        if reached_cap(cli, stats) {
            break;
        }
    }
    Ok(())
}

async fn crawl_category(
    cli: &Cli,
    session: &mut FetchSession,
    store: &Store,
    category: EpazarCategory,
    stats: &mut Stats,
) -> Result<()> {
    info!("=== Crawling e-pazar {} ===", category.as_str());
    let mut cursor = store
        .load_cursor(Portal::Epazar, category.as_str(), None)
        .await?;

    let mut page: i64 = 1;
    loop {
        if let Some(max) = cli.max_pages {
            if page > max {
                break;
            }
        }
        if reached_cap(cli, stats) {
            break;
        }

        let listing_raw = session.fetch(&category.listing_url(page)).await?;
        let listing: ListingPage = match serde_json::from_str(&listing_raw.html) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Listing page {} did not parse as JSON: {}", page, e);
                stats.errors += 1;
                break;
            }
        };
        stats.pages += 1;

        if listing.items.is_empty() {
            break;
        }

        let mut last_key = cursor.last_tender_key.clone();
        for item in &listing.items {
            if reached_cap(cli, stats) {
                break;
            }
            match process_announcement(cli, session, store, item.id, stats).await {
                Ok(Some(key)) => last_key = Some(key),
                Ok(None) => {}
                Err(e) => {
                    warn!("Announcement {} failed: {}", item.number, e);
                    stats.errors += 1;
                }
            }
        }

        cursor.last_page = page;
        cursor.last_tender_key = last_key;
        cursor.error_count = stats.errors as i64;
        store.save_cursor(&cursor).await?;

        if page >= listing.total_pages {
            break;
        }
        page += 1;
    }
    Ok(())
}

async fn process_announcement(
    cli: &Cli,
    session: &mut FetchSession,
    store: &Store,
    id: i64,
    stats: &mut Stats,
) -> Result<Option<String>> {
    let detail_raw = session.fetch(&portal::detail_url(id)).await?;
    let detail: portal::Announcement = serde_json::from_str(&detail_raw.html)?;
    let (tender, documents) = portal::map_announcement(&detail_raw.html, detail);

    if !cli.force_full_scan
        && store
            .is_fresh(&tender.tender_number, tender.year, &tender.source_hash, 24)
            .await?
    {
        stats.skipped += 1;
        return Ok(None);
    }

    for warning in tender.integrity_warnings() {
        warn!("Integrity: {} on {}", warning, tender.tender_key());
    }

    let outcome = store.upsert_tender(&tender, &documents).await?;
    stats.tenders += 1;
    if outcome == IngestOutcome::Inserted {
        info!("New e-pazar tender {}", tender.tender_key());
    }
    Ok(Some(tender.tender_key()))
}

fn reached_cap(cli: &Cli, stats: &Stats) -> bool {
    cli.max_items
        .map(|cap| stats.tenders as usize >= cap)
        .unwrap_or(false)
}
