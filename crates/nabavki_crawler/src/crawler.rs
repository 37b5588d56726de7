//! Category/year traversal over the dropdown-paginated notice grid.
//!
//! The listing cursor is serial — the page dropdown is stateful
//! server-side — while dossier detail fetches run over plain HTTP with a
//! bounded pool. Cursor state is persisted at every page boundary so a
//! killed run resumes with zero duplicates and zero gaps.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use procurement_core::browser::{BrowserSession, WaitStrategy};
use procurement_core::error::FetchError;
use procurement_core::fetch::{looks_like_login_page, FetchSession};
use procurement_core::types::Portal;
use tender_ingest::{IngestOutcome, Store};

use crate::dossier;
use crate::listing::{self, ListingRow};

const BASE_URL: &str = "https://www.e-nabavki.gov.mk";
const LISTING_GRID: &str = "#MainContent_grdDossie";
const PAGE_DROPDOWN: &str = "#MainContent_ddlPage";
const ARCHIVE_DROPDOWN: &str = "#MainContent_ddlArchiveYear";
const RENDER_TIMEOUT: Duration = Duration::from_secs(45);

/// Years reachable through the archive dropdown; later years live in the
/// default view and are reached by reverse traversal.
pub const ARCHIVE_YEARS: std::ops::RangeInclusive<i32> = 2008..=2021;

/// Consecutive empty listing pages before a (category, year) is abandoned.
const EMPTY_PAGE_LIMIT: u32 = 3;

/// Incremental mode treats a stored row as fresh for this long.
const FRESHNESS_HOURS: i32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Active,
    Awarded,
    Cancelled,
    Historical,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Active => "active",
            Category::Awarded => "awarded",
            Category::Cancelled => "cancelled",
            Category::Historical => "historical",
        }
    }

    fn landing_url(&self) -> String {
        let path = match self {
            Category::Active => "PublicAccess/Dossie/Notices.aspx",
            Category::Awarded => "PublicAccess/Dossie/AwardedContracts.aspx",
            Category::Cancelled => "PublicAccess/Dossie/CancelledProcedures.aspx",
            // The archive lives behind the awarded-contracts grid.
            Category::Historical => "PublicAccess/Dossie/AwardedContracts.aspx",
        };
        format!("{}/{}", BASE_URL, path)
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    pub year: Option<i32>,
    pub max_pages: Option<usize>,
    pub start_page: Option<usize>,
    pub reverse: bool,
    pub force_full_scan: bool,
    pub max_items: Option<usize>,
    pub concurrency: usize,
}

#[derive(Debug, Default, Clone)]
pub struct CrawlStats {
    pub pages: u64,
    pub tenders: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub errors: u64,
}

pub struct NabavkiCrawler {
    session: FetchSession,
    browser: BrowserSession,
    store: Store,
    stats: CrawlStats,
}

impl NabavkiCrawler {
    pub async fn new(session: FetchSession, store: Store) -> Result<Self> {
        let browser = BrowserSession::launch()
            .await
            .context("Failed to launch headless browser")?;
        browser
            .set_cookies(session.cookies())
            .await
            .context("Failed to seed browser cookies")?;
        Ok(NabavkiCrawler {
            session,
            browser,
            store,
            stats: CrawlStats::default(),
        })
    }

    pub async fn shutdown(self) -> CrawlStats {
        self.browser.close().await;
        self.stats
    }

    /// Crawl one or more categories per the options. Per-category failures
    /// are contained: logged, counted, the next category still runs.
    pub async fn run(&mut self, category: Category, all: bool, opts: &CrawlerOptions) -> Result<()> {
        let categories: Vec<Category> = if all {
            vec![Category::Active, Category::Awarded, Category::Cancelled]
        } else {
            vec![category]
        };

        for category in categories {
            let years: Vec<Option<i32>> = match category {
                Category::Historical => match opts.year {
                    Some(year) => vec![Some(year)],
                    None => ARCHIVE_YEARS.map(Some).collect(),
                },
                _ => vec![opts.year],
            };
            for year in years {
                if self.reached_item_cap(opts) {
                    return Ok(());
                }
                if let Err(e) = self.crawl_category_year(category, year, opts).await {
                    if is_auth_abort(&e) {
                        return Err(e);
                    }
                    warn!(
                        "Category {} year {:?} aborted: {}",
                        category.as_str(),
                        year,
                        e
                    );
                    self.stats.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn crawl_category_year(
        &mut self,
        category: Category,
        year: Option<i32>,
        opts: &CrawlerOptions,
    ) -> Result<()> {
        info!(
            "=== Crawling {} (year: {:?}) ===",
            category.as_str(),
            year
        );

        let mut cursor = self
            .store
            .load_cursor(Portal::Enabavki, category.as_str(), year)
            .await?;

        let landing = self.apply_filters(category, year).await?;
        let total = listing::total_pages(&landing.html);
        info!("{}: {} listing pages", category.as_str(), total);

        // Resume from the cursor for the long historical backfill; explicit
        // --start-page always wins.
        let resume_from = match opts.start_page {
            Some(p) => p,
            None if category == Category::Historical && !opts.force_full_scan => {
                (cursor.last_page as usize).saturating_add(1).max(1)
            }
            None => 1,
        };

        let sequence: Vec<i64> = if opts.reverse {
            (1..=total).rev().collect()
        } else {
            (1..=total).collect()
        };
        let sequence: Vec<i64> = sequence
            .into_iter()
            .skip(resume_from.saturating_sub(1))
            .take(opts.max_pages.unwrap_or(usize::MAX))
            .collect();

        let mut current_page: i64 = 1;
        let mut empty_streak: u32 = 0;
        let mut seen: HashSet<String> = HashSet::new();

        for page in sequence {
            if self.reached_item_cap(opts) {
                break;
            }
            if page != current_page {
                self.goto_page(category, year, page).await?;
                current_page = page;
            }
            let snapshot = self.browser.snapshot().await?;
            if looks_like_login_page(&snapshot.html) {
                // Listing itself bounced to the login form: one recovery.
                self.session.relogin().await.map_err(auth_abort)?;
                self.browser.set_cookies(self.session.cookies()).await?;
                self.apply_filters(category, year).await?;
                self.goto_page(category, year, page).await?;
            }

            let rows = listing::parse_listing(&self.browser.snapshot().await?.html);
            self.stats.pages += 1;

            if rows.is_empty() {
                empty_streak += 1;
                info!(
                    "Page {} of {} is empty ({}/{})",
                    page,
                    category.as_str(),
                    empty_streak,
                    EMPTY_PAGE_LIMIT
                );
                if empty_streak >= EMPTY_PAGE_LIMIT {
                    info!("{} empty pages in a row, abandoning year", empty_streak);
                    break;
                }
                continue;
            }
            empty_streak = 0;

            let last_key = self.process_rows(&rows, year, &mut seen, opts).await?;

            cursor.last_page = page;
            if let Some(key) = last_key {
                cursor.last_tender_key = Some(key);
            }
            cursor.error_count = self.stats.errors as i64;
            self.store.save_cursor(&cursor).await?;
        }

        Ok(())
    }

    /// Land on the category grid and, for archive years, select the year
    /// from the archive dropdown.
    async fn apply_filters(
        &mut self,
        category: Category,
        year: Option<i32>,
    ) -> Result<procurement_core::fetch::FetchResult> {
        let wait = WaitStrategy {
            selector: Some(LISTING_GRID.to_string()),
            delay: Some(Duration::from_millis(500)),
        };
        let mut result = self
            .browser
            .navigate(&category.landing_url(), &wait, RENDER_TIMEOUT)
            .await?;

        if let Some(year) = year {
            if ARCHIVE_YEARS.contains(&year) {
                let accepted = self
                    .browser
                    .select_option(ARCHIVE_DROPDOWN, &year.to_string())
                    .await?;
                if !accepted {
                    return Err(anyhow!(
                        "archive dropdown rejected year {} on {}",
                        year,
                        category.as_str()
                    ));
                }
                self.browser
                    .wait_for_selector(LISTING_GRID, RENDER_TIMEOUT)
                    .await?;
                result = self.browser.snapshot().await?;
            }
        }
        Ok(result)
    }

    /// Dropdown pagination: values are zero-indexed server-side. A rejected
    /// target reloads the landing page, re-applies the filters and tries
    /// once more before giving up on the page.
    async fn goto_page(&mut self, category: Category, year: Option<i32>, page: i64) -> Result<()> {
        let value = (page - 1).to_string();
        let accepted = self.browser.select_option(PAGE_DROPDOWN, &value).await?;
        if accepted {
            self.browser
                .wait_for_selector(LISTING_GRID, RENDER_TIMEOUT)
                .await?;
            return Ok(());
        }
        warn!("Page dropdown rejected page {}, re-applying filters", page);
        self.apply_filters(category, year).await?;
        let accepted = self.browser.select_option(PAGE_DROPDOWN, &value).await?;
        if !accepted {
            return Err(anyhow!("page dropdown rejected page {} twice", page));
        }
        self.browser
            .wait_for_selector(LISTING_GRID, RENDER_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Dedup, incremental skip, bounded detail fetches, ingestion. Returns
    /// the last tender key emitted on this page.
    async fn process_rows(
        &mut self,
        rows: &[ListingRow],
        year: Option<i32>,
        seen: &mut HashSet<String>,
        opts: &CrawlerOptions,
    ) -> Result<Option<String>> {
        let mut to_fetch: Vec<ListingRow> = Vec::new();

        for row in rows {
            let dedup_key = row
                .tender_number
                .clone()
                .unwrap_or_else(|| row.detail_url.clone());
            if !seen.insert(dedup_key.clone()) {
                info!(
                    "Duplicate listing entry {} ({}) in this run, keeping first",
                    dedup_key, row.title
                );
                self.stats.duplicates += 1;
                continue;
            }

            if !opts.force_full_scan {
                if let Some(number) = &row.tender_number {
                    let row_year = number
                        .rsplit('/')
                        .next()
                        .and_then(|y| y.parse::<i32>().ok())
                        .or(year)
                        .unwrap_or(0);
                    if self
                        .store
                        .is_fresh(number, row_year, &row.source_hash, FRESHNESS_HOURS)
                        .await?
                    {
                        self.stats.skipped += 1;
                        continue;
                    }
                }
            }
            to_fetch.push(row.clone());
        }

        if to_fetch.is_empty() {
            return Ok(None);
        }

        let client = self.session.detail_client();
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.clamp(2, 4)));
        let fetches = to_fetch.iter().map(|row| {
            let client = client.clone();
            let semaphore = semaphore.clone();
            let url = row.detail_url.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                client.fetch(&url).await
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut needs_relogin: Vec<usize> = Vec::new();
        let mut last_key = None;

        for (index, result) in results.into_iter().enumerate() {
            let row = &to_fetch[index];
            match result {
                Ok(page) if looks_like_login_page(&page.html) => needs_relogin.push(index),
                Ok(page) => {
                    if let Some(key) = self.ingest_dossier(row, &page.html, year).await {
                        last_key = Some(key);
                    }
                }
                Err(FetchError::AuthExpired) => needs_relogin.push(index),
                Err(e) => {
                    warn!("Detail fetch failed for {}: {}", row.detail_url, e);
                    self.stats.errors += 1;
                }
            }
            if self.reached_item_cap(opts) {
                return Ok(last_key);
            }
        }

        if !needs_relogin.is_empty() {
            info!(
                "{} detail fetches bounced to login, re-authenticating",
                needs_relogin.len()
            );
            self.session.relogin().await.map_err(auth_abort)?;
            self.browser.set_cookies(self.session.cookies()).await?;
            let client = self.session.detail_client();
            for index in needs_relogin {
                let row = &to_fetch[index];
                match client.fetch(&row.detail_url).await {
                    Ok(page) if !looks_like_login_page(&page.html) => {
                        self.session.mark_authenticated();
                        if let Some(key) = self.ingest_dossier(row, &page.html, year).await {
                            last_key = Some(key);
                        }
                    }
                    Ok(_) => return Err(auth_abort(FetchError::AuthExpired)),
                    Err(e) => {
                        warn!("Retry fetch failed for {}: {}", row.detail_url, e);
                        self.stats.errors += 1;
                    }
                }
            }
        }

        Ok(last_key)
    }

    async fn ingest_dossier(
        &mut self,
        row: &ListingRow,
        html: &str,
        year: Option<i32>,
    ) -> Option<String> {
        let (mut tender, documents) = match dossier::parse_dossier(html, &row.detail_url, year) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dossier parse failed for {}: {}", row.detail_url, e);
                self.stats.errors += 1;
                return None;
            }
        };
        tender.source_hash = row.source_hash.clone();
        for warning in tender.integrity_warnings() {
            warn!("Integrity: {} on {}", warning, tender.tender_key());
        }
        match self.store.upsert_tender(&tender, &documents).await {
            Ok(outcome) => {
                self.stats.tenders += 1;
                match outcome {
                    IngestOutcome::Inserted => self.stats.inserted += 1,
                    IngestOutcome::Updated => self.stats.updated += 1,
                    IngestOutcome::Unchanged => {}
                }
                Some(tender.tender_key())
            }
            Err(e) => {
                warn!("Upsert failed for {}: {}", tender.tender_key(), e);
                self.stats.errors += 1;
                None
            }
        }
    }

    fn reached_item_cap(&self, opts: &CrawlerOptions) -> bool {
        opts.max_items
            .map(|cap| self.stats.tenders as usize >= cap)
            .unwrap_or(false)
    }
}

fn auth_abort(e: FetchError) -> anyhow::Error {
    anyhow!("auth_required: {}", e)
}

fn is_auth_abort(e: &anyhow::Error) -> bool {
    e.to_string().starts_with("auth_required")
}
