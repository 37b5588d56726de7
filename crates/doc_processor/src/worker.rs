//! Batch worker: polls the queue, downloads, extracts, mines, stores.
//! Per-document failures mark that document and leave the tender intact.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use procurement_core::error::FetchError;
use procurement_core::fetch::{looks_like_login_page, FetchSession, RetryPolicy};
use procurement_core::types::ExtractionStatus;
use procurement_core::Config;

use crate::database::{Database, QueueItem};
use crate::ocr;
use crate::products::ProductExtractor;
use crate::{
    detect_format, extract_docx_text, extract_text_from_pdf, extract_xlsx_text, is_scanned_pdf,
    mine_specifications, pdf_page_count, DocFormat,
};

/// Per-file download cap.
const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;
/// Per-file download timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Default, Clone)]
pub struct DocStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub auth_required: u64,
    pub products: u64,
    pub errors: u64,
}

pub struct WorkerOptions {
    pub limit: i64,
    pub workers: usize,
    pub force: bool,
}

pub async fn process_batch(
    db: Arc<Database>,
    config: Arc<Config>,
    opts: &WorkerOptions,
) -> Result<DocStats> {
    let batch = db.fetch_batch(opts.limit, opts.force).await?;
    if batch.is_empty() {
        info!("Document queue is empty");
        return Ok(DocStats::default());
    }
    info!("Processing {} queued documents", batch.len());

    let ocr_enabled = ocr::ocr_available().await;
    if !ocr_enabled {
        warn!("OCR tools not found; scanned PDFs will fail until installed");
    }
    let extractor = Arc::new(ProductExtractor::from_key(config.openai_api_key.clone()));
    if extractor.is_none() {
        info!("No LLM API key configured, product-item extraction disabled");
    }

    let stats = Arc::new(Mutex::new(DocStats::default()));
    let semaphore = Arc::new(Semaphore::new(opts.workers.max(1)));
    let mut handles = Vec::with_capacity(batch.len());

    for item in batch {
        let db = db.clone();
        let config = config.clone();
        let extractor = extractor.clone();
        let stats = stats.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result =
                process_document(&db, &config, extractor.as_ref().as_ref(), &item, ocr_enabled)
                    .await;
            let mut stats = stats.lock().await;
            stats.processed += 1;
            match result {
                Ok(outcome) => outcome.tally(&mut stats),
                Err(e) => {
                    warn!("Document {} processing error: {:#}", item.id, e);
                    stats.errors += 1;
                    // Record the failure so the backoff ladder advances.
                    if let Err(db_err) = db
                        .mark_status(item.id, ExtractionStatus::Failed, Some(&e.to_string()))
                        .await
                    {
                        warn!("Could not record failure for {}: {}", item.id, db_err);
                    }
                    stats.failed += 1;
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let stats = stats.lock().await.clone();
    info!(
        "Batch done: {} processed, {} success, {} failed, {} skipped, {} auth_required, {} product items",
        stats.processed, stats.succeeded, stats.failed, stats.skipped, stats.auth_required, stats.products
    );
    Ok(stats)
}

enum Outcome {
    Success { products: u64 },
    Failed,
    Skipped,
    AuthRequired,
}

impl Outcome {
    fn tally(&self, stats: &mut DocStats) {
        match self {
            Outcome::Success { products } => {
                stats.succeeded += 1;
                stats.products += products;
            }
            Outcome::Failed => stats.failed += 1,
            Outcome::Skipped => stats.skipped += 1,
            Outcome::AuthRequired => stats.auth_required += 1,
        }
    }
}

async fn process_document(
    db: &Database,
    config: &Config,
    extractor: Option<&ProductExtractor>,
    item: &QueueItem,
    ocr_enabled: bool,
) -> Result<Outcome> {
    debug!(
        "Document {} attempt {} ({})",
        item.id,
        item.attempts + 1,
        item.source_url
    );

    let mut session = FetchSession::new(RetryPolicy::default())?;
    session.set_timeout(DOWNLOAD_TIMEOUT);

    let bytes = match session.download(&item.source_url, MAX_FILE_BYTES).await {
        Ok(bytes) => bytes,
        Err(FetchError::AuthExpired) => {
            db.mark_status(item.id, ExtractionStatus::AuthRequired, Some("HTTP 401/403"))
                .await?;
            return Ok(Outcome::AuthRequired);
        }
        Err(e @ FetchError::TooLarge { .. }) => {
            db.mark_status(item.id, ExtractionStatus::Skipped, Some(&e.to_string()))
                .await?;
            return Ok(Outcome::Skipped);
        }
        Err(e) => {
            db.mark_status(item.id, ExtractionStatus::Failed, Some(&e.to_string()))
                .await?;
            return Ok(Outcome::Failed);
        }
    };

    let format = detect_format(&item.source_url, &bytes);

    let text = match format {
        DocFormat::Pdf => {
            let direct = extract_text_from_pdf(&bytes).unwrap_or_default();
            if is_scanned_pdf(&direct) {
                if ocr_enabled {
                    match ocr::ocr_pdf(&bytes).await {
                        Ok(recognized) => recognized,
                        Err(e) => {
                            db.mark_status(item.id, ExtractionStatus::Failed, Some(&e.to_string()))
                                .await?;
                            return Ok(Outcome::Failed);
                        }
                    }
                } else {
                    db.mark_status(
                        item.id,
                        ExtractionStatus::Failed,
                        Some("scanned PDF and OCR unavailable"),
                    )
                    .await?;
                    return Ok(Outcome::Failed);
                }
            } else {
                direct
            }
        }
        DocFormat::Docx => match extract_docx_text(&bytes) {
            Ok(text) => text,
            Err(e) => {
                db.mark_status(item.id, ExtractionStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Ok(Outcome::Failed);
            }
        },
        DocFormat::Xlsx => match extract_xlsx_text(&bytes) {
            Ok(text) => text,
            Err(e) => {
                db.mark_status(item.id, ExtractionStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Ok(Outcome::Failed);
            }
        },
        DocFormat::Html => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if looks_like_login_page(&text) {
                db.mark_status(item.id, ExtractionStatus::AuthRequired, Some("login page"))
                    .await?;
                return Ok(Outcome::AuthRequired);
            }
            db.mark_status(item.id, ExtractionStatus::Skipped, Some("html body"))
                .await?;
            return Ok(Outcome::Skipped);
        }
        DocFormat::LegacyOffice | DocFormat::Unknown => {
            db.mark_status(
                item.id,
                ExtractionStatus::Skipped,
                Some(&format!("unsupported format {:?}", format)),
            )
            .await?;
            return Ok(Outcome::Skipped);
        }
    };

    // Cache the original file under the per-tender partition.
    let local_path = config.document_path(&item.tender_key, item.id, format.extension());
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&local_path, &bytes).await?;

    let page_count = match format {
        DocFormat::Pdf => pdf_page_count(&bytes),
        _ => None,
    };
    let specifications = mine_specifications(&text);

    let (product_items, products_extraction_failed) = match extractor {
        Some(extractor) if !text.trim().is_empty() => match extractor.extract(&text).await {
            Ok(reply) => (reply.items, reply.extraction_failed),
            Err(e) => {
                warn!("Product extraction failed for document {}: {}", item.id, e);
                (Vec::new(), true)
            }
        },
        _ => (Vec::new(), false),
    };

    db.mark_success(
        item.id,
        &local_path.display().to_string(),
        format.mime_type(),
        bytes.len() as i64,
        page_count,
        &text,
        &specifications,
        products_extraction_failed,
    )
    .await?;

    let stored = db
        .store_products(item.id, item.tender_id, &product_items)
        .await?;

    Ok(Outcome::Success {
        products: stored as u64,
    })
}
