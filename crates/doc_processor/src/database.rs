//! Document-queue persistence: batch selection, status ladder updates with
//! retry backoff, and product-item storage.

use anyhow::{Context, Result};
use bigdecimal::{BigDecimal, FromPrimitive};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::products::ProductDraft;
use crate::Specifications;
use procurement_core::types::ExtractionStatus;

/// Failed documents are retried until this many attempts.
pub const MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub tender_id: i64,
    pub tender_key: String,
    pub source_url: String,
    pub attempts: i32,
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;
        tender_ingest::schema::ensure_schema(&pool).await?;
        Ok(Database { pool })
    }

    /// Pending documents in insertion order, plus retryable failures whose
    /// backoff window elapsed. `force` reopens terminal successes too.
    pub async fn fetch_batch(&self, limit: i64, force: bool) -> Result<Vec<QueueItem>> {
        let query = if force {
            r#"
            SELECT d.id, d.tender_id, d.source_url, d.attempts,
                   t.tender_number, t.year
              FROM documents d
              JOIN tenders t ON t.id = d.tender_id
             WHERE d.extraction_status <> 'skipped'
             ORDER BY d.id
             LIMIT $1
            "#
        } else {
            r#"
            SELECT d.id, d.tender_id, d.source_url, d.attempts,
                   t.tender_number, t.year
              FROM documents d
              JOIN tenders t ON t.id = d.tender_id
             WHERE d.extraction_status = 'pending'
                OR (d.extraction_status IN ('failed', 'auth_required')
                    AND d.attempts < $2
                    AND (d.next_retry_at IS NULL OR d.next_retry_at <= NOW()))
             ORDER BY d.id
             LIMIT $1
            "#
        };

        let mut q = sqlx::query(query).bind(limit);
        if !force {
            q = q.bind(MAX_ATTEMPTS);
        }
        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| QueueItem {
                id: row.get("id"),
                tender_id: row.get("tender_id"),
                tender_key: format!(
                    "{}/{}",
                    row.get::<String, _>("tender_number"),
                    row.get::<i32, _>("year")
                ),
                source_url: row.get("source_url"),
                attempts: row.get("attempts"),
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_success(
        &self,
        id: i64,
        local_path: &str,
        mime_type: &str,
        file_size: i64,
        page_count: Option<i32>,
        extracted_text: &str,
        specifications: &Specifications,
        products_extraction_failed: bool,
    ) -> Result<()> {
        let specs_json = serde_json::json!({
            "cpv_codes": specifications.cpv_codes,
            "emails": specifications.emails,
            "phones": specifications.phones,
            "deadline_phrases": specifications.deadline_phrases,
            "spec_length": specifications.spec_length,
            "products_extraction_failed": products_extraction_failed,
        });
        sqlx::query(
            r#"
            UPDATE documents
               SET extraction_status = 'success',
                   local_path = $2,
                   mime_type = $3,
                   file_size = $4,
                   page_count = $5,
                   extracted_text = $6,
                   specifications = $7,
                   last_error = NULL,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(local_path)
        .bind(mime_type)
        .bind(file_size)
        .bind(page_count)
        .bind(extracted_text)
        .bind(&specs_json)
        .execute(&self.pool)
        .await
        .context("Failed to mark document success")?;
        Ok(())
    }

    /// Move a document to a non-success status. Failures get exponential
    /// backoff on their next retry; the attempt counter always advances.
    pub async fn mark_status(
        &self,
        id: i64,
        status: ExtractionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
               SET extraction_status = $2,
                   last_error = $3,
                   attempts = attempts + 1,
                   next_retry_at = NOW()
                       + make_interval(mins => (30 * power(2, LEAST(attempts, 5)))::int),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to update document status")?;

        if status == ExtractionStatus::Failed {
            warn!("Document {} marked failed: {}", id, error.unwrap_or("?"));
        }
        Ok(())
    }

    /// Replace the document's product items. Reprocessing a document is
    /// idempotent — the old rows go first.
    pub async fn store_products(
        &self,
        document_id: i64,
        tender_id: i64,
        items: &[ProductDraft],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM product_items WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO product_items
                    (document_id, tender_id, name, quantity, unit,
                     unit_price, total_price, specifications, category)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(document_id)
            .bind(tender_id)
            .bind(&item.name)
            .bind(item.quantity.and_then(BigDecimal::from_f64))
            .bind(&item.unit)
            .bind(item.unit_price.and_then(BigDecimal::from_f64))
            .bind(item.total_price.and_then(BigDecimal::from_f64))
            .bind(item.specifications.as_ref().map(|s| serde_json::json!(s)))
            .bind(&item.category)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if !items.is_empty() {
            info!(
                "Stored {} product items for document {}",
                items.len(),
                document_id
            );
        }
        Ok(items.len())
    }
}
