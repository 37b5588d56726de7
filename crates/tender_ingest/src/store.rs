//! Single entry point for writing crawled tenders: `upsert_tender` runs
//! one transaction per tender — entity resolution, merge-upsert, child
//! replacement, document seeding. All-or-nothing per tender; a concurrent
//! writer conflict is retried once with a fresh read, then skipped (the
//! crawler will re-encounter the tender on its next pass).

use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use procurement_core::types::{CrawlCursor, DocumentSeed, EntityRef, NormalizedTender, Portal, TenderStatus};

use crate::schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Updated,
    Unchanged,
}

pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;
        schema::ensure_schema(&pool).await?;
        Ok(Store { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Store { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert one normalized tender and its document references.
    pub async fn upsert_tender(
        &self,
        tender: &NormalizedTender,
        documents: &[DocumentSeed],
    ) -> Result<IngestOutcome> {
        match self.try_upsert(tender, documents).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_serialization_conflict(&e) => {
                warn!(
                    "Concurrent writer conflict on {}, retrying once",
                    tender.tender_key()
                );
                self.try_upsert(tender, documents).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_upsert(
        &self,
        tender: &NormalizedTender,
        documents: &[DocumentSeed],
    ) -> Result<IngestOutcome> {
        let mut tx = self.pool.begin().await?;

        let entity_id = resolve_entity(&mut tx, &tender.procuring_entity).await?;

        let existing = sqlx::query(
            r#"
            SELECT id, title, description, procedure_type, cpv_code, category,
                   estimated_value, awarded_value, currency,
                   publication_date, opening_date, closing_date, signing_date,
                   status, contact_person, contact_email, contact_phone,
                   amendments_count, updated_at
              FROM tenders
             WHERE tender_number = $1 AND year = $2
             FOR UPDATE
            "#,
        )
        .bind(&tender.tender_number)
        .bind(tender.year)
        .fetch_optional(&mut *tx)
        .await?;

        let (tender_id, outcome) = match existing {
            None => {
                let tender_id = insert_tender(&mut tx, tender, entity_id).await?;
                (tender_id, IngestOutcome::Inserted)
            }
            Some(row) => {
                let tender_id: i64 = row.get("id");
                let changed = merge_tender(&mut tx, tender_id, tender, &row).await?;
                let outcome = if changed {
                    IngestOutcome::Updated
                } else {
                    IngestOutcome::Unchanged
                };
                (tender_id, outcome)
            }
        };

        if !tender.bids.is_empty() || !tender.lots.is_empty() {
            replace_children(&mut tx, tender_id, tender).await?;
        }

        for doc in documents {
            sqlx::query(
                r#"
                INSERT INTO documents (tender_id, source_url, title, doc_kind)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (tender_id, source_url) DO NOTHING
                "#,
            )
            .bind(tender_id)
            .bind(&doc.source_url)
            .bind(&doc.title)
            .bind(&doc.doc_kind)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Upserted {} ({:?})", tender.tender_key(), outcome);
        Ok(outcome)
    }

    /// Incremental mode: true when the stored row matches the source hash
    /// and was refreshed more recently than `max_age_hours`.
    pub async fn is_fresh(
        &self,
        tender_number: &str,
        year: i32,
        source_hash: &str,
        max_age_hours: i32,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS fresh FROM tenders
             WHERE tender_number = $1 AND year = $2 AND source_hash = $3
               AND updated_at > NOW() - make_interval(hours => $4)
            "#,
        )
        .bind(tender_number)
        .bind(year)
        .bind(source_hash)
        .bind(max_age_hours)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn load_cursor(
        &self,
        portal: Portal,
        category: &str,
        year: Option<i32>,
    ) -> Result<CrawlCursor> {
        let row = sqlx::query(
            r#"
            SELECT last_page, last_tender_key, last_run_at, error_count
              FROM crawl_cursors
             WHERE portal = $1 AND category = $2 AND year = $3
            "#,
        )
        .bind(portal.as_str())
        .bind(category)
        .bind(year.unwrap_or(0))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => CrawlCursor {
                portal,
                category: category.to_string(),
                year,
                last_page: row.get("last_page"),
                last_tender_key: row.get("last_tender_key"),
                last_run_at: row.get("last_run_at"),
                error_count: row.get("error_count"),
            },
            None => CrawlCursor::start(portal, category, year),
        })
    }

    /// Persisted at every page boundary so a killed run resumes with zero
    /// duplicates and zero gaps.
    pub async fn save_cursor(&self, cursor: &CrawlCursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_cursors
                (portal, category, year, last_page, last_tender_key, last_run_at, error_count)
            VALUES ($1, $2, $3, $4, $5, NOW(), $6)
            ON CONFLICT (portal, category, year) DO UPDATE SET
                last_page = EXCLUDED.last_page,
                last_tender_key = EXCLUDED.last_tender_key,
                last_run_at = EXCLUDED.last_run_at,
                error_count = EXCLUDED.error_count
            "#,
        )
        .bind(cursor.portal.as_str())
        .bind(&cursor.category)
        .bind(cursor.year.unwrap_or(0))
        .bind(cursor.last_page)
        .bind(&cursor.last_tender_key)
        .bind(cursor.error_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lifecycle maintenance: open tenders past their deadline become
    /// closed. Runs daily from the orchestrator.
    pub async fn auto_close_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tenders
               SET status = 'closed', updated_at = NOW()
             WHERE status = 'open' AND closing_date < CURRENT_DATE
            "#,
        )
        .execute(&self.pool)
        .await?;
        let closed = result.rows_affected();
        if closed > 0 {
            info!("Lifecycle: closed {} expired tenders", closed);
        }
        Ok(closed)
    }
}

/// Legal-name normalization used for entity and bidder identity.
pub fn normalize_name(name: &str) -> String {
    name.to_uppercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

async fn resolve_entity(
    tx: &mut Transaction<'_, Postgres>,
    entity: &EntityRef,
) -> Result<i64> {
    let normalized = normalize_name(&entity.legal_name);
    let row = sqlx::query(
        r#"
        INSERT INTO procuring_entities (name, normalized_name, tax_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (normalized_name, COALESCE(tax_id, ''))
        DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(&entity.legal_name)
    .bind(&normalized)
    .bind(&entity.tax_id)
    .fetch_one(&mut **tx)
    .await
    .context("Failed to resolve procuring entity")?;
    Ok(row.get("id"))
}

async fn resolve_bidder(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
    tax_id: &Option<String>,
    address: &Option<String>,
    manager: &Option<String>,
) -> Result<i64> {
    let normalized = normalize_name(name);
    let row = sqlx::query(
        r#"
        INSERT INTO bidders (name, normalized_name, tax_id, address, manager_name)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (normalized_name, COALESCE(tax_id, '')) DO UPDATE SET
            name = EXCLUDED.name,
            address = COALESCE(EXCLUDED.address, bidders.address),
            manager_name = COALESCE(EXCLUDED.manager_name, bidders.manager_name)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(&normalized)
    .bind(tax_id)
    .bind(address)
    .bind(manager)
    .fetch_one(&mut **tx)
    .await
    .context("Failed to resolve bidder")?;
    Ok(row.get("id"))
}

async fn insert_tender(
    tx: &mut Transaction<'_, Postgres>,
    tender: &NormalizedTender,
    entity_id: i64,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO tenders
            (tender_number, year, title, description, procuring_entity_id,
             procedure_type, cpv_code, category, estimated_value, awarded_value,
             currency, publication_date, opening_date, closing_date, signing_date,
             status, contact_person, contact_email, contact_phone,
             amendments_count, source_url, source_portal, source_hash, raw_data)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
        RETURNING id
        "#,
    )
    .bind(&tender.tender_number)
    .bind(tender.year)
    .bind(&tender.title)
    .bind(&tender.description)
    .bind(entity_id)
    .bind(&tender.procedure_type)
    .bind(&tender.cpv_code)
    .bind(&tender.category)
    .bind(&tender.estimated_value)
    .bind(&tender.awarded_value)
    .bind(tender.currency.as_str())
    .bind(tender.publication_date)
    .bind(tender.opening_date)
    .bind(tender.closing_date)
    .bind(tender.signing_date)
    .bind(tender.status.as_str())
    .bind(&tender.contact.person)
    .bind(&tender.contact.email)
    .bind(&tender.contact.phone)
    .bind(tender.amendments_count)
    .bind(&tender.source_url)
    .bind(tender.source_portal.as_str())
    .bind(&tender.source_hash)
    .bind(&tender.raw_data)
    .fetch_one(&mut **tx)
    .await
    .context("Failed to insert tender")?;
    Ok(row.get("id"))
}

/// Merge rule: a non-null incoming field wins over the stored value; the
/// raw blob is always replaced; `updated_at` is bumped only when a merged
/// field actually differs. Status changes must follow the DAG — an illegal
/// transition keeps the stored status and logs.
async fn merge_tender(
    tx: &mut Transaction<'_, Postgres>,
    tender_id: i64,
    tender: &NormalizedTender,
    row: &sqlx::postgres::PgRow,
) -> Result<bool> {
    let old_title: String = row.get("title");
    let old_description: Option<String> = row.get("description");
    let old_procedure: Option<String> = row.get("procedure_type");
    let old_cpv: Option<String> = row.get("cpv_code");
    let old_category: Option<String> = row.get("category");
    let old_estimated: Option<BigDecimal> = row.get("estimated_value");
    let old_awarded: Option<BigDecimal> = row.get("awarded_value");
    let old_currency: String = row.get("currency");
    let old_publication: Option<NaiveDate> = row.get("publication_date");
    let old_opening: Option<NaiveDate> = row.get("opening_date");
    let old_closing: Option<NaiveDate> = row.get("closing_date");
    let old_signing: Option<NaiveDate> = row.get("signing_date");
    let old_status: String = row.get("status");
    let old_person: Option<String> = row.get("contact_person");
    let old_email: Option<String> = row.get("contact_email");
    let old_phone: Option<String> = row.get("contact_phone");
    let old_amendments: Option<i32> = row.get("amendments_count");
    let _updated_at: DateTime<Utc> = row.get("updated_at");

    let title = if tender.title.trim().is_empty() {
        old_title.clone()
    } else {
        tender.title.clone()
    };
    let description = tender.description.clone().or_else(|| old_description.clone());
    let procedure = tender.procedure_type.clone().or_else(|| old_procedure.clone());
    let cpv = tender.cpv_code.clone().or_else(|| old_cpv.clone());
    let category = tender.category.clone().or_else(|| old_category.clone());
    let estimated = tender.estimated_value.clone().or_else(|| old_estimated.clone());
    let awarded = tender.awarded_value.clone().or_else(|| old_awarded.clone());
    let currency = tender.currency.as_str().to_string();
    let publication = tender.publication_date.or(old_publication);
    let opening = tender.opening_date.or(old_opening);
    let closing = tender.closing_date.or(old_closing);
    let signing = tender.signing_date.or(old_signing);
    let person = tender.contact.person.clone().or_else(|| old_person.clone());
    let email = tender.contact.email.clone().or_else(|| old_email.clone());
    let phone = tender.contact.phone.clone().or_else(|| old_phone.clone());
    let amendments = tender.amendments_count.or(old_amendments);

    let status = match TenderStatus::parse(&old_status) {
        Some(current) if current.can_transition(tender.status) => {
            tender.status.as_str().to_string()
        }
        Some(current) => {
            warn!(
                "Illegal status transition {} -> {} on {}, keeping {}",
                old_status,
                tender.status.as_str(),
                tender.tender_key(),
                current.as_str()
            );
            old_status.clone()
        }
        None => tender.status.as_str().to_string(),
    };

    let changed = title != old_title
        || description != old_description
        || procedure != old_procedure
        || cpv != old_cpv
        || category != old_category
        || estimated != old_estimated
        || awarded != old_awarded
        || currency != old_currency
        || publication != old_publication
        || opening != old_opening
        || closing != old_closing
        || signing != old_signing
        || status != old_status
        || person != old_person
        || email != old_email
        || phone != old_phone
        || amendments != old_amendments;

    sqlx::query(
        r#"
        UPDATE tenders SET
            title = $2, description = $3, procedure_type = $4, cpv_code = $5,
            category = $6, estimated_value = $7, awarded_value = $8,
            currency = $9, publication_date = $10, opening_date = $11,
            closing_date = $12, signing_date = $13, status = $14,
            contact_person = $15, contact_email = $16, contact_phone = $17,
            amendments_count = $18, source_url = $19, source_hash = $20,
            raw_data = $21,
            updated_at = CASE WHEN $22 THEN NOW() ELSE updated_at END
        WHERE id = $1
        "#,
    )
    .bind(tender_id)
    .bind(&title)
    .bind(&description)
    .bind(&procedure)
    .bind(&cpv)
    .bind(&category)
    .bind(&estimated)
    .bind(&awarded)
    .bind(&currency)
    .bind(publication)
    .bind(opening)
    .bind(closing)
    .bind(signing)
    .bind(&status)
    .bind(&person)
    .bind(&email)
    .bind(&phone)
    .bind(amendments)
    .bind(&tender.source_url)
    .bind(&tender.source_hash)
    .bind(&tender.raw_data)
    .bind(changed)
    .execute(&mut **tx)
    .await
    .context("Failed to merge tender")?;

    Ok(changed)
}

/// Lots and bids are replaced wholesale inside the tender's transaction.
async fn replace_children(
    tx: &mut Transaction<'_, Postgres>,
    tender_id: i64,
    tender: &NormalizedTender,
) -> Result<()> {
    sqlx::query("DELETE FROM tender_bids WHERE tender_id = $1")
        .bind(tender_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM lots WHERE tender_id = $1")
        .bind(tender_id)
        .execute(&mut **tx)
        .await?;

    let mut lot_ids = Vec::with_capacity(tender.lots.len());
    for (position, lot) in tender.lots.iter().enumerate() {
        let row = sqlx::query(
            r#"
            INSERT INTO lots (tender_id, position, title, estimated_value, awarded_value, winner_name)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(tender_id)
        .bind(position as i32)
        .bind(&lot.title)
        .bind(&lot.estimated_value)
        .bind(&lot.awarded_value)
        .bind(&lot.winner_name)
        .fetch_one(&mut **tx)
        .await?;
        lot_ids.push(row.get::<i64, _>("id"));
    }

    for bid in &tender.bids {
        let bidder_id = resolve_bidder(
            tx,
            &bid.bidder_name,
            &bid.bidder_tax_id,
            &bid.bidder_address,
            &bid.bidder_manager,
        )
        .await?;
        let lot_id = bid.lot_index.and_then(|i| lot_ids.get(i)).copied();
        sqlx::query(
            r#"
            INSERT INTO tender_bids
                (tender_id, lot_id, bidder_id, amount, rank, is_winner,
                 disqualified, disqualification_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(tender_id)
        .bind(lot_id)
        .bind(bidder_id)
        .bind(&bid.amount)
        .bind(bid.rank)
        .bind(bid.is_winner)
        .bind(bid.disqualified)
        .bind(&bid.disqualification_reason)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn is_serialization_conflict(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        if let Some(sqlx::Error::Database(db)) = cause.downcast_ref::<sqlx::Error>() {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_normalization_collapses_form() {
        assert_eq!(
            normalize_name("  Општина   Центар, Скопје "),
            "ОПШТИНА ЦЕНТАР СКОПЈЕ"
        );
        assert_eq!(
            normalize_name("ЈЗУ \"Клиничка болница\" - Битола"),
            normalize_name("ЈЗУ Клиничка болница Битола")
        );
    }
}
