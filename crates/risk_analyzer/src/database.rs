//! Analyzer-side store access: snapshot loading, entity history, flag
//! persistence and the materialized-view refresh.

use anyhow::{Context, Result};
use bigdecimal::{BigDecimal, FromPrimitive};
use chrono::{NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::info;

use crate::types::{BidSnapshot, EntityHistory, FlagResult, TenderSnapshot};

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

    /// Every tender in the unified store, both portals.
    pub async fn tender_ids(&self, limit: Option<i64>) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM tenders ORDER BY id LIMIT $1")
            .bind(limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    pub async fn load_snapshot(&self, tender_id: i64) -> Result<Option<TenderSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.tender_number, t.year, t.procuring_entity_id,
                   pe.name AS entity_name,
                   t.category, t.procedure_type, t.status,
                   t.estimated_value::float8 AS estimated_value,
                   t.awarded_value::float8 AS awarded_value,
                   t.publication_date, t.opening_date, t.closing_date,
                   t.amendments_count
              FROM tenders t
              JOIN procuring_entities pe ON pe.id = t.procuring_entity_id
             WHERE t.id = $1
            "#,
        )
        .bind(tender_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let bids = sqlx::query(
            r#"
            SELECT b.bidder_id, bd.name AS bidder_name, bd.address, bd.manager_name,
                   b.amount::float8 AS amount, b.is_winner, b.disqualified
              FROM tender_bids b
              JOIN bidders bd ON bd.id = b.bidder_id
             WHERE b.tender_id = $1
             ORDER BY b.id
            "#,
        )
        .bind(tender_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|b| BidSnapshot {
            bidder_id: b.get("bidder_id"),
            bidder_name: b.get("bidder_name"),
            address: b.get("address"),
            manager_name: b.get("manager_name"),
            amount: b.get("amount"),
            is_winner: b.get("is_winner"),
            disqualified: b.get("disqualified"),
        })
        .collect();

        let lots = sqlx::query(
            r#"
            SELECT COUNT(*) AS lot_count,
                   SUM(awarded_value)::float8 AS lot_awarded_sum
              FROM lots WHERE tender_id = $1
            "#,
        )
        .bind(tender_id)
        .fetch_one(&self.pool)
        .await?;

        let spec_text: Option<String> = sqlx::query(
            r#"
            SELECT LEFT(string_agg(LEFT(extracted_text, 20000), E'\n'), 60000) AS spec_text
              FROM documents
             WHERE tender_id = $1
               AND extraction_status = 'success'
               AND extracted_text IS NOT NULL
            "#,
        )
        .bind(tender_id)
        .fetch_one(&self.pool)
        .await?
        .get("spec_text");

        Ok(Some(TenderSnapshot {
            tender_id: row.get("id"),
            tender_number: row.get("tender_number"),
            year: row.get("year"),
            entity_id: row.get("procuring_entity_id"),
            entity_name: row.get("entity_name"),
            category: row.get("category"),
            procedure_type: row.get("procedure_type"),
            status: row.get("status"),
            estimated_value: row.get("estimated_value"),
            awarded_value: row.get("awarded_value"),
            publication_date: row.get("publication_date"),
            opening_date: row.get("opening_date"),
            closing_date: row.get("closing_date"),
            amendments_count: row.get("amendments_count"),
            bids,
            lot_count: lots.get("lot_count"),
            lot_awarded_sum: lots.get("lot_awarded_sum"),
            spec_text,
        }))
    }

    /// Entity context in the 24 months before the tender's publication.
    pub async fn load_entity_history(&self, snapshot: &TenderSnapshot) -> Result<EntityHistory> {
        let as_of: NaiveDate = snapshot
            .publication_date
            .unwrap_or_else(|| Utc::now().date_naive());
        let mut history = EntityHistory::default();

        let awards = sqlx::query(
            r#"
            SELECT b.bidder_id,
                   COALESCE(b.amount, t.awarded_value)::float8 AS value
              FROM tender_bids b
              JOIN tenders t ON t.id = b.tender_id
             WHERE t.procuring_entity_id = $1
               AND b.is_winner
               AND t.id <> $2
               AND COALESCE(t.signing_date, t.publication_date)
                   >= $3::date - INTERVAL '24 months'
               AND COALESCE(t.signing_date, t.publication_date) <= $3::date
            "#,
        )
        .bind(snapshot.entity_id)
        .bind(snapshot.tender_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;
        history.awards_24m = awards
            .into_iter()
            .map(|r| {
                (
                    r.get::<i64, _>("bidder_id"),
                    r.get::<Option<f64>, _>("value").unwrap_or(0.0),
                )
            })
            .collect();

        let procedures = sqlx::query(
            r#"
            SELECT procedure_type, COUNT(*) AS used
              FROM tenders
             WHERE procuring_entity_id = $1 AND procedure_type IS NOT NULL
             GROUP BY procedure_type
            "#,
        )
        .bind(snapshot.entity_id)
        .fetch_all(&self.pool)
        .await?;
        let mut counts = HashMap::new();
        let mut total = 0i64;
        for row in procedures {
            let used: i64 = row.get("used");
            counts.insert(row.get::<String, _>("procedure_type"), used);
            total += used;
        }
        history.procedure_counts = counts;
        history.procedure_total = total;

        let value_stats = sqlx::query(
            r#"
            SELECT AVG(estimated_value)::float8 AS mean,
                   STDDEV_POP(estimated_value)::float8 AS stddev
              FROM tenders
             WHERE procuring_entity_id = $1 AND estimated_value IS NOT NULL
            "#,
        )
        .bind(snapshot.entity_id)
        .fetch_one(&self.pool)
        .await?;
        history.value_mean = value_stats.get("mean");
        history.value_stddev = value_stats.get("stddev");

        let freq_stats = sqlx::query(
            r#"
            SELECT AVG(c)::float8 AS mean, STDDEV_POP(c)::float8 AS stddev
              FROM (SELECT date_trunc('month', publication_date) AS m, COUNT(*) AS c
                      FROM tenders
                     WHERE procuring_entity_id = $1 AND publication_date IS NOT NULL
                     GROUP BY 1) months
            "#,
        )
        .bind(snapshot.entity_id)
        .fetch_one(&self.pool)
        .await?;
        history.monthly_count_mean = freq_stats.get("mean");
        history.monthly_count_stddev = freq_stats.get("stddev");

        let current: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS c FROM tenders
             WHERE procuring_entity_id = $1
               AND date_trunc('month', publication_date) = date_trunc('month', $2::date)
            "#,
        )
        .bind(snapshot.entity_id)
        .bind(as_of)
        .fetch_one(&self.pool)
        .await?
        .get("c");
        history.current_month_count = current;

        if let Some(winner) = snapshot.winner() {
            let texts = sqlx::query(
                r#"
                SELECT LEFT(d.extracted_text, 20000) AS text
                  FROM documents d
                  JOIN tender_bids b ON b.tender_id = d.tender_id
                 WHERE b.bidder_id = $1
                   AND b.is_winner
                   AND d.tender_id <> $2
                   AND d.extraction_status = 'success'
                   AND d.extracted_text IS NOT NULL
                 ORDER BY d.id DESC
                 LIMIT 5
                "#,
            )
            .bind(winner.bidder_id)
            .bind(snapshot.tender_id)
            .fetch_all(&self.pool)
            .await?;
            history.winner_spec_texts = texts
                .into_iter()
                .filter_map(|r| r.get::<Option<String>, _>("text"))
                .collect();
        }

        Ok(history)
    }

    /// Flags are regenerated wholesale: delete-then-insert in one
    /// transaction, plus the persisted ensemble score.
    pub async fn replace_flags(
        &self,
        tender_id: i64,
        flags: &[FlagResult],
        ensemble: f64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM risk_flags WHERE tender_id = $1")
            .bind(tender_id)
            .execute(&mut *tx)
            .await?;

        for flag in flags {
            sqlx::query(
                r#"
                INSERT INTO risk_flags
                    (tender_id, flag_type, severity, score, evidence, explanation, detected_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                "#,
            )
            .bind(tender_id)
            .bind(flag.flag_type.as_str())
            .bind(flag.severity.as_str())
            .bind(decimal_score(flag.score))
            .bind(&flag.evidence)
            .bind(&flag.explanation)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO tender_risk_scores (tender_id, score, flag_count, computed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tender_id) DO UPDATE SET
                score = EXCLUDED.score,
                flag_count = EXCLUDED.flag_count,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(tender_id)
        .bind(decimal_score(ensemble))
        .bind(flags.len() as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Single published refresh entry point; never called concurrently.
    pub async fn refresh_views(&self) -> Result<()> {
        sqlx::query("SELECT refresh_risk_views()")
            .execute(&self.pool)
            .await
            .context("Materialized-view refresh failed")?;
        info!("Materialized views refreshed");
        Ok(())
    }

    pub async fn flag_stats(&self) -> Result<Vec<(String, String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT flag_type, severity, COUNT(*) AS flag_count
              FROM risk_flags
             GROUP BY flag_type, severity
             ORDER BY flag_type, severity
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get("flag_type"),
                    r.get("severity"),
                    r.get("flag_count"),
                )
            })
            .collect())
    }

    pub async fn top_risky(&self, limit: i64) -> Result<Vec<(String, i32, f64, i32)>> {
        let rows = sqlx::query(
            r#"
            SELECT t.tender_number, t.year, s.score::float8 AS score, s.flag_count
              FROM tender_risk_scores s
              JOIN tenders t ON t.id = s.tender_id
             ORDER BY s.score DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get("tender_number"),
                    r.get("year"),
                    r.get("score"),
                    r.get("flag_count"),
                )
            })
            .collect())
    }
}

fn decimal_score(score: f64) -> BigDecimal {
    BigDecimal::from_f64(score.clamp(0.0, 1.0))
        .unwrap_or_else(|| BigDecimal::from(0))
        .with_scale(4)
}
