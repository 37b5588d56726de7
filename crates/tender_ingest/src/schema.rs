//! Idempotent schema migration, executed at process start by every stage
//! that touches the store. All statements are IF NOT EXISTS / OR REPLACE
//! so concurrent stage startups are harmless.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS procuring_entities (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        normalized_name TEXT NOT NULL,
        tax_id TEXT,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    // Identity must hold for rows without a tax id too, so the unique
    // index coalesces NULL instead of treating every NULL as distinct.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_entities_identity
        ON procuring_entities (normalized_name, COALESCE(tax_id, ''))
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bidders (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        normalized_name TEXT NOT NULL,
        tax_id TEXT,
        address TEXT,
        manager_name TEXT,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_bidders_identity
        ON bidders (normalized_name, COALESCE(tax_id, ''))
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tenders (
        id BIGSERIAL PRIMARY KEY,
        tender_number TEXT NOT NULL,
        year INTEGER NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        procuring_entity_id BIGINT NOT NULL REFERENCES procuring_entities(id),
        procedure_type TEXT,
        cpv_code TEXT,
        category TEXT,
        estimated_value DECIMAL(18,2),
        awarded_value DECIMAL(18,2),
        currency TEXT NOT NULL DEFAULT 'MKD',
        publication_date DATE,
        opening_date DATE,
        closing_date DATE,
        signing_date DATE,
        status TEXT NOT NULL CHECK (status IN ('open', 'closed', 'awarded', 'cancelled')),
        contact_person TEXT,
        contact_email TEXT,
        contact_phone TEXT,
        amendments_count INTEGER,
        source_url TEXT NOT NULL,
        source_portal TEXT NOT NULL,
        source_hash TEXT NOT NULL DEFAULT '',
        raw_data JSONB NOT NULL DEFAULT '{}'::JSONB,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (tender_number, year)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lots (
        id BIGSERIAL PRIMARY KEY,
        tender_id BIGINT NOT NULL REFERENCES tenders(id),
        position INTEGER NOT NULL,
        title TEXT NOT NULL,
        estimated_value DECIMAL(18,2),
        awarded_value DECIMAL(18,2),
        winner_name TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tender_bids (
        id BIGSERIAL PRIMARY KEY,
        tender_id BIGINT NOT NULL REFERENCES tenders(id),
        lot_id BIGINT REFERENCES lots(id),
        bidder_id BIGINT NOT NULL REFERENCES bidders(id),
        amount DECIMAL(18,2),
        rank INTEGER,
        is_winner BOOLEAN NOT NULL DEFAULT FALSE,
        disqualified BOOLEAN NOT NULL DEFAULT FALSE,
        disqualification_reason TEXT
    )
    "#,
    // At most one winner per lot, and per tender when there are no lots.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_winner_per_lot
        ON tender_bids (tender_id, lot_id) WHERE is_winner AND lot_id IS NOT NULL
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_winner_per_tender
        ON tender_bids (tender_id) WHERE is_winner AND lot_id IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id BIGSERIAL PRIMARY KEY,
        tender_id BIGINT NOT NULL REFERENCES tenders(id),
        source_url TEXT NOT NULL,
        title TEXT,
        doc_kind TEXT,
        local_path TEXT,
        mime_type TEXT,
        file_size BIGINT,
        page_count INTEGER,
        extraction_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (extraction_status IN ('pending', 'success', 'auth_required', 'failed', 'skipped')),
        extracted_text TEXT,
        specifications JSONB,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_retry_at TIMESTAMP WITH TIME ZONE,
        last_error TEXT,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (tender_id, source_url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_items (
        id BIGSERIAL PRIMARY KEY,
        document_id BIGINT NOT NULL REFERENCES documents(id),
        tender_id BIGINT NOT NULL REFERENCES tenders(id),
        name TEXT NOT NULL,
        quantity DECIMAL(18,3),
        unit TEXT,
        unit_price DECIMAL(18,2),
        total_price DECIMAL(18,2),
        specifications JSONB,
        category TEXT,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS risk_flags (
        tender_id BIGINT NOT NULL REFERENCES tenders(id),
        flag_type TEXT NOT NULL,
        severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high', 'critical')),
        score DECIMAL(5,4) NOT NULL CHECK (score >= 0 AND score <= 1),
        evidence JSONB NOT NULL,
        explanation TEXT NOT NULL,
        detected_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (tender_id, flag_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tender_risk_scores (
        tender_id BIGINT PRIMARY KEY REFERENCES tenders(id),
        score DECIMAL(5,4) NOT NULL CHECK (score >= 0 AND score <= 1),
        flag_count INTEGER NOT NULL,
        computed_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS crawl_cursors (
        portal TEXT NOT NULL,
        category TEXT NOT NULL,
        year INTEGER NOT NULL DEFAULT 0,
        last_page BIGINT NOT NULL DEFAULT 0,
        last_tender_key TEXT,
        last_run_at TIMESTAMP WITH TIME ZONE,
        error_count BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (portal, category, year)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tenders_entity ON tenders (procuring_entity_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tenders_status ON tenders (status)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_documents_pending
        ON documents (id) WHERE extraction_status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_bids_bidder ON tender_bids (bidder_id)
    "#,
];

const VIEWS: &[&str] = &[
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS mv_tender_risk_summary AS
    SELECT t.id AS tender_id,
           t.tender_number,
           t.year,
           t.title,
           t.status,
           t.estimated_value,
           t.awarded_value,
           pe.name AS entity_name,
           COALESCE(s.score, 0) AS risk_score,
           COALESCE(s.flag_count, 0) AS flag_count,
           (SELECT COALESCE(json_agg(json_build_object(
                       'flag_type', f.flag_type,
                       'severity', f.severity,
                       'score', f.score)), '[]'::json)
              FROM risk_flags f WHERE f.tender_id = t.id) AS flags
      FROM tenders t
      JOIN procuring_entities pe ON pe.id = t.procuring_entity_id
      LEFT JOIN tender_risk_scores s ON s.tender_id = t.id
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS mv_entity_risk_summary AS
    SELECT pe.id AS entity_id,
           pe.name,
           COUNT(t.id) AS tender_count,
           SUM(t.awarded_value) AS total_awarded,
           AVG(COALESCE(s.score, 0)) AS avg_risk_score,
           COUNT(*) FILTER (WHERE s.score >= 0.7) AS high_risk_count
      FROM procuring_entities pe
      LEFT JOIN tenders t ON t.procuring_entity_id = pe.id
      LEFT JOIN tender_risk_scores s ON s.tender_id = t.id
     GROUP BY pe.id, pe.name
    "#,
    // Single published entry point for view refresh; only the analyzer
    // job calls it, never concurrently.
    r#"
    CREATE OR REPLACE FUNCTION refresh_risk_views() RETURNS void AS $body$
    BEGIN
        REFRESH MATERIALIZED VIEW mv_tender_risk_summary;
        REFRESH MATERIALIZED VIEW mv_entity_risk_summary;
    END;
    $body$ LANGUAGE plpgsql
    "#,
];

/// Bring the schema up to date. Safe to run from every process.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in DDL.iter().chain(VIEWS.iter()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| {
                let head: String = statement.split_whitespace().take(6).collect::<Vec<_>>().join(" ");
                format!("schema statement failed: {}", head)
            })?;
    }
    info!("Schema is up to date");
    Ok(())
}
