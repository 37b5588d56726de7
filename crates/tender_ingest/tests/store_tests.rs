//! Store integration tests. These need a live PostgreSQL and are ignored
//! by default; run with a scratch database:
//!
//!   DATABASE_URL=postgres://localhost/nabavki_test cargo test -p tender_ingest -- --ignored

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::str::FromStr;

use procurement_core::types::{
    BidSeed, ContactBlock, Currency, DocumentSeed, EntityRef, NormalizedTender, Portal,
    TenderStatus,
};
use tender_ingest::{IngestOutcome, Store};

fn test_tender(number: &str) -> NormalizedTender {
    NormalizedTender {
        tender_number: number.to_string(),
        year: 2024,
        title: "Набавка на опрема".to_string(),
        description: None,
        procuring_entity: EntityRef {
            legal_name: "Општина Тестово".to_string(),
            tax_id: Some("4000000000001".to_string()),
        },
        procedure_type: Some("Отворена постапка".to_string()),
        cpv_code: Some("30200000-1".to_string()),
        category: Some("Стоки".to_string()),
        estimated_value: Some(BigDecimal::from_str("1000000.00").unwrap()),
        awarded_value: None,
        currency: Currency::Mkd,
        publication_date: NaiveDate::from_ymd_opt(2024, 3, 1),
        opening_date: NaiveDate::from_ymd_opt(2024, 3, 20),
        closing_date: NaiveDate::from_ymd_opt(2024, 3, 18),
        signing_date: None,
        status: TenderStatus::Open,
        contact: ContactBlock::default(),
        amendments_count: None,
        source_url: format!("https://example.test/dossie/{}", number),
        source_portal: Portal::Enabavki,
        source_hash: format!("hash-{}", number),
        raw_data: serde_json::json!({"test": true}),
        bids: vec![],
        lots: vec![],
    }
}

async fn connect() -> Store {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    Store::connect(&url).await.expect("store connects")
}

#[tokio::test]
#[ignore]
async fn ingestion_is_idempotent() {
    let store = connect().await;
    let tender = test_tender("90001/2024");

    let first = store.upsert_tender(&tender, &[]).await.unwrap();
    assert_eq!(first, IngestOutcome::Inserted);

    // Same payload again: one row, no field diff, no updated_at bump.
    let second = store.upsert_tender(&tender, &[]).await.unwrap();
    assert_eq!(second, IngestOutcome::Unchanged);
}

#[tokio::test]
#[ignore]
async fn merge_keeps_nonnull_old_fields() {
    let store = connect().await;
    let mut tender = test_tender("90002/2024");
    store.upsert_tender(&tender, &[]).await.unwrap();

    // A later listing pass with fewer extracted fields must not erase
    // what the dossier pass already stored.
    tender.cpv_code = None;
    tender.description = Some("дополнителен опис".to_string());
    let outcome = store.upsert_tender(&tender, &[]).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Updated);
}

#[tokio::test]
#[ignore]
async fn illegal_status_transition_is_kept_out() {
    let store = connect().await;
    let mut tender = test_tender("90003/2024");
    tender.status = TenderStatus::Awarded;
    tender.bids = vec![BidSeed {
        bidder_name: "Победник ДООЕЛ".to_string(),
        bidder_tax_id: None,
        bidder_address: None,
        bidder_manager: None,
        amount: Some(BigDecimal::from_str("950000.00").unwrap()),
        rank: Some(1),
        is_winner: true,
        disqualified: false,
        disqualification_reason: None,
        lot_index: None,
    }];
    store.upsert_tender(&tender, &[]).await.unwrap();

    // awarded -> open is forbidden; the row must stay awarded.
    tender.status = TenderStatus::Open;
    store.upsert_tender(&tender, &[]).await.unwrap();

    let fresh = store
        .is_fresh("90003/2024", 2024, "hash-90003/2024", 24)
        .await
        .unwrap();
    assert!(fresh, "row still present and freshly updated");
}

#[tokio::test]
#[ignore]
async fn documents_are_unique_per_tender_and_url() {
    let store = connect().await;
    let tender = test_tender("90004/2024");
    let docs = vec![
        DocumentSeed {
            source_url: "https://example.test/doc/1.pdf".to_string(),
            title: Some("Тендерска документација".to_string()),
            doc_kind: None,
        },
        DocumentSeed {
            source_url: "https://example.test/doc/1.pdf".to_string(),
            title: Some("Дупликат".to_string()),
            doc_kind: None,
        },
    ];
    store.upsert_tender(&tender, &docs).await.unwrap();
    // Second encounter of the same URL inserts nothing.
    store.upsert_tender(&tender, &docs).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn cursor_round_trip() {
    let store = connect().await;
    let mut cursor = procurement_core::types::CrawlCursor::start(
        Portal::Enabavki,
        "historical",
        Some(2015),
    );
    cursor.last_page = 37;
    cursor.last_tender_key = Some("123/2015".to_string());
    store.save_cursor(&cursor).await.unwrap();

    let loaded = store
        .load_cursor(Portal::Enabavki, "historical", Some(2015))
        .await
        .unwrap();
    assert_eq!(loaded.last_page, 37);
    assert_eq!(loaded.last_tender_key.as_deref(), Some("123/2015"));
}

#[tokio::test]
#[ignore]
async fn lifecycle_closes_expired_open_tenders() {
    let store = connect().await;
    let mut tender = test_tender("90005/2024");
    tender.closing_date = NaiveDate::from_ymd_opt(2020, 1, 10);
    tender.opening_date = NaiveDate::from_ymd_opt(2020, 1, 1);
    store.upsert_tender(&tender, &[]).await.unwrap();

    let closed = store.auto_close_expired().await.unwrap();
    assert!(closed >= 1);
}
