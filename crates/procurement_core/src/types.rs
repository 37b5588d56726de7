use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Source portal a tender was crawled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Portal {
    Enabavki,
    Epazar,
}

impl Portal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Portal::Enabavki => "enabavki",
            Portal::Epazar => "epazar",
        }
    }
}

/// Tender lifecycle status. Transitions form a DAG:
/// open -> closed -> awarded, and any non-terminal status -> cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenderStatus {
    Open,
    Closed,
    Awarded,
    Cancelled,
}

impl TenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenderStatus::Open => "open",
            TenderStatus::Closed => "closed",
            TenderStatus::Awarded => "awarded",
            TenderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TenderStatus> {
        match s {
            "open" => Some(TenderStatus::Open),
            "closed" => Some(TenderStatus::Closed),
            "awarded" => Some(TenderStatus::Awarded),
            "cancelled" => Some(TenderStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    /// Identity transitions are always legal (idempotent re-ingestion).
    pub fn can_transition(&self, next: TenderStatus) -> bool {
        use TenderStatus::*;
        if *self == next {
            return true;
        }
        match (*self, next) {
            (Open, Closed) | (Open, Awarded) | (Closed, Awarded) => true,
            (Open, Cancelled) | (Closed, Cancelled) | (Awarded, Cancelled) => true,
            (Cancelled, _) => false,
            (Awarded, _) => false,
            (Closed, Open) => false,
            _ => false,
        }
    }
}

/// Document extraction ladder: pending -> success | failed | auth_required | skipped.
/// `failed` and `auth_required` may still reach `success` on a later retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Success,
    AuthRequired,
    Failed,
    Skipped,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Success => "success",
            ExtractionStatus::AuthRequired => "auth_required",
            ExtractionStatus::Failed => "failed",
            ExtractionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<ExtractionStatus> {
        match s {
            "pending" => Some(ExtractionStatus::Pending),
            "success" => Some(ExtractionStatus::Success),
            "auth_required" => Some(ExtractionStatus::AuthRequired),
            "failed" => Some(ExtractionStatus::Failed),
            "skipped" => Some(ExtractionStatus::Skipped),
            _ => None,
        }
    }

    /// Terminal states are never reprocessed without --force.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExtractionStatus::Success | ExtractionStatus::Skipped)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractionStatus::Failed | ExtractionStatus::AuthRequired)
    }
}

/// Statistical risk indicator types. Flags are indicators, never accusations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    SingleBidder,
    RepeatWinner,
    PriceAnomaly,
    BidClustering,
    ShortDeadline,
    HighAmendments,
    SpecRigging,
    RelatedCompanies,
    DataIntegrity,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::SingleBidder => "single_bidder",
            FlagType::RepeatWinner => "repeat_winner",
            FlagType::PriceAnomaly => "price_anomaly",
            FlagType::BidClustering => "bid_clustering",
            FlagType::ShortDeadline => "short_deadline",
            FlagType::HighAmendments => "high_amendments",
            FlagType::SpecRigging => "spec_rigging",
            FlagType::RelatedCompanies => "related_companies",
            FlagType::DataIntegrity => "data_integrity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "MKD")]
    Mkd,
    #[serde(rename = "EUR")]
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Mkd => "MKD",
            Currency::Eur => "EUR",
        }
    }
}

/// Procuring-entity identity as scraped; normalization happens on ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRef {
    pub legal_name: String,
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactBlock {
    pub person: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One bid row as scraped from a dossier or an evaluation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidSeed {
    pub bidder_name: String,
    pub bidder_tax_id: Option<String>,
    pub bidder_address: Option<String>,
    pub bidder_manager: Option<String>,
    pub amount: Option<BigDecimal>,
    pub rank: Option<i32>,
    pub is_winner: bool,
    pub disqualified: bool,
    pub disqualification_reason: Option<String>,
    /// Index into the tender's lots, when the portal groups bids per lot.
    pub lot_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotSeed {
    pub title: String,
    pub estimated_value: Option<BigDecimal>,
    pub awarded_value: Option<BigDecimal>,
    pub winner_name: Option<String>,
}

/// Document reference discovered on a listing or dossier page. Inserted
/// with `extraction_status = pending`; the document processor takes over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSeed {
    pub source_url: String,
    pub title: Option<String>,
    pub doc_kind: Option<String>,
}

/// Fully normalized tender as emitted by either crawler — the single
/// input type of the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTender {
    pub tender_number: String,
    pub year: i32,
    pub title: String,
    pub description: Option<String>,
    pub procuring_entity: EntityRef,
    pub procedure_type: Option<String>,
    pub cpv_code: Option<String>,
    pub category: Option<String>,
    pub estimated_value: Option<BigDecimal>,
    pub awarded_value: Option<BigDecimal>,
    pub currency: Currency,
    pub publication_date: Option<NaiveDate>,
    pub opening_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,
    pub signing_date: Option<NaiveDate>,
    pub status: TenderStatus,
    pub contact: ContactBlock,
    pub amendments_count: Option<i32>,
    pub source_url: String,
    pub source_portal: Portal,
    /// Hash of the raw listing/detail payload, used by incremental mode.
    pub source_hash: String,
    pub raw_data: serde_json::Value,
    pub bids: Vec<BidSeed>,
    pub lots: Vec<LotSeed>,
}

impl NormalizedTender {
    /// Stable key used for dedup and cursors.
    pub fn tender_key(&self) -> String {
        format!("{}/{}", self.tender_number, self.year)
    }

    /// Scraped data is admitted as-is; contradictions are reported, not
    /// repaired, so the analyzer can raise a data_integrity flag.
    pub fn integrity_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let (Some(open), Some(close)) = (self.opening_date, self.closing_date) {
            if close < open {
                warnings.push(format!(
                    "closing_date {} precedes opening_date {}",
                    close, open
                ));
            }
        }
        let winners = self.bids.iter().filter(|b| b.is_winner).count();
        if winners > 1 && self.lots.is_empty() {
            warnings.push(format!("{} winners on a tender without lots", winners));
        }
        if !self.lots.is_empty() {
            let lot_sum: BigDecimal = self
                .lots
                .iter()
                .filter_map(|l| l.awarded_value.clone())
                .sum();
            if let Some(awarded) = &self.awarded_value {
                if lot_sum != BigDecimal::from(0) && &lot_sum != awarded {
                    warnings.push(format!(
                        "lot awarded sum {} differs from tender awarded value {}",
                        lot_sum, awarded
                    ));
                }
            }
        }
        warnings
    }
}

/// Resumable crawl position, persisted at every page boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlCursor {
    pub portal: Portal,
    pub category: String,
    pub year: Option<i32>,
    pub last_page: i64,
    pub last_tender_key: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error_count: i64,
}

impl CrawlCursor {
    pub fn start(portal: Portal, category: &str, year: Option<i32>) -> Self {
        CrawlCursor {
            portal,
            category: category.to_string(),
            year,
            last_page: 0,
            last_tender_key: None,
            last_run_at: None,
            error_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_forward_edges() {
        assert!(TenderStatus::Open.can_transition(TenderStatus::Closed));
        assert!(TenderStatus::Closed.can_transition(TenderStatus::Awarded));
        assert!(TenderStatus::Open.can_transition(TenderStatus::Awarded));
        assert!(TenderStatus::Open.can_transition(TenderStatus::Cancelled));
        assert!(TenderStatus::Awarded.can_transition(TenderStatus::Cancelled));
    }

    #[test]
    fn status_dag_forbidden_edges() {
        assert!(!TenderStatus::Awarded.can_transition(TenderStatus::Open));
        assert!(!TenderStatus::Awarded.can_transition(TenderStatus::Closed));
        assert!(!TenderStatus::Cancelled.can_transition(TenderStatus::Open));
        assert!(!TenderStatus::Cancelled.can_transition(TenderStatus::Awarded));
        assert!(!TenderStatus::Closed.can_transition(TenderStatus::Open));
    }

    #[test]
    fn extraction_status_ladder() {
        assert!(ExtractionStatus::Success.is_terminal());
        assert!(ExtractionStatus::Skipped.is_terminal());
        assert!(ExtractionStatus::Failed.is_retryable());
        assert!(ExtractionStatus::AuthRequired.is_retryable());
        assert!(!ExtractionStatus::Pending.is_terminal());
    }

    #[test]
    fn integrity_warnings_on_inverted_dates() {
        let mut tender = NormalizedTender {
            tender_number: "05231/2024".to_string(),
            year: 2024,
            title: "Набавка на канцелариски материјали".to_string(),
            description: None,
            procuring_entity: EntityRef {
                legal_name: "Општина Центар".to_string(),
                tax_id: None,
            },
            procedure_type: None,
            cpv_code: None,
            category: None,
            estimated_value: None,
            awarded_value: None,
            currency: Currency::Mkd,
            publication_date: None,
            opening_date: NaiveDate::from_ymd_opt(2024, 3, 10),
            closing_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            signing_date: None,
            status: TenderStatus::Open,
            contact: ContactBlock::default(),
            amendments_count: None,
            source_url: String::new(),
            source_portal: Portal::Enabavki,
            source_hash: String::new(),
            raw_data: serde_json::json!({}),
            bids: vec![],
            lots: vec![],
        };
        assert_eq!(tender.integrity_warnings().len(), 1);
        tender.closing_date = NaiveDate::from_ymd_opt(2024, 3, 20);
        assert!(tender.integrity_warnings().is_empty());
    }
}
