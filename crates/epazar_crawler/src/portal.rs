//! e-pazar wire format and its mapping onto the ingestion contract. The
//! portal speaks plain JSON with stable per-category routes and needs no
//! login.

use bigdecimal::BigDecimal;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::str::FromStr;

use procurement_core::parse::{infer_status, parse_amount, parse_date};
use procurement_core::types::{
    BidSeed, ContactBlock, Currency, DocumentSeed, EntityRef, NormalizedTender, Portal,
    TenderStatus,
};

const BASE_URL: &str = "https://e-pazar.gov.mk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpazarCategory {
    Active,
    Finished,
    Contracts,
}

impl EpazarCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpazarCategory::Active => "active",
            EpazarCategory::Finished => "finished",
            EpazarCategory::Contracts => "contracts",
        }
    }

    pub fn listing_url(&self, page: i64) -> String {
        format!(
            "{}/api/announcements?status={}&page={}&pageSize=50",
            BASE_URL,
            self.as_str(),
            page
        )
    }
}

pub fn detail_url(id: i64) -> String {
    format!("{}/api/announcements/{}", BASE_URL, id)
}

#[derive(Debug, Deserialize)]
pub struct ListingPage {
    pub items: Vec<ListingItem>,
    #[serde(rename = "totalPages")]
    pub total_pages: i64,
    pub page: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListingItem {
    pub id: i64,
    pub number: String,
}

#[derive(Debug, Deserialize)]
pub struct Announcement {
    pub id: i64,
    pub number: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "contractingAuthority")]
    pub contracting_authority: AuthorityRef,
    #[serde(rename = "estimatedValue", default)]
    pub estimated_value: Option<String>,
    #[serde(rename = "awardedValue", default)]
    pub awarded_value: Option<String>,
    #[serde(rename = "publicationDate", default)]
    pub publication_date: Option<String>,
    #[serde(rename = "submissionDeadline", default)]
    pub submission_deadline: Option<String>,
    #[serde(rename = "cpvCode", default)]
    pub cpv_code: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(rename = "contactEmail", default)]
    pub contact_email: Option<String>,
    #[serde(rename = "contactPhone", default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub offers: Vec<Offer>,
    #[serde(rename = "lineItems", default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(rename = "evaluationReportUrl", default)]
    pub evaluation_report_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthorityRef {
    pub name: String,
    #[serde(rename = "taxId", default)]
    pub tax_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Offer {
    #[serde(rename = "bidderName")]
    pub bidder_name: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub rank: Option<i32>,
    #[serde(rename = "isWinner", default)]
    pub is_winner: bool,
    #[serde(default)]
    pub disqualified: bool,
    #[serde(rename = "disqualificationReason", default)]
    pub disqualification_reason: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
pub struct LineItem {
    pub name: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(rename = "unitPrice", default)]
    pub unit_price: Option<String>,
    #[serde(rename = "totalPrice", default)]
    pub total_price: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Map a detail payload onto the shared ingestion input. Line items ride
/// along in the raw blob; their first-class extraction happens in the
/// document processor from the attached evaluation report.
pub fn map_announcement(raw_json: &str, detail: Announcement) -> (NormalizedTender, Vec<DocumentSeed>) {
    let (estimated_value, currency) = detail
        .estimated_value
        .as_deref()
        .and_then(parse_amount)
        .map(|(v, c)| (Some(v), c))
        .unwrap_or((None, Currency::Mkd));
    let awarded_value = detail
        .awarded_value
        .as_deref()
        .and_then(parse_amount)
        .map(|(v, _)| v);

    let publication_date = detail.publication_date.as_deref().and_then(parse_date);
    let closing_date = detail.submission_deadline.as_deref().and_then(parse_date);

    let status = match detail.status.as_deref() {
        Some("active") => TenderStatus::Open,
        Some("cancelled") => TenderStatus::Cancelled,
        Some("awarded") | Some("contracted") => TenderStatus::Awarded,
        Some("finished") => {
            if detail.winner.is_some() || detail.offers.iter().any(|o| o.is_winner) {
                TenderStatus::Awarded
            } else {
                TenderStatus::Closed
            }
        }
        _ => infer_status(
            detail.winner.as_deref(),
            closing_date,
            Utc::now().date_naive(),
        ),
    };

    let year = detail
        .number
        .rsplit('/')
        .next()
        .and_then(|y| y.parse::<i32>().ok())
        .or_else(|| publication_date.map(|d| chrono::Datelike::year(&d)))
        .unwrap_or_else(|| chrono::Datelike::year(&Utc::now().date_naive()));

    let bids = detail
        .offers
        .iter()
        .map(|offer| BidSeed {
            bidder_name: offer.bidder_name.clone(),
            bidder_tax_id: None,
            bidder_address: None,
            bidder_manager: None,
            amount: offer
                .amount
                .as_deref()
                .and_then(parse_amount)
                .map(|(v, _)| v)
                .or_else(|| {
                    offer
                        .amount
                        .as_deref()
                        .and_then(|a| BigDecimal::from_str(a).ok())
                }),
            rank: offer.rank,
            is_winner: offer.is_winner,
            disqualified: offer.disqualified,
            disqualification_reason: offer.disqualification_reason.clone(),
            lot_index: None,
        })
        .collect();

    let mut documents: Vec<DocumentSeed> = detail
        .attachments
        .iter()
        .map(|attachment| DocumentSeed {
            source_url: absolutize(&attachment.url),
            title: attachment.title.clone(),
            doc_kind: attachment.kind.clone(),
        })
        .collect();

    // Evaluation-report discovery: finished tenders link the report
    // separately; attach it so the document processor picks it up.
    if let Some(report_url) = &detail.evaluation_report_url {
        let url = absolutize(report_url);
        if !documents.iter().any(|d| d.source_url == url) {
            documents.push(DocumentSeed {
                source_url: url,
                title: Some("Извештај од евалуација".to_string()),
                doc_kind: Some("evaluation_report".to_string()),
            });
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(raw_json.as_bytes());
    let source_hash = hex::encode(hasher.finalize());

    let tender = NormalizedTender {
        tender_number: detail.number.clone(),
        year,
        title: detail.title.clone(),
        description: detail.description.clone(),
        procuring_entity: EntityRef {
            legal_name: detail.contracting_authority.name.clone(),
            tax_id: detail.contracting_authority.tax_id.clone(),
        },
        procedure_type: Some("Набавка од мала вредност".to_string()),
        cpv_code: detail.cpv_code.clone(),
        category: detail.category.clone(),
        estimated_value,
        awarded_value,
        currency,
        publication_date,
        opening_date: None,
        closing_date,
        signing_date: None,
        status,
        contact: ContactBlock {
            person: None,
            email: detail.contact_email.clone(),
            phone: detail.contact_phone.clone(),
        },
        amendments_count: None,
        source_url: detail_url(detail.id),
        source_portal: Portal::Epazar,
        source_hash,
        raw_data: json!({
            "announcement_id": detail.id,
            "line_items": detail.line_items,
            "payload": serde_json::from_str::<serde_json::Value>(raw_json).unwrap_or(json!(null)),
        }),
        bids,
        lots: Vec::new(),
    };

    (tender, documents)
}

fn absolutize(url: &str) -> String {
    if url.starts_with("http") {
        url.to_string()
    } else {
        format!("{}/{}", BASE_URL, url.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL_JSON: &str = r#"{
        "id": 4481,
        "number": "1102/2024",
        "title": "Канцелариски материјали",
        "contractingAuthority": {"name": "Општина Аеродром", "taxId": "4030990254717"},
        "estimatedValue": "120.000,00",
        "publicationDate": "12.02.2024",
        "submissionDeadline": "19.02.2024",
        "status": "finished",
        "winner": "Печатница Напредок",
        "offers": [
            {"bidderName": "Печатница Напредок", "amount": "118.500,00", "rank": 1, "isWinner": true},
            {"bidderName": "Офис Плус", "amount": "121.000,00", "rank": 2}
        ],
        "lineItems": [
            {"name": "Хартија А4", "quantity": 200, "unit": "рис", "unitPrice": "250,00"}
        ],
        "attachments": [
            {"url": "/files/4481/specifikacija.pdf", "title": "Спецификација"}
        ],
        "evaluationReportUrl": "/files/4481/izvestaj.pdf"
    }"#;

    #[test]
    fn maps_finished_announcement() {
        let detail: Announcement = serde_json::from_str(DETAIL_JSON).unwrap();
        let (tender, documents) = map_announcement(DETAIL_JSON, detail);

        assert_eq!(tender.tender_number, "1102/2024");
        assert_eq!(tender.year, 2024);
        assert_eq!(tender.status, TenderStatus::Awarded);
        assert_eq!(tender.source_portal, Portal::Epazar);
        assert_eq!(tender.bids.len(), 2);
        assert!(tender.bids[0].is_winner);
        // Attachment plus the discovered evaluation report.
        assert_eq!(documents.len(), 2);
        assert!(documents[1].source_url.ends_with("izvestaj.pdf"));
        assert_eq!(documents[1].doc_kind.as_deref(), Some("evaluation_report"));
    }

    #[test]
    fn active_announcement_is_open() {
        let json = r#"{
            "id": 1, "number": "7/2025", "title": "Гориво",
            "contractingAuthority": {"name": "ЈП Комунална хигиена"},
            "status": "active"
        }"#;
        let detail: Announcement = serde_json::from_str(json).unwrap();
        let (tender, documents) = map_announcement(json, detail);
        assert_eq!(tender.status, TenderStatus::Open);
        assert!(documents.is_empty());
        assert_eq!(tender.year, 2025);
    }
}
