use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use procurement_core::types::{FlagType, Severity};

/// Everything the feature extractor needs about one tender, loaded in a
/// single pass from the store.
#[derive(Debug, Clone)]
pub struct TenderSnapshot {
    pub tender_id: i64,
    pub tender_number: String,
    pub year: i32,
    pub entity_id: i64,
    pub entity_name: String,
    pub category: Option<String>,
    pub procedure_type: Option<String>,
    pub status: String,
    pub estimated_value: Option<f64>,
    pub awarded_value: Option<f64>,
    pub publication_date: Option<NaiveDate>,
    pub opening_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,
    pub amendments_count: Option<i32>,
    pub bids: Vec<BidSnapshot>,
    pub lot_count: i64,
    pub lot_awarded_sum: Option<f64>,
    /// Concatenated extracted text of the tender's documents, truncated.
    pub spec_text: Option<String>,
}

impl TenderSnapshot {
    pub fn winner(&self) -> Option<&BidSnapshot> {
        self.bids.iter().find(|b| b.is_winner)
    }
}

#[derive(Debug, Clone)]
pub struct BidSnapshot {
    pub bidder_id: i64,
    pub bidder_name: String,
    pub address: Option<String>,
    pub manager_name: Option<String>,
    pub amount: Option<f64>,
    pub is_winner: bool,
    pub disqualified: bool,
}

/// Entity-level context: what this procuring entity awarded in the 24
/// months before the tender under analysis.
#[derive(Debug, Clone, Default)]
pub struct EntityHistory {
    /// (winning bidder id, awarded value) per prior award.
    pub awards_24m: Vec<(i64, f64)>,
    /// Procedure-type usage counts over the entity's whole record.
    pub procedure_counts: HashMap<String, i64>,
    pub procedure_total: i64,
    /// Entity-level tender value distribution.
    pub value_mean: Option<f64>,
    pub value_stddev: Option<f64>,
    /// Tenders per month distribution.
    pub monthly_count_mean: Option<f64>,
    pub monthly_count_stddev: Option<f64>,
    pub current_month_count: i64,
    /// Spec texts of prior tenders won by this tender's winner.
    pub winner_spec_texts: Vec<String>,
}

/// Typed per-tender feature record, seven families. Missing inputs stay
/// `None` — never silent zeros.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureRecord {
    pub tender_id: i64,

    // competition
    pub bid_count: Option<i32>,
    pub disqualified_count: Option<i32>,
    pub bidder_concentration: Option<f64>,

    // price
    pub winner_to_estimate_ratio: Option<f64>,
    pub bid_cv: Option<f64>,
    pub exact_estimate_match: Option<bool>,
    pub estimate_is_round: Option<bool>,
    pub decisive_value: Option<f64>,

    // timing
    pub submission_window_days: Option<i64>,
    pub closing_on_weekend: Option<bool>,
    pub category_floor_days: i64,

    // relationship
    pub entity_awards_24m: Option<i32>,
    pub winner_awards_24m: Option<i32>,
    pub winner_share_24m: Option<f64>,
    pub shared_address_pairs: Option<i32>,
    pub shared_manager_pairs: Option<i32>,

    // procedural
    pub procedure_rarity: Option<f64>,
    pub amendments_count: Option<i32>,

    // document
    pub spec_length: Option<i64>,
    pub spec_boilerplate_similarity: Option<f64>,

    // historical
    pub value_zscore: Option<f64>,
    pub frequency_zscore: Option<f64>,

    // data contradictions surfaced during ingestion-side checks
    pub integrity_violations: Vec<String>,
}

/// One evaluated flag, ready for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagResult {
    pub flag_type: FlagType,
    pub severity: Severity,
    pub score: f64,
    pub evidence: serde_json::Value,
    pub explanation: String,
}
