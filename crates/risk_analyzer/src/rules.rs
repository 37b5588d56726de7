//! Statistical flag rules and the ensemble score. Every rule maps a
//! feature record to at most one flag with a calibrated score in [0, 1],
//! a severity thresholded from the score, a JSON evidence excerpt and a
//! bilingual explanation. Deterministic: the same feature record always
//! produces the same flag set, in the same order.
//!
//! The full threshold table is published here and in DESIGN.md.

use serde_json::json;

use procurement_core::types::{FlagType, Severity};

use crate::types::{FeatureRecord, FlagResult};

// ── Threshold table ──────────────────────────────────────────────────────

/// single_bidder: flag when bids <= 1 and the tender value is above the
/// category floor (MKD).
pub const SINGLE_BIDDER_VALUE_FLOOR: f64 = 500_000.0;

/// repeat_winner: winner's value share of the entity's awards over the
/// prior 24 months, with a minimum award count.
pub const REPEAT_WINNER_SHARE: f64 = 0.5;
pub const REPEAT_WINNER_MIN_AWARDS: i32 = 5;

/// price_anomaly: relative deviation of winner value from the estimate.
pub const PRICE_ANOMALY_DEVIATION: f64 = 0.15;

/// bid_clustering: coefficient of variation below this over >= 3 bids.
pub const BID_CLUSTERING_CV: f64 = 0.02;
pub const BID_CLUSTERING_MIN_BIDS: i32 = 3;

/// high_amendments: documentation amended at least this many times.
pub const HIGH_AMENDMENTS_COUNT: i32 = 3;

/// spec_rigging: token-set similarity to a prior winning template.
pub const SPEC_RIGGING_SIMILARITY: f64 = 0.7;

/// Severity is monotone in score, one shared staircase for all rules.
pub fn severity_for(score: f64) -> Severity {
    if score >= 0.8 {
        Severity::Critical
    } else if score >= 0.6 {
        Severity::High
    } else if score >= 0.4 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Ensemble weights per flag type; the weighted sum is clipped to [0, 1].
const ENSEMBLE_WEIGHTS: &[(FlagType, f64)] = &[
    (FlagType::SingleBidder, 0.20),
    (FlagType::RepeatWinner, 0.20),
    (FlagType::PriceAnomaly, 0.15),
    (FlagType::BidClustering, 0.15),
    (FlagType::ShortDeadline, 0.10),
    (FlagType::HighAmendments, 0.05),
    (FlagType::SpecRigging, 0.15),
    (FlagType::RelatedCompanies, 0.20),
    (FlagType::DataIntegrity, 0.05),
];

// ── Rules ────────────────────────────────────────────────────────────────

/// Run every rule over one feature record. Order is fixed.
pub fn evaluate_all(features: &FeatureRecord) -> Vec<FlagResult> {
    [
        single_bidder(features),
        repeat_winner(features),
        price_anomaly(features),
        bid_clustering(features),
        short_deadline(features),
        high_amendments(features),
        spec_rigging(features),
        related_companies(features),
        data_integrity(features),
    ]
    .into_iter()
    .flatten()
    .map(|flag| FlagResult {
        score: flag.score.clamp(0.0, 1.0),
        ..flag
    })
    .collect()
}

/// Weighted ensemble of the active flags, clipped to [0, 1].
pub fn ensemble_score(flags: &[FlagResult]) -> f64 {
    let score: f64 = flags
        .iter()
        .map(|flag| {
            let weight = ENSEMBLE_WEIGHTS
                .iter()
                .find(|(t, _)| *t == flag.flag_type)
                .map(|(_, w)| *w)
                .unwrap_or(0.0);
            weight * flag.score
        })
        .sum();
    score.clamp(0.0, 1.0)
}

fn single_bidder(f: &FeatureRecord) -> Option<FlagResult> {
    let bids = f.bid_count?;
    let value = f.decisive_value?;
    if bids > 1 || value < SINGLE_BIDDER_VALUE_FLOOR {
        return None;
    }
    let magnitude = (value / SINGLE_BIDDER_VALUE_FLOOR).log10().max(0.0);
    let score = 0.6 + 0.1 * magnitude;
    Some(FlagResult {
        flag_type: FlagType::SingleBidder,
        severity: severity_for(score.clamp(0.0, 1.0)),
        score,
        evidence: json!({
            "bid_count": bids,
            "value": value,
            "value_floor": SINGLE_BIDDER_VALUE_FLOOR,
        }),
        explanation: format!(
            "Само {} понуда за тендер вреден {:.0} МКД / Only {} bid(s) on a tender worth {:.0} MKD",
            bids, value, bids, value
        ),
    })
}

fn repeat_winner(f: &FeatureRecord) -> Option<FlagResult> {
    let share = f.winner_share_24m?;
    let entity_awards = f.entity_awards_24m?;
    let winner_awards = f.winner_awards_24m?;
    if share <= REPEAT_WINNER_SHARE || entity_awards < REPEAT_WINNER_MIN_AWARDS {
        return None;
    }
    let score = 0.4 + 0.5 * ((share - REPEAT_WINNER_SHARE) / (1.0 - REPEAT_WINNER_SHARE)).min(1.0);
    Some(FlagResult {
        flag_type: FlagType::RepeatWinner,
        severity: severity_for(score),
        score,
        evidence: json!({
            "winner_share_24m": share,
            "winner_awards_24m": winner_awards,
            "entity_awards_24m": entity_awards,
            "share_threshold": REPEAT_WINNER_SHARE,
        }),
        explanation: format!(
            "Истиот понудувач добил {:.0}% од доделувањата на органот во последните 24 месеци ({} од {}) / \
             The same bidder won {:.0}% of this entity's awards in the last 24 months ({} of {})",
            share * 100.0, winner_awards, entity_awards,
            share * 100.0, winner_awards, entity_awards
        ),
    })
}

fn price_anomaly(f: &FeatureRecord) -> Option<FlagResult> {
    let ratio = f.winner_to_estimate_ratio?;
    let deviation = (ratio - 1.0).abs();
    let exact_on_nonround =
        f.exact_estimate_match == Some(true) && f.estimate_is_round == Some(false);

    if !exact_on_nonround && deviation <= PRICE_ANOMALY_DEVIATION {
        return None;
    }
    let score = if exact_on_nonround {
        0.85
    } else {
        (0.4 + deviation).min(1.0)
    };
    Some(FlagResult {
        flag_type: FlagType::PriceAnomaly,
        severity: severity_for(score),
        score,
        evidence: json!({
            "winner_to_estimate_ratio": ratio,
            "deviation": deviation,
            "exact_match_on_nonround_estimate": exact_on_nonround,
            "deviation_threshold": PRICE_ANOMALY_DEVIATION,
        }),
        explanation: if exact_on_nonround {
            "Победничката понуда е идентична со незаокружената проценета вредност / \
             Winning bid exactly equals a non-round estimate"
                .to_string()
        } else {
            format!(
                "Победничката вредност отстапува {:.0}% од проценката / \
                 Winner value deviates {:.0}% from the estimate",
                deviation * 100.0,
                deviation * 100.0
            )
        },
    })
}

fn bid_clustering(f: &FeatureRecord) -> Option<FlagResult> {
    let cv = f.bid_cv?;
    let bids = f.bid_count?;
    if bids < BID_CLUSTERING_MIN_BIDS || cv >= BID_CLUSTERING_CV {
        return None;
    }
    let score = 0.5 + 0.3 * (1.0 - cv / BID_CLUSTERING_CV);
    Some(FlagResult {
        flag_type: FlagType::BidClustering,
        severity: severity_for(score),
        score,
        evidence: json!({
            "bid_cv": cv,
            "bid_count": bids,
            "cv_threshold": BID_CLUSTERING_CV,
        }),
        explanation: format!(
            "{} понуди со коефициент на варијација {:.4} — невообичаено блиску / \
             {} bids with coefficient of variation {:.4} — unusually close",
            bids, cv, bids, cv
        ),
    })
}

fn short_deadline(f: &FeatureRecord) -> Option<FlagResult> {
    let window = f.submission_window_days?;
    let floor = f.category_floor_days;
    if window >= floor {
        return None;
    }
    let shortfall = 1.0 - window.max(0) as f64 / floor as f64;
    let score = 0.3 + 0.4 * shortfall;
    Some(FlagResult {
        flag_type: FlagType::ShortDeadline,
        severity: severity_for(score),
        score,
        evidence: json!({
            "submission_window_days": window,
            "category_floor_days": floor,
            "closing_on_weekend": f.closing_on_weekend,
        }),
        explanation: format!(
            "Рок од само {} дена наспроти праг од {} за категоријата / \
             Submission window of only {} days against a {}-day category floor",
            window, floor, window, floor
        ),
    })
}

fn high_amendments(f: &FeatureRecord) -> Option<FlagResult> {
    let amendments = f.amendments_count?;
    if amendments < HIGH_AMENDMENTS_COUNT {
        return None;
    }
    let score = (0.3 + 0.15 * amendments as f64).min(1.0);
    Some(FlagResult {
        flag_type: FlagType::HighAmendments,
        severity: severity_for(score),
        score,
        evidence: json!({
            "amendments_count": amendments,
            "threshold": HIGH_AMENDMENTS_COUNT,
        }),
        explanation: format!(
            "Тендерската документација е менувана {} пати / \
             Tender documentation amended {} times",
            amendments, amendments
        ),
    })
}

fn spec_rigging(f: &FeatureRecord) -> Option<FlagResult> {
    let similarity = f.spec_boilerplate_similarity?;
    if similarity < SPEC_RIGGING_SIMILARITY {
        return None;
    }
    let score = similarity;
    Some(FlagResult {
        flag_type: FlagType::SpecRigging,
        severity: severity_for(score),
        score,
        evidence: json!({
            "spec_similarity": similarity,
            "similarity_threshold": SPEC_RIGGING_SIMILARITY,
            "spec_length": f.spec_length,
        }),
        explanation: format!(
            "Спецификацијата е {:.0}% слична со претходна документација добиена од истиот понудувач / \
             Specification is {:.0}% similar to prior documentation won by the same bidder",
            similarity * 100.0,
            similarity * 100.0
        ),
    })
}

fn related_companies(f: &FeatureRecord) -> Option<FlagResult> {
    let address_pairs = f.shared_address_pairs.unwrap_or(0);
    let manager_pairs = f.shared_manager_pairs.unwrap_or(0);
    let pairs = address_pairs + manager_pairs;
    if pairs < 1 {
        return None;
    }
    let score = (0.5 + 0.2 * pairs as f64).min(1.0);
    Some(FlagResult {
        flag_type: FlagType::RelatedCompanies,
        severity: severity_for(score),
        score,
        evidence: json!({
            "shared_address_pairs": address_pairs,
            "shared_manager_pairs": manager_pairs,
        }),
        explanation: format!(
            "Понудувачи со заедничка адреса или управител ({} парови) / \
             Bidders sharing an address or manager ({} pairs)",
            pairs, pairs
        ),
    })
}

fn data_integrity(f: &FeatureRecord) -> Option<FlagResult> {
    if f.integrity_violations.is_empty() {
        return None;
    }
    let score = (0.4 + 0.1 * f.integrity_violations.len() as f64).min(1.0);
    Some(FlagResult {
        flag_type: FlagType::DataIntegrity,
        severity: severity_for(score),
        score,
        evidence: json!({ "violations": f.integrity_violations }),
        explanation: format!(
            "Противречни податоци во изворниот запис: {} / Contradictory source data: {}",
            f.integrity_violations.join("; "),
            f.integrity_violations.join("; ")
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::compute_features;
    use crate::types::{BidSnapshot, EntityHistory, TenderSnapshot};
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn bid(id: i64, amount: f64, winner: bool) -> BidSnapshot {
        BidSnapshot {
            bidder_id: id,
            bidder_name: format!("Понудувач {}", id),
            address: None,
            manager_name: None,
            amount: Some(amount),
            is_winner: winner,
            disqualified: false,
        }
    }

    fn base_snapshot() -> TenderSnapshot {
        TenderSnapshot {
            tender_id: 42,
            tender_number: "42/2025".to_string(),
            year: 2025,
            entity_id: 7,
            entity_name: "Општина Тест".to_string(),
            category: Some("Стоки".to_string()),
            procedure_type: Some("Отворена постапка".to_string()),
            status: "awarded".to_string(),
            estimated_value: None,
            awarded_value: None,
            publication_date: None,
            opening_date: None,
            closing_date: None,
            amendments_count: None,
            bids: vec![],
            lot_count: 0,
            lot_awarded_sum: None,
            spec_text: None,
        }
    }

    // Scenario: one bid, 10M estimate, 9.8M winner -> single_bidder, high.
    #[test]
    fn single_bidder_scenario() {
        let mut snap = base_snapshot();
        snap.estimated_value = Some(10_000_000.0);
        snap.bids = vec![bid(1, 9_800_000.0, true)];
        let features = compute_features(&snap, &EntityHistory::default());
        let flags = evaluate_all(&features);

        let flag = flags
            .iter()
            .find(|f| f.flag_type == FlagType::SingleBidder)
            .expect("single_bidder must fire");
        assert_eq!(flag.severity, Severity::High);
        assert!(flag.score > 0.0 && flag.score <= 1.0);
    }

    // Scenario: winner bids exactly the non-round estimate, 3 tight bids
    // -> price_anomaly AND bid_clustering.
    #[test]
    fn exact_estimate_scenario() {
        let mut snap = base_snapshot();
        snap.estimated_value = Some(1_234_567.0);
        snap.bids = vec![
            bid(1, 1_234_567.0, true),
            bid(2, 1_235_800.0, false),
            bid(3, 1_233_300.0, false),
        ];
        let features = compute_features(&snap, &EntityHistory::default());
        assert!(features.bid_cv.unwrap() < 0.002);

        let flags = evaluate_all(&features);
        assert!(flags.iter().any(|f| f.flag_type == FlagType::PriceAnomaly));
        assert!(flags.iter().any(|f| f.flag_type == FlagType::BidClustering));
    }

    // Scenario: 7 awards in 24 months, 5 to the winner, >50% of value.
    #[test]
    fn repeat_winner_scenario() {
        let mut snap = base_snapshot();
        snap.bids = vec![bid(9, 4_000_000.0, true), bid(2, 4_100_000.0, false)];
        let history = EntityHistory {
            awards_24m: vec![
                (9, 3_000_000.0),
                (9, 2_500_000.0),
                (9, 2_000_000.0),
                (9, 1_500_000.0),
                (9, 1_000_000.0),
                (3, 2_000_000.0),
                (4, 1_500_000.0),
            ],
            ..EntityHistory::default()
        };
        let features = compute_features(&snap, &history);
        let flags = evaluate_all(&features);
        assert!(flags.iter().any(|f| f.flag_type == FlagType::RepeatWinner));
    }

    // Scenario: published 2025-03-01, closing 2025-03-05, 14-day floor
    // -> short_deadline with severity medium.
    #[test]
    fn short_deadline_scenario() {
        let mut snap = base_snapshot();
        snap.publication_date = NaiveDate::from_ymd_opt(2025, 3, 1);
        snap.closing_date = NaiveDate::from_ymd_opt(2025, 3, 5);
        let features = compute_features(&snap, &EntityHistory::default());
        let flags = evaluate_all(&features);

        let flag = flags
            .iter()
            .find(|f| f.flag_type == FlagType::ShortDeadline)
            .expect("short_deadline must fire");
        assert_eq!(flag.severity, Severity::Medium);
    }

    #[test]
    fn related_companies_fires_on_shared_address() {
        let mut snap = base_snapshot();
        snap.bids = vec![bid(1, 100.0, true), bid(2, 101.0, false)];
        snap.bids[0].address = Some("бул. Илинден 5".to_string());
        snap.bids[1].address = Some("бул. Илинден 5".to_string());
        let features = compute_features(&snap, &EntityHistory::default());
        let flags = evaluate_all(&features);
        assert!(flags
            .iter()
            .any(|f| f.flag_type == FlagType::RelatedCompanies));
    }

    #[test]
    fn analyzer_is_deterministic() {
        let mut snap = base_snapshot();
        snap.estimated_value = Some(1_234_567.0);
        snap.publication_date = NaiveDate::from_ymd_opt(2025, 3, 1);
        snap.closing_date = NaiveDate::from_ymd_opt(2025, 3, 5);
        snap.bids = vec![
            bid(1, 1_234_567.0, true),
            bid(2, 1_235_800.0, false),
            bid(3, 1_233_300.0, false),
        ];
        let features = compute_features(&snap, &EntityHistory::default());
        let first = evaluate_all(&features);
        for _ in 0..10 {
            let next = evaluate_all(&features);
            assert_eq!(
                serde_json::to_string(&next).unwrap(),
                serde_json::to_string(&first).unwrap()
            );
        }
    }

    #[test]
    fn every_flag_has_evidence_and_explanation() {
        let mut snap = base_snapshot();
        snap.estimated_value = Some(10_000_000.0);
        snap.publication_date = NaiveDate::from_ymd_opt(2025, 3, 1);
        snap.closing_date = NaiveDate::from_ymd_opt(2025, 3, 5);
        snap.amendments_count = Some(4);
        snap.bids = vec![bid(1, 10_000_000.0, true)];
        let features = compute_features(&snap, &EntityHistory::default());
        for flag in evaluate_all(&features) {
            assert!(!flag.explanation.is_empty());
            assert!(!flag.evidence.is_null());
            assert!((0.0..=1.0).contains(&flag.score));
        }
    }

    #[test]
    fn ensemble_is_clipped_and_deterministic() {
        let mut snap = base_snapshot();
        snap.estimated_value = Some(50_000_000.0);
        snap.publication_date = NaiveDate::from_ymd_opt(2025, 3, 1);
        snap.closing_date = NaiveDate::from_ymd_opt(2025, 3, 2);
        snap.amendments_count = Some(10);
        snap.bids = vec![bid(1, 50_000_000.0, true)];
        let features = compute_features(&snap, &EntityHistory::default());
        let flags = evaluate_all(&features);
        let score = ensemble_score(&flags);
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(score, ensemble_score(&flags));
    }

    proptest! {
        // Severity staircase is monotone in score for every rule output.
        #[test]
        fn severity_monotone(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(severity_for(lo) <= severity_for(hi));
        }
    }
}
