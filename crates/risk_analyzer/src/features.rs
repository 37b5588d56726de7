//! Per-tender feature extraction, seven families. Pure functions over a
//! [`TenderSnapshot`] and its [`EntityHistory`] — no I/O, so the whole
//! family grid is unit-testable and deterministic.

use chrono::{Datelike, Weekday};
use std::collections::{HashMap, HashSet};

use crate::types::{EntityHistory, FeatureRecord, TenderSnapshot};

/// Category-specific submission-window floors (days). The default covers
/// categories the table does not name.
pub const CATEGORY_DEADLINE_FLOORS: &[(&str, i64)] = &[
    ("Стоки", 14),
    ("Услуги", 10),
    ("Работи", 21),
];
pub const DEFAULT_DEADLINE_FLOOR: i64 = 14;

/// Estimates ending in this many zeros count as "round" — an exact bid
/// match against a non-round estimate is the suspicious case.
const ROUND_MODULUS: f64 = 10_000.0;

pub fn deadline_floor_for(category: Option<&str>) -> i64 {
    category
        .and_then(|c| {
            CATEGORY_DEADLINE_FLOORS
                .iter()
                .find(|(name, _)| c.starts_with(name))
                .map(|(_, days)| *days)
        })
        .unwrap_or(DEFAULT_DEADLINE_FLOOR)
}

pub fn compute_features(snapshot: &TenderSnapshot, history: &EntityHistory) -> FeatureRecord {
    let mut record = FeatureRecord {
        tender_id: snapshot.tender_id,
        category_floor_days: deadline_floor_for(snapshot.category.as_deref()),
        ..FeatureRecord::default()
    };

    competition_features(snapshot, history, &mut record);
    price_features(snapshot, &mut record);
    timing_features(snapshot, &mut record);
    relationship_features(snapshot, history, &mut record);
    procedural_features(snapshot, history, &mut record);
    document_features(snapshot, history, &mut record);
    historical_features(snapshot, history, &mut record);
    integrity_checks(snapshot, &mut record);

    record
}

fn competition_features(
    snapshot: &TenderSnapshot,
    history: &EntityHistory,
    record: &mut FeatureRecord,
) {
    record.bid_count = Some(snapshot.bids.len() as i32);
    record.disqualified_count = Some(snapshot.bids.iter().filter(|b| b.disqualified).count() as i32);

    // Herfindahl-style concentration of this entity's historical awards.
    if !history.awards_24m.is_empty() {
        let mut by_bidder: HashMap<i64, f64> = HashMap::new();
        let mut total = 0.0;
        for (bidder_id, value) in &history.awards_24m {
            *by_bidder.entry(*bidder_id).or_insert(0.0) += value.max(1.0);
            total += value.max(1.0);
        }
        if total > 0.0 {
            let hhi = by_bidder
                .values()
                .map(|v| {
                    let share = v / total;
                    share * share
                })
                .sum::<f64>();
            record.bidder_concentration = Some(hhi);
        }
    }
}

fn price_features(snapshot: &TenderSnapshot, record: &mut FeatureRecord) {
    let winner_value = snapshot.winner().and_then(|w| w.amount);
    let decisive = winner_value.or(snapshot.awarded_value);
    record.decisive_value = decisive.or(snapshot.estimated_value);

    if let (Some(winner), Some(estimate)) = (decisive, snapshot.estimated_value) {
        if estimate > 0.0 {
            record.winner_to_estimate_ratio = Some(winner / estimate);
            record.exact_estimate_match = Some((winner - estimate).abs() < f64::EPSILON);
        }
    }
    if let Some(estimate) = snapshot.estimated_value {
        record.estimate_is_round = Some((estimate % ROUND_MODULUS).abs() < f64::EPSILON);
    }

    let amounts: Vec<f64> = snapshot.bids.iter().filter_map(|b| b.amount).collect();
    if amounts.len() >= 2 {
        record.bid_cv = coefficient_of_variation(&amounts);
    }
}

fn timing_features(snapshot: &TenderSnapshot, record: &mut FeatureRecord) {
    if let (Some(published), Some(closing)) = (snapshot.publication_date, snapshot.closing_date) {
        record.submission_window_days = Some((closing - published).num_days());
    }
    if let Some(closing) = snapshot.closing_date {
        record.closing_on_weekend =
            Some(matches!(closing.weekday(), Weekday::Sat | Weekday::Sun));
    }
}

fn relationship_features(
    snapshot: &TenderSnapshot,
    history: &EntityHistory,
    record: &mut FeatureRecord,
) {
    record.entity_awards_24m = Some(history.awards_24m.len() as i32);

    if let Some(winner) = snapshot.winner() {
        let winner_awards: Vec<&(i64, f64)> = history
            .awards_24m
            .iter()
            .filter(|(bidder_id, _)| *bidder_id == winner.bidder_id)
            .collect();
        record.winner_awards_24m = Some(winner_awards.len() as i32);

        let total: f64 = history.awards_24m.iter().map(|(_, v)| v).sum();
        if total > 0.0 {
            let winner_total: f64 = winner_awards.iter().map(|(_, v)| v).sum();
            record.winner_share_24m = Some(winner_total / total);
        }
    }

    // Shared-address / shared-manager pairs among this tender's bidders.
    if snapshot.bids.len() >= 2 {
        record.shared_address_pairs = Some(shared_pairs(
            snapshot.bids.iter().filter_map(|b| b.address.as_deref()),
        ));
        record.shared_manager_pairs = Some(shared_pairs(
            snapshot.bids.iter().filter_map(|b| b.manager_name.as_deref()),
        ));
    }
}

fn procedural_features(
    snapshot: &TenderSnapshot,
    history: &EntityHistory,
    record: &mut FeatureRecord,
) {
    record.amendments_count = snapshot.amendments_count;

    if let Some(procedure) = &snapshot.procedure_type {
        if history.procedure_total > 0 {
            let used = history
                .procedure_counts
                .get(procedure)
                .copied()
                .unwrap_or(0);
            record.procedure_rarity =
                Some(1.0 - used as f64 / history.procedure_total as f64);
        }
    }
}

fn document_features(
    snapshot: &TenderSnapshot,
    history: &EntityHistory,
    record: &mut FeatureRecord,
) {
    if let Some(text) = &snapshot.spec_text {
        record.spec_length = Some(text.len() as i64);
        if !history.winner_spec_texts.is_empty() {
            let similarity = history
                .winner_spec_texts
                .iter()
                .map(|prior| jaccard_similarity(text, prior))
                .fold(0.0_f64, f64::max);
            record.spec_boilerplate_similarity = Some(similarity);
        }
    }
}

fn historical_features(
    snapshot: &TenderSnapshot,
    history: &EntityHistory,
    record: &mut FeatureRecord,
) {
    if let (Some(value), Some(mean), Some(std)) = (
        snapshot.estimated_value.or(snapshot.awarded_value),
        history.value_mean,
        history.value_stddev,
    ) {
        if std > 0.0 {
            record.value_zscore = Some((value - mean) / std);
        }
    }
    if let (Some(mean), Some(std)) = (history.monthly_count_mean, history.monthly_count_stddev) {
        if std > 0.0 {
            record.frequency_zscore =
                Some((history.current_month_count as f64 - mean) / std);
        }
    }
}

/// Contradictions in the scraped record itself. Admitted at ingestion and
/// surfaced here as a data_integrity flag input.
fn integrity_checks(snapshot: &TenderSnapshot, record: &mut FeatureRecord) {
    let mut violations = Vec::new();
    if let (Some(open), Some(close)) = (snapshot.opening_date, snapshot.closing_date) {
        if close < open {
            violations.push(format!(
                "closing_date {} precedes opening_date {}",
                close, open
            ));
        }
    }
    let winners = snapshot.bids.iter().filter(|b| b.is_winner).count();
    if winners > 1 && snapshot.lot_count == 0 {
        violations.push(format!("{} winners without lots", winners));
    }
    if let (Some(lot_sum), Some(awarded)) = (snapshot.lot_awarded_sum, snapshot.awarded_value) {
        if lot_sum > 0.0 && (lot_sum - awarded).abs() / awarded.max(1.0) > 0.01 {
            violations.push(format!(
                "lot sum {:.2} differs from awarded value {:.2}",
                lot_sum, awarded
            ));
        }
    }
    if snapshot.status == "awarded" && winners == 0 && snapshot.awarded_value.is_none() {
        violations.push("awarded without winner or value".to_string());
    }
    record.integrity_violations = violations;
}

fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return None;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() / mean)
}

fn shared_pairs<'a>(values: impl Iterator<Item = &'a str>) -> i32 {
    let mut counts: HashMap<String, i32> = HashMap::new();
    for value in values {
        let key = value
            .to_uppercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !key.is_empty() {
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts
        .values()
        .filter(|&&c| c >= 2)
        .map(|&c| c * (c - 1) / 2)
        .sum()
}

/// Token-set Jaccard similarity; cheap and good enough to spot reused
/// specification boilerplate.
fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokens(a);
    let set_b: HashSet<String> = tokens(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BidSnapshot;
    use chrono::NaiveDate;

    fn bid(id: i64, name: &str, amount: f64, winner: bool) -> BidSnapshot {
        BidSnapshot {
            bidder_id: id,
            bidder_name: name.to_string(),
            address: None,
            manager_name: None,
            amount: Some(amount),
            is_winner: winner,
            disqualified: false,
        }
    }

    fn snapshot(bids: Vec<BidSnapshot>) -> TenderSnapshot {
        TenderSnapshot {
            tender_id: 1,
            tender_number: "100/2024".to_string(),
            year: 2024,
            entity_id: 7,
            entity_name: "Општина Тест".to_string(),
            category: Some("Стоки".to_string()),
            procedure_type: Some("Отворена постапка".to_string()),
            status: "awarded".to_string(),
            estimated_value: Some(10_000_000.0),
            awarded_value: None,
            publication_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            opening_date: NaiveDate::from_ymd_opt(2024, 3, 20),
            closing_date: NaiveDate::from_ymd_opt(2024, 3, 18),
            amendments_count: Some(0),
            bids,
            lot_count: 0,
            lot_awarded_sum: None,
            spec_text: None,
        }
    }

    #[test]
    fn missing_inputs_stay_none() {
        let snap = TenderSnapshot {
            estimated_value: None,
            publication_date: None,
            closing_date: None,
            bids: vec![],
            ..snapshot(vec![])
        };
        let record = compute_features(&snap, &EntityHistory::default());
        assert_eq!(record.winner_to_estimate_ratio, None);
        assert_eq!(record.submission_window_days, None);
        assert_eq!(record.bid_cv, None);
        assert_eq!(record.winner_share_24m, None);
        // Counts of an empty list are real zeros, not missing data.
        assert_eq!(record.bid_count, Some(0));
    }

    #[test]
    fn window_and_weekend() {
        let mut snap = snapshot(vec![]);
        snap.publication_date = NaiveDate::from_ymd_opt(2025, 3, 1);
        snap.closing_date = NaiveDate::from_ymd_opt(2025, 3, 5);
        let record = compute_features(&snap, &EntityHistory::default());
        assert_eq!(record.submission_window_days, Some(4));
        assert_eq!(record.category_floor_days, 14);
    }

    #[test]
    fn cv_of_tight_bids_is_small() {
        let snap = snapshot(vec![
            bid(1, "А", 1_000_000.0, true),
            bid(2, "Б", 1_001_000.0, false),
            bid(3, "В", 999_500.0, false),
        ]);
        let record = compute_features(&snap, &EntityHistory::default());
        assert!(record.bid_cv.unwrap() < 0.01);
    }

    #[test]
    fn winner_share_from_history() {
        let snap = snapshot(vec![bid(9, "Фаворит", 5_000_000.0, true)]);
        let history = EntityHistory {
            awards_24m: vec![
                (9, 3_000_000.0),
                (9, 2_000_000.0),
                (9, 1_500_000.0),
                (9, 1_000_000.0),
                (9, 500_000.0),
                (4, 2_000_000.0),
                (5, 1_000_000.0),
            ],
            ..EntityHistory::default()
        };
        let record = compute_features(&snap, &history);
        assert_eq!(record.entity_awards_24m, Some(7));
        assert_eq!(record.winner_awards_24m, Some(5));
        assert!(record.winner_share_24m.unwrap() > 0.5);
    }

    #[test]
    fn shared_addresses_counted_in_pairs() {
        let mut snap = snapshot(vec![
            bid(1, "А", 100.0, false),
            bid(2, "Б", 101.0, false),
            bid(3, "В", 102.0, true),
        ]);
        snap.bids[0].address = Some("ул. Партизанска 12, Скопје".to_string());
        snap.bids[1].address = Some("Ул. Партизанска 12, Скопје".to_string());
        let record = compute_features(&snap, &EntityHistory::default());
        assert_eq!(record.shared_address_pairs, Some(1));
        assert_eq!(record.shared_manager_pairs, Some(0));
    }

    #[test]
    fn integrity_violation_on_inverted_dates() {
        let snap = snapshot(vec![]); // closing 18th, opening 20th
        let record = compute_features(&snap, &EntityHistory::default());
        assert_eq!(record.integrity_violations.len(), 1);
    }

    #[test]
    fn boilerplate_similarity_detects_reuse() {
        let text = "Техничка спецификација за набавка на компјутерска опрема процесор меморија диск";
        let mut snap = snapshot(vec![bid(9, "Фаворит", 100.0, true)]);
        snap.spec_text = Some(text.to_string());
        snap.opening_date = None; // keep integrity clean
        let history = EntityHistory {
            winner_spec_texts: vec![text.to_string(), "сосема различен текст".to_string()],
            ..EntityHistory::default()
        };
        let record = compute_features(&snap, &history);
        assert!(record.spec_boilerplate_similarity.unwrap() > 0.9);
    }
}
