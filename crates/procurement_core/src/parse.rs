//! Locale-explicit parsers for the values the portals render: Macedonian
//! date strings, European-formatted amounts, and status inference.

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;

use crate::types::{Currency, TenderStatus};

/// Words the portal appends to dates: "10.03.2024 година во 12:00 часот".
static DATE_NOISE: &[&str] = &["година", "год.", "год", "часот", "во"];

static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9][0-9.,]*").expect("amount regex"));

fn strip_date_noise(input: &str) -> String {
    input
        .split_whitespace()
        .filter(|token| !DATE_NOISE.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

/// Parse a portal date. Accepts DD.MM.YYYY, DD/MM/YYYY and ISO, with or
/// without a time tail and Macedonian suffixes.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let cleaned = strip_date_noise(input);
    if cleaned.is_empty() {
        return None;
    }
    if let Some(dt) = parse_datetime(&cleaned) {
        return Some(dt.date());
    }
    for format in ["%d.%m.%Y", "%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, format) {
            return Some(date);
        }
    }
    None
}

/// Parse a portal timestamp; date-only inputs resolve to midnight.
pub fn parse_datetime(input: &str) -> Option<NaiveDateTime> {
    let cleaned = strip_date_noise(input);
    if cleaned.is_empty() {
        return None;
    }
    let formats = [
        "%d.%m.%Y %H:%M:%S",
        "%d.%m.%Y %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ];
    for format in formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, format) {
            return Some(dt);
        }
    }
    for format in ["%d.%m.%Y", "%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, format) {
            return Some(date.and_time(NaiveTime::MIN));
        }
    }
    None
}

/// ISO date the rest of the pipeline stores.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a currency amount in European formatting ("1.234.567,89 МКД").
/// Currency tags recognized: МКД/ден/MKD and EUR/ЕУР/€; MKD is the
/// default when no tag is present. Decimal arithmetic only, no floats.
pub fn parse_amount(input: &str) -> Option<(BigDecimal, Currency)> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let currency = detect_currency(trimmed);
    let digits = AMOUNT_RE.find(trimmed)?.as_str();
    // "." is the thousands separator, "," the decimal mark.
    let normalized = digits.replace('.', "").replace(',', ".");
    let value = BigDecimal::from_str(&normalized).ok()?;
    Some((value, currency))
}

fn detect_currency(input: &str) -> Currency {
    let upper = input.to_uppercase();
    if upper.contains("EUR") || upper.contains("ЕУР") || input.contains('€') {
        Currency::Eur
    } else {
        Currency::Mkd
    }
}

/// Render an amount the way the portal does; inverse of [`parse_amount`]
/// over two-decimal values.
pub fn format_amount(value: &BigDecimal, currency: Currency) -> String {
    let scaled = value.with_scale(2);
    let plain = scaled.to_string();
    let (int_part, frac_part) = match plain.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (plain, "00".to_string()),
    };
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", int_part.as_str()),
    };
    let mut grouped = String::new();
    let bytes = digits.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 && (bytes.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(*b as char);
    }
    let tag = match currency {
        Currency::Mkd => "МКД",
        Currency::Eur => "EUR",
    };
    format!("{}{},{} {}", sign, grouped, frac_part, tag)
}

/// Status inference when the dossier carries no explicit status field:
/// a named winner means awarded, a future deadline means open, else closed.
pub fn infer_status(
    winner: Option<&str>,
    closing_date: Option<NaiveDate>,
    today: NaiveDate,
) -> TenderStatus {
    if winner.map(|w| !w.trim().is_empty()).unwrap_or(false) {
        return TenderStatus::Awarded;
    }
    match closing_date {
        Some(close) if close >= today => TenderStatus::Open,
        _ => TenderStatus::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_dotted_date_with_suffix() {
        assert_eq!(
            parse_date("10.03.2024 година"),
            NaiveDate::from_ymd_opt(2024, 3, 10)
        );
    }

    #[test]
    fn parses_datetime_with_time_suffix() {
        let dt = parse_datetime("15.04.2024 во 12:00 часот").unwrap();
        assert_eq!(dt.date(), NaiveDate::from_ymd_opt(2024, 4, 15).unwrap());
        assert_eq!(dt.format("%H:%M").to_string(), "12:00");
    }

    #[test]
    fn parses_slash_and_iso_dates() {
        assert_eq!(
            parse_date("05/11/2023"),
            NaiveDate::from_ymd_opt(2023, 11, 5)
        );
        assert_eq!(
            parse_date("2023-11-05"),
            NaiveDate::from_ymd_opt(2023, 11, 5)
        );
    }

    #[test]
    fn rejects_garbage_dates() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("неизвестно"), None);
    }

    #[test]
    fn parses_mkd_amount() {
        let (value, currency) = parse_amount("1.234.567,89 МКД").unwrap();
        assert_eq!(value, BigDecimal::from_str("1234567.89").unwrap());
        assert_eq!(currency, Currency::Mkd);
    }

    #[test]
    fn parses_eur_amount() {
        let (value, currency) = parse_amount("€ 5.000,00").unwrap();
        assert_eq!(value, BigDecimal::from_str("5000.00").unwrap());
        assert_eq!(currency, Currency::Eur);
    }

    #[test]
    fn default_currency_is_mkd() {
        let (_, currency) = parse_amount("10.000,00 денари").unwrap();
        assert_eq!(currency, Currency::Mkd);
    }

    #[test]
    fn formats_amount_with_grouping() {
        let value = BigDecimal::from_str("9800000").unwrap();
        assert_eq!(format_amount(&value, Currency::Mkd), "9.800.000,00 МКД");
    }

    #[test]
    fn infer_status_rules() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(
            infer_status(Some("Друштво за градежништво"), None, today),
            TenderStatus::Awarded
        );
        assert_eq!(
            infer_status(None, NaiveDate::from_ymd_opt(2024, 7, 1), today),
            TenderStatus::Open
        );
        assert_eq!(
            infer_status(None, NaiveDate::from_ymd_opt(2024, 5, 1), today),
            TenderStatus::Closed
        );
        assert_eq!(infer_status(None, None, today), TenderStatus::Closed);
    }

    proptest! {
        // format_amount then parse_amount is the identity over the
        // two-decimal currency domain.
        #[test]
        fn amount_round_trip(units in 0i64..1_000_000_000, cents in 0i64..100) {
            let value = BigDecimal::from(units) + BigDecimal::from(cents) / BigDecimal::from(100);
            let rendered = format_amount(&value, Currency::Mkd);
            let (parsed, currency) = parse_amount(&rendered).unwrap();
            prop_assert_eq!(parsed.with_scale(2), value.with_scale(2));
            prop_assert_eq!(currency, Currency::Mkd);
        }

        #[test]
        fn date_round_trip(days in 0i64..20_000) {
            let date = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap()
                + chrono::Duration::days(days);
            let rendered = format_date(date);
            prop_assert_eq!(parse_date(&rendered), Some(date));
        }
    }
}
