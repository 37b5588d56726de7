//! Listing-page parsing: tender rows off the notice grid (even/odd row
//! classes) and the pager geometry.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};

const BASE_URL: &str = "https://www.e-nabavki.gov.mk";

#[derive(Debug, Clone)]
pub struct ListingRow {
    pub tender_number: Option<String>,
    pub title: String,
    pub detail_url: String,
    /// Hash of the row markup, used as the incremental-mode source hash.
    pub source_hash: String,
}

static ROW_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("#MainContent_grdDossie tr.rgRow, #MainContent_grdDossie tr.rgAltRow")
        .expect("listing row selector")
});
static CELL_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("td selector"));
static LINK_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("a selector"));
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+/[0-9]{4}").expect("number regex"));
static PAGER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"од\s+([0-9]+)").expect("pager regex"));

pub fn parse_listing(html: &str) -> Vec<ListingRow> {
    let doc = Html::parse_document(html);
    let mut rows = Vec::new();

    for row in doc.select(&ROW_SEL) {
        let link = row.select(&LINK_SEL).find(|a| {
            a.value()
                .attr("href")
                .map(|h| (h.contains("Dossie") || h.contains("dossie")) && !h.starts_with("javascript:"))
                .unwrap_or(false)
        });
        let link = match link {
            Some(link) => link,
            None => continue,
        };
        let detail_url = absolutize(link.value().attr("href").unwrap_or_default());
        let title = link
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let cells: Vec<String> = row
            .select(&CELL_SEL)
            .map(|c| {
                c.text()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        let row_text = cells.join(" | ");
        let tender_number = NUMBER_RE.find(&row_text).map(|m| m.as_str().to_string());

        rows.push(ListingRow {
            tender_number,
            title,
            detail_url,
            source_hash: hash_row(&row.html()),
        });
    }
    rows
}

/// Total page count: the pager label when present, otherwise the number
/// of options in the page dropdown.
pub fn total_pages(html: &str) -> i64 {
    let doc = Html::parse_document(html);

    if let Ok(sel) = Selector::parse("#MainContent_lblPageCount") {
        if let Some(label) = doc.select(&sel).next() {
            let text = label.text().collect::<Vec<_>>().join(" ");
            if let Some(caps) = PAGER_RE.captures(&text) {
                if let Ok(n) = caps[1].parse::<i64>() {
                    return n.max(1);
                }
            }
        }
    }

    if let Ok(sel) = Selector::parse("#MainContent_ddlPage option") {
        let count = doc.select(&sel).count() as i64;
        if count > 0 {
            return count;
        }
    }
    1
}

fn absolutize(href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{}/{}", BASE_URL, href.trim_start_matches('/'))
    }
}

fn hash_row(row_html: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(row_html.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_HTML: &str = r#"
    <table id="MainContent_grdDossie">
      <tr class="rgRow">
        <td>05231/2024</td>
        <td><a href="/PublicAccess/Dossie/Details.aspx?id=101">Набавка на медицински материјали</a></td>
        <td>Министерство за здравство</td>
        <td>01.03.2024</td>
      </tr>
      <tr class="rgAltRow">
        <td>05232/2024</td>
        <td><a href="/PublicAccess/Dossie/Details.aspx?id=102">Одржување на софтвер</a></td>
        <td>Општина Центар</td>
        <td>02.03.2024</td>
      </tr>
    </table>
    <span id="MainContent_lblPageCount">Страница 1 од 387</span>
    "#;

    #[test]
    fn parses_even_and_odd_rows() {
        let rows = parse_listing(LISTING_HTML);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tender_number.as_deref(), Some("05231/2024"));
        assert!(rows[0].detail_url.ends_with("Details.aspx?id=101"));
        assert_ne!(rows[0].source_hash, rows[1].source_hash);
    }

    #[test]
    fn reads_pager_total() {
        assert_eq!(total_pages(LISTING_HTML), 387);
        assert_eq!(total_pages("<html></html>"), 1);
    }
}
