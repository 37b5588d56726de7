//! Five-level field extraction over a dossier snapshot. For each field the
//! strategies run in order and the first non-empty hit wins:
//!
//! 1. server-rendered control id
//! 2. structural CSS selector
//! 3. label phrase -> adjacent value element
//! 4. regex over the plain-text dump
//! 5. None, with a structured extraction-failure log entry
//!
//! Extraction is deterministic: the same HTML snapshot always yields the
//! same values.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::debug;

/// Which strategy produced a value; recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionLevel {
    ControlId,
    Selector,
    Label,
    Regex,
}

/// Declarative description of one dossier field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Stable server-rendered element id, without the leading '#'.
    pub control_id: Option<&'static str>,
    /// Structural (class-based) CSS selector.
    pub selector: Option<&'static str>,
    /// Label phrases as rendered by the portal; the value sits in the
    /// adjacent cell or sibling.
    pub labels: &'static [&'static str],
    /// Regex with one capture group, run over the plain-text dump.
    pub pattern: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldOutcome {
    pub name: &'static str,
    pub value: Option<String>,
    pub level: Option<ExtractionLevel>,
}

/// A parsed dossier snapshot plus its plain-text dump.
pub struct PageExtractor {
    doc: Html,
    text_dump: String,
    failures: Vec<&'static str>,
}

impl PageExtractor {
    pub fn new(html: &str) -> Self {
        let doc = Html::parse_document(html);
        let text_dump = doc
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        PageExtractor {
            doc,
            text_dump,
            failures: Vec::new(),
        }
    }

    pub fn text_dump(&self) -> &str {
        &self.text_dump
    }

    /// Fields that fell through all five levels in this extractor's
    /// lifetime; flagged into the tender's raw-data blob by the caller.
    pub fn failures(&self) -> &[&'static str] {
        &self.failures
    }

    pub fn field(&mut self, spec: &FieldSpec) -> Option<String> {
        let outcome = self.field_outcome(spec);
        outcome.value
    }

    pub fn field_outcome(&mut self, spec: &FieldSpec) -> FieldOutcome {
        if let Some(id) = spec.control_id {
            if let Some(value) = self.by_control_id(id) {
                return hit(spec.name, value, ExtractionLevel::ControlId);
            }
        }
        if let Some(selector) = spec.selector {
            if let Some(value) = self.by_selector(selector) {
                return hit(spec.name, value, ExtractionLevel::Selector);
            }
        }
        for label in spec.labels {
            if let Some(value) = self.by_label(label) {
                return hit(spec.name, value, ExtractionLevel::Label);
            }
        }
        if let Some(pattern) = spec.pattern {
            if let Some(value) = self.by_regex(pattern) {
                return hit(spec.name, value, ExtractionLevel::Regex);
            }
        }
        debug!(field = spec.name, "extraction_failure: all levels empty");
        self.failures.push(spec.name);
        FieldOutcome {
            name: spec.name,
            value: None,
            level: None,
        }
    }

    fn by_control_id(&self, id: &str) -> Option<String> {
        let selector = Selector::parse(&format!("#{}", css_escape(id))).ok()?;
        let element = self.doc.select(&selector).next()?;
        non_empty(element_text(&element))
    }

    fn by_selector(&self, selector: &str) -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        let element = self.doc.select(&selector).next()?;
        non_empty(element_text(&element))
    }

    /// Locate a label element by visible text, then take the adjacent
    /// value: the next sibling element, or for table layouts the next cell.
    fn by_label(&self, label: &str) -> Option<String> {
        let candidates = Selector::parse("td, th, label, span, dt").ok()?;
        for element in self.doc.select(&candidates) {
            let text = element_text(&element);
            if !text.trim_start().starts_with(label) {
                continue;
            }
            if let Some(value) = adjacent_value(&element) {
                return Some(value);
            }
        }
        None
    }

    fn by_regex(&self, pattern: &str) -> Option<String> {
        let re = Regex::new(pattern).ok()?;
        let caps = re.captures(&self.text_dump)?;
        let m = caps.get(1).or_else(|| caps.get(0))?;
        non_empty(m.as_str().to_string())
    }
}

fn hit(name: &'static str, value: String, level: ExtractionLevel) -> FieldOutcome {
    FieldOutcome {
        name,
        value: Some(value),
        level: Some(level),
    }
}

fn element_text(element: &ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn adjacent_value(label: &ElementRef) -> Option<String> {
    // Table layout: label cell -> next cell in the same row.
    let mut sibling = label.next_sibling();
    while let Some(node) = sibling {
        if let Some(element) = ElementRef::wrap(node) {
            return non_empty(element_text(&element));
        }
        sibling = node.next_sibling();
    }
    // Label element nested in its own wrapper: value is the parent's next
    // element sibling.
    let parent = label.parent()?;
    let mut sibling = parent.next_sibling();
    while let Some(node) = sibling {
        if let Some(element) = ElementRef::wrap(node) {
            return non_empty(element_text(&element));
        }
        sibling = node.next_sibling();
    }
    None
}

/// Escape characters CSS id selectors cannot carry verbatim. The portal's
/// control ids contain '$' in rare templates.
fn css_escape(id: &str) -> String {
    id.chars()
        .flat_map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                vec![c]
            } else {
                vec!['\\', c]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOSSIER_SNIPPET: &str = r#"
        <html><body>
          <span id="MainContent_lblEntityName">Министерство за здравство</span>
          <div class="dossier-number">05231/2024</div>
          <table>
            <tr><td>Проценета вредност</td><td>1.000.000,00 МКД</td></tr>
            <tr><td>Рок за поднесување</td><td>15.04.2024 во 12:00 часот</td></tr>
          </table>
          <p>Шифра CPV: 33600000-6</p>
        </body></html>"#;

    #[test]
    fn control_id_wins_first() {
        let mut page = PageExtractor::new(DOSSIER_SNIPPET);
        let outcome = page.field_outcome(&FieldSpec {
            name: "entity_name",
            control_id: Some("MainContent_lblEntityName"),
            selector: Some(".dossier-entity"),
            labels: &["Договорен орган"],
            pattern: None,
        });
        assert_eq!(outcome.value.as_deref(), Some("Министерство за здравство"));
        assert_eq!(outcome.level, Some(ExtractionLevel::ControlId));
    }

    #[test]
    fn selector_is_second() {
        let mut page = PageExtractor::new(DOSSIER_SNIPPET);
        let outcome = page.field_outcome(&FieldSpec {
            name: "tender_number",
            control_id: Some("MainContent_lblMissing"),
            selector: Some(".dossier-number"),
            labels: &[],
            pattern: None,
        });
        assert_eq!(outcome.value.as_deref(), Some("05231/2024"));
        assert_eq!(outcome.level, Some(ExtractionLevel::Selector));
    }

    #[test]
    fn label_strategy_reads_adjacent_cell() {
        let mut page = PageExtractor::new(DOSSIER_SNIPPET);
        let outcome = page.field_outcome(&FieldSpec {
            name: "estimated_value",
            control_id: None,
            selector: None,
            labels: &["Проценета вредност"],
            pattern: None,
        });
        assert_eq!(outcome.value.as_deref(), Some("1.000.000,00 МКД"));
        assert_eq!(outcome.level, Some(ExtractionLevel::Label));
    }

    #[test]
    fn regex_is_last_resort() {
        let mut page = PageExtractor::new(DOSSIER_SNIPPET);
        let outcome = page.field_outcome(&FieldSpec {
            name: "cpv_code",
            control_id: None,
            selector: None,
            labels: &[],
            pattern: Some(r"CPV[:\s]+([0-9-]+)"),
        });
        assert_eq!(outcome.value.as_deref(), Some("33600000-6"));
        assert_eq!(outcome.level, Some(ExtractionLevel::Regex));
    }

    #[test]
    fn miss_is_recorded_as_failure() {
        let mut page = PageExtractor::new(DOSSIER_SNIPPET);
        let outcome = page.field_outcome(&FieldSpec {
            name: "signing_date",
            control_id: Some("MainContent_lblSigned"),
            selector: Some(".signing-date"),
            labels: &["Датум на склучување"],
            pattern: Some(r"склучен на ([0-9.]+)"),
        });
        assert!(outcome.value.is_none());
        assert_eq!(page.failures(), &["signing_date"]);
    }

    #[test]
    fn extraction_is_deterministic() {
        let spec = FieldSpec {
            name: "deadline",
            control_id: None,
            selector: None,
            labels: &["Рок за поднесување"],
            pattern: None,
        };
        let first = PageExtractor::new(DOSSIER_SNIPPET).field(&spec);
        for _ in 0..10 {
            assert_eq!(PageExtractor::new(DOSSIER_SNIPPET).field(&spec), first);
        }
    }
}
