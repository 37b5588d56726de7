//! Text and structure extraction from tender documents: PDF (with OCR
//! fallback for scans), Office XML formats, and the specification mining
//! that feeds the analyzer's document features.

pub mod database;
pub mod ocr;
pub mod products;
pub mod worker;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Formats the processor understands. Legacy binary Office files are
/// recognized but skipped — no parser worth its false positives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Pdf,
    Docx,
    Xlsx,
    LegacyOffice,
    Html,
    Unknown,
}

impl DocFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocFormat::Pdf => "application/pdf",
            DocFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocFormat::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            DocFormat::LegacyOffice => "application/msword",
            DocFormat::Html => "text/html",
            DocFormat::Unknown => "application/octet-stream",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocFormat::Pdf => "pdf",
            DocFormat::Docx => "docx",
            DocFormat::Xlsx => "xlsx",
            DocFormat::LegacyOffice => "doc",
            DocFormat::Html => "html",
            DocFormat::Unknown => "bin",
        }
    }
}

/// Sniff the format from magic bytes, falling back to the URL extension.
pub fn detect_format(url: &str, bytes: &[u8]) -> DocFormat {
    if bytes.starts_with(b"%PDF") {
        return DocFormat::Pdf;
    }
    if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        return DocFormat::LegacyOffice;
    }
    if bytes.starts_with(b"PK\x03\x04") {
        // Office Open XML is a zip; look inside to tell docx from xlsx.
        if let Ok(archive) = zip::ZipArchive::new(std::io::Cursor::new(bytes)) {
            let names: Vec<&str> = archive.file_names().collect();
            if names.iter().any(|n| n.starts_with("word/")) {
                return DocFormat::Docx;
            }
            if names.iter().any(|n| n.starts_with("xl/")) {
                return DocFormat::Xlsx;
            }
        }
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
    if head.contains("<html") || head.contains("<!doctype html") {
        return DocFormat::Html;
    }
    let lower = url.split('?').next().unwrap_or(url).to_lowercase();
    match lower.rsplit('.').next() {
        Some("pdf") => DocFormat::Pdf,
        Some("docx") => DocFormat::Docx,
        Some("xlsx") => DocFormat::Xlsx,
        Some("doc") | Some("xls") => DocFormat::LegacyOffice,
        _ => DocFormat::Unknown,
    }
}

pub fn extract_text_from_pdf(pdf_bytes: &[u8]) -> Result<String> {
    let text = pdf_extract::extract_text_from_mem(pdf_bytes)
        .map_err(|e| anyhow!("pdf extraction failed: {}", e))?;
    Ok(text)
}

/// Page-object count in the raw PDF stream. Heuristic, but stable for the
/// portal's generated documents.
pub fn pdf_page_count(pdf_bytes: &[u8]) -> Option<i32> {
    static PAGE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"/Type\s*/Page[^s]").expect("page regex"));
    let haystack = String::from_utf8_lossy(pdf_bytes);
    let count = PAGE_RE.find_iter(&haystack).count();
    if count > 0 {
        Some(count as i32)
    } else {
        None
    }
}

/// A text layer this thin means the PDF is a scan and needs OCR.
pub fn is_scanned_pdf(extracted_text: &str) -> bool {
    extracted_text
        .chars()
        .filter(|c| c.is_alphanumeric())
        .count()
        < 50
}

pub fn extract_docx_text(bytes: &[u8]) -> Result<String> {
    read_zip_xml(bytes, "word/document.xml").map(|xml| strip_xml_tags(&xml))
}

pub fn extract_xlsx_text(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let mut parts = Vec::new();
    let names: Vec<String> = archive.file_names().map(String::from).collect();
    for name in names {
        if name == "xl/sharedStrings.xml" || (name.starts_with("xl/worksheets/") && name.ends_with(".xml"))
        {
            let mut xml = String::new();
            archive.by_name(&name)?.read_to_string(&mut xml)?;
            parts.push(strip_xml_tags(&xml));
        }
    }
    if parts.is_empty() {
        return Err(anyhow!("no worksheet content in xlsx"));
    }
    Ok(parts.join("\n"))
}

fn read_zip_xml(bytes: &[u8], entry: &str) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let mut xml = String::new();
    archive
        .by_name(entry)
        .map_err(|_| anyhow!("{} missing from archive", entry))?
        .read_to_string(&mut xml)?;
    Ok(xml)
}

fn strip_xml_tags(xml: &str) -> String {
    static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));
    // Word wraps runs in <w:t>; a closing tag is a word boundary.
    let spaced = xml.replace("</w:p>", "\n").replace("</w:t>", " ");
    let stripped = TAG_RE.replace_all(&spaced, "");
    stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Structured block mined from a document's text: CPV codes, contacts and
/// deadline phrases the analyzer and the search layer consume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Specifications {
    pub cpv_codes: Vec<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub deadline_phrases: Vec<String>,
    pub spec_length: usize,
}

static CPV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([0-9]{8})(?:-[0-9])?\b").expect("cpv regex"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
});
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?389[\s/\-]?[0-9]{1,2}[\s/\-]?[0-9]{3}[\s/\-]?[0-9]{3,4}").expect("phone regex")
});
static DEADLINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[Рр]ок(?:от)?\s+за\s+[^.]{0,80}|[Кк]раен\s+рок[^.]{0,80})").expect("deadline regex")
});

pub fn mine_specifications(text: &str) -> Specifications {
    let mut cpv_codes: Vec<String> = CPV_RE
        .captures_iter(text)
        .map(|c| c[0].to_string())
        .collect();
    cpv_codes.sort();
    cpv_codes.dedup();

    let mut emails: Vec<String> = EMAIL_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    emails.sort();
    emails.dedup();

    let mut phones: Vec<String> = PHONE_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    phones.sort();
    phones.dedup();

    let deadline_phrases: Vec<String> = DEADLINE_RE
        .find_iter(text)
        .take(10)
        .map(|m| m.as_str().trim().to_string())
        .collect();

    Specifications {
        cpv_codes,
        emails,
        phones,
        deadline_phrases,
        spec_length: text.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pdf_magic() {
        assert_eq!(detect_format("x", b"%PDF-1.7 ..."), DocFormat::Pdf);
    }

    #[test]
    fn detects_legacy_office() {
        assert_eq!(
            detect_format("spec.doc", &[0xD0, 0xCF, 0x11, 0xE0, 0x00]),
            DocFormat::LegacyOffice
        );
    }

    #[test]
    fn falls_back_to_extension() {
        assert_eq!(detect_format("https://x/y/spec.pdf?dl=1", b""), DocFormat::Pdf);
        assert_eq!(detect_format("https://x/y/data", b"garbage"), DocFormat::Unknown);
    }

    #[test]
    fn scanned_pdf_heuristic() {
        assert!(is_scanned_pdf("  \n\u{c}  "));
        assert!(!is_scanned_pdf(&"текст со содржина ".repeat(20)));
    }

    #[test]
    fn mines_cpv_emails_phones() {
        let text = "Набавка по CPV 33140000-3 и 33600000. Контакт: nabavki@zdravstvo.gov.mk, \
                    телефон +389 2 3112 500. Рокот за поднесување на понудите е 15.04.2024.";
        let specs = mine_specifications(text);
        assert_eq!(specs.cpv_codes, vec!["33140000-3", "33600000"]);
        assert_eq!(specs.emails, vec!["nabavki@zdravstvo.gov.mk"]);
        assert_eq!(specs.phones.len(), 1);
        assert_eq!(specs.deadline_phrases.len(), 1);
        assert!(specs.spec_length > 0);
    }

    #[test]
    fn docx_text_extraction() {
        // Build a minimal docx in memory.
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options: zip::write::SimpleFileOptions = Default::default();
            writer.start_file("word/document.xml", options).unwrap();
            use std::io::Write;
            writer
                .write_all(
                    r#"<?xml version="1.0"?><w:document><w:body>
                        <w:p><w:r><w:t>Техничка</w:t></w:r><w:r><w:t>спецификација</w:t></w:r></w:p>
                    </w:body></w:document>"#
                        .as_bytes(),
                )
                .unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(detect_format("spec.docx", &buf), DocFormat::Docx);
        let text = extract_docx_text(&buf).unwrap();
        assert_eq!(text, "Техничка спецификација");
    }

    #[test]
    fn pdf_page_count_heuristic() {
        let fake = b"%PDF-1.4 /Type /Page  << >> /Type /Pages /Type /Page\n";
        assert_eq!(pdf_page_count(fake), Some(2));
        assert_eq!(pdf_page_count(b"%PDF-1.4 nothing"), None);
    }
}
