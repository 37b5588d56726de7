//! Product line-item extraction through an external LLM. The contract is
//! fixed: raw document text in, a JSON array of line items out. A missing
//! API key disables the extractor; malformed model output degrades to an
//! empty list with a `products_extraction_failed` marker — the pipeline
//! never fails because of this side service.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";
const MAX_TEXT_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You are a procurement document parser. You receive raw text \
extracted from a Macedonian public-procurement document and return ONLY a JSON array of \
line items. Each element: {\"name\": string, \"quantity\": number|null, \"unit\": string|null, \
\"unit_price\": number|null, \"total_price\": number|null, \"specifications\": string|null, \
\"category\": string|null}. Return [] when the document has no product table. No prose.";

/// One extracted line item, exactly as the contract defines it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDraft {
    pub name: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub specifications: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug)]
pub struct ExtractionReply {
    pub items: Vec<ProductDraft>,
    /// Set when the model answered but the answer did not parse.
    pub extraction_failed: bool,
}

pub struct ProductExtractor {
    client: reqwest::Client,
    api_key: String,
}

impl ProductExtractor {
    /// None when no API key is configured — the caller degrades to
    /// "no product items extracted".
    pub fn from_key(api_key: Option<String>) -> Option<Self> {
        let api_key = api_key?;
        info!("Product-item extraction enabled");
        Some(ProductExtractor {
            client: reqwest::Client::new(),
            api_key,
        })
    }

    pub async fn extract(&self, document_text: &str) -> Result<ExtractionReply> {
        let truncated = if document_text.len() > MAX_TEXT_CHARS {
            let mut cut = MAX_TEXT_CHARS;
            while !document_text.is_char_boundary(cut) {
                cut -= 1;
            }
            &document_text[..cut]
        } else {
            document_text
        };

        let request_body = json!({
            "model": MODEL,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": truncated}
            ],
            "max_tokens": 2000,
            "temperature": 0.1
        });

        let response = self
            .client
            .post(OPENAI_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("product extraction API error: {}", error_text));
        }

        let response_json: Value = response.json().await?;
        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("no content in model response"))?;

        Ok(parse_reply(content))
    }
}

/// Parse the model's answer. Code fences and stray prose around the array
/// are tolerated; anything that still fails to parse flags the document.
pub fn parse_reply(content: &str) -> ExtractionReply {
    let cleaned = strip_code_fence(content);
    let json_slice = match (cleaned.find('['), cleaned.rfind(']')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => {
            warn!("Model reply carried no JSON array");
            return ExtractionReply {
                items: Vec::new(),
                extraction_failed: true,
            };
        }
    };
    match serde_json::from_str::<Vec<ProductDraft>>(json_slice) {
        Ok(items) => ExtractionReply {
            items,
            extraction_failed: false,
        },
        Err(e) => {
            warn!("Model reply did not parse as line items: {}", e);
            ExtractionReply {
                items: Vec::new(),
                extraction_failed: true,
            }
        }
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```").trim())
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_array() {
        let reply = parse_reply(
            r#"[{"name": "Хартија А4", "quantity": 200, "unit": "рис", "unit_price": 250.0}]"#,
        );
        assert!(!reply.extraction_failed);
        assert_eq!(reply.items.len(), 1);
        assert_eq!(reply.items[0].name, "Хартија А4");
        assert_eq!(reply.items[0].quantity, Some(200.0));
    }

    #[test]
    fn parses_fenced_array() {
        let reply = parse_reply("```json\n[{\"name\": \"Тонер\"}]\n```");
        assert!(!reply.extraction_failed);
        assert_eq!(reply.items.len(), 1);
    }

    #[test]
    fn empty_array_is_not_a_failure() {
        let reply = parse_reply("[]");
        assert!(!reply.extraction_failed);
        assert!(reply.items.is_empty());
    }

    #[test]
    fn malformed_reply_degrades_with_flag() {
        let reply = parse_reply("The document contains office supplies.");
        assert!(reply.extraction_failed);
        assert!(reply.items.is_empty());

        let broken = parse_reply(r#"[{"name": "x", quantity: }]"#);
        assert!(broken.extraction_failed);
    }
}
