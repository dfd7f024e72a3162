//! Expense-document field extraction.
//!
//! An independent pipeline from the answering engine: reads a base64-encoded
//! receipt or bill image from stdin, asks the multimodal chat model to
//! extract structured fields, and emits exactly one JSON object on stdout —
//! either the parsed fields or `{"error": <message>}`. It never crashes and
//! always exits cleanly with a well-formed JSON object, so callers can pipe
//! it without guarding.
//!
//! Shares the retry/backoff controller with the answering engine, but with
//! the structured-error policy: failures become error payloads instead of
//! degraded answer text.

use anyhow::Result;
use base64::Engine as _;
use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::llm::{self, RetryPolicy};

/// Field-extraction instruction sent alongside the image.
const EXPENSE_PROMPT: &str = "\
You are a financial document parser. Extract the following fields from the \
attached document image:
- total_amount
- date (ISO format)
- organization
- document_number
- payment_method (cash, card, bank transfer, UPI, etc.)
- category (Rent, Education, Medical, Insurance, etc.)
- tax_id (GSTIN or other tax ID, if present)
- is_tax_deductible (true/false)
Return a single JSON object with exactly these keys. Use null for fields \
that are not present.";

/// Run the extraction pipeline: stdin base64 → model → stdout JSON.
pub async fn run_extract(config: &Config) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;

    let payload = extract_fields(config, &input).await;
    println!("{}", payload);
    Ok(())
}

async fn extract_fields(config: &Config, input: &str) -> serde_json::Value {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return error_payload("no input provided on stdin");
    }

    let image = match base64::engine::general_purpose::STANDARD.decode(&cleaned) {
        Ok(bytes) => bytes,
        Err(e) => return error_payload(&format!("invalid base64 input: {}", e)),
    };

    let model = match llm::create_chat_model(&config.llm) {
        Ok(model) => model,
        Err(e) => return error_payload(&e.to_string()),
    };
    let policy = RetryPolicy::from_config(&config.llm);

    let mime = sniff_mime(&image);
    let model_ref = model.as_ref();
    let response = match llm::call_with_retry(&policy, || {
        model_ref.generate_with_image(EXPENSE_PROMPT, &image, mime)
    })
    .await
    {
        Ok(text) => text,
        Err(e) => return error_payload(&format!("extraction model failed: {}", e)),
    };

    parse_model_json(&response)
}

/// Detect the image format from magic bytes; the model only needs a
/// plausible MIME type.
fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else {
        "image/jpeg"
    }
}

/// Parse the model's output as a JSON object, tolerating markdown code
/// fences. Anything else becomes an error payload carrying the raw output.
fn parse_model_json(response: &str) -> serde_json::Value {
    let stripped = strip_code_fences(response);

    match serde_json::from_str::<serde_json::Value>(stripped) {
        Ok(value) if value.is_object() => value,
        Ok(_) | Err(_) => serde_json::json!({
            "error": "model returned invalid JSON",
            "raw": response,
        }),
    }
}

/// Remove a surrounding ```...``` fence, with or without a language tag.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = inner.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line, if any.
    match inner.split_once('\n') {
        Some((first_line, rest)) if !first_line.trim_start().starts_with('{') => rest.trim(),
        _ => inner.trim(),
    }
}

fn error_payload(message: &str) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_object() {
        let value = parse_model_json(r#"{"total_amount": 1200, "category": "Rent"}"#);
        assert_eq!(value["total_amount"], 1200);
        assert_eq!(value["category"], "Rent");
    }

    #[test]
    fn parses_fenced_json_with_language_tag() {
        let value = parse_model_json("```json\n{\"date\": \"2024-03-01\"}\n```");
        assert_eq!(value["date"], "2024-03-01");
    }

    #[test]
    fn parses_fenced_json_without_language_tag() {
        let value = parse_model_json("```\n{\"payment_method\": \"UPI\"}\n```");
        assert_eq!(value["payment_method"], "UPI");
    }

    #[test]
    fn non_object_output_becomes_error_payload() {
        let value = parse_model_json("[1, 2, 3]");
        assert_eq!(value["error"], "model returned invalid JSON");
        assert_eq!(value["raw"], "[1, 2, 3]");
    }

    #[test]
    fn unparseable_output_becomes_error_payload_with_raw() {
        let value = parse_model_json("The total is 1200 rupees.");
        assert_eq!(value["error"], "model returned invalid JSON");
        assert!(value["raw"].as_str().unwrap().contains("1200 rupees"));
    }

    #[test]
    fn sniffs_png_and_defaults_to_jpeg() {
        assert_eq!(sniff_mime(&[0x89, b'P', b'N', b'G', 0x0d]), "image/png");
        assert_eq!(sniff_mime(&[0xff, 0xd8, 0xff]), "image/jpeg");
    }
}
