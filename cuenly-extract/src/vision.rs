//! C8: the LLM-vision fallback extractor. Consults the result cache (C13)
//! first, rasterizes the first page, runs a quick OCR pass to filter out
//! delivery notes, then prompts a vision-capable LLM for a structured
//! invoice record.

use std::time::Duration;

use async_trait::async_trait;
use cuenly_common::model::Currency;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::cache::ResultCache;

const LLM_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_MIN: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

const REMISION_KEYWORDS: &[&str] = &[
    "nota de remisión",
    "remisión electrónica",
    "nota de entrega",
    "remisión de mercaderías",
];

const FATAL_MARKERS: &[&str] = &["invalid api key", "authentication", "insufficient quota", "billing"];
const RETRYABLE_MARKERS: &[&str] = &["timeout", "rate limit", "5xx", "connection"];

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("document appears to be a remisión (delivery note), not a fiscal invoice")]
    Remision,
    #[error("AI quota already reached for this tenant")]
    QuotaReached,
    #[error("LLM call failed fatally: {0}")]
    Fatal(String),
    #[error("LLM call failed after retries: {0}")]
    Retryable(String),
    #[error("could not locate a JSON object in the model's response")]
    NoJsonFound,
}

/// Rasterizes a PDF's first page to a JPEG at ~300 DPI. Implemented by the
/// binary (backed by whatever native PDF renderer is available); this
/// crate only depends on the narrow trait.
#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    async fn rasterize_first_page(&self, pdf_bytes: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// A quick OCR pass used only to detect remisión keywords before spending
/// an LLM call; accuracy beyond that is not required.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn quick_text(&self, jpeg_bytes: &[u8]) -> anyhow::Result<String>;
}

/// Pre-flight AI-quota check plus atomic increment, backed by the user
/// repository.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Returns `true` if quota is available. Must be checked *before* the
    /// LLM is called.
    async fn has_quota(&self, owner_email: &str) -> anyhow::Result<bool>;
    async fn increment_processed(&self, owner_email: &str) -> anyhow::Result<()>;
}

/// The minimal surface this module needs from an OpenAI-compatible chat
/// completions endpoint.
#[async_trait]
pub trait VisionLlmClient: Send + Sync {
    async fn complete_json(
        &self,
        image_jpeg: &[u8],
        ocr_hint: Option<&str>,
        temperature: f32,
    ) -> Result<String, VisionError>;
}

pub struct VisionExtractor<R, O, Q, L> {
    cache: ResultCache,
    rasterizer: R,
    ocr: O,
    quota: Q,
    llm: L,
}

impl<R, O, Q, L> VisionExtractor<R, O, Q, L>
where
    R: PdfRasterizer,
    O: OcrEngine,
    Q: QuotaGate,
    L: VisionLlmClient,
{
    pub fn new(cache: ResultCache, rasterizer: R, ocr: O, quota: Q, llm: L) -> Self {
        Self {
            cache,
            rasterizer,
            ocr,
            quota,
            llm,
        }
    }

    #[instrument(skip(self, pdf_bytes))]
    pub async fn extract_from_pdf(
        &self,
        pdf_bytes: &[u8],
        owner_email: &str,
    ) -> Result<Value, VisionError> {
        let content_hash = cuenly_common::sha256::digest(pdf_bytes);
        let identifier = hex_digest(content_hash.as_ref());

        if let Some(cached) = self.cache.get(&identifier).await {
            return Ok(cached);
        }

        if !self
            .quota
            .has_quota(owner_email)
            .await
            .map_err(|e| VisionError::Fatal(e.to_string()))?
        {
            return Err(VisionError::QuotaReached);
        }

        let jpeg = self
            .rasterizer
            .rasterize_first_page(pdf_bytes)
            .await
            .map_err(|e| VisionError::Fatal(e.to_string()))?;

        let ocr_text = self.ocr.quick_text(&jpeg).await.ok();
        if let Some(text) = &ocr_text {
            let lower = text.to_lowercase();
            if REMISION_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
                return Err(VisionError::Remision);
            }
        }

        let temperature = if ocr_text.is_some() { 0.3 } else { 0.1 };
        let raw_response = self
            .call_with_retry(&jpeg, ocr_text.as_deref(), temperature)
            .await?;

        let extracted = extract_and_normalize_json(&raw_response)?;

        self.quota
            .increment_processed(owner_email)
            .await
            .map_err(|e| VisionError::Fatal(e.to_string()))?;

        self.cache.put(&identifier, "OPENAI_VISION", extracted.clone()).await;
        Ok(extracted)
    }

    async fn call_with_retry(
        &self,
        jpeg: &[u8],
        ocr_hint: Option<&str>,
        temperature: f32,
    ) -> Result<String, VisionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(
                LLM_TIMEOUT,
                self.llm.complete_json(jpeg, ocr_hint, temperature),
            )
            .await;

            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(VisionError::Retryable("LLM call timed out".to_string())),
            };

            match outcome {
                Ok(text) => return Ok(text),
                Err(e @ VisionError::Fatal(_)) => return Err(e),
                Err(e) if attempt >= MAX_ATTEMPTS => return Err(e),
                Err(e) => {
                    let backoff = random_backoff();
                    warn!(attempt, error = %e, backoff_ms = backoff.as_millis(), "LLM call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn random_backoff() -> Duration {
    let min = BACKOFF_MIN.as_millis() as u64;
    let max = BACKOFF_MAX.as_millis() as u64;
    let millis = rand::thread_rng().gen_range(min..=max);
    Duration::from_millis(millis)
}

/// Classifies an LLM error message as fatal or retryable per the fixed
/// keyword lists.
pub fn classify_llm_error(message: &str) -> VisionError {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|kw| lower.contains(kw)) {
        VisionError::Fatal(message.to_string())
    } else if RETRYABLE_MARKERS.iter().any(|kw| lower.contains(kw)) {
        VisionError::Retryable(message.to_string())
    } else {
        VisionError::Retryable(message.to_string())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    cuenly_common::hex::encode(bytes)
}

/// Numeric fields on the top-level invoice object that may arrive as
/// comma- or period-formatted strings.
const NUMERIC_FIELDS: &[&str] =
    &["gravado_5", "gravado_10", "exento", "iva_5", "iva_10", "total", "tipo_cambio"];
/// Numeric fields on each `items[]` entry.
const ITEM_NUMERIC_FIELDS: &[&str] = &["cantidad", "precio_unitario", "total"];

/// Tolerant JSON extraction: strips code fences, locates the first
/// balanced `{...}` block, then normalizes loosely-typed fields (`"None"`
/// → null, comma/period number styles, IVA percent-vs-amount confusion,
/// and the net/vat/gross backfill per bracket).
fn extract_and_normalize_json(raw: &str) -> Result<Value, VisionError> {
    let stripped = strip_code_fences(raw);
    let json_slice = locate_json_object(&stripped).ok_or(VisionError::NoJsonFound)?;
    let mut value: Value =
        serde_json::from_str(json_slice).map_err(|_| VisionError::NoJsonFound)?;
    normalize_value(&mut value);
    normalize_invoice_fields(&mut value);
    Ok(value)
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.trim().trim_end_matches("```").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Locates the first balanced `{...}` block via brace counting, ignoring
/// braces inside string literals. More robust than a first-`{`/last-`}`
/// slice when the model appends trailing prose that itself contains
/// braces (code samples, set notation, stray commentary).
fn locate_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut end = None;

    for (i, ch) in s.char_indices() {
        if i < start {
            continue;
        }
        if in_string {
            match ch {
                '\\' if !escape => escape = true,
                '"' if !escape => in_string = false,
                _ => escape = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    end.map(|e| &s[start..=e])
}

/// Nulls out loosely-typed "absent" markers (`"none"`, `"null"`, empty
/// string), case-insensitively and trimmed, the way the vision model
/// emits them in place of a JSON `null`.
fn normalize_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty()
                || trimmed.eq_ignore_ascii_case("none")
                || trimmed.eq_ignore_ascii_case("null")
            {
                *value = Value::Null;
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                normalize_value(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                normalize_value(item);
            }
        }
        _ => {}
    }
}

/// Number-style and IVA-consistency normalization: disambiguates
/// comma/period decimal separators, coerces the currency literal, fixes
/// per-item IVA percent-vs-amount confusion, and backfills the tax
/// base/total when only the VAT amount (or neither) is present.
fn normalize_invoice_fields(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else { return };

    for &field in NUMERIC_FIELDS {
        normalize_numeric_field(obj, field);
    }

    if let Some(raw_moneda) = obj.get("moneda").and_then(Value::as_str) {
        let normalized = Currency::normalize(raw_moneda);
        if let Ok(encoded) = serde_json::to_value(normalized) {
            obj.insert("moneda".to_string(), encoded);
        }
    }

    let iva_5 = decimal_field(obj, "iva_5");
    let iva_10 = decimal_field(obj, "iva_10");

    if let Some(items) = obj.get_mut("items").and_then(Value::as_array_mut) {
        for item in items {
            let Some(item_obj) = item.as_object_mut() else { continue };
            for &field in ITEM_NUMERIC_FIELDS {
                normalize_numeric_field(item_obj, field);
            }
            coerce_item_iva_rate(item_obj, iva_5, iva_10);
        }
    }

    backfill_bases_from_iva(obj, iva_5, iva_10);
    backfill_total_if_missing(obj);
}

fn normalize_numeric_field(obj: &mut Map<String, Value>, key: &str) {
    let Some(Value::String(s)) = obj.get(key) else { return };
    if let Some(normalized) = normalize_numeric_string(s) {
        obj.insert(key.to_string(), Value::String(normalized));
    }
}

/// Disambiguates decimal separators the way hand-typed Paraguayan amounts
/// arrive: if there's exactly one comma, every period is a thousands
/// separator and the comma is the decimal point (`1.234,56` and `1234,56`
/// both become `1234.56`); otherwise every comma is treated as a decimal
/// point and periods are left alone.
fn normalize_numeric_string(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let comma_count = cleaned.matches(',').count();
    let normalized = if comma_count == 1 {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned.replace(',', ".")
    };
    Some(normalized)
}

fn decimal_field(obj: &Map<String, Value>, key: &str) -> Decimal {
    obj.get(key).and_then(value_to_decimal).unwrap_or(Decimal::ZERO)
}

fn value_to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
        _ => None,
    }
}

/// When a line item's `iva_rate` isn't one of the three valid SIFEN
/// brackets (0/5/10) — the model sometimes emits the VAT amount or a
/// percent sign instead of a bare bracket — coerce it to whichever
/// bracket the invoice-level totals say is in effect. Ambiguous (both or
/// neither bucket populated) is left at the exempt bracket rather than
/// guessed.
fn coerce_item_iva_rate(item: &mut Map<String, Value>, iva_5: Decimal, iva_10: Decimal) {
    if matches!(item.get("iva_rate").and_then(Value::as_u64), Some(0) | Some(5) | Some(10)) {
        return;
    }
    let bracket = match (iva_5.is_zero(), iva_10.is_zero()) {
        (false, true) => 5u64,
        (true, false) => 10u64,
        _ => 0u64,
    };
    item.insert("iva_rate".to_string(), Value::from(bracket));
}

/// `gravado_5 = iva_5 * 20`, `gravado_10 = iva_10 * 10` when only the VAT
/// amount is present — the same fixed-rate relationship the XML parser
/// backfills, kept in sync so both extraction paths agree on what
/// "gravado" means once they reach the same canonical header.
fn backfill_bases_from_iva(obj: &mut Map<String, Value>, iva_5: Decimal, iva_10: Decimal) {
    let gravado_5 = decimal_field(obj, "gravado_5");
    if gravado_5.is_zero() && !iva_5.is_zero() {
        obj.insert("gravado_5".to_string(), Value::String((iva_5 * Decimal::from(20)).to_string()));
    }
    let gravado_10 = decimal_field(obj, "gravado_10");
    if gravado_10.is_zero() && !iva_10.is_zero() {
        obj.insert("gravado_10".to_string(), Value::String((iva_10 * Decimal::from(10)).to_string()));
    }
}

fn backfill_total_if_missing(obj: &mut Map<String, Value>) {
    let total = decimal_field(obj, "total");
    if total > Decimal::ZERO {
        return;
    }
    let exento = decimal_field(obj, "exento");
    let gravado_5 = decimal_field(obj, "gravado_5");
    let gravado_10 = decimal_field(obj, "gravado_10");
    let iva_5 = decimal_field(obj, "iva_5");
    let iva_10 = decimal_field(obj, "iva_10");
    let computed = exento + gravado_5 + iva_5 + gravado_10 + iva_10;
    obj.insert("total".to_string(), Value::String(computed.to_string()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_fatal_markers() {
        assert!(matches!(
            classify_llm_error("Error: invalid api key provided"),
            VisionError::Fatal(_)
        ));
        assert!(matches!(
            classify_llm_error("insufficient_quota: billing issue"),
            VisionError::Fatal(_)
        ));
    }

    #[test]
    fn classify_retryable_markers() {
        assert!(matches!(
            classify_llm_error("request timeout"),
            VisionError::Retryable(_)
        ));
        assert!(matches!(
            classify_llm_error("rate limit exceeded"),
            VisionError::Retryable(_)
        ));
    }

    #[test]
    fn strips_code_fences_and_locates_object() {
        let raw = "```json\n{\"a\": 1}\n```";
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn normalizes_none_string_to_null() {
        let raw = r#"{"cdc": "None", "total": 1000}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert!(value["cdc"].is_null());
    }

    #[test]
    fn locates_json_embedded_in_prose() {
        let raw = "Here is the result: {\"a\": 1} — let me know if you need anything else.";
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn balanced_brace_search_ignores_trailing_prose_with_braces() {
        let raw = r#"{"a": {"b": 1}} and here's a set literal: {1, 2, 3}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["a"]["b"], 1);
    }

    #[test]
    fn balanced_brace_search_ignores_braces_inside_strings() {
        let raw = r#"{"descripcion": "set {not json}", "total": 5}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["descripcion"], "set {not json}");
    }

    #[test]
    fn normalizes_comma_decimal_separator() {
        let raw = r#"{"total": "1.234,56"}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["total"], "1234.56");
    }

    #[test]
    fn normalizes_thousands_dot_with_single_comma() {
        let raw = r#"{"total": "1.234.567,89"}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["total"], "1234567.89");
    }

    #[test]
    fn backfills_gravado_from_iva_when_absent() {
        let raw = r#"{"iva_10": "20000"}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["gravado_10"], "200000");
    }

    #[test]
    fn backfills_total_when_missing() {
        let raw = r#"{"exento": "100", "gravado_10": "1000", "iva_10": "100"}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["total"], "1200");
    }

    #[test]
    fn coerces_item_iva_percent_to_matching_bracket() {
        let raw = r#"{"iva_10": "100", "items": [{"iva_rate": 4500}]}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["items"][0]["iva_rate"], 10);
    }

    #[test]
    fn leaves_valid_item_iva_rate_untouched() {
        let raw = r#"{"iva_5": "10", "iva_10": "20", "items": [{"iva_rate": 5}]}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["items"][0]["iva_rate"], 5);
    }

    #[test]
    fn currency_literal_is_normalized_in_place() {
        let raw = r#"{"moneda": "Guaranies"}"#;
        let value = extract_and_normalize_json(raw).unwrap();
        assert_eq!(value["moneda"], "PYG");
    }
}
