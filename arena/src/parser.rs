//! Extract and validate JSON actions from raw model output.
//!
//! Finds the first valid JSON object in the text, validates it against
//! the event's compiled JSON Schema, and flags injection attempts.
//! Models often wrap the answer in prose ("I'll raise.
//! `{"action":"raise","amount":10}`. It's the right move."); taking the
//! first candidate that parses and validates preserves intent without
//! privileging trailing or malformed ones.

use std::sync::LazyLock;

use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::Value;

use crate::sanitize::detect_injection;

// Outermost { ... } spans, permitting one level of nesting.
static JSON_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap());

/// Result of parsing a model's raw output.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub success: bool,
    pub action: Option<Value>,
    pub raw_json: Option<String>,
    pub error: Option<String>,
    pub injection_detected: bool,
}

/// Parse `raw_text` against a schema compiled once per match.
pub fn parse(raw_text: &str, schema: &JSONSchema) -> ParseResult {
    let injection = detect_injection(raw_text);

    let candidates: Vec<&str> = JSON_OBJECT_RE
        .find_iter(raw_text)
        .map(|m| m.as_str())
        .collect();

    if candidates.is_empty() {
        return ParseResult {
            success: false,
            action: None,
            raw_json: None,
            error: Some("No JSON object found in output".to_string()),
            injection_detected: injection,
        };
    }

    let mut last_error = None;
    for candidate in &candidates {
        let parsed: Value = match serde_json::from_str(candidate) {
            Ok(v) => v,
            Err(e) => {
                last_error = Some(format!("JSON parse error: {e}"));
                continue;
            }
        };

        if !parsed.is_object() {
            last_error = Some("JSON value is not an object".to_string());
            continue;
        }

        if let Err(errors) = schema.validate(&parsed) {
            let msg = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            last_error = Some(format!("Schema validation: {msg}"));
            continue;
        }

        return ParseResult {
            success: true,
            action: Some(parsed),
            raw_json: Some((*candidate).to_string()),
            error: None,
            injection_detected: injection,
        };
    }

    ParseResult {
        success: false,
        action: None,
        raw_json: Some(candidates[0].to_string()),
        error: last_error,
        injection_detected: injection,
    }
}
