//! Anthropic-style messages adapter.
//!
//! The response's mixed content list is folded: blocks tagged
//! `"thinking"` populate `reasoning_text`, blocks tagged `"text"`
//! concatenate into `raw_text`.

use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{
    AdapterError, AdapterErrorKind, AdapterResponse, Message, ModelAdapter, QueryContext,
    RATE_LIMIT_BACKOFF,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    model_id: String,
    client: Client,
    base_url: String,
    api_key: String,
    temperature: f64,
}

impl AnthropicAdapter {
    pub fn new(
        model_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<String>,
        temperature: f64,
    ) -> Self {
        AnthropicAdapter {
            model_id: model_id.into(),
            client: Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.into(),
            temperature,
        }
    }

    fn err(&self, kind: AdapterErrorKind, details: impl Into<String>) -> AdapterError {
        AdapterError::new(kind, &self.model_id, details)
    }

    fn call_api(
        &self,
        messages: &[Message],
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<MessagesResponse, AdapterError> {
        let body = json!({
            "model": self.model_id,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": self.temperature,
        });

        for attempt in 0..2 {
            let result = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .timeout(timeout)
                .json(&body)
                .send();

            let response = match result {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return Err(self.err(AdapterErrorKind::Timeout, e.to_string()))
                }
                Err(e) => return Err(self.err(AdapterErrorKind::ApiError, e.to_string())),
            };

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == 0 {
                    thread::sleep(RATE_LIMIT_BACKOFF);
                    continue;
                }
                return Err(self.err(AdapterErrorKind::RateLimit, "HTTP 429 after retry"));
            }

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().unwrap_or_default();
                return Err(self.err(AdapterErrorKind::ApiError, format!("HTTP {status}: {text}")));
            }

            return response
                .json::<MessagesResponse>()
                .map_err(|e| self.err(AdapterErrorKind::ApiError, format!("bad response body: {e}")));
        }
        Err(self.err(AdapterErrorKind::ApiError, "max retries exceeded"))
    }
}

impl ModelAdapter for AnthropicAdapter {
    fn query(
        &self,
        messages: &[Message],
        max_tokens: u32,
        timeout: Duration,
        _context: &QueryContext,
    ) -> Result<AdapterResponse, AdapterError> {
        let start = Instant::now();
        let msg = self.call_api(messages, max_tokens, timeout)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut raw_text = String::new();
        let mut reasoning_text = None;
        for block in msg.content {
            match block {
                ContentBlock::Thinking { thinking } => reasoning_text = Some(thinking),
                ContentBlock::Text { text } => raw_text.push_str(&text),
                ContentBlock::Other => {}
            }
        }

        Ok(AdapterResponse {
            raw_text,
            reasoning_text,
            input_tokens: msg.usage.input_tokens,
            output_tokens: msg.usage.output_tokens,
            latency_ms,
            model_id: self.model_id.clone(),
            model_version: msg.model,
        })
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: AnthropicUsage,
    model: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Thinking { thinking: String },
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}
