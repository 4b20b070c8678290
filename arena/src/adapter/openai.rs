//! OpenAI-compatible chat-completion adapter.
//!
//! Works with the OpenAI API and any compatible endpoint (routed
//! gateways, local servers) via a base-URL override.

use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{
    AdapterError, AdapterErrorKind, AdapterResponse, Message, ModelAdapter, QueryContext,
    RATE_LIMIT_BACKOFF,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    model_id: String,
    client: Client,
    base_url: String,
    api_key: String,
    temperature: f64,
}

impl OpenAiAdapter {
    pub fn new(
        model_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<String>,
        temperature: f64,
        extra_headers: HeaderMap,
    ) -> Self {
        let client = Client::builder()
            .default_headers(extra_headers)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        OpenAiAdapter {
            model_id: model_id.into(),
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.into(),
            temperature,
        }
    }

    fn err(&self, kind: AdapterErrorKind, details: impl Into<String>) -> AdapterError {
        AdapterError::new(kind, &self.model_id, details)
    }

    /// One request, plus a single fixed-delay retry after a rate limit.
    fn call_api(
        &self,
        messages: &[Message],
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<ChatResponse, AdapterError> {
        let body = json!({
            "model": self.model_id,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": self.temperature,
        });

        for attempt in 0..2 {
            let result = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
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
                .json::<ChatResponse>()
                .map_err(|e| self.err(AdapterErrorKind::ApiError, format!("bad response body: {e}")));
        }
        Err(self.err(AdapterErrorKind::ApiError, "max retries exceeded"))
    }
}

impl ModelAdapter for OpenAiAdapter {
    fn query(
        &self,
        messages: &[Message],
        max_tokens: u32,
        timeout: Duration,
        _context: &QueryContext,
    ) -> Result<AdapterResponse, AdapterError> {
        let start = Instant::now();
        let completion = self.call_api(messages, max_tokens, timeout)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.err(AdapterErrorKind::ApiError, "no choices in completion"))?;

        Ok(AdapterResponse {
            raw_text: choice.message.content.unwrap_or_default(),
            reasoning_text: choice.message.reasoning_content,
            input_tokens: completion.usage.prompt_tokens,
            output_tokens: completion.usage.completion_tokens,
            latency_ms,
            model_id: self.model_id.clone(),
            model_version: completion.model,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Usage,
    model: String,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
