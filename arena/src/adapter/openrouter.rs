//! Routed adapter: OpenAI-compatible wire format with a fixed base URL
//! and optional attribution headers.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{AdapterError, AdapterResponse, Message, ModelAdapter, OpenAiAdapter, QueryContext};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterAdapter {
    inner: OpenAiAdapter,
}

impl OpenRouterAdapter {
    pub fn new(
        model_id: impl Into<String>,
        api_key: impl Into<String>,
        temperature: f64,
        site_url: Option<&str>,
        app_name: Option<&str>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(url) = site_url {
            if let Ok(value) = HeaderValue::from_str(url) {
                headers.insert(HeaderName::from_static("http-referer"), value);
            }
        }
        if let Some(name) = app_name {
            if let Ok(value) = HeaderValue::from_str(name) {
                headers.insert(HeaderName::from_static("x-title"), value);
            }
        }
        OpenRouterAdapter {
            inner: OpenAiAdapter::new(
                model_id,
                api_key,
                Some(OPENROUTER_BASE_URL.to_string()),
                temperature,
                headers,
            ),
        }
    }
}

impl ModelAdapter for OpenRouterAdapter {
    fn query(
        &self,
        messages: &[Message],
        max_tokens: u32,
        timeout: Duration,
        context: &QueryContext,
    ) -> Result<AdapterResponse, AdapterError> {
        self.inner.query(messages, max_tokens, timeout, context)
    }
}
