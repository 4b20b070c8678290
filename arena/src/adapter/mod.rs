//! Uniform façade over model back-ends.
//!
//! Every adapter exposes [`ModelAdapter::query`] and maps all back-end
//! failures into [`AdapterError`] with one of three classification tags.
//! No back-end-specific error type ever escapes this boundary; the
//! uniform tag is the entire fault surface the match loop sees.

mod anthropic;
mod offline;
mod openai;
mod openrouter;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicAdapter;
pub use offline::{resolve_strategy, OfflineAdapter, Strategy};
pub use openai::OpenAiAdapter;
pub use openrouter::OpenRouterAdapter;

/// One chat message sent to a back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Ambient data an adapter may hand to an offline strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryContext {
    pub match_seed: i64,
}

/// Immutable response from a model query.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub raw_text: String,
    pub reasoning_text: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: f64,
    pub model_id: String,
    pub model_version: String,
}

/// Classification tag carried by every adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    Timeout,
    RateLimit,
    ApiError,
}

impl std::fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterErrorKind::Timeout => "timeout",
            AdapterErrorKind::RateLimit => "rate_limit",
            AdapterErrorKind::ApiError => "api_error",
        };
        f.write_str(s)
    }
}

/// The single error kind raised by adapters.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} from {model_id}: {details}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub model_id: String,
    pub details: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, model_id: impl Into<String>, details: impl Into<String>) -> Self {
        AdapterError {
            kind,
            model_id: model_id.into(),
            details: details.into(),
        }
    }
}

/// Uniform query interface over heterogeneous back-ends.
///
/// Implementations must honor `timeout`: the match loop delegates
/// shot-clock enforcement of in-flight calls to it.
pub trait ModelAdapter: Send + Sync {
    fn query(
        &self,
        messages: &[Message],
        max_tokens: u32,
        timeout: Duration,
        context: &QueryContext,
    ) -> Result<AdapterResponse, AdapterError>;
}

/// Fixed delay before the single rate-limit retry.
pub(crate) const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);

/// Approximate characters per token, used by the offline adapter.
pub(crate) const CHARS_PER_TOKEN: usize = 4;
