//! Model identifier normalization for aggregated stats.
//!
//! Configs, telemetry and store documents refer to the same model under
//! different identifiers (gateway-prefixed ids, short names from older
//! configs). Aggregation keys on the canonical display name. Unknown
//! identifiers pass through unchanged.

use std::collections::HashMap;
use std::sync::LazyLock;

// canonical name → known aliases (the canonical name matches itself).
const CANONICAL: &[(&str, &[&str])] = &[
    ("claude-opus-4.6", &["anthropic/claude-opus-4.6", "opus-4.6", "opus"]),
    ("claude-sonnet-4.5", &["anthropic/claude-sonnet-4.5", "sonnet-4.5", "sonnet"]),
    ("haiku-4.5", &["anthropic/claude-haiku-4.5", "haiku-4-5", "haiku"]),
    ("gpt-5", &["openai/gpt-5"]),
    ("gpt-4o", &["openai/gpt-4o"]),
    ("gpt-4o-mini", &["openai/gpt-4o-mini"]),
    ("o4-mini", &["openai/o4-mini"]),
    ("gemini-2.5-pro", &["google/gemini-2.5-pro"]),
    ("gemini-2.5-flash", &["google/gemini-2.5-flash", "gemini-flash"]),
    ("deepseek-r1", &["deepseek/deepseek-r1"]),
    ("deepseek-v3", &["deepseek/deepseek-chat"]),
    ("grok-3", &["x-ai/grok-3"]),
    ("grok-3-mini", &["x-ai/grok-3-mini", "x-ai/grok-3-mini-beta"]),
    ("llama-4-maverick", &["meta-llama/llama-4-maverick"]),
    ("llama-4-scout", &["meta-llama/llama-4-scout", "llama-scout"]),
    ("mistral-large-3", &["mistralai/mistral-large", "mistral-large", "mistral"]),
    ("mistral-small", &["mistralai/mistral-small-3.1-24b-instruct"]),
    ("qwen3-235b", &["qwen/qwen3-235b-a22b"]),
    ("kimi-k2", &["moonshotai/kimi-k2-thinking"]),
];

static ALIAS_MAP: LazyLock<HashMap<String, &'static str>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (canonical, aliases) in CANONICAL {
        map.insert(canonical.to_lowercase(), *canonical);
        for alias in *aliases {
            map.insert(alias.to_lowercase(), *canonical);
        }
    }
    map
});

/// Normalize a model identifier to its canonical display name.
/// Matching is case-insensitive; unknown names are returned unchanged.
pub fn normalize(model_name: &str) -> String {
    ALIAS_MAP
        .get(&model_name.to_lowercase())
        .map(|s| (*s).to_string())
        .unwrap_or_else(|| model_name.to_string())
}
