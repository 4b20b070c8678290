//! Tournament configuration.
//!
//! Immutable after construction. File parsing lives outside the engine;
//! these structs are built programmatically, builder-style.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::referee::EscalationConfig;

/// Which back-end an agent talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Offline,
    OpenAi,
    Anthropic,
    OpenRouter,
}

/// One configured participant: adapter kind, credentials, compute caps.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub provider: Provider,
    /// Canonical model identifier, used for aggregated stats.
    pub model_id: Option<String>,
    /// Offline strategy name; required when `provider` is `Offline`.
    pub strategy: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    /// Routed-adapter attribution.
    pub site_url: Option<String>,
    pub app_name: Option<String>,
    pub temperature: f64,
    pub max_output_tokens: u32,
    /// Per-turn wall-clock budget (the shot clock).
    pub timeout: Duration,
}

impl AgentConfig {
    pub fn offline(name: impl Into<String>, strategy: impl Into<String>) -> Self {
        let name = name.into();
        AgentConfig {
            model_id: Some(name.clone()),
            name,
            provider: Provider::Offline,
            strategy: Some(strategy.into()),
            api_key_env: None,
            base_url: None,
            site_url: None,
            app_name: None,
            temperature: 0.0,
            max_output_tokens: 256,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn remote(
        name: impl Into<String>,
        provider: Provider,
        model_id: impl Into<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        let name = name.into();
        AgentConfig {
            name,
            provider,
            model_id: Some(model_id.into()),
            strategy: None,
            api_key_env: Some(api_key_env.into()),
            base_url: None,
            site_url: None,
            app_name: None,
            temperature: 0.0,
            max_output_tokens: 256,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// A game kind plus its per-event parameters.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub name: String,
    pub weight: u32,
    pub rounds: u32,
    /// Seats per match; events with three or more seat everyone at one
    /// table per round.
    pub seats_per_match: usize,
    /// Engine-specific parameters, passed through to the factory.
    pub params: Value,
}

impl EventConfig {
    pub fn new(name: impl Into<String>) -> Self {
        EventConfig {
            name: name.into(),
            weight: 1,
            rounds: 1,
            seats_per_match: 2,
            params: Value::Null,
        }
    }

    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_seats_per_match(mut self, seats: usize) -> Self {
        self.seats_per_match = seats;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// How matchups are enumerated for each event.
#[derive(Debug, Clone)]
pub enum MatchupFormat {
    /// Every pair of agents meets once per round.
    RoundRobin,
    /// Single elimination; byes advance the odd seed.
    Bracket,
    /// Explicit tables, one inner list of agent names per match.
    Explicit(Vec<Vec<String>>),
}

/// Global compute defaults, overridable per agent.
#[derive(Debug, Clone)]
pub struct ComputeCaps {
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

impl Default for ComputeCaps {
    fn default() -> Self {
        ComputeCaps {
            max_output_tokens: 256,
            timeout: Duration::from_secs(30),
        }
    }
}

/// The whole declarative run description. Read-only once built.
#[derive(Debug, Clone)]
pub struct TournamentConfig {
    pub name: String,
    pub seed: i64,
    pub version: String,
    pub format: MatchupFormat,
    pub agents: BTreeMap<String, AgentConfig>,
    pub events: BTreeMap<String, EventConfig>,
    pub compute_caps: ComputeCaps,
    pub escalation: EscalationConfig,
    pub output_dir: PathBuf,
    pub max_parallel_matches: usize,
    /// Whether the document sink stores prompts verbatim. The file sink
    /// always does.
    pub store_prompts: bool,
}

impl TournamentConfig {
    pub fn new(name: impl Into<String>, seed: i64) -> Self {
        TournamentConfig {
            name: name.into(),
            seed,
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: MatchupFormat::RoundRobin,
            agents: BTreeMap::new(),
            events: BTreeMap::new(),
            compute_caps: ComputeCaps::default(),
            escalation: EscalationConfig::default(),
            output_dir: PathBuf::from("output"),
            max_parallel_matches: 1,
            store_prompts: false,
        }
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn with_event(mut self, event: EventConfig) -> Self {
        self.events.insert(event.name.clone(), event);
        self
    }

    pub fn with_format(mut self, format: MatchupFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_max_parallel_matches(mut self, n: usize) -> Self {
        self.max_parallel_matches = n.max(1);
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_store_prompts(mut self, store: bool) -> Self {
        self.store_prompts = store;
        self
    }

    /// Where match log files for this run land.
    pub fn telemetry_dir(&self) -> PathBuf {
        self.output_dir.join("telemetry")
    }
}

/// Errors raised while building the orchestrator, before any match runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing credential environment variable {var} for agent {agent}")]
    MissingCredential { agent: String, var: String },
    #[error("agent {agent} has no api_key_env configured")]
    NoCredentialConfigured { agent: String },
    #[error("unknown offline strategy {strategy:?} for agent {agent}")]
    UnknownStrategy { agent: String, strategy: String },
    #[error("agent {agent} is offline but has no strategy configured")]
    NoStrategyConfigured { agent: String },
    #[error("no engine factory registered for event {event}")]
    UnknownEvent { event: String },
    #[error("agent {agent} has no model_id configured")]
    NoModelConfigured { agent: String },
    #[error("explicit matchup references unknown agent {agent}")]
    UnknownAgent { agent: String },
}
