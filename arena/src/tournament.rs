//! Tournament orchestration.
//!
//! Builds every adapter up front (configuration problems abort before a
//! single match starts), realizes the schedule, and drives it wave by
//! wave with a bounded worker pool. Each match owns its engine, referee
//! and telemetry logger exclusively; concurrency across matches is
//! coarse-grained and embarrassingly parallel.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::Context;
use reqwest::header::HeaderMap;
use serde_json::json;
use tracing::{info, instrument, warn};

use game_interface::EngineFactory;

use crate::adapter::{
    resolve_strategy, AnthropicAdapter, ModelAdapter, OfflineAdapter, OpenAiAdapter,
    OpenRouterAdapter,
};
use crate::config::{AgentConfig, ConfigError, Provider, TournamentConfig};
use crate::match_runner::{run_match, MatchDescriptor, MatchOutcome, MatchSettings};
use crate::schedule::{match_id, seat_id, Schedule, Seating, WinnerSource};
use crate::seed::SeedManager;
use crate::sink::{DocumentSink, DocumentStore, SinkItem};
use crate::telemetry::now_rfc3339;

/// One agent's row in the final table. Two-player events score 3/1/0
/// league points; multiplayer events score positionally.
#[derive(Debug, Clone)]
pub struct StandingsEntry {
    pub agent: String,
    pub played: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub points_for: f64,
    pub points_against: f64,
    pub league_points: f64,
}

impl StandingsEntry {
    fn new(agent: &str) -> Self {
        StandingsEntry {
            agent: agent.to_string(),
            played: 0,
            wins: 0,
            draws: 0,
            losses: 0,
            points_for: 0.0,
            points_against: 0.0,
            league_points: 0.0,
        }
    }

    pub fn differential(&self) -> f64 {
        self.points_for - self.points_against
    }
}

/// Aggregate result of the whole run.
#[derive(Debug, Clone)]
pub struct TournamentReport {
    pub tournament: String,
    pub telemetry_dir: PathBuf,
    pub matches: Vec<MatchOutcome>,
    pub standings: Vec<StandingsEntry>,
    pub engine_errors: u32,
}

impl TournamentReport {
    /// Non-zero when any match died on an engine-internal error.
    /// Configuration and file-sink failures never reach a report; they
    /// surface as errors earlier.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.engine_errors > 0)
    }
}

/// Runs a tournament defined by a [`TournamentConfig`].
pub struct TournamentRunner {
    config: TournamentConfig,
    engines: HashMap<String, Arc<dyn EngineFactory>>,
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
    seeds: SeedManager,
    sink: Option<Arc<DocumentSink>>,
    cancel: Arc<AtomicBool>,
}

impl TournamentRunner {
    /// Build the runner, failing fast on any configuration problem:
    /// unknown providers or strategies, missing credentials, events
    /// without a registered engine factory.
    pub fn new(
        config: TournamentConfig,
        engines: HashMap<String, Arc<dyn EngineFactory>>,
    ) -> Result<Self, ConfigError> {
        for event in config.events.keys() {
            if !engines.contains_key(event) {
                return Err(ConfigError::UnknownEvent {
                    event: event.clone(),
                });
            }
        }

        let mut adapters: HashMap<String, Arc<dyn ModelAdapter>> = HashMap::new();
        for (name, agent) in &config.agents {
            adapters.insert(name.clone(), build_adapter(agent)?);
        }

        let seeds = SeedManager::new(config.seed);
        Ok(TournamentRunner {
            config,
            engines,
            adapters,
            seeds,
            sink: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Attach a document store; the background sink spins up now and is
    /// drained when `run` returns.
    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.sink = Some(DocumentSink::start(store));
        self
    }

    /// Replace one agent's adapter, bypassing provider construction.
    /// Test harnesses use this to inject fake latency or canned output.
    pub fn with_adapter(mut self, agent: &str, adapter: Arc<dyn ModelAdapter>) -> Self {
        self.adapters.insert(agent.to_string(), adapter);
        self
    }

    /// Flag checked between turns; setting it cancels in-flight matches
    /// after their current turn and skips the rest of the schedule.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Execute the full schedule and return the aggregate report.
    #[instrument(skip_all, fields(tournament = self.config.name))]
    pub fn run(&self) -> anyhow::Result<TournamentReport> {
        let schedule = Schedule::build(&self.config, &self.seeds).context("building schedule")?;
        let telemetry_dir = self.config.telemetry_dir();
        info!(
            "running {} matches across {} events",
            schedule.match_count(),
            self.config.events.len()
        );

        if let Some(sink) = &self.sink {
            sink.enqueue(SinkItem::Tournament {
                name: self.config.name.clone(),
                doc: json!({
                    "name": self.config.name,
                    "seed": self.config.seed,
                    "version": self.config.version,
                    "events": self.config.events.keys().collect::<Vec<_>>(),
                    "agents": self.config.agents.keys().collect::<Vec<_>>(),
                    "started_at": now_rfc3339(),
                }),
            });
        }

        let mut all_outcomes: Vec<MatchOutcome> = Vec::new();
        let mut prev_wave: Vec<MatchOutcome> = Vec::new();

        for wave in &schedule.waves {
            if self.cancel.load(Ordering::Relaxed) {
                warn!("cancellation requested, skipping remaining waves");
                break;
            }

            let descriptors: Vec<MatchDescriptor> = wave
                .iter()
                .map(|pending| {
                    let agents = resolve_seating(&pending.seating, &prev_wave);
                    MatchDescriptor {
                        match_id: match_id(
                            &pending.event,
                            pending.round,
                            pending.match_index,
                            &agents,
                        ),
                        event: pending.event.clone(),
                        round: pending.round,
                        match_index: pending.match_index,
                        seed: pending.seed,
                        seats: agents
                            .into_iter()
                            .enumerate()
                            .map(|(i, agent)| (seat_id(i), agent))
                            .collect(),
                    }
                })
                .collect();

            let outcomes = self.run_wave(&descriptors, &telemetry_dir)?;
            // One event's waves are contiguous in the schedule, so the
            // previous wave is always the one a bracket slot feeds from.
            prev_wave = outcomes.clone();
            all_outcomes.extend(outcomes);
        }

        if let Some(sink) = &self.sink {
            sink.close();
        }

        let standings = compute_standings(&self.config, &all_outcomes);
        for entry in &standings {
            info!(
                "{}: P{} W{} D{} L{} pts {:.1}",
                entry.agent, entry.played, entry.wins, entry.draws, entry.losses,
                entry.league_points
            );
        }

        let engine_errors = all_outcomes
            .iter()
            .filter(|o| o.engine_error.is_some())
            .count() as u32;

        Ok(TournamentReport {
            tournament: self.config.name.clone(),
            telemetry_dir,
            matches: all_outcomes,
            standings,
            engine_errors,
        })
    }

    /// Run one wave with at most `max_parallel_matches` in flight,
    /// preserving wave order in the returned outcomes.
    fn run_wave(
        &self,
        descriptors: &[MatchDescriptor],
        telemetry_dir: &std::path::Path,
    ) -> anyhow::Result<Vec<MatchOutcome>> {
        let max_parallel = self.config.max_parallel_matches;
        let mut slots: Vec<Option<MatchOutcome>> = vec![None; descriptors.len()];
        let (tx_result, rx_result) = mpsc::channel();

        thread::scope(|scope| -> anyhow::Result<()> {
            let mut queue = descriptors.iter().enumerate();
            let mut in_flight = 0usize;
            loop {
                while in_flight < max_parallel {
                    let Some((idx, descriptor)) = queue.next() else {
                        break;
                    };
                    let tx_result = tx_result.clone();
                    let factory = Arc::clone(&self.engines[&descriptor.event]);
                    let event_params = &self.config.events[&descriptor.event].params;
                    let settings_sink = self.sink.clone();
                    scope.spawn(move || {
                        let result = run_match(MatchSettings {
                            descriptor,
                            factory: factory.as_ref(),
                            event_params,
                            adapters: &self.adapters,
                            agents: &self.config.agents,
                            escalation: self.config.escalation.clone(),
                            telemetry_dir,
                            sink: settings_sink,
                            store_prompts: self.config.store_prompts,
                            tournament_name: &self.config.name,
                            cancel: self.cancel.as_ref(),
                        });
                        let _ = tx_result.send((idx, result));
                    });
                    in_flight += 1;
                }
                if in_flight == 0 {
                    return Ok(());
                }
                let (idx, result) = rx_result.recv().expect("match worker channel closed");
                in_flight -= 1;
                slots[idx] = Some(result?);
            }
        })?;

        Ok(slots
            .into_iter()
            .map(|slot| slot.expect("every wave slot produces an outcome"))
            .collect())
    }
}

/// Fill a slot's seats: fixed tables pass through, bracket slots take
/// the leader of the feeding match from the previous wave.
fn resolve_seating(seating: &Seating, prev_wave: &[MatchOutcome]) -> Vec<String> {
    match seating {
        Seating::Fixed(agents) => agents.clone(),
        Seating::Winners(sources) => sources
            .iter()
            .map(|source| match source {
                WinnerSource::Bye(agent) => agent.clone(),
                WinnerSource::Match(idx) => prev_wave[*idx]
                    .leading_agent()
                    .expect("finished match has a leading agent"),
            })
            .collect(),
    }
}

fn build_adapter(agent: &AgentConfig) -> Result<Arc<dyn ModelAdapter>, ConfigError> {
    let model_id = || -> Result<String, ConfigError> {
        agent
            .model_id
            .clone()
            .ok_or_else(|| ConfigError::NoModelConfigured {
                agent: agent.name.clone(),
            })
    };
    let api_key = || -> Result<String, ConfigError> {
        let var = agent
            .api_key_env
            .clone()
            .ok_or_else(|| ConfigError::NoCredentialConfigured {
                agent: agent.name.clone(),
            })?;
        std::env::var(&var).map_err(|_| ConfigError::MissingCredential {
            agent: agent.name.clone(),
            var,
        })
    };

    match agent.provider {
        Provider::Offline => {
            let name = agent.strategy.clone().ok_or_else(|| {
                ConfigError::NoStrategyConfigured {
                    agent: agent.name.clone(),
                }
            })?;
            let strategy =
                resolve_strategy(&name).ok_or_else(|| ConfigError::UnknownStrategy {
                    agent: agent.name.clone(),
                    strategy: name.clone(),
                })?;
            let model_id = agent.model_id.clone().unwrap_or_else(|| agent.name.clone());
            Ok(Arc::new(OfflineAdapter::new(
                model_id,
                move |m: &[crate::adapter::Message], c: &crate::adapter::QueryContext| {
                    strategy(m, c)
                },
            )))
        }
        Provider::OpenAi => Ok(Arc::new(OpenAiAdapter::new(
            model_id()?,
            api_key()?,
            agent.base_url.clone(),
            agent.temperature,
            HeaderMap::new(),
        ))),
        Provider::Anthropic => Ok(Arc::new(AnthropicAdapter::new(
            model_id()?,
            api_key()?,
            agent.base_url.clone(),
            agent.temperature,
        ))),
        Provider::OpenRouter => Ok(Arc::new(OpenRouterAdapter::new(
            model_id()?,
            api_key()?,
            agent.temperature,
            agent.site_url.as_deref(),
            agent.app_name.as_deref(),
        ))),
    }
}

/// League table across completed matches. Engine-error matches are
/// excluded; forfeited matches count like any other result.
fn compute_standings(config: &TournamentConfig, outcomes: &[MatchOutcome]) -> Vec<StandingsEntry> {
    let mut entries: BTreeMap<String, StandingsEntry> = config
        .agents
        .keys()
        .map(|name| (name.clone(), StandingsEntry::new(name)))
        .collect();

    for outcome in outcomes {
        if outcome.engine_error.is_some() {
            continue;
        }
        for agent in outcome.seat_agents.values() {
            if let Some(entry) = entries.get_mut(agent) {
                entry.played += 1;
            }
        }

        if outcome.seat_agents.len() == 2 {
            let seats: Vec<&String> = outcome.seat_agents.keys().collect();
            let (sa, sb) = (
                outcome.scores.get(seats[0]).copied().unwrap_or(0.0),
                outcome.scores.get(seats[1]).copied().unwrap_or(0.0),
            );
            let (ma, mb) = (
                outcome.seat_agents[seats[0]].clone(),
                outcome.seat_agents[seats[1]].clone(),
            );
            let (pa, pb) = if sa > sb {
                (3.0, 0.0)
            } else if sb > sa {
                (0.0, 3.0)
            } else {
                (1.0, 1.0)
            };
            if let Some(a) = entries.get_mut(&ma) {
                a.league_points += pa;
                a.points_for += sa;
                a.points_against += sb;
                match sa.partial_cmp(&sb) {
                    Some(std::cmp::Ordering::Greater) => a.wins += 1,
                    Some(std::cmp::Ordering::Less) => a.losses += 1,
                    _ => a.draws += 1,
                }
            }
            if let Some(b) = entries.get_mut(&mb) {
                b.league_points += pb;
                b.points_for += sb;
                b.points_against += sa;
                match sb.partial_cmp(&sa) {
                    Some(std::cmp::Ordering::Greater) => b.wins += 1,
                    Some(std::cmp::Ordering::Less) => b.losses += 1,
                    _ => b.draws += 1,
                }
            }
        } else {
            // Positional points: first place gets N, last gets 1; tied
            // scores share the average of their rank points.
            let n = outcome.seat_agents.len();
            let mut ranked: Vec<(&String, f64)> = outcome
                .seat_agents
                .keys()
                .map(|seat| (seat, outcome.scores.get(seat).copied().unwrap_or(0.0)))
                .collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            let mut i = 0;
            while i < ranked.len() {
                let mut j = i;
                while j < ranked.len() && ranked[j].1 == ranked[i].1 {
                    j += 1;
                }
                let avg: f64 =
                    (i..j).map(|k| (n - k) as f64).sum::<f64>() / (j - i) as f64;
                for (seat, score) in &ranked[i..j] {
                    let agent = &outcome.seat_agents[*seat];
                    if let Some(entry) = entries.get_mut(agent) {
                        entry.league_points += avg;
                        entry.points_for += *score;
                    }
                }
                i = j;
            }
        }
    }

    let mut table: Vec<StandingsEntry> = entries.into_values().collect();
    table.sort_by(|a, b| {
        (b.league_points, b.differential(), b.wins)
            .partial_cmp(&(a.league_points, a.differential(), a.wins))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    table
}
