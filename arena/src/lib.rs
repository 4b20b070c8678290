//! # Arena: a reproducible tournament engine for language-model agents
//!
//! Given a declarative [`TournamentConfig`](config::TournamentConfig),
//! the engine schedules matches, drives each match turn by turn, queries
//! agents over heterogeneous back-ends, enforces legality, survives
//! adversarial and misbehaving agents, and emits structured telemetry
//! for later analysis.
//!
//! It provides:
//! - Match scheduling and execution ([`tournament::TournamentRunner`])
//! - A uniform, failure-mapped adapter layer over model back-ends,
//!   including a deterministic offline adapter for tests
//! - A per-match fidelity referee ruling on retries, turn forfeits and
//!   ejections
//! - A dual-sink telemetry pipeline: an append-only JSONL audit file
//!   per match plus an optional asynchronous document sink
//!
//! Game rules stay outside: each event implements the narrow
//! `GameEngine` contract from the `game-interface` crate and the engine
//! never looks past it.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use arena::config::{AgentConfig, EventConfig, TournamentConfig};
//! use arena::tournament::TournamentRunner;
//! use game_interface::EngineFactory;
//!
//! # fn holdem_factory() -> Arc<dyn EngineFactory> { unimplemented!() }
//! fn main() -> anyhow::Result<()> {
//!     let config = TournamentConfig::new("spring-league", 42)
//!         .with_agent(AgentConfig::offline("caller", "always_call"))
//!         .with_agent(AgentConfig::offline("bluffer", "garbage"))
//!         .with_event(EventConfig::new("holdem").with_rounds(1));
//!
//!     let mut engines: HashMap<String, Arc<dyn EngineFactory>> = HashMap::new();
//!     engines.insert("holdem".to_string(), holdem_factory());
//!
//!     let report = TournamentRunner::new(config, engines)?.run()?;
//!     for entry in &report.standings {
//!         println!("{}: {:.1} pts", entry.agent, entry.league_points);
//!     }
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod logging;
pub mod match_runner;
pub mod model_names;
pub mod parser;
pub mod referee;
pub mod sanitize;
pub mod schedule;
pub mod seed;
pub mod sink;
pub mod telemetry;
pub mod tournament;

pub use game_interface::{EngineFactory, GameEngine, Scores, SeatId, ValidationResult};
