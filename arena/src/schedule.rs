//! Eager schedule realization.
//!
//! The full match list is built up-front from the configured events and
//! format: `(event, round, match_index)` triples with their derived
//! seeds are fixed before anything runs, so the seed-isolation
//! invariant is inspectable. Bracket slots are enumerated up front too;
//! only their participants resolve as earlier rounds complete, which
//! leaves every slot's seed a pure function of its triple.

use sha2::{Digest, Sha256};

use crate::config::{ConfigError, MatchupFormat, TournamentConfig};
use crate::seed::SeedManager;

/// The most seats any match may have.
pub const MAX_SEATS: usize = 9;

const SEAT_LETTERS: &[u8] = b"abcdefghi";

/// Seat identifier for seat index `i`: `player_a`, `player_b`, ...
pub fn seat_id(i: usize) -> String {
    assert!(i < MAX_SEATS, "seat index {i} out of range");
    format!("player_{}", SEAT_LETTERS[i] as char)
}

/// Stable match identifier: event-prefixed hash of event, round, index
/// and the seated agents.
pub fn match_id(event: &str, round: u32, match_index: u32, agents: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.as_bytes());
    hasher.update(format!(":{round}:{match_index}:").as_bytes());
    hasher.update(agents.join(",").as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("{event}-{hex}")
}

/// Where a bracket slot's participant comes from.
#[derive(Debug, Clone)]
pub enum WinnerSource {
    /// Winner of the given match index in the previous wave of the same
    /// event.
    Match(usize),
    /// A bye: the agent advances without playing.
    Bye(String),
}

/// How a slot gets its seating.
#[derive(Debug, Clone)]
pub enum Seating {
    Fixed(Vec<String>),
    Winners(Vec<WinnerSource>),
}

/// One schedule slot. Seed and triple are fixed at build time; for
/// bracket slots the agents fill in when the feeding wave completes.
#[derive(Debug, Clone)]
pub struct PendingMatch {
    pub event: String,
    pub round: u32,
    pub match_index: u32,
    pub seed: i64,
    pub seating: Seating,
}

/// A wave is a set of matches with no ordering dependencies between
/// them; waves run in order, matches within a wave may run in parallel.
pub type Wave = Vec<PendingMatch>;

#[derive(Debug, Clone)]
pub struct Schedule {
    pub waves: Vec<Wave>,
}

impl Schedule {
    /// Realize the full schedule for every configured event.
    pub fn build(config: &TournamentConfig, seeds: &SeedManager) -> Result<Schedule, ConfigError> {
        let agent_names: Vec<String> = config.agents.keys().cloned().collect();
        let mut waves = Vec::new();

        for (event_name, event) in &config.events {
            if event.seats_per_match >= 3 {
                // One table seating everyone, once per round.
                let seated: Vec<String> = agent_names.iter().take(MAX_SEATS).cloned().collect();
                for round in 1..=event.rounds {
                    waves.push(vec![PendingMatch {
                        event: event_name.clone(),
                        round,
                        match_index: 0,
                        seed: seeds.get_match_seed(event_name, round, 0),
                        seating: Seating::Fixed(seated.clone()),
                    }]);
                }
                continue;
            }

            match &config.format {
                MatchupFormat::RoundRobin => {
                    for round in 1..=event.rounds {
                        let mut wave = Vec::new();
                        let mut match_index = 0u32;
                        for i in 0..agent_names.len() {
                            for j in (i + 1)..agent_names.len() {
                                wave.push(PendingMatch {
                                    event: event_name.clone(),
                                    round,
                                    match_index,
                                    seed: seeds.get_match_seed(event_name, round, match_index),
                                    seating: Seating::Fixed(vec![
                                        agent_names[i].clone(),
                                        agent_names[j].clone(),
                                    ]),
                                });
                                match_index += 1;
                            }
                        }
                        if !wave.is_empty() {
                            waves.push(wave);
                        }
                    }
                }
                MatchupFormat::Explicit(tables) => {
                    let mut wave = Vec::new();
                    for (idx, table) in tables.iter().enumerate() {
                        for agent in table {
                            if !config.agents.contains_key(agent) {
                                return Err(ConfigError::UnknownAgent {
                                    agent: agent.clone(),
                                });
                            }
                        }
                        wave.push(PendingMatch {
                            event: event_name.clone(),
                            round: 1,
                            match_index: idx as u32,
                            seed: seeds.get_match_seed(event_name, 1, idx as u32),
                            seating: Seating::Fixed(table.clone()),
                        });
                    }
                    if !wave.is_empty() {
                        waves.push(wave);
                    }
                }
                MatchupFormat::Bracket => {
                    waves.extend(bracket_waves(event_name, &agent_names, seeds));
                }
            }
        }

        Ok(Schedule { waves })
    }

    /// Every slot's `(event, round, match_index, seed)` for inspection.
    pub fn slots(&self) -> Vec<(String, u32, u32, i64)> {
        self.waves
            .iter()
            .flatten()
            .map(|m| (m.event.clone(), m.round, m.match_index, m.seed))
            .collect()
    }

    pub fn match_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}

/// Single-elimination slots: round 1 pairs agents in config order, each
/// later round pairs the winners of adjacent slots, odd entrants bye.
fn bracket_waves(event: &str, agents: &[String], seeds: &SeedManager) -> Vec<Wave> {
    let mut waves = Vec::new();
    let mut field: Vec<WinnerSource> = agents
        .iter()
        .map(|a| WinnerSource::Bye(a.clone()))
        .collect();
    let mut round = 1u32;

    while field.len() > 1 {
        let mut wave = Vec::new();
        let mut next_field = Vec::new();
        let mut match_index = 0u32;

        let mut pairs = field.chunks(2);
        for chunk in &mut pairs {
            match chunk {
                [a, b] => {
                    let seating = match (a, b) {
                        (WinnerSource::Bye(x), WinnerSource::Bye(y)) => {
                            Seating::Fixed(vec![x.clone(), y.clone()])
                        }
                        _ => Seating::Winners(vec![a.clone(), b.clone()]),
                    };
                    wave.push(PendingMatch {
                        event: event.to_string(),
                        round,
                        match_index,
                        seed: seeds.get_match_seed(event, round, match_index),
                        seating,
                    });
                    next_field.push(WinnerSource::Match(match_index as usize));
                    match_index += 1;
                }
                [odd] => next_field.push(odd.clone()),
                _ => unreachable!("chunks(2) yields one- or two-element slices"),
            }
        }

        waves.push(wave);
        field = next_field;
        round += 1;
    }

    waves
}
