//! Drives one match from reset to finalized telemetry.
//!
//! The loop asks the engine whose turn it is, queries that seat's
//! adapter under the shot clock, parses and validates the response,
//! hands every misstep to the referee, and applies or forfeits. All
//! adapter, parse and validation trouble is absorbed into violations;
//! only engine-internal errors and file-sink failures escape, and even
//! those finalize telemetry first.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use tracing::{instrument, trace, warn};

use game_interface::{EngineFactory, GameEngine, Scores, SeatId};

use crate::adapter::{AdapterError, AdapterErrorKind, Message, ModelAdapter, QueryContext};
use crate::config::AgentConfig;
use crate::parser;
use crate::referee::{EscalationConfig, FidelityReport, Referee, Ruling, ViolationKind};
use crate::sanitize::sanitize;
use crate::sink::DocumentSink;
use crate::telemetry::{
    TelemetryLogger, TournamentContext, TurnRecord, ENGINE_VERSION, PROMPT_VERSION,
};

/// Three identical consecutive violations eject the seat outright.
const STUCK_LOOP_WINDOW: usize = 3;

/// Everything fixed about one scheduled match.
#[derive(Debug, Clone)]
pub struct MatchDescriptor {
    pub match_id: String,
    pub event: String,
    pub round: u32,
    pub match_index: u32,
    pub seed: i64,
    /// Seat id → agent name, in seating order.
    pub seats: Vec<(SeatId, String)>,
}

/// Result of one finished (or aborted) match.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub match_id: String,
    pub event: String,
    pub round: u32,
    pub scores: Scores,
    pub fidelity: FidelityReport,
    pub seat_agents: BTreeMap<SeatId, String>,
    pub ruling: String,
    pub engine_error: Option<String>,
}

impl MatchOutcome {
    /// Agent with the single highest score; ties and empty score maps
    /// fall back to seating order so bracket resolution is total.
    pub fn leading_agent(&self) -> Option<String> {
        let (mut best_seat, mut best) = (None, f64::NEG_INFINITY);
        for (seat, score) in &self.scores {
            if *score > best {
                best = *score;
                best_seat = Some(seat.clone());
            }
        }
        best_seat
            .or_else(|| self.seat_agents.keys().next().cloned())
            .and_then(|seat| self.seat_agents.get(&seat).cloned())
    }
}

/// Borrowed context a match needs to run.
pub struct MatchSettings<'a> {
    pub descriptor: &'a MatchDescriptor,
    pub factory: &'a dyn EngineFactory,
    pub event_params: &'a Value,
    pub adapters: &'a HashMap<String, Arc<dyn ModelAdapter>>,
    pub agents: &'a BTreeMap<String, AgentConfig>,
    pub escalation: EscalationConfig,
    pub telemetry_dir: &'a Path,
    pub sink: Option<Arc<DocumentSink>>,
    pub store_prompts: bool,
    pub tournament_name: &'a str,
    pub cancel: &'a AtomicBool,
}

/// Execute one match end to end. The returned `Err` is reserved for
/// file-sink failures; everything else lands inside the outcome.
#[instrument(skip_all, fields(match_id = settings.descriptor.match_id))]
pub fn run_match(settings: MatchSettings<'_>) -> anyhow::Result<MatchOutcome> {
    trace!("match started");
    let descriptor = settings.descriptor;
    let seat_agents: BTreeMap<SeatId, String> = descriptor.seats.iter().cloned().collect();
    let seat_ids: Vec<SeatId> = descriptor.seats.iter().map(|(s, _)| s.clone()).collect();

    let mut logger = TelemetryLogger::create(
        settings.telemetry_dir,
        &descriptor.match_id,
        TournamentContext {
            tournament_name: settings.tournament_name.to_string(),
            event_type: descriptor.event.clone(),
            round: descriptor.round,
        },
        settings.sink.clone(),
        settings.store_prompts,
    )?;

    let referee = Referee::new(seat_ids, settings.escalation.clone());
    let started = Instant::now();

    let mut engine = match settings.factory.new_engine(settings.event_params) {
        Ok(engine) => engine,
        Err(e) => {
            return finalize_engine_error(descriptor, &seat_agents, &mut logger, referee, None, e)
        }
    };
    engine.reset(descriptor.seed);
    let initial_total: f64 = engine.get_scores().values().sum();

    let schema_value = engine.get_action_schema();
    let schema = match JSONSchema::compile(&schema_value) {
        Ok(schema) => schema,
        Err(e) => {
            let err = anyhow::anyhow!("invalid action schema: {e}");
            return finalize_engine_error(
                descriptor,
                &seat_agents,
                &mut logger,
                referee,
                Some(engine.as_mut()),
                err,
            );
        }
    };

    let mut turns = TurnLoop {
        descriptor,
        engine: engine.as_mut(),
        referee,
        logger: &mut logger,
        schema: &schema,
        adapters: settings.adapters,
        agents: settings.agents,
        seat_agents: &seat_agents,
        turn_number: 0,
        recent_violations: HashMap::new(),
        adapter_ms: 0.0,
    };

    let mut ruling = "completed".to_string();
    let mut engine_error = None;

    loop {
        if settings.cancel.load(Ordering::Relaxed) {
            ruling = "cancelled".to_string();
            break;
        }
        if turns.engine.is_terminal() {
            break;
        }

        turns.referee.new_turn();
        let seat = turns.engine.current_player();
        match turns.take_turn(&seat) {
            Ok(TurnVerdict::Applied(action)) => {
                if let Err(e) = turns.engine.apply_action(&seat, &action) {
                    engine_error = Some(format!("{e:?}"));
                    ruling = "engine_error".to_string();
                    break;
                }
            }
            Ok(TurnVerdict::Forfeited) => turns.engine.forfeit_turn(&seat),
            Ok(TurnVerdict::Ejected) => {
                turns.engine.forfeit_match(&seat);
                break;
            }
            Err(e) => return Err(e), // file sink is gone; the run is over
        }
    }

    if let Some(seat) = turns.referee.match_forfeited_by() {
        ruling = format!("forfeited_by:{seat}");
    }

    let adapter_ms = turns.adapter_ms;
    let referee = turns.referee;
    let scores = engine.get_scores();
    let fidelity = referee.fidelity_report();
    let final_total: f64 = scores.values().sum();
    let conserved = (final_total - initial_total).abs() < 1e-6;
    if !conserved && engine_error.is_none() {
        warn!(
            "score conservation violated in {}: {initial_total} -> {final_total}",
            descriptor.match_id
        );
    }

    let mut extra = json!({
        "event": descriptor.event,
        "round": descriptor.round,
        "ruling": ruling,
        "player_models": seat_agents,
        "highlight_hands": engine.get_highlight_hands(),
        "initial_stakes_total": initial_total,
        "final_scores_total": final_total,
        "conservation_violated": !conserved,
        "timing": {
            "total_ms": started.elapsed().as_secs_f64() * 1000.0,
            "adapter_ms": adapter_ms,
        },
    });
    if let Some(err) = &engine_error {
        extra["engine_error"] = json!(err);
    }
    if let Some(seat) = fidelity.forfeited_by.clone() {
        extra["forfeit_details"] = json!({
            "forfeiting_seat": seat,
            "forfeiting_agent": seat_agents.get(&seat),
            "turn_forfeits": referee.turn_forfeits(&seat),
        });
    }

    logger.finalize_match(&scores, &fidelity, extra)?;
    trace!("match finished: {ruling}");

    Ok(MatchOutcome {
        match_id: descriptor.match_id.clone(),
        event: descriptor.event.clone(),
        round: descriptor.round,
        scores,
        fidelity,
        seat_agents,
        ruling,
        engine_error,
    })
}

fn finalize_engine_error(
    descriptor: &MatchDescriptor,
    seat_agents: &BTreeMap<SeatId, String>,
    logger: &mut TelemetryLogger,
    referee: Referee,
    engine: Option<&mut dyn GameEngine>,
    error: anyhow::Error,
) -> anyhow::Result<MatchOutcome> {
    warn!("engine error in {}: {error:?}", descriptor.match_id);
    let scores = engine.map(|e| e.get_scores()).unwrap_or_default();
    let fidelity = referee.fidelity_report();
    logger.finalize_match(
        &scores,
        &fidelity,
        json!({
            "event": descriptor.event,
            "round": descriptor.round,
            "ruling": "engine_error",
            "player_models": seat_agents,
            "engine_error": format!("{error:?}"),
        }),
    )?;
    Ok(MatchOutcome {
        match_id: descriptor.match_id.clone(),
        event: descriptor.event.clone(),
        round: descriptor.round,
        scores,
        fidelity,
        seat_agents: seat_agents.clone(),
        ruling: "engine_error".to_string(),
        engine_error: Some(format!("{error:?}")),
    })
}

enum TurnVerdict {
    Applied(Value),
    Forfeited,
    Ejected,
}

/// What one adapter round-trip produced, before the referee sees it.
enum AttemptResult {
    Valid {
        action: Value,
        injection: bool,
    },
    Violation {
        kind: ViolationKind,
        details: String,
        /// Use the engine's retry prompt rather than re-sending the
        /// original (parse and legality failures carry a reason).
        explain_retry: bool,
    },
}

struct TurnLoop<'a> {
    descriptor: &'a MatchDescriptor,
    engine: &'a mut dyn GameEngine,
    referee: Referee,
    logger: &'a mut TelemetryLogger,
    schema: &'a JSONSchema,
    adapters: &'a HashMap<String, Arc<dyn ModelAdapter>>,
    agents: &'a BTreeMap<String, AgentConfig>,
    seat_agents: &'a BTreeMap<SeatId, String>,
    turn_number: u64,
    recent_violations: HashMap<SeatId, VecDeque<(ViolationKind, String)>>,
    adapter_ms: f64,
}

impl TurnLoop<'_> {
    /// One seat's turn: at most two decision attempts inside a single
    /// shot-clock window.
    fn take_turn(&mut self, seat: &str) -> anyhow::Result<TurnVerdict> {
        let agent_name = self
            .seat_agents
            .get(seat)
            .cloned()
            .unwrap_or_else(|| seat.to_string());
        let agents = self.agents;
        let agent = &agents[&agent_name];
        let adapter = Arc::clone(&self.adapters[&agent_name]);

        let budget = agent.timeout;
        let clock = Instant::now();
        let snapshot = self.engine.get_state_snapshot();
        let base_prompt = self.engine.get_prompt(seat);
        let context = QueryContext {
            match_seed: self.descriptor.seed,
        };

        let mut prompt = base_prompt;
        for attempt in 0..2u8 {
            let remaining = budget.saturating_sub(clock.elapsed());
            let messages = [Message::user(&prompt)];
            let query_start = Instant::now();
            let response = adapter.query(&messages, agent.max_output_tokens, remaining, &context);
            let elapsed = query_start.elapsed();
            self.adapter_ms += elapsed.as_secs_f64() * 1000.0;

            let over_budget = clock.elapsed() > budget;
            let (result, response) = match response {
                Err(e) => (classify_adapter_error(&e), None),
                Ok(resp) => {
                    let raw = sanitize(&resp.raw_text);
                    let result = if over_budget {
                        AttemptResult::Violation {
                            kind: ViolationKind::Timeout,
                            details: format!(
                                "response exceeded shot clock ({}ms > {}ms)",
                                clock.elapsed().as_millis(),
                                budget.as_millis()
                            ),
                            explain_retry: false,
                        }
                    } else if raw.trim().is_empty() {
                        AttemptResult::Violation {
                            kind: ViolationKind::EmptyResponse,
                            details: "empty response".to_string(),
                            explain_retry: false,
                        }
                    } else {
                        self.judge_text(seat, &raw)
                    };
                    (result, Some((resp, raw)))
                }
            };

            match result {
                AttemptResult::Valid { action, injection } => {
                    let mut violation = None;
                    if injection {
                        self.referee.record_violation(
                            seat,
                            ViolationKind::InjectionAttempt,
                            "injection pattern detected",
                        );
                        violation = Some(ViolationKind::InjectionAttempt);
                        // Flagged, never blocked: the action still plays.
                    }
                    self.log_attempt(LogAttempt {
                        seat,
                        agent,
                        prompt: &prompt,
                        response: response.as_ref(),
                        parsed_action: Some(&action),
                        parse_success: true,
                        validation_result: "legal",
                        violation,
                        ruling: None,
                        snapshot: &snapshot,
                        elapsed,
                        budget,
                        time_exceeded: false,
                    })?;
                    return Ok(TurnVerdict::Applied(action));
                }
                AttemptResult::Violation {
                    kind,
                    details,
                    explain_retry,
                } => {
                    let mut ruling = self.referee.record_violation(seat, kind, &details);
                    if self.is_stuck(seat, kind, &details) {
                        ruling = self.referee.force_match_forfeit(seat);
                    }
                    let time_exceeded = over_budget || kind == ViolationKind::Timeout;

                    if ruling == Ruling::Retry && attempt == 0 && self.referee.should_retry(seat) {
                        let left = budget.saturating_sub(clock.elapsed());
                        if left > Duration::ZERO {
                            self.referee.consume_retry(seat);
                            self.log_attempt(LogAttempt {
                                seat,
                                agent,
                                prompt: &prompt,
                                response: response.as_ref(),
                                parsed_action: None,
                                parse_success: false,
                                validation_result: "retry",
                                violation: Some(kind),
                                ruling: Some(Ruling::Retry),
                                snapshot: &snapshot,
                                elapsed,
                                budget,
                                time_exceeded,
                            })?;
                            if explain_retry {
                                prompt = self.engine.get_retry_prompt(seat, &details);
                            }
                            continue;
                        }
                        // Window spent between attempts: the skipped
                        // retry is itself a timeout.
                        ruling = self.referee.record_violation(
                            seat,
                            ViolationKind::Timeout,
                            "shot clock exhausted before retry",
                        );
                    }

                    self.log_attempt(LogAttempt {
                        seat,
                        agent,
                        prompt: &prompt,
                        response: response.as_ref(),
                        parsed_action: None,
                        parse_success: false,
                        validation_result: "forfeit",
                        violation: Some(kind),
                        ruling: Some(ruling),
                        snapshot: &snapshot,
                        elapsed,
                        budget,
                        time_exceeded,
                    })?;

                    return Ok(match ruling {
                        Ruling::ForfeitMatch | Ruling::EliminatePlayer => TurnVerdict::Ejected,
                        _ => TurnVerdict::Forfeited,
                    });
                }
            }
        }
        unreachable!("second attempt always returns")
    }

    /// Parse and validate non-empty sanitized text.
    fn judge_text(&mut self, seat: &str, raw: &str) -> AttemptResult {
        let parsed = parser::parse(raw, self.schema);
        if !parsed.success {
            return AttemptResult::Violation {
                kind: ViolationKind::MalformedJson,
                details: parsed
                    .error
                    .unwrap_or_else(|| "unknown parse error".to_string()),
                explain_retry: true,
            };
        }
        let action = parsed.action.expect("successful parse carries an action");
        let verdict = self.engine.validate_action(seat, &action);
        if !verdict.legal {
            return AttemptResult::Violation {
                kind: ViolationKind::IllegalMove,
                details: verdict.reason.unwrap_or_else(|| "illegal move".to_string()),
                explain_retry: true,
            };
        }
        AttemptResult::Valid {
            action,
            injection: parsed.injection_detected,
        }
    }

    /// Record the violation in the rolling window; three identical
    /// entries mean a deterministically broken agent.
    fn is_stuck(&mut self, seat: &str, kind: ViolationKind, details: &str) -> bool {
        let window = self.recent_violations.entry(seat.to_string()).or_default();
        window.push_back((kind, details.to_string()));
        if window.len() > STUCK_LOOP_WINDOW {
            window.pop_front();
        }
        window.len() == STUCK_LOOP_WINDOW
            && window
                .iter()
                .all(|(k, d)| *k == kind && d == details)
    }

    fn log_attempt(&mut self, attempt: LogAttempt<'_>) -> anyhow::Result<()> {
        self.turn_number += 1;
        let (model_id, model_version, raw_output, reasoning, input_tokens, output_tokens, latency_ms) =
            match attempt.response {
                Some((resp, raw)) => (
                    resp.model_id.clone(),
                    resp.model_version.clone(),
                    raw.clone(),
                    resp.reasoning_text.clone(),
                    resp.input_tokens,
                    resp.output_tokens,
                    resp.latency_ms,
                ),
                None => {
                    let fallback = attempt
                        .agent
                        .model_id
                        .clone()
                        .unwrap_or_else(|| attempt.agent.name.clone());
                    (
                        fallback.clone(),
                        fallback,
                        String::new(),
                        None,
                        0,
                        0,
                        attempt.elapsed.as_secs_f64() * 1000.0,
                    )
                }
            };

        let record = TurnRecord {
            turn_number: self.turn_number,
            hand_number: attempt
                .snapshot
                .get("hand_number")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            street: attempt
                .snapshot
                .get("street")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            player_id: attempt.seat.to_string(),
            model_id,
            model_version,
            prompt: attempt.prompt.to_string(),
            raw_output,
            reasoning_output: reasoning,
            parsed_action: attempt.parsed_action.cloned(),
            parse_success: attempt.parse_success,
            validation_result: attempt.validation_result.to_string(),
            violation: attempt.violation.map(|v| v.as_str().to_string()),
            ruling: attempt.ruling.map(|r| r.as_str().to_string()),
            state_snapshot: attempt.snapshot.clone(),
            input_tokens,
            output_tokens,
            latency_ms,
            time_limit_ms: attempt.budget.as_millis() as u64,
            time_exceeded: attempt.time_exceeded,
            cumulative_strikes: self.referee.strikes(attempt.seat),
            strike_limit: self.referee.match_forfeit_threshold(),
            engine_version: ENGINE_VERSION.to_string(),
            prompt_version: PROMPT_VERSION.to_string(),
        };
        self.logger.log_turn(&record)
    }
}

struct LogAttempt<'a> {
    seat: &'a str,
    agent: &'a AgentConfig,
    prompt: &'a str,
    response: Option<&'a (crate::adapter::AdapterResponse, String)>,
    parsed_action: Option<&'a Value>,
    parse_success: bool,
    validation_result: &'a str,
    violation: Option<ViolationKind>,
    ruling: Option<Ruling>,
    snapshot: &'a Value,
    elapsed: Duration,
    budget: Duration,
    time_exceeded: bool,
}

/// Adapter failures collapse onto the violation taxonomy: a timeout is
/// a timeout, and everything else is externally indistinguishable from
/// an unresponsive agent at this layer.
fn classify_adapter_error(error: &AdapterError) -> AttemptResult {
    let kind = match error.kind {
        AdapterErrorKind::Timeout => ViolationKind::Timeout,
        AdapterErrorKind::RateLimit | AdapterErrorKind::ApiError => ViolationKind::Timeout,
    };
    AttemptResult::Violation {
        kind,
        details: error.to_string(),
        explain_retry: false,
    }
}
