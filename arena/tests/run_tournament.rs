//! End-to-end scenarios driven through the full tournament loop with
//! offline adapters and the ChipDuel toy engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::Level;

use arena::adapter::OfflineAdapter;
use arena::config::{AgentConfig, EventConfig, TournamentConfig};
use arena::tournament::{TournamentReport, TournamentRunner};
use game_interface::EngineFactory;

use crate::games::{ChipDuelFactory, CountingAdapter};

mod games;

fn init_logger() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_target(false);

    let _ = tracing_subscriber::fmt()
        .event_format(format)
        .with_max_level(Level::INFO)
        .try_init();
}

fn engines() -> HashMap<String, Arc<dyn EngineFactory>> {
    let mut map: HashMap<String, Arc<dyn EngineFactory>> = HashMap::new();
    map.insert("chipduel".to_string(), Arc::new(ChipDuelFactory));
    map
}

fn duel_config(dir: &Path, hands: u32, strategy_a: &str, strategy_b: &str) -> TournamentConfig {
    TournamentConfig::new("test-run", 42)
        .with_output_dir(dir)
        .with_agent(AgentConfig::offline("mock-a", strategy_a))
        .with_agent(AgentConfig::offline("mock-b", strategy_b))
        .with_event(EventConfig::new("chipduel").with_params(serde_json::json!({
            "hands_per_match": hands,
            "starting_stack": 200,
        })))
}

fn read_log(report: &TournamentReport, match_idx: usize) -> Vec<Value> {
    let match_id = &report.matches[match_idx].match_id;
    let path = report.telemetry_dir.join(format!("{match_id}.log"));
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn turn_records(lines: &[Value]) -> Vec<&Value> {
    lines
        .iter()
        .filter(|l| l.get("record_type").and_then(Value::as_str) != Some("match_summary"))
        .collect()
}

#[test]
fn clean_heads_up_match() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 100, "always_call", "always_call");
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    assert_eq!(report.matches.len(), 1);
    let outcome = &report.matches[0];
    assert_eq!(outcome.ruling, "completed");
    assert_eq!(outcome.scores.values().sum::<f64>(), 400.0);
    for fidelity in outcome.fidelity.seats.values() {
        assert_eq!(fidelity.total_violations, 0);
    }

    let lines = read_log(&report, 0);
    // Two betting decisions per hand, one record each, plus the summary.
    assert_eq!(turn_records(&lines).len(), 200);
    assert_eq!(
        lines.last().unwrap()["record_type"].as_str(),
        Some("match_summary")
    );
    assert_eq!(lines.last().unwrap()["conservation_violated"], false);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn turn_numbers_increase_by_one_per_attempt() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 5, "always_call", "always_call");
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    let lines = read_log(&report, 0);
    let turns: Vec<u64> = turn_records(&lines)
        .iter()
        .map(|r| r["turn_number"].as_u64().unwrap())
        .collect();
    let expected: Vec<u64> = (1..=turns.len() as u64).collect();
    assert_eq!(turns, expected);

    let hands: Vec<u64> = turn_records(&lines)
        .iter()
        .map(|r| r["hand_number"].as_u64().unwrap())
        .collect();
    assert!(hands.windows(2).all(|w| w[0] <= w[1]), "hand numbers regressed");
}

#[test]
fn adversarial_garbage_output() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 2, "always_call", "garbage");
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    let outcome = &report.matches[0];
    let b = &outcome.fidelity.seats["player_b"];
    assert!(b.malformed_json >= 2, "expected malformed_json >= hands");
    assert!(b.turn_forfeits > 0);
    assert_eq!(outcome.scores.values().sum::<f64>(), 400.0);
    assert_eq!(
        read_log(&report, 0).last().unwrap()["record_type"],
        "match_summary"
    );
    // Clean seat stays clean.
    assert_eq!(outcome.fidelity.seats["player_a"].total_violations, 0);
}

#[test]
fn injection_flagged_but_never_blocked() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 5, "always_call", "injector");
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    let outcome = &report.matches[0];
    assert_eq!(outcome.ruling, "completed");
    let b = &outcome.fidelity.seats["player_b"];
    assert_eq!(b.injection_attempts, 5);
    assert_eq!(b.malformed_json, 0);
    assert_eq!(b.illegal_move, 0);
    assert_eq!(b.turn_forfeits, 0);
    assert_eq!(outcome.scores.values().sum::<f64>(), 400.0);

    let lines = read_log(&report, 0);
    // The match plays out exactly like a clean one: one decision per
    // seat per hand, all applied.
    assert_eq!(turn_records(&lines).len(), 10);
    for record in turn_records(&lines) {
        assert_eq!(record["validation_result"], "legal");
    }
}

#[test]
fn shot_clock_forfeit_ejects_slow_seat() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut config = duel_config(dir.path(), 10, "always_call", "always_call");
    config.agents.get_mut("mock-b").unwrap().timeout = Duration::from_millis(5);

    // Sleeps past the clock by a varying margin every call.
    let calls = Arc::new(AtomicU32::new(0));
    let slow = OfflineAdapter::new("mock-b", move |_, _| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20 + u64::from(n)));
        r#"{"action": "call"}"#.to_string()
    });

    let report = TournamentRunner::new(config, engines())
        .unwrap()
        .with_adapter("mock-b", Arc::new(slow))
        .run()
        .unwrap();

    let outcome = &report.matches[0];
    assert_eq!(outcome.ruling, "forfeited_by:player_b");
    let b = &outcome.fidelity.seats["player_b"];
    assert!(b.timeout >= 3);
    assert_eq!(b.strikes, 3);
    assert!(b.match_forfeited);
    assert!(outcome.scores["player_a"] > outcome.scores["player_b"]);
    assert_eq!(outcome.scores.values().sum::<f64>(), 400.0);

    let lines = read_log(&report, 0);
    let b_turns: Vec<&Value> = turn_records(&lines)
        .into_iter()
        .filter(|r| r["player_id"] == "player_b")
        .collect();
    for record in &b_turns {
        assert_eq!(record["violation"], "timeout");
        assert_eq!(record["time_exceeded"], true);
    }
    let summary = lines.last().unwrap();
    assert_eq!(summary["forfeit_details"]["forfeiting_seat"], "player_b");
}

#[test]
fn engine_error_finalizes_and_run_continues() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = TournamentConfig::new("crash-run", 7)
        .with_output_dir(dir.path())
        .with_agent(AgentConfig::offline("mock-a", "always_call"))
        .with_agent(AgentConfig::offline("mock-b", "always_call"))
        .with_event(
            EventConfig::new("chipduel")
                .with_rounds(2)
                .with_params(serde_json::json!({
                    "hands_per_match": 20,
                    "starting_stack": 200,
                    "fail_after_actions": 17,
                })),
        );
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    // Both scheduled matches ran despite the first one dying.
    assert_eq!(report.matches.len(), 2);
    assert_eq!(report.engine_errors, 2);
    assert_eq!(report.exit_code(), 1);

    for idx in 0..2 {
        let outcome = &report.matches[idx];
        assert_eq!(outcome.ruling, "engine_error");
        assert!(outcome
            .engine_error
            .as_deref()
            .unwrap()
            .contains("synthetic engine fault"));
        let lines = read_log(&report, idx);
        assert_eq!(turn_records(&lines).len(), 17);
        let summary = lines.last().unwrap();
        assert_eq!(summary["record_type"], "match_summary");
        assert_eq!(summary["ruling"], "engine_error");
    }
}

#[test]
fn stuck_loop_ejects_deterministically_broken_agent() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 10, "always_call", "garbage");
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    let outcome = &report.matches[0];
    // Ejected on the third identical violation, far before the 10 hands
    // or any strike threshold could end the match.
    assert_eq!(outcome.ruling, "forfeited_by:player_b");
    let b = &outcome.fidelity.seats["player_b"];
    assert_eq!(b.malformed_json, 3);
    assert_eq!(b.strikes, 0);
    assert!(b.match_forfeited);

    let summary = read_log(&report, 0).last().unwrap().clone();
    assert_eq!(summary["fidelity_report"]["_match_forfeited_by"], "player_b");
    assert_eq!(outcome.scores.values().sum::<f64>(), 400.0);
}

#[test]
fn at_most_two_queries_per_turn() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 1, "always_call", "garbage");

    let (counting, calls) = CountingAdapter::new(Box::new(OfflineAdapter::new(
        "mock-b",
        |_, _| "still not json".to_string(),
    )));

    let report = TournamentRunner::new(config, engines())
        .unwrap()
        .with_adapter("mock-b", Arc::new(counting))
        .run()
        .unwrap();

    // One turn for the broken seat: the first attempt plus exactly one
    // retry, never more.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.matches.len(), 1);
}

#[test]
fn unknown_strategy_is_a_config_error() {
    let config = TournamentConfig::new("bad", 1)
        .with_agent(AgentConfig::offline("mock-a", "no_such_strategy"))
        .with_event(EventConfig::new("chipduel"));
    let err = TournamentRunner::new(config, engines()).err().unwrap();
    assert!(err.to_string().contains("no_such_strategy"));
}

#[test]
fn missing_credential_is_a_config_error() {
    let config = TournamentConfig::new("bad", 1)
        .with_agent(AgentConfig::remote(
            "live",
            arena::config::Provider::OpenAi,
            "gpt-4o",
            "DEFINITELY_UNSET_ENV_VAR_FOR_TEST",
        ))
        .with_event(EventConfig::new("chipduel"));
    let err = TournamentRunner::new(config, engines()).err().unwrap();
    assert!(err.to_string().contains("DEFINITELY_UNSET_ENV_VAR_FOR_TEST"));
}

#[test]
fn unknown_event_is_a_config_error() {
    let config = TournamentConfig::new("bad", 1)
        .with_agent(AgentConfig::offline("mock-a", "always_call"))
        .with_event(EventConfig::new("parcheesi"));
    let err = TournamentRunner::new(config, engines()).err().unwrap();
    assert!(err.to_string().contains("parcheesi"));
}

#[test]
fn cancellation_still_finalizes() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 100, "always_call", "always_call");
    let runner = TournamentRunner::new(config, engines()).unwrap();
    runner.cancel_flag().store(true, Ordering::SeqCst);
    let report = runner.run().unwrap();

    // The wave was skipped entirely; nothing started, nothing to
    // finalize, and the run still reports cleanly.
    assert!(report.matches.is_empty());
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn bounded_parallelism_completes_every_match() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut config = TournamentConfig::new("parallel-run", 42)
        .with_output_dir(dir.path())
        .with_max_parallel_matches(3)
        .with_event(EventConfig::new("chipduel").with_params(serde_json::json!({
            "hands_per_match": 10,
            "starting_stack": 200,
        })));
    for name in ["mock-a", "mock-b", "mock-c", "mock-d"] {
        config = config.with_agent(AgentConfig::offline(name, "always_call"));
    }
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    // Round robin over four agents: six matches, all finalized.
    assert_eq!(report.matches.len(), 6);
    for idx in 0..6 {
        let outcome = &report.matches[idx];
        assert_eq!(outcome.ruling, "completed");
        assert_eq!(outcome.scores.values().sum::<f64>(), 400.0);
        let lines = read_log(&report, idx);
        assert_eq!(
            lines.last().unwrap()["record_type"].as_str(),
            Some("match_summary")
        );
    }
    // Each agent sat in exactly three matches.
    for entry in &report.standings {
        assert_eq!(entry.played, 3);
    }
}

#[test]
fn standings_award_league_points() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = duel_config(dir.path(), 4, "always_call", "garbage");
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    // The garbage seat loses by forfeit; the caller tops the table.
    assert_eq!(report.standings[0].agent, "mock-a");
    assert_eq!(report.standings[0].wins, 1);
    assert_eq!(report.standings[0].league_points, 3.0);
    assert_eq!(report.standings[1].agent, "mock-b");
    assert_eq!(report.standings[1].losses, 1);
}
