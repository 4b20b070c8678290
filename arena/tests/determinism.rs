//! Two runs with the same config and seed must produce identical
//! telemetry, modulo timestamps and latencies.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use arena::config::{AgentConfig, EventConfig, TournamentConfig};
use arena::tournament::TournamentRunner;
use game_interface::EngineFactory;

use crate::games::ChipDuelFactory;

mod games;

fn engines() -> HashMap<String, Arc<dyn EngineFactory>> {
    let mut map: HashMap<String, Arc<dyn EngineFactory>> = HashMap::new();
    map.insert("chipduel".to_string(), Arc::new(ChipDuelFactory));
    map
}

fn run_once(dir: &Path, seed: i64) -> Vec<(String, Vec<Value>)> {
    let config = TournamentConfig::new("determinism", seed)
        .with_output_dir(dir)
        .with_agent(AgentConfig::offline("mock-a", "always_call"))
        .with_agent(AgentConfig::offline("mock-b", "always_call"))
        .with_event(EventConfig::new("chipduel").with_params(serde_json::json!({
            "hands_per_match": 25,
            "starting_stack": 200,
        })));
    let report = TournamentRunner::new(config, engines()).unwrap().run().unwrap();

    report
        .matches
        .iter()
        .map(|outcome| {
            let path = report.telemetry_dir.join(format!("{}.log", outcome.match_id));
            let lines = std::fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(|l| scrub(serde_json::from_str(l).unwrap()))
                .collect();
            (outcome.match_id.clone(), lines)
        })
        .collect()
}

/// Drop the fields the determinism contract exempts.
fn scrub(mut record: Value) -> Value {
    if let Some(map) = record.as_object_mut() {
        map.remove("timestamp");
        map.remove("latency_ms");
        map.remove("timing");
    }
    record
}

#[test]
fn identical_runs_produce_identical_telemetry() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let run_a = run_once(dir_a.path(), 42);
    let run_b = run_once(dir_b.path(), 42);

    assert_eq!(run_a.len(), run_b.len());
    for ((id_a, lines_a), (id_b, lines_b)) in run_a.iter().zip(run_b.iter()) {
        assert_eq!(id_a, id_b, "match ids must be stable across runs");
        assert_eq!(lines_a.len(), lines_b.len());
        for (a, b) in lines_a.iter().zip(lines_b.iter()) {
            assert_eq!(a, b);
        }
    }
}

#[test]
fn different_seeds_diverge() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let run_a = run_once(dir_a.path(), 42);
    let run_b = run_once(dir_b.path(), 43);

    // Same schedule shape, different chip flow: somewhere in 25 hands
    // the decks must fall differently.
    assert_eq!(run_a[0].1.len(), run_b[0].1.len());
    assert_ne!(run_a[0].1, run_b[0].1);
}
