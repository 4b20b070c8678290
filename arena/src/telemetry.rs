//! Per-match telemetry: durable JSONL file sink plus document-sink feed.
//!
//! One [`TelemetryLogger`] per match. Every turn becomes one JSON line
//! in `<match_id>.log`, flushed immediately; the final line is a match
//! summary. The logger is a scoped resource: if the match-driving code
//! never reaches `finalize_match` (panic, cancellation bug), the drop
//! guard writes a crash-stub summary so the file always terminates with
//! exactly one summary record. File-sink failures are fatal (the file
//! is the audit trail); document-sink trouble never surfaces here.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::error;

use game_interface::Scores;

use crate::model_names::normalize;
use crate::referee::FidelityReport;
use crate::sink::{derive_winner, DocumentSink, ModelStatDelta, SinkItem};

pub const TELEMETRY_SCHEMA_VERSION: &str = "1.1.0";
pub const PROMPT_VERSION: &str = "1.0.0";
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One model decision attempt, including retries and forfeits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_number: u64,
    pub hand_number: u64,
    pub street: String,
    pub player_id: String,
    pub model_id: String,
    pub model_version: String,
    pub prompt: String,
    pub raw_output: String,
    pub reasoning_output: Option<String>,
    pub parsed_action: Option<Value>,
    pub parse_success: bool,
    pub validation_result: String,
    pub violation: Option<String>,
    pub ruling: Option<String>,
    pub state_snapshot: Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: f64,
    pub time_limit_ms: u64,
    pub time_exceeded: bool,
    pub cumulative_strikes: u32,
    pub strike_limit: u32,
    pub engine_version: String,
    pub prompt_version: String,
}

/// Denormalized run context stamped onto every document-sink record.
#[derive(Debug, Clone)]
pub struct TournamentContext {
    pub tournament_name: String,
    pub event_type: String,
    pub round: u32,
}

/// Writes JSONL telemetry for a single match.
pub struct TelemetryLogger {
    match_id: String,
    path: PathBuf,
    file: BufWriter<File>,
    sink: Option<Arc<DocumentSink>>,
    ctx: TournamentContext,
    store_prompts: bool,
    finalized: bool,
}

impl TelemetryLogger {
    /// Open (or append to) the match log file.
    ///
    /// `store_prompts` controls the document sink only: the file sink
    /// always records prompts verbatim; the document sink stores a
    /// salted hash plus character/token counts unless opted in.
    pub fn create(
        output_dir: &Path,
        match_id: &str,
        ctx: TournamentContext,
        sink: Option<Arc<DocumentSink>>,
        store_prompts: bool,
    ) -> anyhow::Result<TelemetryLogger> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("creating telemetry dir {}", output_dir.display()))?;
        let path = output_dir.join(format!("{match_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening match log {}", path.display()))?;
        Ok(TelemetryLogger {
            match_id: match_id.to_string(),
            path,
            file: BufWriter::new(file),
            sink,
            ctx,
            store_prompts,
            finalized: false,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    /// Synchronous write to the file sink, then enqueue for the
    /// document sink. A file write failure is fatal to the run.
    pub fn log_turn(&mut self, record: &TurnRecord) -> anyhow::Result<()> {
        let mut doc = serde_json::to_value(record).context("serializing turn record")?;
        stamp_common(&mut doc, &self.match_id);
        self.append_line(&doc)?;

        if self.sink.is_some() {
            let mut sink_doc = doc;
            self.denormalize(&mut sink_doc);
            if !self.store_prompts {
                redact_prompt(&mut sink_doc, &self.match_id, record);
            }
            if let Some(sink) = &self.sink {
                sink.enqueue(SinkItem::Turn(sink_doc));
            }
        }
        Ok(())
    }

    /// Write the terminal summary record and enqueue the match document
    /// plus per-model stat increments. Guaranteed to run for every match
    /// that starts: callers that never reach it are covered by the drop
    /// guard's crash stub.
    pub fn finalize_match(
        &mut self,
        scores: &Scores,
        fidelity: &FidelityReport,
        extra: Value,
    ) -> anyhow::Result<()> {
        let mut doc = json!({
            "schema_version": TELEMETRY_SCHEMA_VERSION,
            "record_type": "match_summary",
            "match_id": self.match_id,
            "final_scores": scores,
            "fidelity_report": fidelity,
            "engine_version": ENGINE_VERSION,
            "timestamp": now_rfc3339(),
        });
        if let (Some(target), Some(source)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        self.append_line(&doc)?;
        self.finalized = true;

        if let Some(sink) = &self.sink {
            let mut match_doc = doc;
            self.denormalize(&mut match_doc);

            let seat_models = seat_models_of(&match_doc);
            let winner = derive_winner(scores, &seat_models);
            sink.enqueue(SinkItem::Match {
                match_id: self.match_id.clone(),
                doc: match_doc,
            });

            for (seat, model_id) in &seat_models {
                let is_winner = winner.as_deref() == Some(model_id.as_str());
                let is_draw = winner.is_none();
                let violations = fidelity
                    .seats
                    .get(seat)
                    .map(|f| u64::from(f.total_violations))
                    .unwrap_or(0);
                sink.enqueue(SinkItem::ModelStat(ModelStatDelta {
                    model_id: model_id.clone(),
                    event_type: self.ctx.event_type.clone(),
                    wins: u32::from(is_winner),
                    losses: u32::from(!is_winner && !is_draw),
                    draws: u32::from(is_draw),
                    violations,
                    last_played: now_rfc3339(),
                }));
            }
        }
        Ok(())
    }

    fn append_line(&mut self, doc: &Value) -> anyhow::Result<()> {
        let line = serde_json::to_string(doc).context("serializing telemetry record")?;
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.write_all(b"\n"))
            .and_then(|()| self.file.flush())
            .with_context(|| format!("writing match log {}", self.path.display()))
    }

    fn denormalize(&self, doc: &mut Value) {
        let Some(map) = doc.as_object_mut() else {
            return;
        };
        map.insert("event_type".to_string(), json!(self.ctx.event_type));
        map.insert("tournament_name".to_string(), json!(self.ctx.tournament_name));
        map.insert("round".to_string(), json!(self.ctx.round));
        for key in ["model_id", "model_version"] {
            let normalized = map.get(key).and_then(Value::as_str).map(normalize);
            if let Some(name) = normalized {
                map.insert(key.to_string(), json!(name));
            }
        }
    }
}

impl Drop for TelemetryLogger {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        // The driver died before its own finalize. A stub summary beats
        // silent loss of the terminal record.
        let stub = json!({
            "schema_version": TELEMETRY_SCHEMA_VERSION,
            "record_type": "match_summary",
            "match_id": self.match_id,
            "final_scores": {},
            "fidelity_report": {},
            "ruling": "aborted",
            "crash_stub": true,
            "engine_version": ENGINE_VERSION,
            "timestamp": now_rfc3339(),
        });
        if let Err(e) = self.append_line(&stub) {
            error!("failed to write crash-stub summary for {}: {e}", self.match_id);
        }
    }
}

fn stamp_common(doc: &mut Value, match_id: &str) {
    if let Some(map) = doc.as_object_mut() {
        map.insert("schema_version".to_string(), json!(TELEMETRY_SCHEMA_VERSION));
        map.insert("match_id".to_string(), json!(match_id));
        map.insert("timestamp".to_string(), json!(now_rfc3339()));
    }
}

fn redact_prompt(doc: &mut Value, match_id: &str, record: &TurnRecord) {
    let Some(map) = doc.as_object_mut() else {
        return;
    };
    let Some(prompt) = map.remove("prompt") else {
        return;
    };
    let prompt_text = prompt.as_str().unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(match_id.as_bytes());
    hasher.update(prompt_text.as_bytes());
    let hash = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    map.insert("prompt_hash".to_string(), json!(hash));
    map.insert("prompt_chars".to_string(), json!(prompt_text.chars().count()));
    map.insert("prompt_tokens".to_string(), json!(record.input_tokens));
}

fn seat_models_of(doc: &Value) -> BTreeMap<String, String> {
    doc.get("player_models")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
