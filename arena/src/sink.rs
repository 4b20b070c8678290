//! Background document sink with a bounded queue.
//!
//! Accepts telemetry documents from any number of concurrently running
//! matches, batches them, and hands them to a [`DocumentStore`] from a
//! dedicated writer thread. Store errors are warned and dropped: the
//! durable file log is the authoritative audit trail, and the match loop
//! must never block on or fail because of this sink. If the store is
//! unreachable at startup the sink disables itself and every operation
//! becomes a no-op.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use game_interface::Scores;

/// Bound on queued documents; overflow drops the newest with a warning.
const QUEUE_CAPACITY: usize = 10_000;
const BATCH_SIZE: usize = 50;

/// Environment variable holding the store connection string. Absence
/// disables the document sink entirely.
pub const STORE_URI_ENV: &str = "TOURNEY_STORE_URI";

/// The configured store URI, if any. Callers hand it to whatever
/// [`DocumentStore`] implementation they deploy with.
pub fn store_uri_from_env() -> Option<String> {
    std::env::var(STORE_URI_ENV).ok().filter(|s| !s.is_empty())
}

/// Atomic increments applied to one model's aggregate document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatDelta {
    pub model_id: String,
    pub event_type: String,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub violations: u64,
    pub last_played: String,
}

/// The storage backend behind the sink.
///
/// `insert_turns` must be idempotent under the compound unique key
/// `(match_id, turn_number, hand_number, player_id)` so backfilled
/// re-ingestion is a no-op; `apply_model_stats` must use atomic
/// increments, never read-modify-write.
pub trait DocumentStore: Send + Sync {
    fn ping(&self) -> anyhow::Result<()>;
    fn insert_turns(&self, turns: &[Value]) -> anyhow::Result<()>;
    fn upsert_match(&self, match_id: &str, doc: &Value) -> anyhow::Result<()>;
    fn apply_model_stats(&self, delta: &ModelStatDelta) -> anyhow::Result<()>;
    fn upsert_tournament(&self, name: &str, doc: &Value) -> anyhow::Result<()>;
}

pub(crate) enum SinkItem {
    Turn(Value),
    Match { match_id: String, doc: Value },
    ModelStat(ModelStatDelta),
    Tournament { name: String, doc: Value },
}

/// Process-wide handle to the background writer.
pub struct DocumentSink {
    tx: Mutex<Option<SyncSender<SinkItem>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentSink {
    /// Start the writer thread, or a disabled sink when the store does
    /// not answer a ping.
    pub fn start(store: Arc<dyn DocumentStore>) -> Arc<DocumentSink> {
        if let Err(e) = store.ping() {
            warn!("document store unreachable, telemetry sink disabled: {e}");
            return Arc::new(DocumentSink {
                tx: Mutex::new(None),
                writer: Mutex::new(None),
            });
        }

        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("document-sink-writer".to_string())
            .spawn(move || writer_loop(rx, store))
            .expect("spawning the sink writer thread");

        Arc::new(DocumentSink {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn enqueue(&self, item: SinkItem) {
        let guard = self.tx.lock().expect("sink sender mutex poisoned");
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("document sink queue full, dropping record");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("document sink writer gone, dropping record");
            }
        }
    }

    /// Drop the sender and wait for the writer to drain the queue.
    pub fn close(&self) {
        self.tx.lock().expect("sink sender mutex poisoned").take();
        if let Some(handle) = self.writer.lock().expect("sink writer mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(rx: Receiver<SinkItem>, store: Arc<dyn DocumentStore>) {
    loop {
        // Block for the first item; a closed channel ends the loop.
        let first = match rx.recv() {
            Ok(item) => item,
            Err(_) => return,
        };
        let mut batch = vec![first];
        while batch.len() < BATCH_SIZE {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        flush_batch(&store, batch);
    }
}

fn flush_batch(store: &Arc<dyn DocumentStore>, batch: Vec<SinkItem>) {
    let mut turns = Vec::new();
    for item in batch {
        match item {
            SinkItem::Turn(doc) => turns.push(doc),
            SinkItem::Match { match_id, doc } => {
                if let Err(e) = store.upsert_match(&match_id, &doc) {
                    warn!("failed to upsert match {match_id}: {e}");
                }
            }
            SinkItem::ModelStat(delta) => {
                if let Err(e) = store.apply_model_stats(&delta) {
                    warn!("failed to update model stats for {}: {e}", delta.model_id);
                }
            }
            SinkItem::Tournament { name, doc } => {
                if let Err(e) = store.upsert_tournament(&name, &doc) {
                    warn!("failed to upsert tournament {name}: {e}");
                }
            }
        }
    }
    if !turns.is_empty() {
        if let Err(e) = store.insert_turns(&turns) {
            warn!("failed to insert {} turn documents: {e}", turns.len());
        }
    }
}

/// The model with the single highest score, or `None` on a tie.
pub(crate) fn derive_winner(scores: &Scores, seat_models: &BTreeMap<String, String>) -> Option<String> {
    let max = scores.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut top = scores.iter().filter(|(_, s)| **s == max);
    let (seat, _) = top.next()?;
    if top.next().is_some() {
        return None;
    }
    seat_models.get(seat).cloned()
}

/// Re-ingest a durable log file into a store.
///
/// Turn inserts rely on the store's compound unique key, so running the
/// same file twice is a net no-op. Model aggregates are deliberately not
/// re-derived here: they are increment-only and would double-count.
pub fn backfill_log_file(path: &Path, store: &dyn DocumentStore) -> anyhow::Result<BackfillSummary> {
    let data = std::fs::read_to_string(path)?;
    let mut turns = Vec::new();
    let mut matches = 0usize;

    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let doc: Value = serde_json::from_str(line)?;
        if doc.get("record_type").and_then(Value::as_str) == Some("match_summary") {
            if let Some(match_id) = doc.get("match_id").and_then(Value::as_str) {
                store.upsert_match(match_id, &doc)?;
                matches += 1;
            }
        } else {
            turns.push(doc);
        }
    }

    let inserted = turns.len();
    for chunk in turns.chunks(BATCH_SIZE) {
        store.insert_turns(chunk)?;
    }
    Ok(BackfillSummary {
        turns: inserted,
        matches,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSummary {
    pub turns: usize,
    pub matches: usize,
}

// ---------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------

/// Per-model aggregate document held by [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStats {
    pub total_matches: u32,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub total_violations: u64,
    pub games: BTreeMap<String, GameStats>,
    pub last_played: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GameStats {
    pub matches: u32,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
}

#[derive(Default)]
struct MemoryStoreInner {
    turns: Vec<Value>,
    turn_keys: HashSet<String>,
    matches: BTreeMap<String, Value>,
    models: BTreeMap<String, ModelStats>,
    tournaments: BTreeMap<String, Value>,
}

/// Store used by tests and offline runs: enforces the compound unique
/// key on turns and applies model-stat increments atomically under one
/// lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn turn_count(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").turns.len()
    }

    pub fn match_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .matches
            .keys()
            .cloned()
            .collect()
    }

    pub fn match_doc(&self, match_id: &str) -> Option<Value> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .matches
            .get(match_id)
            .cloned()
    }

    pub fn model_stats(&self, model_id: &str) -> Option<ModelStats> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .models
            .get(model_id)
            .cloned()
    }

    pub fn turns_for_match(&self, match_id: &str) -> Vec<Value> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .turns
            .iter()
            .filter(|t| t.get("match_id").and_then(Value::as_str) == Some(match_id))
            .cloned()
            .collect()
    }
}

fn compound_key(doc: &Value) -> String {
    format!(
        "{}|{}|{}|{}",
        doc.get("match_id").and_then(Value::as_str).unwrap_or(""),
        doc.get("turn_number").and_then(Value::as_u64).unwrap_or(0),
        doc.get("hand_number").and_then(Value::as_u64).unwrap_or(0),
        doc.get("player_id").and_then(Value::as_str).unwrap_or(""),
    )
}

impl DocumentStore for MemoryStore {
    fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn insert_turns(&self, turns: &[Value]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        for doc in turns {
            let key = compound_key(doc);
            if inner.turn_keys.insert(key) {
                inner.turns.push(doc.clone());
            }
        }
        Ok(())
    }

    fn upsert_match(&self, match_id: &str, doc: &Value) -> anyhow::Result<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .matches
            .insert(match_id.to_string(), doc.clone());
        Ok(())
    }

    fn apply_model_stats(&self, delta: &ModelStatDelta) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let stats = inner.models.entry(delta.model_id.clone()).or_default();
        stats.total_matches += 1;
        stats.wins += delta.wins;
        stats.losses += delta.losses;
        stats.draws += delta.draws;
        stats.total_violations += delta.violations;
        stats.last_played = delta.last_played.clone();
        let game = stats.games.entry(delta.event_type.clone()).or_default();
        game.matches += 1;
        game.wins += delta.wins;
        game.losses += delta.losses;
        game.draws += delta.draws;
        Ok(())
    }

    fn upsert_tournament(&self, name: &str, doc: &Value) -> anyhow::Result<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .tournaments
            .insert(name.to_string(), doc.clone());
        Ok(())
    }
}
