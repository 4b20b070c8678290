//! Contract between the arena and the individual game engines.
//!
//! Each event (poker, board games, dice games) provides a [`GameEngine`]
//! implementation. The match loop interacts with engines only through
//! this trait: it never inspects game rules, only prompts, schemas,
//! validation verdicts and scores.

use std::collections::BTreeMap;

use serde_json::Value;

/// Seat identifiers are `"player_a"`, `"player_b"`, ... up to nine seats.
pub type SeatId = String;

/// Final (or running) scores per seat.
pub type Scores = BTreeMap<SeatId, f64>;

/// Verdict of [`GameEngine::validate_action`]. Does not modify state.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub legal: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn legal() -> Self {
        ValidationResult {
            legal: true,
            reason: None,
        }
    }

    pub fn illegal(reason: impl Into<String>) -> Self {
        ValidationResult {
            legal: false,
            reason: Some(reason.into()),
        }
    }
}

/// What every event engine must implement.
///
/// Engines must be deterministic under a fixed seed and any sequence of
/// validated actions. `forfeit_turn` must always succeed, conserve
/// score, and advance the state so that `current_player()` eventually
/// moves on.
pub trait GameEngine: Send {
    /// Initialize or reinitialize all game state from the given seed.
    fn reset(&mut self, seed: i64);

    /// Seat whose turn it is.
    fn current_player(&self) -> SeatId;

    /// Prompt for the given seat, freshly generated from current state.
    fn get_prompt(&self, seat: &str) -> String;

    /// Prompt for a retry after `reason` went wrong.
    fn get_retry_prompt(&self, seat: &str, reason: &str) -> String;

    /// JSON Schema describing valid actions for this event.
    fn get_action_schema(&self) -> Value;

    /// Check an action against the rules without applying it.
    fn validate_action(&self, seat: &str, action: &Value) -> ValidationResult;

    /// Apply a previously validated action.
    ///
    /// # Errors
    /// An error here means the engine reached an impossible state (a
    /// rule bug, not a player mistake) and aborts the match.
    fn apply_action(&mut self, seat: &str, action: &Value) -> anyhow::Result<()>;

    /// Apply the engine's default forfeit action (check if legal, else
    /// fold/pass). Must never fail.
    fn forfeit_turn(&mut self, seat: &str);

    /// End the match because `seat` forfeited it: award the remaining
    /// stake to the surviving seats and mark the match terminal.
    /// Must conserve total score.
    fn forfeit_match(&mut self, seat: &str);

    fn is_terminal(&self) -> bool;

    /// Only meaningful once `is_terminal()` is true, except immediately
    /// after `reset` where it reports the initial stakes.
    fn get_scores(&self) -> Scores;

    /// JSON-serializable snapshot of the current state. Should carry
    /// `hand_number` and `street` keys where the game has them.
    fn get_state_snapshot(&self) -> Value;

    /// Hand/turn numbers the engine flags as highlights.
    fn get_highlight_hands(&self) -> Vec<u64>;
}

/// Constructs fresh engines for one event kind.
pub trait EngineFactory: Send + Sync {
    /// Build a new engine from the event's configured parameters.
    fn new_engine(&self, params: &Value) -> anyhow::Result<Box<dyn GameEngine>>;
}
