//! Deterministic toy engines and adapter helpers shared by the
//! integration tests. ChipDuel is a minimal chip-conserving betting
//! game: both seats ante one chip per hand, act once each, and the pot
//! goes to the last seat standing (or a seeded coin flip when both
//! stay in).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};

use arena::adapter::{AdapterError, AdapterResponse, Message, ModelAdapter, QueryContext};
use game_interface::{EngineFactory, GameEngine, Scores, SeatId, ValidationResult};

const SEATS: [&str; 2] = ["player_a", "player_b"];
const ANTE: i64 = 1;

pub struct ChipDuel {
    hands_per_match: u32,
    starting_stack: i64,
    fail_after_actions: Option<u32>,

    rng: ChaCha8Rng,
    stacks: [i64; 2],
    pot: i64,
    hand_number: u32,
    active: usize,
    in_hand: [bool; 2],
    acted: [bool; 2],
    applied_actions: u32,
    terminal: bool,
    highlights: Vec<u64>,
}

impl ChipDuel {
    pub fn new(hands_per_match: u32, starting_stack: i64, fail_after_actions: Option<u32>) -> Self {
        ChipDuel {
            hands_per_match,
            starting_stack,
            fail_after_actions,
            rng: ChaCha8Rng::seed_from_u64(0),
            stacks: [starting_stack; 2],
            pot: 0,
            hand_number: 1,
            active: 0,
            in_hand: [true; 2],
            acted: [false; 2],
            applied_actions: 0,
            terminal: false,
            highlights: Vec::new(),
        }
    }

    fn seat_index(seat: &str) -> usize {
        SEATS.iter().position(|s| *s == seat).expect("known seat")
    }

    fn start_hand(&mut self) {
        if self.stacks.iter().any(|s| *s < ANTE) {
            self.terminal = true;
            return;
        }
        for stack in &mut self.stacks {
            *stack -= ANTE;
        }
        self.pot = 2 * ANTE;
        self.in_hand = [true; 2];
        self.acted = [false; 2];
        self.active = 0;
    }

    fn settle_hand(&mut self) {
        if self.pot > 2 * ANTE {
            self.highlights.push(u64::from(self.hand_number));
        }
        match (self.in_hand[0], self.in_hand[1]) {
            (true, false) => self.stacks[0] += self.pot,
            (false, true) => self.stacks[1] += self.pot,
            (true, true) => {
                let winner = usize::from(self.rng.gen_range(0..2u8) == 1);
                self.stacks[winner] += self.pot;
            }
            (false, false) => {
                let half = self.pot / 2;
                self.stacks[0] += self.pot - half;
                self.stacks[1] += half;
            }
        }
        self.pot = 0;
        if self.hand_number >= self.hands_per_match {
            self.terminal = true;
        } else {
            self.hand_number += 1;
            self.start_hand();
        }
    }

    fn advance(&mut self) {
        if self.acted.iter().all(|a| *a) {
            self.settle_hand();
        } else {
            self.active = 1 - self.active;
        }
    }
}

impl GameEngine for ChipDuel {
    fn reset(&mut self, seed: i64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed as u64);
        self.stacks = [self.starting_stack; 2];
        self.pot = 0;
        self.hand_number = 1;
        self.applied_actions = 0;
        self.terminal = false;
        self.highlights.clear();
        self.start_hand();
    }

    fn current_player(&self) -> SeatId {
        SEATS[self.active].to_string()
    }

    fn get_prompt(&self, seat: &str) -> String {
        let i = Self::seat_index(seat);
        format!(
            "Hand {}/{}. Street: bet. Your stack: {}, pot: {}. \
             Respond with JSON: {{\"action\": \"call\"|\"fold\"|\"raise\", \"amount\": n}}",
            self.hand_number, self.hands_per_match, self.stacks[i], self.pot
        )
    }

    fn get_retry_prompt(&self, seat: &str, reason: &str) -> String {
        format!(
            "Your previous response was invalid: {reason}. {}",
            self.get_prompt(seat)
        )
    }

    fn get_action_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "enum": ["call", "fold", "raise"] },
                "amount": { "type": "integer", "minimum": 1 },
                "reasoning": { "type": "string" }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    fn validate_action(&self, seat: &str, action: &Value) -> ValidationResult {
        let i = Self::seat_index(seat);
        match action.get("action").and_then(Value::as_str) {
            Some("raise") => match action.get("amount").and_then(Value::as_i64) {
                None => ValidationResult::illegal("raise requires an amount"),
                Some(amount) if amount > self.stacks[i] => {
                    ValidationResult::illegal(format!(
                        "cannot raise {amount} with a stack of {}",
                        self.stacks[i]
                    ))
                }
                Some(_) => ValidationResult::legal(),
            },
            Some("call") | Some("fold") => ValidationResult::legal(),
            _ => ValidationResult::illegal("unknown action"),
        }
    }

    fn apply_action(&mut self, seat: &str, action: &Value) -> anyhow::Result<()> {
        self.applied_actions += 1;
        if let Some(n) = self.fail_after_actions {
            if self.applied_actions >= n {
                bail!("synthetic engine fault at action {n}");
            }
        }
        let i = Self::seat_index(seat);
        match action.get("action").and_then(Value::as_str) {
            Some("fold") => self.in_hand[i] = false,
            Some("raise") => {
                let amount = action.get("amount").and_then(Value::as_i64).unwrap_or(0);
                self.stacks[i] -= amount;
                self.pot += amount;
            }
            _ => {}
        }
        self.acted[i] = true;
        self.advance();
        Ok(())
    }

    fn forfeit_turn(&mut self, seat: &str) {
        let i = Self::seat_index(seat);
        self.in_hand[i] = false;
        self.acted[i] = true;
        self.advance();
    }

    fn forfeit_match(&mut self, seat: &str) {
        let i = Self::seat_index(seat);
        self.stacks[1 - i] += self.pot;
        self.pot = 0;
        self.terminal = true;
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn get_scores(&self) -> Scores {
        SEATS
            .iter()
            .zip(self.stacks)
            .map(|(seat, stack)| (seat.to_string(), stack as f64))
            .collect()
    }

    fn get_state_snapshot(&self) -> Value {
        json!({
            "hand_number": self.hand_number,
            "street": "bet",
            "pot": self.pot,
            "stacks": BTreeMap::from([
                (SEATS[0], self.stacks[0]),
                (SEATS[1], self.stacks[1]),
            ]),
        })
    }

    fn get_highlight_hands(&self) -> Vec<u64> {
        self.highlights.clone()
    }
}

/// Builds [`ChipDuel`] engines from event params:
/// `{"hands_per_match": n, "starting_stack": n, "fail_after_actions": n?}`.
pub struct ChipDuelFactory;

impl EngineFactory for ChipDuelFactory {
    fn new_engine(&self, params: &Value) -> anyhow::Result<Box<dyn GameEngine>> {
        let hands = params
            .get("hands_per_match")
            .and_then(Value::as_u64)
            .unwrap_or(100) as u32;
        let stack = params
            .get("starting_stack")
            .and_then(Value::as_i64)
            .unwrap_or(200);
        let fail_after = params
            .get("fail_after_actions")
            .and_then(Value::as_u64)
            .map(|n| n as u32);
        Ok(Box::new(ChipDuel::new(hands, stack, fail_after)))
    }
}

/// Wraps another adapter and counts queries, for retry-budget checks.
pub struct CountingAdapter {
    inner: Box<dyn ModelAdapter>,
    calls: Arc<AtomicU32>,
}

impl CountingAdapter {
    pub fn new(inner: Box<dyn ModelAdapter>) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            CountingAdapter {
                inner,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl ModelAdapter for CountingAdapter {
    fn query(
        &self,
        messages: &[Message],
        max_tokens: u32,
        timeout: Duration,
        context: &QueryContext,
    ) -> Result<AdapterResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.query(messages, max_tokens, timeout, context)
    }
}
