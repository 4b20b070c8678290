//! Violation tracking, penalty rulings, and fidelity reporting.
//!
//! One referee per match, owned by the match-driving routine. It is the
//! single source of truth for what happens after misbehavior, keeping
//! that policy out of the game engines: each seat gets at most one retry
//! per turn, repeated strike-eligible forfeits escalate to ejection.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use game_interface::SeatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MalformedJson,
    IllegalMove,
    Timeout,
    EmptyResponse,
    InjectionAttempt,
}

impl ViolationKind {
    pub fn severity(self) -> u32 {
        match self {
            ViolationKind::MalformedJson => 2,
            ViolationKind::IllegalMove => 1,
            ViolationKind::Timeout => 2,
            ViolationKind::EmptyResponse => 2,
            ViolationKind::InjectionAttempt => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::MalformedJson => "malformed_json",
            ViolationKind::IllegalMove => "illegal_move",
            ViolationKind::Timeout => "timeout",
            ViolationKind::EmptyResponse => "empty_response",
            ViolationKind::InjectionAttempt => "injection_attempt",
        }
    }
}

/// The referee's decision after a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ruling {
    Retry,
    ForfeitTurn,
    EliminatePlayer,
    ForfeitMatch,
}

impl Ruling {
    pub fn as_str(self) -> &'static str {
        match self {
            Ruling::Retry => "retry",
            Ruling::ForfeitTurn => "forfeit_turn",
            Ruling::EliminatePlayer => "eliminate_player",
            Ruling::ForfeitMatch => "forfeit_match",
        }
    }
}

/// How cumulative forfeits escalate to match forfeit.
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Base match-forfeit threshold before seat-count scaling.
    pub match_forfeit_base: u32,
    /// Violation kinds whose turn forfeits count as strikes.
    pub strike_kinds: BTreeSet<ViolationKind>,
    /// Add one to the threshold per seat above six.
    pub scale_with_seats: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        EscalationConfig {
            match_forfeit_base: 3,
            strike_kinds: BTreeSet::from([ViolationKind::Timeout, ViolationKind::EmptyResponse]),
            scale_with_seats: true,
        }
    }
}

#[derive(Debug, Clone)]
struct ViolationRecord {
    kind: ViolationKind,
    severity: u32,
    #[allow(dead_code)]
    details: String,
}

/// Per-seat aggregation of violations over one match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeatFidelity {
    pub total_violations: u32,
    pub malformed_json: u32,
    pub illegal_move: u32,
    pub timeout: u32,
    pub empty_response: u32,
    pub injection_attempts: u32,
    pub total_severity: u32,
    pub retries_used: u32,
    pub turn_forfeits: u32,
    pub strikes: u32,
    pub match_forfeited: bool,
}

/// The full per-match report: one entry per seat, plus the forfeiting
/// seat when the match ended by forfeit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FidelityReport {
    pub seats: BTreeMap<SeatId, SeatFidelity>,
    #[serde(rename = "_match_forfeited_by", skip_serializing_if = "Option::is_none")]
    pub forfeited_by: Option<SeatId>,
}

/// Tracks violations and issues rulings for a single match.
pub struct Referee {
    seats: Vec<SeatId>,
    escalation: EscalationConfig,
    threshold: u32,
    violations: BTreeMap<SeatId, Vec<ViolationRecord>>,
    // Per-turn state, cleared by new_turn().
    turn_violations: BTreeMap<SeatId, u32>,
    retry_used: BTreeMap<SeatId, bool>,
    // Per-match state.
    turn_forfeits: BTreeMap<SeatId, u32>,
    strikes: BTreeMap<SeatId, u32>,
    retries_total: BTreeMap<SeatId, u32>,
    forfeited_by: Option<SeatId>,
}

impl Referee {
    pub fn new(seats: Vec<SeatId>, escalation: EscalationConfig) -> Self {
        let scale = if escalation.scale_with_seats {
            (seats.len() as u32).saturating_sub(6)
        } else {
            0
        };
        let threshold = escalation.match_forfeit_base + scale;
        Referee {
            seats,
            escalation,
            threshold,
            violations: BTreeMap::new(),
            turn_violations: BTreeMap::new(),
            retry_used: BTreeMap::new(),
            turn_forfeits: BTreeMap::new(),
            strikes: BTreeMap::new(),
            retries_total: BTreeMap::new(),
            forfeited_by: None,
        }
    }

    /// The seat-count-scaled match-forfeit threshold.
    pub fn match_forfeit_threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a violation and rule on it.
    ///
    /// First violation of the turn with the retry still available rules
    /// `Retry`; otherwise the turn forfeits, and strike-eligible kinds
    /// that reach the threshold escalate to `ForfeitMatch` (two seats)
    /// or `EliminatePlayer` (three or more).
    pub fn record_violation(&mut self, seat: &str, kind: ViolationKind, details: &str) -> Ruling {
        let severity = kind.severity();
        self.violations
            .entry(seat.to_string())
            .or_default()
            .push(ViolationRecord {
                kind,
                severity,
                details: details.to_string(),
            });
        let turn_count = {
            let count = self.turn_violations.entry(seat.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if turn_count == 1 && !self.retry_consumed(seat) {
            return Ruling::Retry;
        }

        // An injection flag never forfeits the turn: the action it rode
        // in on still proceeds, so nothing below applies to it.
        if kind == ViolationKind::InjectionAttempt {
            return Ruling::ForfeitTurn;
        }

        *self.turn_forfeits.entry(seat.to_string()).or_insert(0) += 1;

        if self.escalation.strike_kinds.contains(&kind) {
            let strikes = self.strikes.entry(seat.to_string()).or_insert(0);
            *strikes += 1;
            if *strikes >= self.threshold {
                self.forfeited_by = Some(seat.to_string());
                return self.ejection_ruling();
            }
        }

        Ruling::ForfeitTurn
    }

    /// Eject a seat outside the ordinary threshold (stuck-loop policy).
    pub fn force_match_forfeit(&mut self, seat: &str) -> Ruling {
        self.forfeited_by = Some(seat.to_string());
        self.ejection_ruling()
    }

    fn ejection_ruling(&self) -> Ruling {
        if self.seats.len() > 2 {
            Ruling::EliminatePlayer
        } else {
            Ruling::ForfeitMatch
        }
    }

    pub fn should_retry(&self, seat: &str) -> bool {
        !self.retry_consumed(seat)
    }

    pub fn consume_retry(&mut self, seat: &str) {
        self.retry_used.insert(seat.to_string(), true);
        *self.retries_total.entry(seat.to_string()).or_insert(0) += 1;
    }

    fn retry_consumed(&self, seat: &str) -> bool {
        self.retry_used.get(seat).copied().unwrap_or(false)
    }

    /// Reset per-turn state. Call before every turn.
    pub fn new_turn(&mut self) {
        self.turn_violations.clear();
        self.retry_used.clear();
    }

    pub fn strikes(&self, seat: &str) -> u32 {
        self.strikes.get(seat).copied().unwrap_or(0)
    }

    pub fn turn_forfeits(&self, seat: &str) -> u32 {
        self.turn_forfeits.get(seat).copied().unwrap_or(0)
    }

    pub fn match_forfeited_by(&self) -> Option<&str> {
        self.forfeited_by.as_deref()
    }

    /// Build the per-seat report. Every seat gets an entry, violations
    /// or not.
    pub fn fidelity_report(&self) -> FidelityReport {
        let mut seats = BTreeMap::new();
        for seat in &self.seats {
            let mut entry = SeatFidelity {
                retries_used: self.retries_total.get(seat).copied().unwrap_or(0),
                turn_forfeits: self.turn_forfeits.get(seat).copied().unwrap_or(0),
                strikes: self.strikes.get(seat).copied().unwrap_or(0),
                match_forfeited: self.forfeited_by.as_deref() == Some(seat.as_str()),
                ..SeatFidelity::default()
            };
            if let Some(records) = self.violations.get(seat) {
                entry.total_violations = records.len() as u32;
                for v in records {
                    entry.total_severity += v.severity;
                    match v.kind {
                        ViolationKind::MalformedJson => entry.malformed_json += 1,
                        ViolationKind::IllegalMove => entry.illegal_move += 1,
                        ViolationKind::Timeout => entry.timeout += 1,
                        ViolationKind::EmptyResponse => entry.empty_response += 1,
                        ViolationKind::InjectionAttempt => entry.injection_attempts += 1,
                    }
                }
            }
            seats.insert(seat.clone(), entry);
        }
        FidelityReport {
            seats,
            forfeited_by: self.forfeited_by.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_seats() -> Vec<SeatId> {
        vec!["player_a".to_string(), "player_b".to_string()]
    }

    fn referee() -> Referee {
        Referee::new(two_seats(), EscalationConfig::default())
    }

    #[test]
    fn first_violation_allows_retry() {
        let mut ref_ = referee();
        let ruling = ref_.record_violation("player_a", ViolationKind::MalformedJson, "bad json");
        assert_eq!(ruling, Ruling::Retry);
    }

    #[test]
    fn second_violation_same_turn_forfeits() {
        let mut ref_ = referee();
        ref_.record_violation("player_a", ViolationKind::MalformedJson, "bad");
        ref_.consume_retry("player_a");
        let ruling = ref_.record_violation("player_a", ViolationKind::IllegalMove, "bad move");
        assert_eq!(ruling, Ruling::ForfeitTurn);
        assert_eq!(ref_.turn_forfeits("player_a"), 1);
    }

    #[test]
    fn retry_flag_tracks_consumption() {
        let mut ref_ = referee();
        ref_.record_violation("player_a", ViolationKind::MalformedJson, "x");
        assert!(ref_.should_retry("player_a"));
        ref_.consume_retry("player_a");
        assert!(!ref_.should_retry("player_a"));
    }

    #[test]
    fn new_turn_resets_retry() {
        let mut ref_ = referee();
        ref_.record_violation("player_a", ViolationKind::MalformedJson, "x");
        ref_.consume_retry("player_a");
        ref_.new_turn();
        let ruling = ref_.record_violation("player_a", ViolationKind::IllegalMove, "y");
        assert_eq!(ruling, Ruling::Retry);
        assert!(ref_.should_retry("player_a"));
    }

    #[test]
    fn violations_accumulate_across_turns() {
        let mut ref_ = referee();
        ref_.record_violation("player_a", ViolationKind::MalformedJson, "x");
        ref_.new_turn();
        ref_.record_violation("player_a", ViolationKind::IllegalMove, "y");
        let report = ref_.fidelity_report();
        let a = &report.seats["player_a"];
        assert_eq!(a.total_violations, 2);
        assert_eq!(a.malformed_json, 1);
        assert_eq!(a.illegal_move, 1);
        assert_eq!(a.total_severity, 3);
    }

    #[test]
    fn strike_kinds_escalate_to_match_forfeit() {
        let mut ref_ = referee();
        for _ in 0..3 {
            ref_.new_turn();
            ref_.record_violation("player_a", ViolationKind::Timeout, "slow");
            ref_.consume_retry("player_a");
            let ruling = ref_.record_violation("player_a", ViolationKind::Timeout, "slow");
            if ref_.strikes("player_a") >= 3 {
                assert_eq!(ruling, Ruling::ForfeitMatch);
            }
        }
        assert_eq!(ref_.match_forfeited_by(), Some("player_a"));
        assert!(ref_.fidelity_report().seats["player_a"].match_forfeited);
    }

    #[test]
    fn non_strike_kinds_never_escalate() {
        let mut ref_ = referee();
        for _ in 0..10 {
            ref_.new_turn();
            ref_.consume_retry("player_a");
            let ruling = ref_.record_violation("player_a", ViolationKind::IllegalMove, "bad");
            assert_eq!(ruling, Ruling::ForfeitTurn);
        }
        assert_eq!(ref_.strikes("player_a"), 0);
        assert!(ref_.match_forfeited_by().is_none());
    }

    #[test]
    fn injection_rules_retry_and_never_forfeits() {
        let mut ref_ = referee();
        let ruling =
            ref_.record_violation("player_a", ViolationKind::InjectionAttempt, "ignore prev");
        assert_eq!(ruling, Ruling::Retry);
        let report = ref_.fidelity_report();
        assert_eq!(report.seats["player_a"].injection_attempts, 1);
        assert_eq!(report.seats["player_a"].turn_forfeits, 0);
        assert_eq!(report.seats["player_a"].strikes, 0);
    }

    #[test]
    fn threshold_scales_with_seat_count() {
        let seats = |n: usize| -> Vec<SeatId> {
            (0..n).map(|i| format!("player_{}", (b'a' + i as u8) as char)).collect()
        };
        assert_eq!(
            Referee::new(seats(2), EscalationConfig::default()).match_forfeit_threshold(),
            3
        );
        assert_eq!(
            Referee::new(seats(7), EscalationConfig::default()).match_forfeit_threshold(),
            4
        );
        assert_eq!(
            Referee::new(seats(8), EscalationConfig::default()).match_forfeit_threshold(),
            5
        );
        assert_eq!(
            Referee::new(seats(9), EscalationConfig::default()).match_forfeit_threshold(),
            6
        );
    }

    #[test]
    fn multiplayer_ejection_is_elimination() {
        let seats: Vec<SeatId> = (0..4)
            .map(|i| format!("player_{}", (b'a' + i as u8) as char))
            .collect();
        let mut ref_ = Referee::new(seats, EscalationConfig::default());
        for _ in 0..3 {
            ref_.new_turn();
            ref_.consume_retry("player_c");
            ref_.record_violation("player_c", ViolationKind::EmptyResponse, "blank");
        }
        assert_eq!(ref_.force_match_forfeit("player_c"), Ruling::EliminatePlayer);
    }

    #[test]
    fn report_covers_clean_seats() {
        let ref_ = referee();
        let report = ref_.fidelity_report();
        assert_eq!(report.seats.len(), 2);
        assert_eq!(report.seats["player_b"].total_violations, 0);
    }
}
