//! Deterministic, HMAC-derived RNG per match.
//!
//! Seeds are derived via HMAC-SHA-256 so adding, removing or reordering
//! matches never shifts the seed of any other match.

use hmac::{Hmac, Mac};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Produces deterministic, isolated RNG streams for each match.
#[derive(Debug, Clone, Copy)]
pub struct SeedManager {
    tournament_seed: i64,
}

impl SeedManager {
    pub fn new(tournament_seed: i64) -> Self {
        SeedManager { tournament_seed }
    }

    /// Derive a match seed from `(event, round, match_index)`.
    ///
    /// Same inputs always produce the same seed, independent of every
    /// other entry in the schedule.
    pub fn get_match_seed(&self, event: &str, round: u32, match_index: u32) -> i64 {
        let mut mac = HmacSha256::new_from_slice(&self.tournament_seed.to_be_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{event}:{round}:{match_index}").as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(head)
    }

    /// An isolated generator for the given match seed. Never touches
    /// any process-global RNG state.
    pub fn get_rng(&self, match_seed: i64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(match_seed as u64)
    }
}
