use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::entry::Token;

/// Source of capability tokens: non-negative 31-bit pseudo-random values,
/// one independent draw per allocation.
///
/// Nothing relies on tokens being unique; they only need to make a stale
/// handle unlikely to pass validation by accident.
pub(crate) struct TokenSource {
    rng: StdRng,
}

impl TokenSource {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic source for tests.
    #[cfg(test)]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn draw(&mut self) -> Token {
        self.rng.gen_range(0..=i32::MAX)
    }
}
