//! A small, non-cryptographic PRNG used to jitter client request ids and
//! timeout backoffs. Not suitable for cryptographic key material; see
//! `crate::bft::crypto` for that.

use rand_core::{OsRng, RngCore};

/// Mutable PRNG state. Cheap to create per-thread; reseed with `new()`.
pub struct State(u64);

impl State {
    /// Seeds a new PRNG state from the OS entropy source.
    pub fn new() -> Self {
        let mut seed = OsRng.next_u64();
        if seed == 0 {
            seed = 0xdead_beef_cafe_babe;
        }
        State(seed)
    }

    /// Returns the next pseudo-random `u64`, advancing the internal state.
    ///
    /// xorshift64star.
    pub fn next_state(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_draws_differ() {
        let mut rng = State::new();
        let a = rng.next_state();
        let b = rng.next_state();
        assert_ne!(a, b);
    }
}
