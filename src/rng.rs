//! Random number generation for split perturbations.
//!
//! Split-and-merge is the only randomized part of a fit. A seeded generator
//! makes the accepted/rejected trial sequence reproducible; without a seed
//! the generator draws its key from OS entropy.

use rand::{Error, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// ChaCha20-backed generator used to perturb split component means.
#[derive(Clone, Debug)]
pub struct SplitRng {
    rng: ChaCha20Rng,
    seed: Option<u64>,
    draws: u64,
}

impl SplitRng {
    /// Create a generator keyed from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: ChaCha20Rng::from_entropy(),
            seed: None,
            draws: 0,
        }
    }

    /// Create a reproducible generator.
    ///
    /// `seed_from_u64` expands the 64-bit seed to the full 256-bit key.
    pub fn with_seed(seed: u64) -> Self {
        log::debug!("Split RNG seeded with {}", seed);
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed: Some(seed),
            draws: 0,
        }
    }

    /// Seeded when `seed` is given, entropy-keyed otherwise.
    pub fn from_seed_option(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self::with_seed(s),
            None => Self::new(),
        }
    }

    /// Seed this generator was created with, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Number of 32/64-bit words or byte fills drawn so far.
    pub fn draws(&self) -> u64 {
        self.draws
    }
}

impl Default for SplitRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for SplitRng {
    fn next_u32(&mut self) -> u32 {
        self.draws += 1;
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.draws += 1;
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.draws += 1;
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.draws += 1;
        self.rng.try_fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_seeded_generators_agree() {
        let mut a = SplitRng::with_seed(12345);
        let mut b = SplitRng::from_seed_option(Some(12345));
        for _ in 0..10 {
            assert_eq!(a.gen::<f64>(), b.gen::<f64>());
        }
        assert_eq!(a.seed(), Some(12345));
        assert_eq!(a.draws(), 10);
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = SplitRng::with_seed(1);
        let mut b = SplitRng::with_seed(2);
        let xs: Vec<u64> = (0..4).map(|_| a.next_u64()).collect();
        let ys: Vec<u64> = (0..4).map(|_| b.next_u64()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_entropy_generator_has_no_seed() {
        let rng = SplitRng::from_seed_option(None);
        assert_eq!(rng.seed(), None);
        assert_eq!(rng.draws(), 0);
    }
}
