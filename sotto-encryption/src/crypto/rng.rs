// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;

use rand_chacha::rand_core::{SeedableRng, TryRngCore};
use thiserror::Error;

/// Cryptographically-secure random number generator that uses the ChaCha
/// algorithm.
///
/// Every piece of key material and every nonce in sotto comes out of this
/// generator. Seeded from the operating system by default; tests construct
/// it from a fixed seed to stay deterministic.
#[derive(Debug)]
pub struct Rng {
    rng: Mutex<rand_chacha::ChaCha20Rng>,
}

impl Default for Rng {
    fn default() -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_os_rng()),
        }
    }
}

#[cfg(any(test, feature = "test_utils"))]
impl Rng {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_seed(seed)),
        }
    }
}

impl Rng {
    pub fn random_array<const N: usize>(&self) -> Result<[u8; N], RngError> {
        let mut rng = self.rng.lock().map_err(|_| RngError::LockPoisoned)?;
        let mut out = [0u8; N];
        rng.try_fill_bytes(&mut out)
            .map_err(|_| RngError::NotEnoughRandomness)?;
        Ok(out)
    }
}

#[derive(Debug, Error)]
pub enum RngError {
    #[error("rng lock is poisoned")]
    LockPoisoned,

    #[error("unable to collect enough randomness")]
    NotEnoughRandomness,
}

#[cfg(test)]
mod tests {
    use super::Rng;

    #[test]
    fn seeded_rng_is_deterministic() {
        let sample_1: [u8; 64] = Rng::from_seed([1; 32]).random_array().unwrap();
        let sample_2: [u8; 64] = Rng::from_seed([1; 32]).random_array().unwrap();
        assert_eq!(sample_1, sample_2);
    }

    #[test]
    fn consecutive_draws_differ() {
        let rng = Rng::from_seed([1; 32]);
        let sample_1: [u8; 64] = rng.random_array().unwrap();
        let sample_2: [u8; 64] = rng.random_array().unwrap();
        assert_ne!(sample_1, sample_2);
    }
}
