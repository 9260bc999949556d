// SPDX-License-Identifier: MIT OR Apache-2.0

//! A user's long-lived secret key material.
use chrono::Utc;
use serde::{Deserialize, Serialize};

use sotto_core::Timestamp;

use crate::crypto::{Rng, RngError, Secret};

/// Size of every key material unit.
pub const KEY_SIZE: usize = 32;

/// Number of one-time keys a user keeps around. The pool is replaced
/// wholesale on rotation.
pub const ONETIME_KEY_POOL_SIZE: usize = 10;

/// Secret key material of one user: a long-lived identity key, a
/// medium-lived signed pre-key and a bounded pool of one-time keys.
///
/// The identity key is generated once and never changes afterwards; there is
/// no API to replace it. One-time keys are rotated as a whole pool, old ones
/// become permanently unusable the moment the rotation is persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyMaterial {
    identity_key: Secret<KEY_SIZE>,
    signed_prekey: Secret<KEY_SIZE>,
    onetime_keys: Vec<Secret<KEY_SIZE>>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl KeyMaterial {
    /// Generates fresh key material for a user who has none yet.
    pub(crate) fn generate(rng: &Rng) -> Result<Self, RngError> {
        let now = Utc::now();
        Ok(Self {
            identity_key: Secret::from_rng(rng)?,
            signed_prekey: Secret::from_rng(rng)?,
            onetime_keys: generate_onetime_pool(rng)?,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replaces the entire one-time key pool with freshly generated keys.
    pub(crate) fn rotate_onetime_keys(&mut self, rng: &Rng) -> Result<(), RngError> {
        self.onetime_keys = generate_onetime_pool(rng)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn identity_key(&self) -> &Secret<KEY_SIZE> {
        &self.identity_key
    }

    pub fn signed_prekey(&self) -> &Secret<KEY_SIZE> {
        &self.signed_prekey
    }

    pub fn onetime_keys(&self) -> &[Secret<KEY_SIZE>] {
        &self.onetime_keys
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

fn generate_onetime_pool(rng: &Rng) -> Result<Vec<Secret<KEY_SIZE>>, RngError> {
    let mut pool = Vec::with_capacity(ONETIME_KEY_POOL_SIZE);
    for _ in 0..ONETIME_KEY_POOL_SIZE {
        pool.push(Secret::from_rng(rng)?);
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{KeyMaterial, ONETIME_KEY_POOL_SIZE};

    #[test]
    fn generate_full_pool() {
        let rng = Rng::from_seed([1; 32]);
        let material = KeyMaterial::generate(&rng).unwrap();

        assert_eq!(material.onetime_keys().len(), ONETIME_KEY_POOL_SIZE);

        // All generated keys are distinct.
        for (i, key) in material.onetime_keys().iter().enumerate() {
            assert_ne!(key, material.identity_key());
            assert_ne!(key, material.signed_prekey());
            for other in &material.onetime_keys()[i + 1..] {
                assert_ne!(key, other);
            }
        }
    }

    #[test]
    fn rotation_replaces_pool_and_keeps_identity() {
        let rng = Rng::from_seed([1; 32]);
        let mut material = KeyMaterial::generate(&rng).unwrap();

        let identity_before = material.identity_key().clone();
        let prekey_before = material.signed_prekey().clone();
        let pool_before = material.onetime_keys().to_vec();

        material.rotate_onetime_keys(&rng).unwrap();

        assert_eq!(material.identity_key(), &identity_before);
        assert_eq!(material.signed_prekey(), &prekey_before);
        assert_eq!(material.onetime_keys().len(), ONETIME_KEY_POOL_SIZE);
        for key in material.onetime_keys() {
            assert!(!pool_before.contains(key));
        }
    }
}
