// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handle to a user's persisted key material.
//!
//! All key state lives in the backing store; nothing is cached in memory, so
//! the state observed after a method returns is the state that was actually
//! acknowledged by the store. Callers decide how to react to storage
//! failures, the store is never retried internally.
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use sotto_core::UserId;

use crate::crypto::{Rng, RngError};
use crate::key_material::KeyMaterial;
use crate::traits::KeyMaterialStore;

/// Manages per-user key material on top of a persistent store.
///
/// Mutations for the same user are serialized through an in-process lock, so
/// two concurrent rotations cannot interleave their writes. Last writer
/// wins.
#[derive(Debug)]
pub struct GroupKeyStore<S> {
    store: S,
    rng: Arc<Rng>,
    user_locks: StdMutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl<S> GroupKeyStore<S>
where
    S: KeyMaterialStore,
{
    pub fn new(store: S, rng: Arc<Rng>) -> Self {
        Self {
            store,
            rng,
            user_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Generates and persists key material for a user who has none yet.
    ///
    /// Idempotent: when material already exists this is a no-op and no write
    /// is issued. Returns `true` when new material was created.
    pub async fn ensure_initialized(&self, user_id: &UserId) -> Result<bool, KeyStoreError<S::Error>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let existing = self
            .store
            .get_key_material(user_id)
            .await
            .map_err(KeyStoreError::Storage)?;
        if existing.is_some() {
            return Ok(false);
        }

        let material = KeyMaterial::generate(&self.rng)?;
        let mut store = self.store.clone();
        store
            .upsert_key_material(user_id, &material)
            .await
            .map_err(KeyStoreError::Storage)?;

        debug!(user = %user_id, "initialized key material");
        Ok(true)
    }

    /// Regenerates the user's entire one-time key pool and persists it,
    /// overwriting the previous pool.
    ///
    /// Old one-time keys become permanently unusable, there is no grace
    /// period.
    pub async fn rotate_onetime_keys(&self, user_id: &UserId) -> Result<(), KeyStoreError<S::Error>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut material = self
            .store
            .get_key_material(user_id)
            .await
            .map_err(KeyStoreError::Storage)?
            .ok_or_else(|| KeyStoreError::UnknownUser(user_id.clone()))?;

        material.rotate_onetime_keys(&self.rng)?;

        let mut store = self.store.clone();
        store
            .upsert_key_material(user_id, &material)
            .await
            .map_err(KeyStoreError::Storage)?;

        debug!(user = %user_id, "rotated one-time key pool");
        Ok(())
    }

    /// Returns the user's persisted key material, if any.
    pub async fn key_material(
        &self,
        user_id: &UserId,
    ) -> Result<Option<KeyMaterial>, KeyStoreError<S::Error>> {
        self.store
            .get_key_material(user_id)
            .await
            .map_err(KeyStoreError::Storage)
    }

    fn user_lock(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .expect("acquire exclusive access on lock table");
        locks.entry(user_id.clone()).or_default().clone()
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError<E> {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("no key material exists for user {0}")]
    UnknownUser(UserId),

    #[error("storage error: {0}")]
    Storage(E),
}
