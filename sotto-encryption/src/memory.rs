// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory persistence for key material.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sotto_core::UserId;

use crate::key_material::KeyMaterial;
use crate::traits::KeyMaterialStore;

/// An in-memory store for per-user key material.
///
/// `MemoryKeyStore` supports usage in asynchronous and multi-threaded
/// contexts by wrapping its state with an `RwLock` and `Arc`. Useful for
/// tests and for embedders which handle persistence elsewhere.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<HashMap<UserId, KeyMaterial>>>,
}

impl MemoryKeyStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_store(&self) -> RwLockReadGuard<'_, HashMap<UserId, KeyMaterial>> {
        self.inner
            .read()
            .expect("acquire shared read access on store")
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, HashMap<UserId, KeyMaterial>> {
        self.inner
            .write()
            .expect("acquire exclusive write access on store")
    }
}

impl KeyMaterialStore for MemoryKeyStore {
    type Error = Infallible;

    async fn get_key_material(
        &self,
        user_id: &UserId,
    ) -> Result<Option<KeyMaterial>, Self::Error> {
        Ok(self.read_store().get(user_id).cloned())
    }

    async fn upsert_key_material(
        &mut self,
        user_id: &UserId,
        material: &KeyMaterial,
    ) -> Result<(), Self::Error> {
        self.write_store()
            .insert(user_id.clone(), material.clone());
        Ok(())
    }

    async fn delete_key_material(&mut self, user_id: &UserId) -> Result<bool, Self::Error> {
        Ok(self.write_store().remove(user_id).is_some())
    }
}
