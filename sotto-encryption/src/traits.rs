// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces against the persistent stores this crate relies on.
use std::fmt::{Debug, Display};

use sotto_core::UserId;

use crate::key_material::KeyMaterial;

/// Interface for persisting per-user key material (the
/// `user_encryption_keys` table of the backing relational store).
///
/// Two variants of the trait are provided: one which is thread-safe
/// (implementing `Sync`) and one which is purely intended for
/// single-threaded execution contexts.
#[trait_variant::make(KeyMaterialStore: Send)]
pub trait LocalKeyMaterialStore: Clone {
    type Error: Display + Debug;

    /// Get a user's key material.
    ///
    /// Returns `None` when no material has been persisted for this user.
    async fn get_key_material(
        &self,
        user_id: &UserId,
    ) -> Result<Option<KeyMaterial>, Self::Error>;

    /// Insert or overwrite a user's key material.
    ///
    /// The write must be atomic: readers never observe a partially-updated
    /// row.
    async fn upsert_key_material(
        &mut self,
        user_id: &UserId,
        material: &KeyMaterial,
    ) -> Result<(), Self::Error>;

    /// Delete a user's key material.
    ///
    /// Returns `true` when the removal occurred and `false` when no material
    /// was found for this user.
    async fn delete_key_material(&mut self, user_id: &UserId) -> Result<bool, Self::Error>;
}
