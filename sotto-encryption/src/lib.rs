// SPDX-License-Identifier: MIT OR Apache-2.0

//! `sotto-encryption` provides the cryptographic half of the sotto secure
//! group messaging core: per-user key material, deterministic per-(group,
//! member) key derivation and per-recipient message encryption.
//!
//! ## Scheme
//!
//! Every outgoing message is encrypted exactly once under a fresh random
//! message key (XChaCha20-Poly1305). The message key is then *wrapped*
//! (encrypted again) once per recipient, under a key both sides derive
//! independently from the group and recipient identifiers. Receivers look up
//! their own wrapped entry, unwrap the message key and open the content.
//!
//! Key material (identity key, signed pre-key, a pool of one-time keys) is
//! generated per user and persisted through the [`traits::KeyMaterialStore`]
//! interface; see [`GroupKeyStore`] for initialization and rotation.
//!
//! ## Security
//!
//! The derivation scheme is symmetric and deterministic: it gives every
//! group member the same pairwise wrapping keys without a key-exchange round
//! trip, at the cost of forward secrecy. Rotating the one-time key pool does
//! not change previously derived wrapping keys. This mirrors the behavior of
//! the system this crate was extracted from and is a deliberate trade-off,
//! not an oversight; a protocol with real key agreement would be a redesign
//! of this module's contract.
mod cipher;
mod crypto;
mod derive;
mod key_material;
mod key_store;
mod memory;
pub mod traits;

mod package;

pub use cipher::{DecryptError, EncryptError, decrypt_for_group, encrypt_for_group};
pub use crypto::{Rng, RngError, Secret};
pub use derive::{DerivationError, GROUP_KEY_SIZE, derive_group_key};
pub use key_material::{KEY_SIZE, KeyMaterial, ONETIME_KEY_POOL_SIZE};
pub use key_store::{GroupKeyStore, KeyStoreError};
pub use memory::MemoryKeyStore;
pub use package::{EncryptedMessagePackage, PACKAGE_VERSION, PackageError};
