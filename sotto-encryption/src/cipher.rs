// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypting messages towards a group and decrypting them again.
//!
//! Every message is encrypted exactly once under a fresh random message key;
//! the message key is then wrapped for each recipient under the key derived
//! for that (group, recipient) pair. Receivers unwrap their own copy and
//! open the content with it.
use std::collections::BTreeMap;

use chrono::Utc;
use serde_bytes::ByteBuf;
use thiserror::Error;
use tracing::warn;

use sotto_core::{GroupId, MessageId, UserId};

use crate::crypto::xchacha20::{
    XAEAD_KEY_SIZE, XAEAD_NONCE_SIZE, XAeadError, XAeadNonce, xaead_decrypt, xaead_encrypt,
};
use crate::crypto::{Rng, RngError, Secret};
use crate::derive::{DerivationError, derive_group_key};
use crate::package::{EncryptedMessagePackage, PACKAGE_VERSION};

/// Encrypts a message towards all given recipients of a group.
///
/// The sender is always included as a recipient of their own message so they
/// can re-read it later. When the wrapping key for a single recipient cannot
/// be derived, that recipient's entry is omitted and the send continues;
/// they will simply be unable to decrypt this message. Only a failure to
/// encrypt the content itself fails the whole call.
pub fn encrypt_for_group(
    plaintext: &[u8],
    group_id: &GroupId,
    recipient_ids: &[UserId],
    sender_id: &UserId,
    rng: &Rng,
) -> Result<EncryptedMessagePackage, EncryptError> {
    // Fresh message key and nonce for every single call, never reused.
    let message_key: Secret<XAEAD_KEY_SIZE> = Secret::from_rng(rng)?;
    let nonce: XAeadNonce = rng.random_array()?;
    let ciphertext = xaead_encrypt(&message_key, &nonce, plaintext)?;

    let mut wrapped_keys = BTreeMap::new();
    for member_id in recipient_ids.iter().chain(std::iter::once(sender_id)) {
        if wrapped_keys.contains_key(member_id) {
            continue;
        }
        match wrap_message_key(&message_key, group_id, member_id, rng) {
            Ok(wrapped) => {
                wrapped_keys.insert(member_id.clone(), ByteBuf::from(wrapped));
            }
            Err(err) => {
                // Degraded delivery: this member will not be able to read
                // the message, everyone else still can.
                warn!(group = %group_id, member = %member_id,
                    "omitting recipient from encrypted message: {err}");
            }
        }
    }

    Ok(EncryptedMessagePackage {
        version: PACKAGE_VERSION,
        ciphertext: ByteBuf::from(frame(nonce, ciphertext)),
        wrapped_keys,
        sender_id: sender_id.clone(),
        timestamp: Utc::now(),
        message_id: MessageId::random(),
    })
}

/// Decrypts a group message for one reader.
///
/// The reader derives the same wrapping key the sender used for them,
/// unwraps their copy of the message key and opens the content with it. Any
/// authentication failure along the way is surfaced as
/// [`DecryptError::TamperedOrCorrupted`]; partial plaintext is never
/// returned.
pub fn decrypt_for_group(
    package: &EncryptedMessagePackage,
    group_id: &GroupId,
    reader_id: &UserId,
) -> Result<Vec<u8>, DecryptError> {
    if package.version() != PACKAGE_VERSION {
        return Err(DecryptError::UnsupportedVersion(package.version()));
    }

    let wrapped = package
        .wrapped_key_for(reader_id)
        .ok_or(DecryptError::NotAddressedToReader)?;

    let wrapping_key = derive_group_key(group_id, reader_id)?;
    let (key_nonce, wrapped_key) = unframe(wrapped)?;
    let message_key_bytes = xaead_decrypt(&wrapping_key, &key_nonce, wrapped_key)
        .map_err(|_| DecryptError::TamperedOrCorrupted)?;
    let message_key: Secret<XAEAD_KEY_SIZE> = Secret::from_bytes(
        message_key_bytes
            .try_into()
            .map_err(|_| DecryptError::TamperedOrCorrupted)?,
    );

    let (content_nonce, ciphertext) = unframe(package.ciphertext())?;
    xaead_decrypt(&message_key, &content_nonce, ciphertext)
        .map_err(|_| DecryptError::TamperedOrCorrupted)
}

/// Encrypts the message key under the wrapping key derived for one member.
fn wrap_message_key(
    message_key: &Secret<XAEAD_KEY_SIZE>,
    group_id: &GroupId,
    member_id: &UserId,
    rng: &Rng,
) -> Result<Vec<u8>, WrapError> {
    let wrapping_key = derive_group_key(group_id, member_id)?;
    let nonce: XAeadNonce = rng.random_array()?;
    let wrapped = xaead_encrypt(&wrapping_key, &nonce, message_key.as_bytes())?;
    Ok(frame(nonce, wrapped))
}

fn frame(nonce: XAeadNonce, mut ciphertext: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(XAEAD_NONCE_SIZE + ciphertext.len());
    framed.extend_from_slice(&nonce);
    framed.append(&mut ciphertext);
    framed
}

fn unframe(framed: &[u8]) -> Result<(XAeadNonce, &[u8]), DecryptError> {
    if framed.len() < XAEAD_NONCE_SIZE {
        return Err(DecryptError::TamperedOrCorrupted);
    }
    let (nonce, ciphertext) = framed.split_at(XAEAD_NONCE_SIZE);
    let nonce: XAeadNonce = nonce
        .try_into()
        .map_err(|_| DecryptError::TamperedOrCorrupted)?;
    Ok((nonce, ciphertext))
}

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Aead(#[from] XAeadError),
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("unsupported package version {0}")]
    UnsupportedVersion(u64),

    #[error("message is not addressed to this reader")]
    NotAddressedToReader,

    #[error("message failed authentication and cannot be displayed")]
    TamperedOrCorrupted,

    #[error(transparent)]
    Derivation(#[from] DerivationError),
}

/// Per-recipient wrapping failure. Downgrades that recipient's access
/// instead of aborting the whole encryption.
#[derive(Debug, Error)]
enum WrapError {
    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Aead(#[from] XAeadError),
}
