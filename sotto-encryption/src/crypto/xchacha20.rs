// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20-Poly1305 authenticated encryption.
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::crypto::Secret;

pub const XAEAD_KEY_SIZE: usize = 32;

pub const XAEAD_NONCE_SIZE: usize = 24;

/// Extended nonce (192 bit), large enough to be safely generated at random
/// for every encryption.
pub type XAeadNonce = [u8; XAEAD_NONCE_SIZE];

/// Encrypts plaintext with the given key and nonce, authenticating the
/// resulting ciphertext.
pub fn xaead_encrypt(
    key: &Secret<XAEAD_KEY_SIZE>,
    nonce: &XAeadNonce,
    plaintext: &[u8],
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| XAeadError::Encrypt)
}

/// Decrypts a ciphertext, verifying its authentication tag.
///
/// Fails when the ciphertext was tampered with or the key does not match.
pub fn xaead_decrypt(
    key: &Secret<XAEAD_KEY_SIZE>,
    nonce: &XAeadNonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| XAeadError::Decrypt)
}

#[derive(Debug, Error)]
pub enum XAeadError {
    #[error("plaintext could not be encrypted")]
    Encrypt,

    #[error("ciphertext failed authentication during decryption")]
    Decrypt,
}
