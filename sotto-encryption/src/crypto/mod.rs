// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives: random-number generation, secret containers,
//! key derivation and authenticated encryption.
pub mod hkdf;
mod rng;
mod secret;
pub mod xchacha20;

pub use rng::{Rng, RngError};
pub use secret::Secret;
