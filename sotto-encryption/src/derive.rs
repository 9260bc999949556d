// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic derivation of per-(group, member) wrapping keys.
//!
//! Sender and recipient independently compute the same shared secret from
//! the group and member identifiers alone, so no key-exchange round trip is
//! needed before a message can be wrapped for a recipient. The derivation is
//! one-way: the identifiers cannot be recovered from the output.
//!
//! Note that this scheme intentionally provides no forward secrecy; secrets
//! only change when identifiers change. See the design notes for the
//! reasoning behind keeping it.
use thiserror::Error;

use sotto_core::{GroupId, UserId};

use crate::crypto::Secret;
use crate::crypto::hkdf::{HkdfError, hkdf};

/// Size of a derived wrapping key.
pub const GROUP_KEY_SIZE: usize = 32;

/// Domain-separation label, fixed for all derivations of this scheme.
const GROUP_KEY_SALT: &[u8] = b"sotto/group-member-key/v1";

/// Derives the shared wrapping key for one member of a group.
///
/// Deterministic: the same (group, member) pair always yields the same
/// secret, for every caller.
pub fn derive_group_key(
    group_id: &GroupId,
    member_id: &UserId,
) -> Result<Secret<GROUP_KEY_SIZE>, DerivationError> {
    // Length-framed so that distinct (group, member) pairs can never
    // produce the same input key material.
    let mut ikm = Vec::with_capacity(16 + group_id.as_bytes().len() + member_id.as_bytes().len());
    ikm.extend_from_slice(&(group_id.as_bytes().len() as u64).to_be_bytes());
    ikm.extend_from_slice(group_id.as_bytes());
    ikm.extend_from_slice(&(member_id.as_bytes().len() as u64).to_be_bytes());
    ikm.extend_from_slice(member_id.as_bytes());

    let bytes: [u8; GROUP_KEY_SIZE] = hkdf(GROUP_KEY_SALT, &ikm, None)?;
    Ok(Secret::from_bytes(bytes))
}

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error(transparent)]
    Hkdf(#[from] HkdfError),
}

#[cfg(test)]
mod tests {
    use sotto_core::{GroupId, UserId};

    use super::derive_group_key;

    #[test]
    fn deterministic_for_both_sides() {
        let group = GroupId::from("g1");
        let member = UserId::from("alice");

        // Whoever derives the key gets the same result.
        assert_eq!(
            derive_group_key(&group, &member).unwrap(),
            derive_group_key(&group, &member).unwrap()
        );
    }

    #[test]
    fn distinct_per_group_and_member() {
        let key = derive_group_key(&GroupId::from("g1"), &UserId::from("alice")).unwrap();

        assert_ne!(
            key,
            derive_group_key(&GroupId::from("g2"), &UserId::from("alice")).unwrap()
        );
        assert_ne!(
            key,
            derive_group_key(&GroupId::from("g1"), &UserId::from("bob")).unwrap()
        );
    }

    #[test]
    fn no_ambiguity_across_id_boundaries() {
        // ("ab", "c") and ("a", "bc") must not collide.
        let key_1 = derive_group_key(&GroupId::from("ab"), &UserId::from("c")).unwrap();
        let key_2 = derive_group_key(&GroupId::from("a"), &UserId::from("bc")).unwrap();
        assert_ne!(key_1, key_2);
    }
}
