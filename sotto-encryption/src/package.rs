// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire format of an encrypted group message.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

use sotto_core::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use sotto_core::{MessageId, Timestamp, UserId};

/// The package version this implementation produces and accepts. Anything
/// else is rejected on decode before any other field is touched.
pub const PACKAGE_VERSION: u64 = 1;

/// One encrypted group message as it travels over the transport.
///
/// The content is encrypted exactly once under a per-message key; that key
/// is wrapped separately for every intended recipient (including the sender,
/// so they can re-read their own messages). A recipient missing from
/// `wrapped_keys` simply cannot decrypt, which is a normal outcome and not a
/// protocol violation.
///
/// Serialized as a CBOR record with short field names
/// (`v`/`c`/`k`/`s`/`t`/`i`); unknown or missing fields are decode errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedMessagePackage {
    /// Format version.
    #[serde(rename = "v")]
    pub(crate) version: u64,

    /// Message content encrypted under the per-message key, AEAD nonce
    /// prefixed.
    #[serde(rename = "c")]
    pub(crate) ciphertext: ByteBuf,

    /// Per-recipient wrapped copies of the message key, AEAD nonce prefixed.
    #[serde(rename = "k")]
    pub(crate) wrapped_keys: BTreeMap<UserId, ByteBuf>,

    /// Who encrypted this message.
    #[serde(rename = "s")]
    pub(crate) sender_id: UserId,

    /// When it was encrypted (RFC 3339).
    #[serde(rename = "t")]
    pub(crate) timestamp: Timestamp,

    /// Globally unique message identifier (UUID string), also the handle
    /// for receiver-side deduplication.
    #[serde(rename = "i")]
    pub(crate) message_id: MessageId,
}

/// Minimal probe record used to check the version of an incoming package
/// before the rest of it is decoded.
#[derive(Deserialize)]
struct VersionProbe {
    v: u64,
}

impl EncryptedMessagePackage {
    /// Serializes the package for the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }

    /// Decodes a package received from the transport.
    ///
    /// The version field is validated first; a package with an unknown
    /// version is rejected without decoding anything else.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PackageError> {
        let probe: VersionProbe = decode_cbor(bytes)?;
        if probe.v != PACKAGE_VERSION {
            return Err(PackageError::UnsupportedVersion(probe.v));
        }
        Ok(decode_cbor(bytes)?)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// The wrapped message key addressed to the given reader, if any.
    pub fn wrapped_key_for(&self, reader_id: &UserId) -> Option<&[u8]> {
        self.wrapped_keys.get(reader_id).map(|buf| buf.as_ref())
    }

    /// All recipients this package is addressed to.
    pub fn recipients(&self) -> impl Iterator<Item = &UserId> {
        self.wrapped_keys.keys()
    }

    pub fn sender_id(&self) -> &UserId {
        &self.sender_id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("unsupported package version {0}")]
    UnsupportedVersion(u64),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use serde_bytes::ByteBuf;

    use sotto_core::cbor::encode_cbor;
    use sotto_core::{MessageId, UserId};

    use super::{EncryptedMessagePackage, PACKAGE_VERSION, PackageError};

    fn sample_package() -> EncryptedMessagePackage {
        EncryptedMessagePackage {
            version: PACKAGE_VERSION,
            ciphertext: ByteBuf::from(vec![7; 48]),
            wrapped_keys: BTreeMap::from([
                (UserId::from("alice"), ByteBuf::from(vec![1; 72])),
                (UserId::from("bob"), ByteBuf::from(vec![2; 72])),
            ]),
            sender_id: UserId::from("alice"),
            timestamp: Utc::now(),
            message_id: MessageId::random(),
        }
    }

    #[test]
    fn encode_decode() {
        let package = sample_package();
        let bytes = package.to_bytes().unwrap();
        let package_again = EncryptedMessagePackage::from_bytes(&bytes).unwrap();
        assert_eq!(package, package_again);
    }

    #[test]
    fn unknown_version_rejected_before_decoding() {
        let mut package = sample_package();
        package.version = 2;
        // Break another field: the probe must reject the version without
        // ever looking at it.
        package.ciphertext = ByteBuf::from(vec![]);

        let bytes = package.to_bytes().unwrap();
        let result = EncryptedMessagePackage::from_bytes(&bytes);
        assert!(matches!(result, Err(PackageError::UnsupportedVersion(2))));
    }

    #[test]
    fn missing_fields_are_decode_errors() {
        #[derive(serde::Serialize)]
        struct Partial {
            v: u64,
            c: ByteBuf,
        }

        let bytes = encode_cbor(&Partial {
            v: PACKAGE_VERSION,
            c: ByteBuf::from(vec![7; 8]),
        })
        .unwrap();

        assert!(EncryptedMessagePackage::from_bytes(&bytes).is_err());
    }
}
