// SPDX-License-Identifier: MIT OR Apache-2.0

//! HKDF key derivation (SHA256).
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Derives new key material of the given length from a salt, input key
/// material and an optional info tag.
pub fn hkdf<const N: usize>(
    salt: &[u8],
    ikm: &[u8],
    info: Option<&[u8]>,
) -> Result<[u8; N], HkdfError> {
    let mut out = [0u8; N];
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    hkdf.expand(info.unwrap_or_default(), &mut out)
        .map_err(|_| HkdfError::InvalidOutputLength)?;
    Ok(out)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("requested output size is too large for hkdf expansion")]
    InvalidOutputLength,
}

#[cfg(test)]
mod tests {
    use super::hkdf;

    #[test]
    fn deterministic_derivation() {
        let out_1: [u8; 32] = hkdf(b"salt", b"secret input", None).unwrap();
        let out_2: [u8; 32] = hkdf(b"salt", b"secret input", None).unwrap();
        assert_eq!(out_1, out_2);

        // Different inputs yield different outputs.
        let out_3: [u8; 32] = hkdf(b"salt", b"other input", None).unwrap();
        assert_ne!(out_1, out_3);

        let out_4: [u8; 32] = hkdf(b"other salt", b"secret input", None).unwrap();
        assert_ne!(out_1, out_4);
    }
}
