use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KmsError;

pub const SYMMETRIC_KEY_LEN: usize = 32;

/// 256-bit symmetric key. Zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KmsError> {
        if bytes.len() != SYMMETRIC_KEY_LEN {
            return Err(KmsError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// HKDF-SHA256 over `ikm`, expanded to one key.
    pub fn derive(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<Self, KmsError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = [0u8; SYMMETRIC_KEY_LEN];
        hk.expand(info, &mut okm)
            .map_err(|_| KmsError::KeyDerivation)?;
        Ok(Self(okm))
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }

    /// Transport form used inside KMS replies.
    pub fn to_jwk(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_jwk(encoded: &str) -> Result<Self, KmsError> {
        let mut decoded = URL_SAFE_NO_PAD.decode(encoded.trim())?;
        let key = Self::from_slice(&decoded);
        decoded.zeroize();
        key
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwk_round_trips_and_rejects_short_keys() {
        let key = SymmetricKey::generate();
        let restored = SymmetricKey::from_jwk(&key.to_jwk()).expect("decode");
        assert_eq!(key, restored);

        let err = SymmetricKey::from_jwk(&URL_SAFE_NO_PAD.encode([1u8; 8])).expect_err("short");
        assert!(matches!(
            err,
            KmsError::InvalidKeyLength {
                expected: 32,
                actual: 8
            }
        ));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = SymmetricKey::from_bytes([7u8; SYMMETRIC_KEY_LEN]);
        assert_eq!(format!("{key:?}"), "SymmetricKey(..)");
    }

    #[test]
    fn derivation_is_salt_separated() {
        let a = SymmetricKey::derive(b"shared", b"req-1", b"info").expect("derive");
        let b = SymmetricKey::derive(b"shared", b"req-2", b"info").expect("derive");
        assert_ne!(a, b);
    }
}
