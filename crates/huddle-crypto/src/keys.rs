//! Identifier-based key derivation.
//!
//! ```text
//! identifier ──SHA-256──▶ digest ──hex──▶ 64 chars
//!                                         ├─ chars[0..32] as ASCII ─▶ AES-256 key
//!                                         └─ chars[0..16] as ASCII ─▶ CBC IV
//! ```
//!
//! Taking the hex characters rather than the raw digest bytes matches the
//! Android member application, so keys derived here interoperate with it.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::{self, CipherError};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// AES block / CBC IV length in bytes.
pub const IV_LEN: usize = 16;

/// SHA-256 digest of an identifier.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentifierDigest([u8; 32]);

impl IdentifierDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for IdentifierDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentifierDigest({})", self.to_hex())
    }
}

/// Hash the UTF-8 bytes of `identifier`. No salt.
pub fn hash_identifier(identifier: &str) -> IdentifierDigest {
    IdentifierDigest(Sha256::digest(identifier.as_bytes()).into())
}

/// The AES key for a digest.
pub fn derive_key(digest: &IdentifierDigest) -> [u8; KEY_LEN] {
    hex_prefix(digest)
}

/// The CBC IV for a digest.
pub fn derive_iv(digest: &IdentifierDigest) -> [u8; IV_LEN] {
    hex_prefix(digest)
}

fn hex_prefix<const N: usize>(digest: &IdentifierDigest) -> [u8; N] {
    let mut rendered = digest.to_hex();
    let mut out = [0u8; N];
    out.copy_from_slice(&rendered.as_bytes()[..N]);
    rendered.zeroize();
    out
}

/// Symmetric key and IV for one peer.
///
/// The same identifier always yields the same material. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl KeyMaterial {
    /// Derive from a (claimed) identifier.
    pub fn derive(identifier: &str) -> Self {
        Self::from_digest(&hash_identifier(identifier))
    }

    pub fn from_digest(digest: &IdentifierDigest) -> Self {
        Self {
            key: derive_key(digest),
            iv: derive_iv(digest),
        }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Encrypt with this material. See [`cipher::encrypt`].
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        cipher::encrypt(plaintext, &self.key, &self.iv)
    }

    /// Decrypt with this material. See [`cipher::decrypt`].
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        cipher::decrypt(ciphertext, &self.key, &self.iv)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUDENT_ID: &str = "816012345";
    const STUDENT_ID_SHA256: &str =
        "bd6a16f93657015ff4d2f145d8aa0dbdbbfe0b37eb2dc928c5db872204504b5e";

    #[test]
    fn test_digest_is_sha256() {
        assert_eq!(hash_identifier(STUDENT_ID).to_hex(), STUDENT_ID_SHA256);
        assert_eq!(
            hash_identifier("").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_key_and_iv_are_hex_prefixes() {
        let digest = hash_identifier(STUDENT_ID);
        assert_eq!(&derive_key(&digest), b"bd6a16f93657015ff4d2f145d8aa0dbd");
        assert_eq!(&derive_iv(&digest), b"bd6a16f93657015f");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = KeyMaterial::derive(STUDENT_ID);
        let b = KeyMaterial::derive(STUDENT_ID);
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.iv(), b.iv());
    }

    #[test]
    fn test_different_identifiers_produce_different_material() {
        let a = KeyMaterial::derive("816012345");
        let b = KeyMaterial::derive("816012346");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.iv(), b.iv());
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let keys = KeyMaterial::derive(STUDENT_ID);
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains("bd6a16f9"));
    }

    #[test]
    fn test_unicode_identifiers_are_hashed_as_utf8() {
        let keys = KeyMaterial::derive("étudiant");
        assert!(keys.key().iter().all(u8::is_ascii_hexdigit));
    }
}
