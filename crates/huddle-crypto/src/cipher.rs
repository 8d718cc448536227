//! AES-256-CBC with PKCS#7 padding, base64 transport encoding.
//!
//! Pure functions. Key and IV are taken as slices so that callers holding
//! material of the wrong size get a [`CipherError`] instead of a panic.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::keys::{IV_LEN, KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Errors from [`encrypt`] and [`decrypt`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid IV length: expected 16 bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("invalid base64: {0}")]
    Encoding(String),

    #[error("padding check failed (wrong key or corrupted ciphertext)")]
    Padding,

    #[error("decrypted bytes are not valid UTF-8")]
    Utf8,
}

impl From<CipherError> for huddle_common::Error {
    fn from(err: CipherError) -> Self {
        huddle_common::Error::crypto(err)
    }
}

fn check_lengths(key: &[u8], iv: &[u8]) -> Result<(), CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    if iv.len() != IV_LEN {
        return Err(CipherError::InvalidIvLength(iv.len()));
    }
    Ok(())
}

/// Encrypt `plaintext` and return standard padded base64.
pub fn encrypt(plaintext: &str, key: &[u8], iv: &[u8]) -> Result<String, CipherError> {
    check_lengths(key, iv)?;
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(STANDARD.encode(ciphertext))
}

/// Decode base64, decrypt and return the UTF-8 plaintext.
pub fn decrypt(ciphertext: &str, key: &[u8], iv: &[u8]) -> Result<String, CipherError> {
    check_lengths(key, iv)?;
    let bytes = STANDARD
        .decode(ciphertext.trim())
        .map_err(|e| CipherError::Encoding(e.to_string()))?;
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&bytes)
        .map_err(|_| CipherError::Padding)?;
    String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
}
