//! AES-256-GCM authenticated encryption with base64 wire framing.
//!
//! Every stored secret value, the password-verification sentinel, and the
//! cached session key use the same frame: `base64(nonce ‖ tag ‖ ciphertext)`.
//! The backup and export codecs lay the fields out themselves and use the
//! raw-part variants [`seal_parts`] / [`open_parts`].

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::generate_nonce;

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Encrypts plaintext and returns the raw frame fields.
///
/// A fresh random nonce is generated per call, so encrypting the same
/// plaintext twice yields distinct outputs.
///
/// # Returns
///
/// `(nonce, tag, ciphertext)` — 12 bytes, 16 bytes, and the body.
pub fn seal_parts(
    key: &[u8],
    plaintext: &[u8],
) -> Result<([u8; NONCE_SIZE], [u8; TAG_SIZE], Vec<u8>), CryptoError> {
    let cipher = cipher(key)?;

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the tag to the ciphertext; split it back out.
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let tag_start = sealed.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);

    Ok((nonce_bytes, tag, sealed))
}

/// Decrypts raw frame fields produced by [`seal_parts`].
pub fn open_parts(
    key: &[u8],
    nonce: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher(key).map_err(|_| CryptoError::DecryptionFailed)?;

    if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(Zeroizing::new(plaintext))
}

/// Encrypts plaintext into the vault wire frame.
///
/// Format: `base64(nonce (12 bytes) ‖ tag (16 bytes) ‖ ciphertext)`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<String, CryptoError> {
    let (nonce, tag, body) = seal_parts(key, plaintext)?;

    let mut framed = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + body.len());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&tag);
    framed.extend_from_slice(&body);

    Ok(BASE64.encode(framed))
}

/// Decrypts a vault wire frame produced by [`encrypt`].
///
/// # Errors
///
/// [`CryptoError::DecryptionFailed`] if the blob is not valid base64, is
/// shorter than nonce + tag, or fails AEAD verification.
pub fn decrypt(key: &[u8], blob: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let raw = BASE64
        .decode(blob)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    if raw.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let nonce = &raw[..NONCE_SIZE];
    let tag = &raw[NONCE_SIZE..NONCE_SIZE + TAG_SIZE];
    let body = &raw[NONCE_SIZE + TAG_SIZE..];

    open_parts(key, nonce, tag, body)
}

/// Compares two byte strings in constant time.
///
/// Lengths are compared first; unequal lengths short-circuit to `false`,
/// which leaks only the length.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Verifies a candidate key against an encrypted sentinel.
///
/// Decrypts `blob` under `key` and compares with `expected` in constant
/// time. Any decryption error is reported as a mismatch.
pub fn verify_password(key: &[u8], expected: &[u8], blob: &str) -> bool {
    match decrypt(key, blob) {
        Ok(plaintext) => constant_time_equal(&plaintext, expected),
        Err(_) => false,
    }
}
