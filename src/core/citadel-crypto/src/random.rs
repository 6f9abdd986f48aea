//! Random material for the vault: wrapping keys, KDF salts, AEAD nonces,
//! and secret row identifiers. Everything draws from the OS CSPRNG;
//! nothing here is seeded or reproducible.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{KEY_SIZE, NONCE_SIZE};

/// Size of a key-derivation salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Random bytes behind a row identifier. Rendered as hex, so stored ids
/// are twice this long.
const ID_SIZE: usize = 16;

/// Generates a random 256-bit key, zeroized on drop.
///
/// Session wrapping keys come from here; the master key never does, it is
/// always derived from the password.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut *key);
    key
}

/// Generates a random salt for key derivation.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Generates a random nonce for AES-GCM.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generates an opaque identifier for a secret row.
///
/// Identifiers are stable across updates, so they only need to be unique,
/// not secret: 16 random bytes as lowercase hex.
pub fn generate_id() -> String {
    let mut bytes = [0u8; ID_SIZE];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
