//! Export codec: portable, password-encrypted secret bundles.
//!
//! ## Wire format
//!
//! `"SECRETS_EXPORT_V1" (17) | salt (16) | iv (12) | tag (16) | ciphertext`
//!
//! The ciphertext is UTF-8 JSON: an ordered array of entries. Exports are
//! always encrypted; the export password is independent of the vault master
//! password.

use serde::{Deserialize, Serialize};

use citadel_crypto::aead::{self, NONCE_SIZE, TAG_SIZE};
use citadel_crypto::kdf::derive_master_key;
use citadel_crypto::random::{generate_salt, SALT_SIZE};

use crate::error::VaultError;
use crate::types::Environment;
use crate::validate::require_valid_export_password;

/// Magic prefix identifying an export bundle.
pub const EXPORT_MAGIC: &[u8; 17] = b"SECRETS_EXPORT_V1";

/// One secret in a portable bundle. `value` is plaintext here; the bundle
/// as a whole is encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    /// Secret key.
    pub key: String,
    /// Plaintext value.
    pub value: String,
    /// Owning environment.
    pub environment: Environment,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Encodes entries into an encrypted export bundle.
pub fn encode_export(entries: &[ExportEntry], password: &str) -> Result<Vec<u8>, VaultError> {
    require_valid_export_password(password)?;

    let json = serde_json::to_vec(entries)
        .map_err(|e| VaultError::Corrupted(format!("export encoding failed: {e}")))?;

    let salt = generate_salt();
    let key = derive_master_key(password, &salt);
    let (nonce, tag, ciphertext) = aead::seal_parts(&*key, &json)?;

    let mut out =
        Vec::with_capacity(EXPORT_MAGIC.len() + SALT_SIZE + NONCE_SIZE + TAG_SIZE + ciphertext.len());
    out.extend_from_slice(EXPORT_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);

    Ok(out)
}

/// Decodes an export bundle.
///
/// # Errors
///
/// [`VaultError::Corrupted`] when the magic is missing or the frame is
/// truncated or the decrypted payload is not valid JSON;
/// [`VaultError::DecryptionFailed`] on a wrong password or tampering.
pub fn decode_export(blob: &[u8], password: &str) -> Result<Vec<ExportEntry>, VaultError> {
    if blob.len() < EXPORT_MAGIC.len() + SALT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(VaultError::Corrupted("truncated export file".to_string()));
    }

    let (magic, rest) = blob.split_at(EXPORT_MAGIC.len());
    if magic != EXPORT_MAGIC {
        return Err(VaultError::Corrupted(
            "not a secrets export file (bad magic)".to_string(),
        ));
    }

    let (salt, rest) = rest.split_at(SALT_SIZE);
    let (nonce, rest) = rest.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let key = derive_master_key(password, salt);
    let json = aead::open_parts(&*key, nonce, tag, ciphertext)?;

    serde_json::from_slice(&json)
        .map_err(|e| VaultError::Corrupted(format!("malformed export payload: {e}")))
}
