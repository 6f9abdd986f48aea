//! Backup codec: versioned framing of a whole vault database file.
//!
//! ## Wire format
//!
//! Plain:
//! `0x00 | u32 BE metadata_len | metadata_json | vault_bytes`
//!
//! Encrypted:
//! `0x01 | salt (16) | iv (12) | tag (16) | u32 BE metadata_len |
//! metadata_json | ciphertext`
//!
//! Metadata sits outside the ciphertext in both forms, so backup listings
//! work without the backup password.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use citadel_crypto::aead::{self, NONCE_SIZE, TAG_SIZE};
use citadel_crypto::kdf::derive_master_key;
use citadel_crypto::random::{generate_salt, SALT_SIZE};

use crate::error::VaultError;

/// Format tag: unencrypted backup.
pub const BACKUP_PLAIN: u8 = 0x00;

/// Format tag: password-encrypted backup.
pub const BACKUP_ENCRYPTED: u8 = 0x01;

/// Backup metadata, serialized as JSON inside the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Vault schema version the backup was taken from.
    pub version: String,
    /// Backup creation time, milliseconds since epoch.
    pub created_at: i64,
    /// Advisory secret count. Historically written as 0; consumers must not
    /// rely on it.
    pub secrets_count: u32,
}

/// A backup file on disk together with its parsed metadata.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// Location of the backup file.
    pub path: PathBuf,
    /// Parsed frame metadata.
    pub metadata: BackupMetadata,
}

/// Encodes a backup frame around raw vault database bytes.
///
/// With a password, the vault bytes are AEAD-encrypted under a key derived
/// from the password and a fresh salt; the password is independent of the
/// vault master password.
pub fn encode_backup(
    vault_bytes: &[u8],
    metadata: &BackupMetadata,
    password: Option<&str>,
) -> Result<Vec<u8>, VaultError> {
    let meta_json = serde_json::to_vec(metadata)
        .map_err(|e| VaultError::Corrupted(format!("metadata encoding failed: {e}")))?;
    let meta_len = (meta_json.len() as u32).to_be_bytes();

    match password {
        None => {
            let mut out = Vec::with_capacity(1 + 4 + meta_json.len() + vault_bytes.len());
            out.push(BACKUP_PLAIN);
            out.extend_from_slice(&meta_len);
            out.extend_from_slice(&meta_json);
            out.extend_from_slice(vault_bytes);
            Ok(out)
        },
        Some(password) => {
            let salt = generate_salt();
            let key = derive_master_key(password, &salt);
            let (nonce, tag, ciphertext) = aead::seal_parts(&*key, vault_bytes)?;

            let mut out = Vec::with_capacity(
                1 + SALT_SIZE + NONCE_SIZE + TAG_SIZE + 4 + meta_json.len() + ciphertext.len(),
            );
            out.push(BACKUP_ENCRYPTED);
            out.extend_from_slice(&salt);
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&tag);
            out.extend_from_slice(&meta_len);
            out.extend_from_slice(&meta_json);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        },
    }
}

/// Decodes a backup frame back into metadata and raw vault bytes.
///
/// # Errors
///
/// [`VaultError::Corrupted`] for an unknown or truncated frame, or an
/// encrypted frame with no password supplied; [`VaultError::DecryptionFailed`]
/// when the password is wrong or the ciphertext was tampered with.
pub fn decode_backup(
    blob: &[u8],
    password: Option<&str>,
) -> Result<(BackupMetadata, Vec<u8>), VaultError> {
    let (format, rest) = blob
        .split_first()
        .ok_or_else(|| VaultError::Corrupted("empty backup file".to_string()))?;

    match *format {
        BACKUP_PLAIN => {
            let (metadata, vault_bytes) = split_metadata(rest)?;
            Ok((metadata, vault_bytes.to_vec()))
        },
        BACKUP_ENCRYPTED => {
            let password = password.ok_or_else(|| {
                VaultError::Corrupted("backup is encrypted; a password is required".to_string())
            })?;

            if rest.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
                return Err(VaultError::Corrupted("truncated backup header".to_string()));
            }
            let (salt, rest) = rest.split_at(SALT_SIZE);
            let (nonce, rest) = rest.split_at(NONCE_SIZE);
            let (tag, rest) = rest.split_at(TAG_SIZE);
            let (metadata, ciphertext) = split_metadata(rest)?;

            let key = derive_master_key(password, salt);
            let vault_bytes = aead::open_parts(&*key, nonce, tag, ciphertext)?;

            Ok((metadata, vault_bytes.to_vec()))
        },
        other => Err(VaultError::Corrupted(format!(
            "unknown backup format tag: {other:#04x}"
        ))),
    }
}

/// Parses only the metadata of a backup frame. Never needs the password.
pub fn read_metadata(blob: &[u8]) -> Result<BackupMetadata, VaultError> {
    let (format, rest) = blob
        .split_first()
        .ok_or_else(|| VaultError::Corrupted("empty backup file".to_string()))?;

    let rest = match *format {
        BACKUP_PLAIN => rest,
        BACKUP_ENCRYPTED => {
            let skip = SALT_SIZE + NONCE_SIZE + TAG_SIZE;
            rest.get(skip..)
                .ok_or_else(|| VaultError::Corrupted("truncated backup header".to_string()))?
        },
        other => {
            return Err(VaultError::Corrupted(format!(
                "unknown backup format tag: {other:#04x}"
            )))
        },
    };

    let (metadata, _) = split_metadata(rest)?;
    Ok(metadata)
}

/// Enumerates `.enc` backups in a directory, newest first.
///
/// Files that cannot be read or parsed are skipped.
pub fn list_backups(dir: &Path) -> Vec<BackupInfo> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut backups = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("enc") {
            continue;
        }

        let Ok(blob) = std::fs::read(&path) else {
            warn!(path = %path.display(), "Skipping unreadable backup");
            continue;
        };
        match read_metadata(&blob) {
            Ok(metadata) => backups.push(BackupInfo { path, metadata }),
            Err(_) => {
                warn!(path = %path.display(), "Skipping malformed backup");
            },
        }
    }

    backups.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));

    debug!(count = backups.len(), dir = %dir.display(), "Listed backups");

    backups
}

fn split_metadata(rest: &[u8]) -> Result<(BackupMetadata, &[u8]), VaultError> {
    if rest.len() < 4 {
        return Err(VaultError::Corrupted("truncated backup header".to_string()));
    }
    let (len_bytes, rest) = rest.split_at(4);
    let meta_len = u32::from_be_bytes(len_bytes.try_into().expect("4-byte slice")) as usize;

    if rest.len() < meta_len {
        return Err(VaultError::Corrupted(
            "backup metadata length out of range".to_string(),
        ));
    }
    let (meta_json, payload) = rest.split_at(meta_len);

    let metadata = serde_json::from_slice(meta_json)
        .map_err(|e| VaultError::Corrupted(format!("malformed backup metadata: {e}")))?;

    Ok((metadata, payload))
}
