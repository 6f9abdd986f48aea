//! On-disk session cache.
//!
//! Lets a short-lived CLI process pick up an unlocked vault without
//! re-prompting for the master password. The master key is re-encrypted
//! under a fresh random session key; both sit in the same file, so this is
//! convenience for a single interactive terminal session, not protection
//! against an adversary who can read the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use citadel_crypto::{aead, MasterKey};

use crate::clock::now_millis;
use crate::error::VaultError;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Serialized session file layout.
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    /// Master key, AEAD-encrypted under `session_key` (base64 frame).
    encrypted_master_key: String,
    /// The 32-byte session key, base64.
    session_key: String,
    /// Expiry, milliseconds since epoch.
    expires_at: i64,
    /// Creation time, milliseconds since epoch.
    created_at: i64,
}

/// Handle to the session cache file.
#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
}

impl SessionCache {
    /// Creates a handle for the session file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the session file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Caches the master key for `timeout_minutes`, replacing any existing
    /// session.
    pub fn save_session(
        &self,
        master_key: &MasterKey,
        timeout_minutes: u64,
    ) -> Result<(), VaultError> {
        let session_key = MasterKey::generate();
        let encrypted_master_key = aead::encrypt(session_key.as_bytes(), master_key.as_bytes())?;

        let now = now_millis();
        let file = SessionFile {
            encrypted_master_key,
            session_key: BASE64.encode(session_key.as_bytes()),
            expires_at: now + (timeout_minutes as i64) * 60_000,
            created_at: now,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec(&file)
            .map_err(|e| VaultError::SessionInvalid(format!("serialize failed: {e}")))?;
        std::fs::write(&self.path, json)?;
        restrict_permissions(&self.path);

        debug!(expires_at = file.expires_at, "Session saved");

        Ok(())
    }

    /// Loads the cached master key.
    ///
    /// Returns `None` — after deleting the file — when the session is past
    /// its expiry or the file fails to parse or decrypt. A missing file is
    /// plain `None`.
    pub fn load_session(&self) -> Result<Option<MasterKey>, VaultError> {
        let Some(file) = self.read_file() else {
            self.discard();
            return Ok(None);
        };

        if now_millis() > file.expires_at {
            debug!("Session expired, discarding");
            self.discard();
            return Ok(None);
        }

        let key = self.unwrap_key(&file);
        if key.is_none() {
            self.discard();
        }

        Ok(key)
    }

    /// Pushes the expiry out by `timeout_minutes` from now.
    ///
    /// Returns false — after discarding the file — when there is no live
    /// session to extend.
    pub fn extend_session(&self, timeout_minutes: u64) -> Result<bool, VaultError> {
        let Some(mut file) = self.read_file() else {
            self.discard();
            return Ok(false);
        };

        if now_millis() > file.expires_at {
            self.discard();
            return Ok(false);
        }

        file.expires_at = now_millis() + (timeout_minutes as i64) * 60_000;

        let json = serde_json::to_vec(&file)
            .map_err(|e| VaultError::SessionInvalid(format!("serialize failed: {e}")))?;
        std::fs::write(&self.path, json)?;
        restrict_permissions(&self.path);

        Ok(true)
    }

    /// True when an unexpired session file exists. Does not decrypt.
    pub fn has_valid_session(&self) -> bool {
        match self.read_file() {
            Some(file) => now_millis() <= file.expires_at,
            None => false,
        }
    }

    /// Removes the session file, zero-filling it first to frustrate casual
    /// inspection of the freed blocks.
    pub fn delete_session(&self) -> Result<(), VaultError> {
        if !self.path.exists() {
            return Ok(());
        }

        if let Ok(meta) = std::fs::metadata(&self.path) {
            let _ = std::fs::write(&self.path, vec![0u8; meta.len() as usize]);
        }
        std::fs::remove_file(&self.path)?;

        debug!("Session deleted");

        Ok(())
    }

    fn read_file(&self) -> Option<SessionFile> {
        if !self.path.exists() {
            return None;
        }
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn unwrap_key(&self, file: &SessionFile) -> Option<MasterKey> {
        let session_key_bytes = BASE64.decode(&file.session_key).ok()?;
        let session_key = MasterKey::from_bytes(&session_key_bytes).ok()?;
        let plaintext = aead::decrypt(session_key.as_bytes(), &file.encrypted_master_key).ok()?;
        MasterKey::from_bytes(&plaintext).ok()
    }

    fn discard(&self) {
        if self.path.exists() {
            let _ = self.delete_session();
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
