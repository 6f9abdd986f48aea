//! Core domain types: environments, vault states, secrets, audit entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use citadel_store::{AuditRow, SecretRow};

use crate::error::VaultError;

// ============================================================================
// Environment
// ============================================================================

/// A label partitioning the secret namespace.
///
/// `All` is both a label and the default fallback: a lookup in a named
/// environment that finds nothing falls back to the `all` row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development.
    Dev,
    /// Staging.
    Staging,
    /// Production.
    Prod,
    /// The environment-independent default dictionary.
    #[default]
    All,
}

impl Environment {
    /// Wire representation: exactly `dev`, `staging`, `prod`, or `all`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
            Self::All => "all",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" => Ok(Self::Prod),
            "all" => Ok(Self::All),
            other => Err(VaultError::InvalidEnvironment(other.to_string())),
        }
    }
}

// ============================================================================
// Vault state
// ============================================================================

/// State of the vault lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    /// No vault file exists yet.
    NotInitialized,
    /// Vault exists but the master key is not in memory.
    Locked,
    /// Master key is loaded; secrets are accessible.
    Unlocked,
    /// Too many failed unlock attempts; unlocking is refused until the
    /// lockout expires.
    LockedOut,
}

impl fmt::Display for VaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotInitialized => "not-initialized",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::LockedOut => "locked-out",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Actions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// A secret value was decrypted and returned.
    Read,
    /// A secret was created or overwritten.
    Write,
    /// A secret was deleted.
    Delete,
    /// A secret value was rotated.
    Rotate,
    /// A secret left the vault in a portable bundle.
    Export,
    /// A secret arrived from a portable bundle.
    Import,
}

impl AuditAction {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Rotate => "rotate",
            Self::Export => "export",
            Self::Import => "import",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "rotate" => Ok(Self::Rotate),
            "export" => Ok(Self::Export),
            "import" => Ok(Self::Import),
            other => Err(VaultError::Corrupted(format!("unknown audit action: {other}"))),
        }
    }
}

/// One audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Row id.
    pub id: i64,
    /// Event timestamp, milliseconds since epoch.
    pub timestamp: i64,
    /// What happened.
    pub action: AuditAction,
    /// Key of the secret the action touched.
    pub secret_key: String,
    /// Environment the action was recorded against.
    pub environment: String,
    /// OS username of the actor.
    pub user: String,
    /// Optional source address.
    pub ip_address: Option<String>,
    /// Optional structured metadata, serialized as a string.
    pub metadata: Option<String>,
}

impl AuditEntry {
    pub(crate) fn from_row(row: AuditRow) -> Result<Self, VaultError> {
        Ok(Self {
            id: row.id,
            timestamp: row.timestamp,
            action: row.action.parse()?,
            secret_key: row.secret_key,
            environment: row.environment,
            user: row.user,
            ip_address: row.ip_address,
            metadata: row.metadata,
        })
    }
}

/// Filter and pagination for audit queries.
#[derive(Debug, Clone)]
pub struct AuditFilter {
    /// Restrict to one secret key.
    pub secret_key: Option<String>,
    /// Restrict to one action.
    pub action: Option<AuditAction>,
    /// Maximum entries to return.
    pub limit: i64,
    /// Entries to skip (newest-first ordering).
    pub offset: i64,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            secret_key: None,
            action: None,
            limit: 50,
            offset: 0,
        }
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// A stored secret. `value` is the AEAD ciphertext; plaintext is only ever
/// returned by the decrypting read operations.
#[derive(Debug, Clone, Serialize)]
pub struct Secret {
    /// Opaque identifier, stable across updates.
    pub id: String,
    /// Uppercase identifier key.
    pub key: String,
    /// Ciphertext of the value (base64 frame).
    pub value: String,
    /// Owning environment.
    pub environment: Environment,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Tags, in insertion order.
    pub tags: Vec<String>,
    /// Creation timestamp, milliseconds since epoch.
    pub created_at: i64,
    /// Last-update timestamp, milliseconds since epoch.
    pub updated_at: i64,
    /// Last read timestamp, if ever read.
    pub last_used_at: Option<i64>,
    /// Expiry timestamp, if set.
    pub expires_at: Option<i64>,
}

impl Secret {
    pub(crate) fn from_row(row: SecretRow) -> Result<Self, VaultError> {
        let tags = match &row.tags {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| VaultError::Corrupted(format!("malformed tags: {e}")))?,
            None => Vec::new(),
        };

        Ok(Self {
            id: row.id,
            key: row.key,
            value: row.value,
            environment: row.environment.parse()?,
            description: row.description,
            tags,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_used_at: row.last_used_at,
            expires_at: row.expires_at,
        })
    }
}

/// A secret record together with its decrypted value.
#[derive(Debug, Clone)]
pub struct SecretWithValue {
    /// The full record (ciphertext in `secret.value`).
    pub secret: Secret,
    /// The decrypted plaintext.
    pub value: String,
}

/// Optional fields for [`crate::Vault::add_secret`].
#[derive(Debug, Clone, Default)]
pub struct SecretOptions {
    /// Free-form description.
    pub description: Option<String>,
    /// Tags, in order.
    pub tags: Option<Vec<String>>,
    /// Expiry timestamp, milliseconds since epoch.
    pub expires_at: Option<i64>,
}

/// Optional fields for [`crate::Vault::update_secret`]. Unset fields are
/// left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Replacement description.
    pub description: Option<String>,
    /// Replacement tags.
    pub tags: Option<Vec<String>>,
}

/// Options for [`crate::Vault::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite an existing vault file.
    pub force: bool,
    /// Auto-lock timeout in minutes (engine default when unset).
    pub auto_lock_minutes: Option<u64>,
}

/// Counts returned by [`crate::Vault::import_secrets`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Entries inserted as new secrets.
    pub added: usize,
    /// Entries that collided and overwrote an existing secret.
    pub updated: usize,
}
