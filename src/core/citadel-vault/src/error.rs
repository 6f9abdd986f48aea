//! Vault error taxonomy.
//!
//! Every kind carries a stable code string via [`VaultError::code`] so
//! clients (the CLI, scripts parsing its output) can match on behavior
//! without depending on display text.

use citadel_crypto::CryptoError;
use citadel_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the vault engine.
#[derive(Debug, Error)]
pub enum VaultError {
    /// An operation requires an existing vault.
    #[error("vault is not initialized; run init first")]
    NotInitialized,

    /// `initialize` was called without force on an existing vault file.
    #[error("vault already exists; use force to overwrite")]
    AlreadyInitialized,

    /// A read or mutation requires the vault to be unlocked.
    #[error("vault is locked")]
    Locked,

    /// Unlock sentinel mismatch.
    #[error("wrong master password ({attempts_remaining} attempts remaining)")]
    WrongPassword {
        /// Failed attempts left before lockout.
        attempts_remaining: u32,
    },

    /// Unlock attempted inside the lockout window.
    #[error("vault locked out for {seconds_remaining}s after repeated failures")]
    LockedOut {
        /// Seconds until the lockout expires.
        seconds_remaining: u64,
    },

    /// Target secret row is absent.
    #[error("secret not found: {key} [{environment}]")]
    SecretNotFound {
        /// Requested key.
        key: String,
        /// Requested environment.
        environment: String,
    },

    /// `(key, environment)` collision on insert.
    #[error("secret already exists: {key} [{environment}]")]
    SecretAlreadyExists {
        /// Conflicting key.
        key: String,
        /// Conflicting environment.
        environment: String,
    },

    /// Key syntax or length rejection.
    #[error("invalid secret key: {0}")]
    InvalidKey(String),

    /// Environment outside the enum.
    #[error("invalid environment: {0} (expected dev, staging, prod, or all)")]
    InvalidEnvironment(String),

    /// Password strength check failure.
    #[error("password does not meet requirements: {}", errors.join("; "))]
    InvalidPassword {
        /// The individual rule violations.
        errors: Vec<String>,
    },

    /// AEAD tag mismatch or malformed ciphertext.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Secret value plaintext exceeds the size cap.
    #[error("secret value too large: {size} bytes")]
    ValueTooLarge {
        /// Offending plaintext size.
        size: usize,
    },

    /// Unrecoverable schema or state mismatch, or a malformed archive.
    #[error("vault corrupted: {0}")]
    Corrupted(String),

    /// Session cache entry past its expiry.
    #[error("session expired")]
    SessionExpired,

    /// Session cache entry rejected.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// Empty input where a value is required (prompt-side rejection).
    #[error("value cannot be empty")]
    EmptyValue,

    /// Password confirmation mismatch (prompt-side rejection).
    #[error("passwords do not match")]
    PasswordMismatch,

    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Filesystem failure outside the store (backup and session files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "VAULT_NOT_INITIALIZED",
            Self::AlreadyInitialized => "VAULT_EXISTS",
            Self::Locked => "VAULT_LOCKED",
            Self::WrongPassword { .. } => "WRONG_PASSWORD",
            Self::LockedOut { .. } => "LOCKED_OUT",
            Self::SecretNotFound { .. } => "SECRET_NOT_FOUND",
            Self::SecretAlreadyExists { .. } => "SECRET_EXISTS",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::InvalidEnvironment(_) => "INVALID_ENVIRONMENT",
            Self::InvalidPassword { .. } => "INVALID_PASSWORD",
            Self::DecryptionFailed => "DECRYPTION_FAILED",
            Self::ValueTooLarge { .. } => "VALUE_TOO_LARGE",
            Self::Corrupted(_) => "VAULT_CORRUPTED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionInvalid(_) => "SESSION_INVALID",
            Self::EmptyValue => "EMPTY_VALUE",
            Self::PasswordMismatch => "PASSWORD_MISMATCH",
            Self::Store(_) => "STORAGE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailed => Self::DecryptionFailed,
            other => Self::Corrupted(other.to_string()),
        }
    }
}
