//! # Citadel Vault
//!
//! The vault engine: a local-first, encrypted store of developer secrets
//! organized by environment, behind a master-password-gated lifecycle.
//!
//! The engine owns:
//! - the `NOT_INITIALIZED → LOCKED → UNLOCKED → LOCKED_OUT` state machine
//! - per-value authenticated encryption under a PBKDF2-derived master key
//! - environment-scoped secret lookup with fallback to `all`
//! - a persisted brute-force defense that survives process restarts
//! - the append-only audit log
//! - backup and export wire codecs
//! - the on-disk session cache
//!
//! Clients (the CLI, scripts) consume the [`Vault`] API and the
//! [`VaultError`] taxonomy; everything else here is plumbing in service of
//! those two.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod engine;
pub mod error;
pub mod export;
pub mod session;
pub mod types;
pub mod validate;

mod clock;

pub use engine::{
    Vault, DEFAULT_AUTO_LOCK_MINUTES, LOCKOUT_DURATION_SECS, MAX_FAILED_ATTEMPTS, MAX_VALUE_SIZE,
    VAULT_VERSION,
};
pub use error::VaultError;
pub use session::SessionCache;
pub use types::{
    AuditAction, AuditEntry, AuditFilter, Environment, ImportReport, InitOptions, Secret,
    SecretOptions, SecretWithValue, UpdateOptions, VaultState,
};
pub use validate::{validate_password, validate_secret_key, PasswordReport, PasswordStrength};
