//! The vault engine: lifecycle state machine, secret CRUD, rotation,
//! brute-force defense, and the bulk decrypt paths.
//!
//! ## Locking discipline
//!
//! Every public method takes one exclusive lock around the engine state, and
//! the auto-lock timer callback takes the same lock. The timer task holds
//! only a `Weak` reference, so dropping the last [`Vault`] handle tears it
//! down.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use citadel_crypto::aead;
use citadel_crypto::random::generate_id;
use citadel_crypto::MasterKey;
use citadel_store::{AuditQuery, NewAuditRow, SecretRow, StoreError, VaultStore};

use crate::backup::{decode_backup, encode_backup, BackupMetadata};
use crate::clock::now_millis;
use crate::error::VaultError;
use crate::export::{decode_export, encode_export, ExportEntry};
use crate::types::{
    AuditAction, AuditEntry, AuditFilter, Environment, ImportReport, InitOptions, Secret,
    SecretOptions, SecretWithValue, UpdateOptions, VaultState,
};
use crate::validate::{
    require_valid_export_password, require_valid_password, validate_secret_key,
};

// ============================================================================
// Constants
// ============================================================================

/// Consecutive wrong passwords tolerated before lockout.
pub const MAX_FAILED_ATTEMPTS: u32 = 3;

/// Lockout window after too many failures.
pub const LOCKOUT_DURATION_SECS: u64 = 5 * 60;

/// Default inactivity timeout, minutes.
pub const DEFAULT_AUTO_LOCK_MINUTES: u64 = 15;

/// Maximum secret value plaintext size, bytes.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

/// Vault metadata format version.
pub const VAULT_VERSION: &str = "1";

/// Ceiling for [`Vault::export_audit_logs`].
const AUDIT_EXPORT_LIMIT: i64 = 100_000;

const VERIFICATION_PLAINTEXT: &str = "secrets-manager-v1";

/// Keys in the `vault_meta` table.
mod meta {
    pub const SALT: &str = "salt";
    pub const VERSION: &str = "version";
    pub const CREATED_AT: &str = "created_at";
    pub const AUTO_LOCK_TIMEOUT: &str = "auto_lock_timeout";
    pub const VERIFICATION: &str = "__vault_verification__";
    pub const FAILED_ATTEMPTS: &str = "failed_attempts";
    pub const LOCKOUT_UNTIL: &str = "lockout_until";
}

// ============================================================================
// Engine state
// ============================================================================

struct VaultInner {
    db_path: PathBuf,
    store: Option<VaultStore>,
    state: VaultState,
    master_key: Option<MasterKey>,
    failed_attempts: u32,
    lockout_until: Option<i64>,
    auto_lock: Duration,
    last_activity: Instant,
    timer: Option<JoinHandle<()>>,
}

impl VaultInner {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn ensure_unlocked(&self) -> Result<(), VaultError> {
        match self.state {
            VaultState::Unlocked => Ok(()),
            VaultState::NotInitialized => Err(VaultError::NotInitialized),
            VaultState::Locked | VaultState::LockedOut => Err(VaultError::Locked),
        }
    }

    /// Store and master-key handles for an unlocked vault.
    fn session(&self) -> Result<(VaultStore, MasterKey), VaultError> {
        self.ensure_unlocked()?;
        match (&self.store, &self.master_key) {
            (Some(store), Some(key)) => Ok((store.clone(), key.clone())),
            _ => Err(VaultError::Corrupted(
                "unlocked vault without live store or key".to_string(),
            )),
        }
    }

    /// Disarms the timer, zeroizes the key, closes the database.
    async fn lock_now(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // MasterKey zeroizes on drop.
        self.master_key = None;
        if let Some(store) = self.store.take() {
            store.close().await;
        }
        if self.state != VaultState::NotInitialized && self.state != VaultState::Locked {
            info!("Vault locked");
        }
        if self.state != VaultState::NotInitialized {
            self.state = VaultState::Locked;
        }
    }

    /// `<vault dir>/backups`, when the vault has a parent directory.
    fn backups_dir(&self) -> Option<PathBuf> {
        self.db_path.parent().map(|p| p.join("backups"))
    }
}

/// Re-arms the inactivity timer. Must be called with the state lock held.
fn arm_timer(arc: &Arc<Mutex<VaultInner>>, inner: &mut VaultInner) {
    if let Some(timer) = inner.timer.take() {
        timer.abort();
    }

    let weak: Weak<Mutex<VaultInner>> = Arc::downgrade(arc);
    let mut wait = inner.auto_lock;

    inner.timer = Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(wait).await;

            let Some(arc) = weak.upgrade() else { break };
            let mut inner = arc.lock().await;

            if inner.state != VaultState::Unlocked {
                break;
            }

            let idle = inner.last_activity.elapsed();
            if idle >= inner.auto_lock {
                debug!(idle_secs = idle.as_secs(), "Auto-lock timeout reached");
                inner.lock_now().await;
                break;
            }

            // Activity happened since the timer was armed: sleep out the rest.
            wait = inner.auto_lock - idle;
        }
    }));
}

// ============================================================================
// Vault
// ============================================================================

/// Handle to a vault bound to one database path.
///
/// Cloning shares the same engine state; all methods serialize on one
/// internal lock.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<Mutex<VaultInner>>,
}

impl Vault {
    /// Binds a vault handle to a database path. Does not touch the
    /// filesystem beyond an existence check.
    pub fn open(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let state = if VaultStore::vault_exists(&db_path) {
            VaultState::Locked
        } else {
            VaultState::NotInitialized
        };

        Self {
            inner: Arc::new(Mutex::new(VaultInner {
                db_path,
                store: None,
                state,
                master_key: None,
                failed_attempts: 0,
                lockout_until: None,
                auto_lock: Duration::from_secs(DEFAULT_AUTO_LOCK_MINUTES * 60),
                last_activity: Instant::now(),
                timer: None,
            })),
        }
    }

    /// Path of the vault database file.
    pub async fn db_path(&self) -> PathBuf {
        self.inner.lock().await.db_path.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Creates a fresh vault and leaves it unlocked.
    ///
    /// # Errors
    ///
    /// [`VaultError::AlreadyInitialized`] if the vault file exists and
    /// `force` is unset; [`VaultError::InvalidPassword`] if the master
    /// password fails the strength rules.
    pub async fn initialize(&self, password: &str, options: InitOptions) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;

        let exists = VaultStore::vault_exists(&inner.db_path);
        if exists && !options.force {
            return Err(VaultError::AlreadyInitialized);
        }

        require_valid_password(password)?;

        if exists {
            inner.lock_now().await;
            std::fs::remove_file(&inner.db_path)?;
        }

        let store = VaultStore::open(&inner.db_path).await?;

        let salt = citadel_crypto::random::generate_salt();
        let key = MasterKey::derive(password, &salt);
        let sentinel = aead::encrypt(key.as_bytes(), VERIFICATION_PLAINTEXT.as_bytes())?;
        let minutes = options.auto_lock_minutes.unwrap_or(DEFAULT_AUTO_LOCK_MINUTES);
        let now = now_millis();

        store.set_meta(meta::SALT, &BASE64.encode(salt)).await?;
        store.set_meta(meta::VERSION, VAULT_VERSION).await?;
        store.set_meta(meta::CREATED_AT, &now.to_string()).await?;
        store
            .set_meta(meta::AUTO_LOCK_TIMEOUT, &minutes.to_string())
            .await?;
        store.set_meta(meta::VERIFICATION, &sentinel).await?;
        store.set_meta(meta::FAILED_ATTEMPTS, "0").await?;
        store.set_meta(meta::LOCKOUT_UNTIL, "").await?;

        inner.store = Some(store);
        inner.master_key = Some(key);
        inner.failed_attempts = 0;
        inner.lockout_until = None;
        inner.auto_lock = Duration::from_secs(minutes * 60);
        inner.state = VaultState::Unlocked;
        inner.touch();
        arm_timer(&self.inner, &mut inner);

        info!(path = %inner.db_path.display(), "Vault initialized");

        Ok(())
    }

    /// Unlocks the vault with the master password.
    ///
    /// Persisted brute-force state is consulted before any key derivation:
    /// inside the lockout window the attempt fails immediately with
    /// [`VaultError::LockedOut`]. A wrong password increments the persisted
    /// counter; the counter survives process restarts.
    pub async fn unlock(
        &self,
        password: &str,
        auto_lock_minutes: Option<u64>,
    ) -> Result<bool, VaultError> {
        let mut inner = self.inner.lock().await;

        if !VaultStore::vault_exists(&inner.db_path) {
            return Err(VaultError::NotInitialized);
        }
        if inner.state == VaultState::Unlocked {
            inner.touch();
            return Ok(true);
        }

        let store = match inner.store.clone() {
            Some(store) => store,
            None => {
                let store = VaultStore::open(&inner.db_path).await?;
                inner.store = Some(store.clone());
                store
            },
        };

        inner.failed_attempts = load_failed_attempts(&store).await?;
        inner.lockout_until = load_lockout_until(&store).await?;

        let now = now_millis();
        if let Some(until) = inner.lockout_until {
            if until > now {
                inner.state = VaultState::LockedOut;
                return Err(VaultError::LockedOut {
                    seconds_remaining: millis_to_secs_ceil(until - now),
                });
            }
            // The window has passed: clear the persisted state and proceed.
            inner.failed_attempts = 0;
            inner.lockout_until = None;
            store.set_meta(meta::FAILED_ATTEMPTS, "0").await?;
            store.set_meta(meta::LOCKOUT_UNTIL, "").await?;
            inner.state = VaultState::Locked;
        }

        let salt = load_salt(&store).await?;
        let sentinel = load_sentinel(&store).await?;

        let candidate = MasterKey::derive(password, &salt);
        if !aead::verify_password(
            candidate.as_bytes(),
            VERIFICATION_PLAINTEXT.as_bytes(),
            &sentinel,
        ) {
            inner.failed_attempts += 1;
            store
                .set_meta(meta::FAILED_ATTEMPTS, &inner.failed_attempts.to_string())
                .await?;

            if inner.failed_attempts >= MAX_FAILED_ATTEMPTS {
                let until = now + (LOCKOUT_DURATION_SECS as i64) * 1000;
                inner.lockout_until = Some(until);
                store.set_meta(meta::LOCKOUT_UNTIL, &until.to_string()).await?;
                inner.state = VaultState::LockedOut;
                if let Some(store) = inner.store.take() {
                    store.close().await;
                }
                warn!(attempts = inner.failed_attempts, "Vault locked out");
                return Err(VaultError::LockedOut {
                    seconds_remaining: LOCKOUT_DURATION_SECS,
                });
            }

            let attempts_remaining = MAX_FAILED_ATTEMPTS - inner.failed_attempts;
            warn!(attempts_remaining, "Wrong master password");
            return Err(VaultError::WrongPassword { attempts_remaining });
        }

        inner.failed_attempts = 0;
        inner.lockout_until = None;
        store.set_meta(meta::FAILED_ATTEMPTS, "0").await?;
        store.set_meta(meta::LOCKOUT_UNTIL, "").await?;

        let minutes = match auto_lock_minutes {
            Some(minutes) => {
                store
                    .set_meta(meta::AUTO_LOCK_TIMEOUT, &minutes.to_string())
                    .await?;
                minutes
            },
            None => store
                .get_meta(meta::AUTO_LOCK_TIMEOUT)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_AUTO_LOCK_MINUTES),
        };

        inner.auto_lock = Duration::from_secs(minutes * 60);
        inner.master_key = Some(candidate);
        inner.state = VaultState::Unlocked;
        inner.touch();
        arm_timer(&self.inner, &mut inner);

        info!("Vault unlocked");

        Ok(true)
    }

    /// Unlocks with a master key recovered from the session cache.
    ///
    /// The key must decrypt the verification sentinel; a stale key (for
    /// example after a master-password change) is rejected with
    /// [`VaultError::SessionInvalid`]. The lockout window applies to this
    /// path too.
    pub async fn unlock_with_session(&self, key: MasterKey) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;

        if !VaultStore::vault_exists(&inner.db_path) {
            return Err(VaultError::NotInitialized);
        }
        if inner.state == VaultState::Unlocked {
            inner.touch();
            return Ok(());
        }

        let store = match inner.store.clone() {
            Some(store) => store,
            None => {
                let store = VaultStore::open(&inner.db_path).await?;
                inner.store = Some(store.clone());
                store
            },
        };

        if let Some(until) = load_lockout_until(&store).await? {
            let now = now_millis();
            if until > now {
                inner.state = VaultState::LockedOut;
                return Err(VaultError::LockedOut {
                    seconds_remaining: millis_to_secs_ceil(until - now),
                });
            }
        }

        let sentinel = load_sentinel(&store).await?;
        if !aead::verify_password(key.as_bytes(), VERIFICATION_PLAINTEXT.as_bytes(), &sentinel) {
            return Err(VaultError::SessionInvalid(
                "cached key does not match this vault".to_string(),
            ));
        }

        let minutes = store
            .get_meta(meta::AUTO_LOCK_TIMEOUT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_AUTO_LOCK_MINUTES);

        inner.auto_lock = Duration::from_secs(minutes * 60);
        inner.master_key = Some(key);
        inner.state = VaultState::Unlocked;
        inner.touch();
        arm_timer(&self.inner, &mut inner);

        debug!("Vault unlocked from session cache");

        Ok(())
    }

    /// Hands the live master key to the session cache.
    ///
    /// The key never leaves this crate: it flows directly into the cache's
    /// re-encrypted on-disk form. Fails with [`VaultError::Locked`] unless
    /// the vault is unlocked.
    pub async fn cache_session(
        &self,
        cache: &crate::session::SessionCache,
        timeout_minutes: u64,
    ) -> Result<(), VaultError> {
        let inner = self.inner.lock().await;
        let (_, master_key) = inner.session()?;
        cache.save_session(&master_key, timeout_minutes)
    }

    /// Locks the vault: disarms the timer, zeroizes the master key, closes
    /// the database. Idempotent.
    pub async fn lock(&self) {
        let mut inner = self.inner.lock().await;
        inner.lock_now().await;
    }

    /// True when a vault file exists at the bound path.
    pub async fn is_initialized(&self) -> bool {
        let inner = self.inner.lock().await;
        VaultStore::vault_exists(&inner.db_path)
    }

    /// True unless the vault is currently unlocked.
    pub async fn is_locked(&self) -> bool {
        self.state().await != VaultState::Unlocked
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> VaultState {
        let inner = self.inner.lock().await;
        if !VaultStore::vault_exists(&inner.db_path) {
            return VaultState::NotInitialized;
        }
        if inner.state == VaultState::NotInitialized {
            // The file appeared underneath us (restore from another handle).
            return VaultState::Locked;
        }
        inner.state
    }

    // ========================================================================
    // Secret CRUD
    // ========================================================================

    /// Creates a secret.
    ///
    /// # Errors
    ///
    /// [`VaultError::SecretAlreadyExists`] when the `(key, environment)`
    /// pair is taken; [`VaultError::InvalidKey`] /
    /// [`VaultError::ValueTooLarge`] on input rejection.
    pub async fn add_secret(
        &self,
        key: &str,
        value: &str,
        environment: Environment,
        options: SecretOptions,
    ) -> Result<Secret, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        insert_row(
            &store,
            &master_key,
            key,
            value,
            environment,
            &options,
            AuditAction::Write,
        )
        .await
    }

    /// Reads a secret's plaintext.
    ///
    /// A miss in a named environment falls back to the `all` row: `all` is
    /// the default dictionary and named environments override it. Returns
    /// `None` when neither row exists.
    pub async fn get_secret(
        &self,
        key: &str,
        environment: Environment,
    ) -> Result<Option<String>, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        let Some(row) = lookup_with_fallback(&store, key, environment).await? else {
            return Ok(None);
        };

        let value = decrypt_value(&master_key, &row.value)?;
        store.touch_last_used(&row.id, now_millis()).await?;
        record_audit(&store, AuditAction::Read, key, environment.as_str()).await?;

        Ok(Some(value))
    }

    /// Reads a secret's full record plus plaintext.
    ///
    /// Same fallback as [`Vault::get_secret`]; the audit entry records the
    /// matched row's environment rather than the requested one.
    pub async fn get_secret_with_details(
        &self,
        key: &str,
        environment: Environment,
    ) -> Result<Option<SecretWithValue>, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        let Some(mut row) = lookup_with_fallback(&store, key, environment).await? else {
            return Ok(None);
        };

        let value = decrypt_value(&master_key, &row.value)?;
        let now = now_millis();
        store.touch_last_used(&row.id, now).await?;
        row.last_used_at = Some(now);
        record_audit(&store, AuditAction::Read, key, &row.environment).await?;

        let secret = Secret::from_row(row)?;
        Ok(Some(SecretWithValue { secret, value }))
    }

    /// Lists secrets without decrypting anything.
    ///
    /// With a filter, rows in that environment plus the `all` rows are
    /// returned, ordered by `(key, environment)`.
    pub async fn list_secrets(
        &self,
        environment: Option<Environment>,
    ) -> Result<Vec<Secret>, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, _) = inner.session()?;

        let rows = store.list_secrets(environment.map(|e| e.as_str())).await?;
        rows.into_iter().map(Secret::from_row).collect()
    }

    /// Overwrites a secret's value (freshly encrypted) and optionally its
    /// description and tags. Fields left unset keep their stored values.
    ///
    /// No environment fallback: the exact `(key, environment)` row must
    /// exist.
    pub async fn update_secret(
        &self,
        key: &str,
        value: &str,
        environment: Environment,
        options: UpdateOptions,
    ) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        let row = store
            .find_secret(key, environment.as_str())
            .await?
            .ok_or_else(|| VaultError::SecretNotFound {
                key: key.to_string(),
                environment: environment.to_string(),
            })?;

        overwrite_row(
            &store,
            &master_key,
            &row,
            value,
            options.description.as_deref(),
            options.tags.as_deref(),
            AuditAction::Write,
        )
        .await
    }

    /// Deletes one `(key, environment)` row.
    ///
    /// # Errors
    ///
    /// [`VaultError::SecretNotFound`] when the row is absent.
    pub async fn delete_secret(
        &self,
        key: &str,
        environment: Environment,
    ) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, _) = inner.session()?;

        let removed = store.delete_secret(key, environment.as_str()).await?;
        if removed == 0 {
            return Err(VaultError::SecretNotFound {
                key: key.to_string(),
                environment: environment.to_string(),
            });
        }

        record_audit(&store, AuditAction::Delete, key, environment.as_str()).await?;

        Ok(())
    }

    /// Deletes a key across every environment. Succeeds silently when
    /// nothing matched; returns the count removed.
    pub async fn delete_secret_all_envs(&self, key: &str) -> Result<u64, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, _) = inner.session()?;

        let rows = store.secrets_for_key(key).await?;
        let removed = store.delete_secret_all_envs(key).await?;

        for row in &rows {
            record_audit(&store, AuditAction::Delete, key, &row.environment).await?;
        }

        Ok(removed)
    }

    /// Rotates a secret's value across environments, skipping the excluded
    /// ones. Every surviving row gets its own fresh encryption of the new
    /// value, so no nonce is ever shared between rows.
    ///
    /// Returns the number of rows rotated.
    pub async fn rotate_secret(
        &self,
        key: &str,
        new_value: &str,
        exclude: &[Environment],
    ) -> Result<usize, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        if new_value.len() > MAX_VALUE_SIZE {
            return Err(VaultError::ValueTooLarge {
                size: new_value.len(),
            });
        }

        let rows: Vec<SecretRow> = store
            .secrets_for_key(key)
            .await?
            .into_iter()
            .filter(|row| exclude.iter().all(|e| e.as_str() != row.environment))
            .collect();

        if rows.is_empty() {
            return Err(VaultError::SecretNotFound {
                key: key.to_string(),
                environment: "any".to_string(),
            });
        }

        let now = now_millis();
        for row in &rows {
            let ciphertext = aead::encrypt(master_key.as_bytes(), new_value.as_bytes())?;
            store
                .update_secret(&row.id, &ciphertext, None, None, now)
                .await?;
            record_audit(&store, AuditAction::Rotate, key, &row.environment).await?;
        }

        info!(key, rotated = rows.len(), "Secret rotated");

        Ok(rows.len())
    }

    /// Case-sensitive substring search over keys and descriptions.
    pub async fn search_secrets(&self, needle: &str) -> Result<Vec<Secret>, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, _) = inner.session()?;

        let rows = store.search_secrets(needle).await?;
        rows.into_iter().map(Secret::from_row).collect()
    }

    /// Decrypts every secret visible to one environment, for injection into
    /// a process environment.
    ///
    /// Merge rule: when both `(key, env)` and `(key, all)` exist, the
    /// environment-specific row wins.
    pub async fn secrets_for_sync(
        &self,
        environment: Environment,
    ) -> Result<HashMap<String, String>, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        let rows = store.sync_rows(environment.as_str()).await?;

        let mut chosen: HashMap<String, SecretRow> = HashMap::new();
        for row in rows {
            let is_specific = row.environment == environment.as_str();
            match chosen.entry(row.key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(row);
                },
                Entry::Occupied(mut slot) => {
                    if is_specific {
                        slot.insert(row);
                    }
                },
            }
        }

        let mut values = HashMap::with_capacity(chosen.len());
        for (key, row) in chosen {
            let value = decrypt_value(&master_key, &row.value)?;
            record_audit(&store, AuditAction::Read, &key, &row.environment).await?;
            values.insert(key, value);
        }

        Ok(values)
    }

    // ========================================================================
    // Master password
    // ========================================================================

    /// Re-encrypts the whole vault under a new master password.
    ///
    /// Runs against the database regardless of engine state. Every secret is
    /// decrypted under the old key and re-encrypted under the new one inside
    /// a single transaction; if any row fails to decrypt the database is
    /// left untouched. When the engine is unlocked at call time, the
    /// in-memory key is swapped so the live session keeps working.
    pub async fn change_master_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), VaultError> {
        require_valid_password(new_password)?;

        let mut inner = self.inner.lock().await;

        if !VaultStore::vault_exists(&inner.db_path) {
            return Err(VaultError::NotInitialized);
        }

        let (store, transient) = match &inner.store {
            Some(store) => (store.clone(), false),
            None => (VaultStore::open(&inner.db_path).await?, true),
        };

        let result = rekey(&store, old_password, new_password).await;

        if transient {
            store.close().await;
        }

        let new_key = result?;

        if inner.state == VaultState::Unlocked {
            // Old key is dropped (and zeroized) by the swap.
            inner.master_key = Some(new_key);
            inner.touch();
        }

        info!("Master password changed");

        Ok(())
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    /// Queries audit entries, newest first.
    pub async fn audit_logs(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, _) = inner.session()?;

        let rows = store
            .audit_logs(&AuditQuery {
                secret_key: filter.secret_key,
                action: filter.action.map(|a| a.as_str().to_string()),
                limit: filter.limit,
                offset: filter.offset,
            })
            .await?;

        rows.into_iter().map(AuditEntry::from_row).collect()
    }

    /// Total audit entries, optionally for one secret key.
    pub async fn audit_count(&self, secret_key: Option<&str>) -> Result<i64, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, _) = inner.session()?;

        Ok(store.audit_count(secret_key).await?)
    }

    /// Deletes all but the newest `keep_last_n` audit entries. Returns the
    /// count removed.
    pub async fn prune_audit_logs(&self, keep_last_n: i64) -> Result<u64, VaultError> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, _) = inner.session()?;

        let removed = store.prune_audit(keep_last_n).await?;
        info!(removed, kept = keep_last_n, "Audit log pruned");

        Ok(removed)
    }

    /// Dumps the audit trail (up to 100 000 entries), optionally for one
    /// secret key.
    pub async fn export_audit_logs(
        &self,
        secret_key: Option<&str>,
    ) -> Result<Vec<AuditEntry>, VaultError> {
        self.audit_logs(AuditFilter {
            secret_key: secret_key.map(str::to_string),
            action: None,
            limit: AUDIT_EXPORT_LIMIT,
            offset: 0,
        })
        .await
    }

    // ========================================================================
    // Backup / restore
    // ========================================================================

    /// Writes a backup of the vault database to `dest`.
    ///
    /// With a password, the vault bytes are encrypted; the password is
    /// independent of the master password. Works on a locked vault.
    pub async fn create_backup(
        &self,
        dest: &Path,
        password: Option<&str>,
    ) -> Result<BackupMetadata, VaultError> {
        let inner = self.inner.lock().await;

        if !VaultStore::vault_exists(&inner.db_path) {
            return Err(VaultError::NotInitialized);
        }

        let vault_bytes = std::fs::read(&inner.db_path)?;
        let metadata = BackupMetadata {
            version: VAULT_VERSION.to_string(),
            created_at: now_millis(),
            // Historically advisory; kept at zero for format compatibility.
            secrets_count: 0,
        };

        let blob = encode_backup(&vault_bytes, &metadata, password)?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, blob)?;
        restrict_file(dest);

        info!(dest = %dest.display(), encrypted = password.is_some(), "Backup created");

        Ok(metadata)
    }

    /// Replaces the vault database with the contents of a backup.
    ///
    /// The engine is locked first. If a `backups/` directory exists next to
    /// the vault, the current database is preserved there as
    /// `vault-pre-restore-<millis>.db`. The new file lands atomically with
    /// mode `0o600`, and the vault ends up `Locked`.
    pub async fn restore_backup(
        &self,
        src: &Path,
        password: Option<&str>,
    ) -> Result<BackupMetadata, VaultError> {
        let blob = std::fs::read(src)?;
        let (metadata, vault_bytes) = decode_backup(&blob, password)?;

        let mut inner = self.inner.lock().await;
        inner.lock_now().await;

        if VaultStore::vault_exists(&inner.db_path) {
            if let Some(dir) = inner.backups_dir() {
                if dir.is_dir() {
                    let aside = dir.join(format!("vault-pre-restore-{}.db", now_millis()));
                    std::fs::copy(&inner.db_path, &aside)?;
                    debug!(aside = %aside.display(), "Preserved pre-restore vault");
                }
            }
        }

        if let Some(parent) = inner.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = inner.db_path.with_extension("db.tmp");
        std::fs::write(&staging, &vault_bytes)?;
        restrict_file(&staging);
        std::fs::rename(&staging, &inner.db_path)?;

        inner.state = VaultState::Locked;

        info!(src = %src.display(), "Vault restored from backup");

        Ok(metadata)
    }

    // ========================================================================
    // Export / import
    // ========================================================================

    /// Bundles secrets into an encrypted, portable export blob.
    ///
    /// With an environment filter, that environment's rows plus the `all`
    /// rows are included; entries keep their own environment labels.
    pub async fn export_secrets(
        &self,
        password: &str,
        environment: Option<Environment>,
    ) -> Result<Vec<u8>, VaultError> {
        require_valid_export_password(password)?;

        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        let rows = store.list_secrets(environment.map(|e| e.as_str())).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let value = decrypt_value(&master_key, &row.value)?;
            record_audit(&store, AuditAction::Export, &row.key, &row.environment).await?;

            let secret = Secret::from_row(row)?;
            entries.push(ExportEntry {
                key: secret.key,
                value,
                environment: secret.environment,
                description: secret.description,
                tags: if secret.tags.is_empty() {
                    None
                } else {
                    Some(secret.tags)
                },
            });
        }

        info!(count = entries.len(), "Secrets exported");

        encode_export(&entries, password)
    }

    /// Imports a bundle produced by [`Vault::export_secrets`].
    ///
    /// Entries whose `(key, environment)` already exists overwrite the
    /// stored value (merge semantics). Returns added/updated counts.
    pub async fn import_secrets(
        &self,
        blob: &[u8],
        password: &str,
    ) -> Result<ImportReport, VaultError> {
        let entries = decode_export(blob, password)?;

        let mut inner = self.inner.lock().await;
        inner.touch();
        let (store, master_key) = inner.session()?;

        let mut report = ImportReport::default();
        for entry in entries {
            let options = SecretOptions {
                description: entry.description.clone(),
                tags: entry.tags.clone(),
                expires_at: None,
            };

            let inserted = insert_row(
                &store,
                &master_key,
                &entry.key,
                &entry.value,
                entry.environment,
                &options,
                AuditAction::Import,
            )
            .await;

            match inserted {
                Ok(_) => report.added += 1,
                Err(VaultError::SecretAlreadyExists { .. }) => {
                    let row = store
                        .find_secret(&entry.key, entry.environment.as_str())
                        .await?
                        .ok_or_else(|| {
                            VaultError::Corrupted("row vanished during import".to_string())
                        })?;
                    overwrite_row(
                        &store,
                        &master_key,
                        &row,
                        &entry.value,
                        entry.description.as_deref(),
                        entry.tags.as_deref(),
                        AuditAction::Import,
                    )
                    .await?;
                    report.updated += 1;
                },
                Err(e) => return Err(e),
            }
        }

        info!(added = report.added, updated = report.updated, "Secrets imported");

        Ok(report)
    }
}

// ============================================================================
// Internal helpers
// ============================================================================

async fn lookup_with_fallback(
    store: &VaultStore,
    key: &str,
    environment: Environment,
) -> Result<Option<SecretRow>, VaultError> {
    if let Some(row) = store.find_secret(key, environment.as_str()).await? {
        return Ok(Some(row));
    }
    if environment != Environment::All {
        return Ok(store.find_secret(key, Environment::All.as_str()).await?);
    }
    Ok(None)
}

fn decrypt_value(master_key: &MasterKey, ciphertext: &str) -> Result<String, VaultError> {
    let plaintext = aead::decrypt(master_key.as_bytes(), ciphertext)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| VaultError::DecryptionFailed)
}

fn encode_tags(tags: Option<&[String]>) -> Result<Option<String>, VaultError> {
    tags.map(serde_json::to_string)
        .transpose()
        .map_err(|e| VaultError::Corrupted(format!("tag encoding failed: {e}")))
}

async fn record_audit(
    store: &VaultStore,
    action: AuditAction,
    secret_key: &str,
    environment: &str,
) -> Result<(), VaultError> {
    store
        .insert_audit(&NewAuditRow {
            timestamp: now_millis(),
            action: action.as_str().to_string(),
            secret_key: secret_key.to_string(),
            environment: environment.to_string(),
            user: whoami::username(),
            ip_address: None,
            metadata: None,
        })
        .await?;
    Ok(())
}

async fn insert_row(
    store: &VaultStore,
    master_key: &MasterKey,
    key: &str,
    value: &str,
    environment: Environment,
    options: &SecretOptions,
    action: AuditAction,
) -> Result<Secret, VaultError> {
    validate_secret_key(key)?;
    if value.len() > MAX_VALUE_SIZE {
        return Err(VaultError::ValueTooLarge { size: value.len() });
    }

    if store.find_secret(key, environment.as_str()).await?.is_some() {
        return Err(VaultError::SecretAlreadyExists {
            key: key.to_string(),
            environment: environment.to_string(),
        });
    }

    let ciphertext = aead::encrypt(master_key.as_bytes(), value.as_bytes())?;
    let now = now_millis();
    let row = SecretRow {
        id: generate_id(),
        key: key.to_string(),
        value: ciphertext,
        environment: environment.to_string(),
        description: options.description.clone(),
        tags: encode_tags(options.tags.as_deref())?,
        created_at: now,
        updated_at: now,
        last_used_at: None,
        expires_at: options.expires_at,
    };

    store.insert_secret(&row).await.map_err(|e| match e {
        StoreError::AlreadyExists(_) => VaultError::SecretAlreadyExists {
            key: key.to_string(),
            environment: environment.to_string(),
        },
        other => other.into(),
    })?;

    record_audit(store, action, key, environment.as_str()).await?;

    debug!(key, environment = environment.as_str(), "Secret stored");

    Secret::from_row(row)
}

async fn overwrite_row(
    store: &VaultStore,
    master_key: &MasterKey,
    row: &SecretRow,
    value: &str,
    description: Option<&str>,
    tags: Option<&[String]>,
    action: AuditAction,
) -> Result<(), VaultError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(VaultError::ValueTooLarge { size: value.len() });
    }

    let ciphertext = aead::encrypt(master_key.as_bytes(), value.as_bytes())?;
    let tags_json = encode_tags(tags)?;

    store
        .update_secret(
            &row.id,
            &ciphertext,
            description,
            tags_json.as_deref(),
            now_millis(),
        )
        .await?;

    record_audit(store, action, &row.key, &row.environment).await?;

    Ok(())
}

async fn rekey(
    store: &VaultStore,
    old_password: &str,
    new_password: &str,
) -> Result<MasterKey, VaultError> {
    let salt = load_salt(store).await?;
    let sentinel = load_sentinel(store).await?;

    let old_key = MasterKey::derive(old_password, &salt);
    if !aead::verify_password(
        old_key.as_bytes(),
        VERIFICATION_PLAINTEXT.as_bytes(),
        &sentinel,
    ) {
        let attempts = load_failed_attempts(store).await?;
        return Err(VaultError::WrongPassword {
            attempts_remaining: MAX_FAILED_ATTEMPTS.saturating_sub(attempts),
        });
    }

    let new_salt = citadel_crypto::random::generate_salt();
    let new_key = MasterKey::derive(new_password, &new_salt);

    let pairs = store.all_secret_values().await?;
    let mut updates = Vec::with_capacity(pairs.len());
    for (id, ciphertext) in pairs {
        // Any decryption failure aborts before a single row is written.
        let plaintext = aead::decrypt(old_key.as_bytes(), &ciphertext)?;
        let reencrypted = aead::encrypt(new_key.as_bytes(), &plaintext)?;
        updates.push((id, reencrypted));
    }

    let new_sentinel = aead::encrypt(new_key.as_bytes(), VERIFICATION_PLAINTEXT.as_bytes())?;
    let new_salt_b64 = BASE64.encode(new_salt);

    store
        .apply_rekey(
            (meta::SALT, new_salt_b64.as_str()),
            (meta::VERIFICATION, new_sentinel.as_str()),
            &updates,
        )
        .await?;

    Ok(new_key)
}

async fn load_salt(store: &VaultStore) -> Result<Vec<u8>, VaultError> {
    let salt_b64 = store
        .get_meta(meta::SALT)
        .await?
        .ok_or_else(|| VaultError::Corrupted("salt missing from vault metadata".to_string()))?;
    BASE64
        .decode(&salt_b64)
        .map_err(|_| VaultError::Corrupted("malformed salt in vault metadata".to_string()))
}

async fn load_sentinel(store: &VaultStore) -> Result<String, VaultError> {
    store.get_meta(meta::VERIFICATION).await?.ok_or_else(|| {
        VaultError::Corrupted("verification sentinel missing from vault metadata".to_string())
    })
}

async fn load_failed_attempts(store: &VaultStore) -> Result<u32, VaultError> {
    Ok(store
        .get_meta(meta::FAILED_ATTEMPTS)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

async fn load_lockout_until(store: &VaultStore) -> Result<Option<i64>, VaultError> {
    Ok(store
        .get_meta(meta::LOCKOUT_UNTIL)
        .await?
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok()))
}

fn millis_to_secs_ceil(millis: i64) -> u64 {
    ((millis + 999) / 1000).max(0) as u64
}

#[cfg(unix)]
fn restrict_file(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) {}

// ============================================================================
// Tests
// ============================================================================
