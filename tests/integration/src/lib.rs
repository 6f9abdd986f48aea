//! Integration tests for the Citadel vault engine.
//!
//! These tests drive the public engine API end to end: initialization,
//! the unlock lifecycle and brute-force defense, secret CRUD with the
//! environment fallback, rotation, sync, rekeying, sessions, backups, and
//! the portable export format.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::path::PathBuf;

use tempfile::TempDir;

use citadel_vault::{InitOptions, Vault};

/// Master password used across the suite. Satisfies every strength rule.
pub const PASSWORD: &str = "TestPassword123!";

/// A vault over a temporary directory that cleans up after itself.
pub struct TestVault {
    /// The engine handle.
    pub vault: Vault,
    dir: TempDir,
}

impl TestVault {
    /// Creates and initializes a vault in a fresh temp directory.
    pub async fn init() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let vault = Vault::open(dir.path().join("vault.db"));
        vault
            .initialize(PASSWORD, InitOptions::default())
            .await
            .expect("initialize vault");
        Self { vault, dir }
    }

    /// Path of the vault database file.
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("vault.db")
    }

    /// Path of the session cache file.
    pub fn session_path(&self) -> PathBuf {
        self.dir.path().join("session.json")
    }

    /// The `backups/` directory next to the vault (created on demand).
    pub fn backups_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("backups");
        std::fs::create_dir_all(&dir).expect("create backups dir");
        dir
    }

    /// A second engine handle over the same database, as a restarted
    /// process would see it.
    pub fn reopen(&self) -> Vault {
        Vault::open(self.db_path())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    use citadel_store::VaultStore;
    use citadel_vault::{
        AuditAction, AuditFilter, Environment, InitOptions, SecretOptions, SessionCache,
        UpdateOptions, Vault, VaultError, VaultState, MAX_FAILED_ATTEMPTS, MAX_VALUE_SIZE,
    };

    use super::{TestVault, PASSWORD};

    fn opts() -> SecretOptions {
        SecretOptions::default()
    }

    // ========================================================================
    // CRUD and environment fallback
    // ========================================================================

    #[tokio::test]
    async fn add_then_read_back() {
        let t = TestVault::init().await;

        t.vault
            .add_secret(
                "DATABASE_URL",
                "postgres://localhost/db",
                Environment::Dev,
                opts(),
            )
            .await
            .unwrap();

        let value = t
            .vault
            .get_secret("DATABASE_URL", Environment::Dev)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("postgres://localhost/db"));
    }

    #[tokio::test]
    async fn named_environment_falls_back_to_all() {
        let t = TestVault::init().await;

        t.vault
            .add_secret("API_KEY", "key123", Environment::All, opts())
            .await
            .unwrap();

        let value = t.vault.get_secret("API_KEY", Environment::Dev).await.unwrap();
        assert_eq!(value.as_deref(), Some("key123"));

        // But `all` itself never falls anywhere.
        let value = t.vault.get_secret("MISSING", Environment::All).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn environment_specific_rows_override_each_other() {
        let t = TestVault::init().await;

        t.vault
            .add_secret("DB", "dev-db", Environment::Dev, opts())
            .await
            .unwrap();
        t.vault
            .add_secret("DB", "prod-db", Environment::Prod, opts())
            .await
            .unwrap();

        assert_eq!(
            t.vault.get_secret("DB", Environment::Dev).await.unwrap().as_deref(),
            Some("dev-db")
        );
        assert_eq!(
            t.vault.get_secret("DB", Environment::Prod).await.unwrap().as_deref(),
            Some("prod-db")
        );
    }

    #[tokio::test]
    async fn duplicate_key_environment_rejected() {
        let t = TestVault::init().await;

        t.vault
            .add_secret("TOKEN", "a", Environment::Dev, opts())
            .await
            .unwrap();
        let result = t.vault.add_secret("TOKEN", "b", Environment::Dev, opts()).await;
        assert!(matches!(result, Err(VaultError::SecretAlreadyExists { .. })));

        // Different environment is a different identity.
        t.vault
            .add_secret("TOKEN", "b", Environment::Prod, opts())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_removes_only_the_exact_row() {
        let t = TestVault::init().await;

        t.vault
            .add_secret("KEY", "all-value", Environment::All, opts())
            .await
            .unwrap();
        t.vault
            .add_secret("KEY", "dev-value", Environment::Dev, opts())
            .await
            .unwrap();

        t.vault.delete_secret("KEY", Environment::Dev).await.unwrap();

        // The dev row is gone; the read now falls back to `all`.
        assert_eq!(
            t.vault.get_secret("KEY", Environment::Dev).await.unwrap().as_deref(),
            Some("all-value")
        );

        let result = t.vault.delete_secret("KEY", Environment::Dev).await;
        assert!(matches!(result, Err(VaultError::SecretNotFound { .. })));
    }

    #[tokio::test]
    async fn delete_all_envs_is_silent_on_zero() {
        let t = TestVault::init().await;

        t.vault.add_secret("K", "1", Environment::Dev, opts()).await.unwrap();
        t.vault.add_secret("K", "2", Environment::Prod, opts()).await.unwrap();

        assert_eq!(t.vault.delete_secret_all_envs("K").await.unwrap(), 2);
        assert_eq!(t.vault.delete_secret_all_envs("K").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_secrets_counts_and_filters() {
        let t = TestVault::init().await;

        t.vault.add_secret("A", "1", Environment::Dev, opts()).await.unwrap();
        t.vault.add_secret("B", "2", Environment::Dev, opts()).await.unwrap();
        t.vault.add_secret("C", "3", Environment::Prod, opts()).await.unwrap();

        assert_eq!(t.vault.list_secrets(None).await.unwrap().len(), 3);
        assert_eq!(
            t.vault.list_secrets(Some(Environment::Dev)).await.unwrap().len(),
            2
        );
        assert_eq!(
            t.vault.list_secrets(Some(Environment::Prod)).await.unwrap().len(),
            1
        );

        // Values stay ciphertext in listings.
        let listed = t.vault.list_secrets(None).await.unwrap();
        assert!(listed.iter().all(|s| s.value != "1" && s.value != "2"));
    }

    #[tokio::test]
    async fn update_overwrites_value_and_keeps_unset_fields() {
        let t = TestVault::init().await;

        t.vault
            .add_secret(
                "KEY",
                "old",
                Environment::All,
                SecretOptions {
                    description: Some("kept".to_string()),
                    tags: Some(vec!["x".to_string()]),
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        t.vault
            .update_secret("KEY", "new", Environment::All, UpdateOptions::default())
            .await
            .unwrap();

        let found = t
            .vault
            .get_secret_with_details("KEY", Environment::All)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.value, "new");
        assert_eq!(found.secret.description.as_deref(), Some("kept"));
        assert_eq!(found.secret.tags, vec!["x"]);
        assert!(found.secret.updated_at >= found.secret.created_at);
        assert!(found.secret.last_used_at.is_some());
    }

    #[tokio::test]
    async fn update_requires_exact_row() {
        let t = TestVault::init().await;

        t.vault.add_secret("KEY", "v", Environment::All, opts()).await.unwrap();

        // No fallback on update: the dev row does not exist.
        let result = t
            .vault
            .update_secret("KEY", "new", Environment::Dev, UpdateOptions::default())
            .await;
        assert!(matches!(result, Err(VaultError::SecretNotFound { .. })));
    }

    #[tokio::test]
    async fn input_validation() {
        let t = TestVault::init().await;

        let result = t.vault.add_secret("lowercase", "v", Environment::All, opts()).await;
        assert!(matches!(result, Err(VaultError::InvalidKey(_))));

        let big = "x".repeat(MAX_VALUE_SIZE + 1);
        let result = t.vault.add_secret("BIG", &big, Environment::All, opts()).await;
        assert!(matches!(result, Err(VaultError::ValueTooLarge { .. })));

        // Exactly at the cap is fine.
        let exact = "x".repeat(MAX_VALUE_SIZE);
        t.vault.add_secret("EXACT", &exact, Environment::All, opts()).await.unwrap();

        let result = "qa".parse::<Environment>();
        assert!(matches!(result, Err(VaultError::InvalidEnvironment(_))));
    }

    #[tokio::test]
    async fn search_matches_key_and_description() {
        let t = TestVault::init().await;

        t.vault
            .add_secret(
                "DATABASE_URL",
                "v",
                Environment::Dev,
                SecretOptions {
                    description: Some("postgres connection".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        t.vault.add_secret("API_KEY", "v", Environment::Dev, opts()).await.unwrap();

        assert_eq!(t.vault.search_secrets("DATABASE").await.unwrap().len(), 1);
        assert_eq!(t.vault.search_secrets("postgres").await.unwrap().len(), 1);
        assert_eq!(t.vault.search_secrets("KEY").await.unwrap().len(), 1);
        assert!(t.vault.search_secrets("database").await.unwrap().is_empty());
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    #[tokio::test]
    async fn rotate_skips_excluded_environments() {
        let t = TestVault::init().await;

        t.vault.add_secret("API_KEY", "old-key", Environment::Dev, opts()).await.unwrap();
        t.vault.add_secret("API_KEY", "old-key", Environment::Prod, opts()).await.unwrap();

        let rotated = t
            .vault
            .rotate_secret("API_KEY", "new-key", &[Environment::Prod])
            .await
            .unwrap();
        assert_eq!(rotated, 1);

        assert_eq!(
            t.vault.get_secret("API_KEY", Environment::Dev).await.unwrap().as_deref(),
            Some("new-key")
        );
        assert_eq!(
            t.vault.get_secret("API_KEY", Environment::Prod).await.unwrap().as_deref(),
            Some("old-key")
        );
    }

    #[tokio::test]
    async fn rotate_produces_distinct_ciphertexts_per_row() {
        let t = TestVault::init().await;

        t.vault.add_secret("K", "v", Environment::Dev, opts()).await.unwrap();
        t.vault.add_secret("K", "v", Environment::Prod, opts()).await.unwrap();

        t.vault.rotate_secret("K", "rotated", &[]).await.unwrap();

        let rows = t.vault.list_secrets(None).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Fresh nonce per row: identical plaintext, different ciphertext.
        assert_ne!(rows[0].value, rows[1].value);
    }

    #[tokio::test]
    async fn rotate_unknown_key_fails() {
        let t = TestVault::init().await;
        let result = t.vault.rotate_secret("NOPE", "v", &[]).await;
        assert!(matches!(result, Err(VaultError::SecretNotFound { .. })));

        // Excluding every row the key has also counts as not found.
        t.vault.add_secret("ONLY_DEV", "v", Environment::Dev, opts()).await.unwrap();
        let result = t
            .vault
            .rotate_secret("ONLY_DEV", "v2", &[Environment::Dev])
            .await;
        assert!(matches!(result, Err(VaultError::SecretNotFound { .. })));
    }

    // ========================================================================
    // Sync merge rule
    // ========================================================================

    #[tokio::test]
    async fn sync_prefers_environment_specific_rows() {
        let t = TestVault::init().await;

        t.vault.add_secret("SHARED", "base", Environment::All, opts()).await.unwrap();
        t.vault.add_secret("SHARED", "dev-override", Environment::Dev, opts()).await.unwrap();
        t.vault.add_secret("ONLY_ALL", "fallback", Environment::All, opts()).await.unwrap();
        t.vault.add_secret("ONLY_DEV", "specific", Environment::Dev, opts()).await.unwrap();
        t.vault.add_secret("PROD_ONLY", "hidden", Environment::Prod, opts()).await.unwrap();

        let env: HashMap<String, String> =
            t.vault.secrets_for_sync(Environment::Dev).await.unwrap();

        assert_eq!(env.len(), 3);
        assert_eq!(env["SHARED"], "dev-override");
        assert_eq!(env["ONLY_ALL"], "fallback");
        assert_eq!(env["ONLY_DEV"], "specific");
        assert!(!env.contains_key("PROD_ONLY"));
    }

    // ========================================================================
    // Lock lifecycle and brute-force defense
    // ========================================================================

    #[tokio::test]
    async fn lock_then_unlock_roundtrip() {
        let t = TestVault::init().await;

        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();
        t.vault.lock().await;
        assert_eq!(t.vault.state().await, VaultState::Locked);

        assert!(matches!(
            t.vault.get_secret("K", Environment::All).await,
            Err(VaultError::Locked)
        ));

        assert!(t.vault.unlock(PASSWORD, None).await.unwrap());
        assert_eq!(
            t.vault.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn wrong_password_counts_down_then_locks_out() {
        let t = TestVault::init().await;
        t.vault.lock().await;

        for expected_remaining in [2u32, 1] {
            let result = t.vault.unlock("WrongPassword1!", None).await;
            match result {
                Err(VaultError::WrongPassword { attempts_remaining }) => {
                    assert_eq!(attempts_remaining, expected_remaining);
                },
                other => panic!("expected WrongPassword, got {other:?}"),
            }
        }

        // Third failure trips the lockout.
        let result = t.vault.unlock("WrongPassword1!", None).await;
        assert!(matches!(result, Err(VaultError::LockedOut { .. })));
        assert_eq!(t.vault.state().await, VaultState::LockedOut);

        // Even the correct password is refused inside the window.
        let result = t.vault.unlock(PASSWORD, None).await;
        assert!(matches!(result, Err(VaultError::LockedOut { .. })));
    }

    #[tokio::test]
    async fn lockout_survives_process_restart() {
        let t = TestVault::init().await;
        t.vault.lock().await;

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = t.vault.unlock("WrongPassword1!", None).await;
        }

        // A fresh handle over the same database sees the persisted lockout.
        let restarted = t.reopen();
        let result = restarted.unlock(PASSWORD, None).await;
        assert!(matches!(result, Err(VaultError::LockedOut { .. })));
    }

    #[tokio::test]
    async fn expired_lockout_clears_and_unlocks() {
        let t = TestVault::init().await;
        t.vault.lock().await;

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = t.vault.unlock("WrongPassword1!", None).await;
        }

        // Rewind the persisted lockout into the past, as wall-clock expiry
        // would.
        let store = VaultStore::open(t.db_path()).await.unwrap();
        store.set_meta("lockout_until", "1000").await.unwrap();
        store.close().await;

        let restarted = t.reopen();
        assert!(restarted.unlock(PASSWORD, None).await.unwrap());
        assert_eq!(restarted.state().await, VaultState::Unlocked);

        // Counter was reset: a single new failure reports full headroom.
        restarted.lock().await;
        let result = restarted.unlock("WrongPassword1!", None).await;
        match result {
            Err(VaultError::WrongPassword { attempts_remaining }) => {
                assert_eq!(attempts_remaining, MAX_FAILED_ATTEMPTS - 1);
            },
            other => panic!("expected WrongPassword, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_attempts_persist_across_restart() {
        let t = TestVault::init().await;
        t.vault.lock().await;

        let _ = t.vault.unlock("WrongPassword1!", None).await;
        let _ = t.vault.unlock("WrongPassword1!", None).await;

        // One more failure from a fresh handle must trip the lockout.
        let restarted = t.reopen();
        let result = restarted.unlock("WrongPassword1!", None).await;
        assert!(matches!(result, Err(VaultError::LockedOut { .. })));
    }

    // ========================================================================
    // Master password change
    // ========================================================================

    #[tokio::test]
    async fn change_password_preserves_every_secret() {
        let t = TestVault::init().await;

        let fixtures = [
            ("DATABASE_URL", "postgres://localhost/db", Environment::Dev),
            ("API_KEY", "key123", Environment::All),
            ("PROD_TOKEN", "tok-987", Environment::Prod),
        ];
        for (key, value, env) in fixtures {
            t.vault.add_secret(key, value, env, opts()).await.unwrap();
        }

        let new_password = "EntirelyNew456$pw";
        t.vault
            .change_master_password(PASSWORD, new_password)
            .await
            .unwrap();

        // The live session keeps working with the swapped key.
        assert_eq!(
            t.vault.get_secret("API_KEY", Environment::All).await.unwrap().as_deref(),
            Some("key123")
        );

        // The old password is dead, the new one unlocks everything.
        t.vault.lock().await;
        assert!(matches!(
            t.vault.unlock(PASSWORD, None).await,
            Err(VaultError::WrongPassword { .. })
        ));
        assert!(t.vault.unlock(new_password, None).await.unwrap());

        for (key, value, env) in fixtures {
            assert_eq!(
                t.vault.get_secret(key, env).await.unwrap().as_deref(),
                Some(value)
            );
        }
    }

    #[tokio::test]
    async fn change_password_rejects_wrong_old_password() {
        let t = TestVault::init().await;
        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();

        let result = t
            .vault
            .change_master_password("NotTheRight1!", "EntirelyNew456$pw")
            .await;
        assert!(matches!(result, Err(VaultError::WrongPassword { .. })));

        // Nothing changed.
        t.vault.lock().await;
        assert!(t.vault.unlock(PASSWORD, None).await.unwrap());
        assert_eq!(
            t.vault.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn change_password_works_on_a_locked_vault() {
        let t = TestVault::init().await;
        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();
        t.vault.lock().await;

        let new_password = "EntirelyNew456$pw";
        t.vault
            .change_master_password(PASSWORD, new_password)
            .await
            .unwrap();
        assert_eq!(t.vault.state().await, VaultState::Locked);

        assert!(t.vault.unlock(new_password, None).await.unwrap());
        assert_eq!(
            t.vault.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("v")
        );
    }

    // ========================================================================
    // Session cache
    // ========================================================================

    #[tokio::test]
    async fn session_bridges_engine_handles() {
        let t = TestVault::init().await;
        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();

        let cache = SessionCache::new(t.session_path());
        t.vault.cache_session(&cache, 15).await.unwrap();
        t.vault.lock().await;

        // A second handle (a new CLI process) unlocks from the session.
        let restarted = t.reopen();
        let key = cache.load_session().unwrap().expect("live session");
        restarted.unlock_with_session(key).await.unwrap();

        assert_eq!(
            restarted.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn session_goes_stale_after_password_change() {
        let t = TestVault::init().await;

        let cache = SessionCache::new(t.session_path());
        t.vault.cache_session(&cache, 15).await.unwrap();

        t.vault
            .change_master_password(PASSWORD, "EntirelyNew456$pw")
            .await
            .unwrap();
        t.vault.lock().await;

        let key = cache.load_session().unwrap().expect("file still present");
        let result = t.vault.unlock_with_session(key).await;
        assert!(matches!(result, Err(VaultError::SessionInvalid(_))));
    }

    // ========================================================================
    // Backup and restore
    // ========================================================================

    #[tokio::test]
    async fn backup_restore_roundtrip_is_bit_identical() {
        let t = TestVault::init().await;
        let backups = t.backups_dir();

        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();
        t.vault.lock().await;
        let snapshot = std::fs::read(t.db_path()).unwrap();

        let backup_path = backups.join("vault-backup-test.enc");
        t.vault
            .create_backup(&backup_path, Some("backup-password"))
            .await
            .unwrap();

        // Mutate the vault after the backup.
        t.vault.unlock(PASSWORD, None).await.unwrap();
        t.vault.add_secret("LATER", "x", Environment::All, opts()).await.unwrap();
        t.vault.lock().await;

        t.vault
            .restore_backup(&backup_path, Some("backup-password"))
            .await
            .unwrap();

        let restored = std::fs::read(t.db_path()).unwrap();
        assert_eq!(snapshot, restored);

        // The pre-restore copy was preserved in the backups directory.
        let aside: Vec<_> = std::fs::read_dir(&backups)
            .unwrap()
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("vault-pre-restore-")
            })
            .collect();
        assert_eq!(aside.len(), 1);

        // And the restored vault unlocks without the later secret.
        assert!(t.vault.unlock(PASSWORD, None).await.unwrap());
        assert!(t.vault.get_secret("LATER", Environment::All).await.unwrap().is_none());
        assert_eq!(
            t.vault.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn restore_rejects_wrong_backup_password() {
        let t = TestVault::init().await;
        let backup_path = t.backups_dir().join("b.enc");

        t.vault.create_backup(&backup_path, Some("right-password")).await.unwrap();

        let result = t.vault.restore_backup(&backup_path, Some("wrong-password")).await;
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn plain_backup_needs_no_password() {
        let t = TestVault::init().await;
        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();
        t.vault.lock().await;

        let backup_path = t.backups_dir().join("plain.bak");
        t.vault.create_backup(&backup_path, None).await.unwrap();
        t.vault.restore_backup(&backup_path, None).await.unwrap();

        assert!(t.vault.unlock(PASSWORD, None).await.unwrap());
        assert_eq!(
            t.vault.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("v")
        );
    }

    // ========================================================================
    // Export / import
    // ========================================================================

    #[tokio::test]
    async fn export_import_roundtrip_between_vaults() {
        let source = TestVault::init().await;
        source
            .vault
            .add_secret(
                "DATABASE_URL",
                "postgres://localhost/db",
                Environment::Dev,
                SecretOptions {
                    description: Some("primary".to_string()),
                    tags: Some(vec!["db".to_string()]),
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        source
            .vault
            .add_secret("API_KEY", "key123", Environment::All, opts())
            .await
            .unwrap();

        let blob = source.vault.export_secrets("export-pass", None).await.unwrap();

        let target = TestVault::init().await;
        let report = target.vault.import_secrets(&blob, "export-pass").await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.updated, 0);

        assert_eq!(
            target
                .vault
                .get_secret("DATABASE_URL", Environment::Dev)
                .await
                .unwrap()
                .as_deref(),
            Some("postgres://localhost/db")
        );
        let details = target
            .vault
            .get_secret_with_details("DATABASE_URL", Environment::Dev)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.secret.description.as_deref(), Some("primary"));
        assert_eq!(details.secret.tags, vec!["db"]);
    }

    #[tokio::test]
    async fn import_collisions_overwrite() {
        let source = TestVault::init().await;
        source
            .vault
            .add_secret("K", "exported-value", Environment::All, opts())
            .await
            .unwrap();
        let blob = source.vault.export_secrets("export-pass", None).await.unwrap();

        let target = TestVault::init().await;
        target
            .vault
            .add_secret("K", "local-value", Environment::All, opts())
            .await
            .unwrap();

        let report = target.vault.import_secrets(&blob, "export-pass").await.unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(report.updated, 1);
        assert_eq!(
            target.vault.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("exported-value")
        );
    }

    #[tokio::test]
    async fn import_rejects_wrong_password_and_garbage() {
        let source = TestVault::init().await;
        source.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();
        let blob = source.vault.export_secrets("export-pass", None).await.unwrap();

        let target = TestVault::init().await;
        let result = target.vault.import_secrets(&blob, "wrong-pass").await;
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));

        let result = target.vault.import_secrets(b"not an export", "export-pass").await;
        assert!(matches!(result, Err(VaultError::Corrupted(_))));
    }

    #[tokio::test]
    async fn export_respects_environment_filter() {
        let source = TestVault::init().await;
        source.vault.add_secret("D", "1", Environment::Dev, opts()).await.unwrap();
        source.vault.add_secret("P", "2", Environment::Prod, opts()).await.unwrap();
        source.vault.add_secret("A", "3", Environment::All, opts()).await.unwrap();

        let blob = source
            .vault
            .export_secrets("export-pass", Some(Environment::Dev))
            .await
            .unwrap();

        let target = TestVault::init().await;
        let report = target.vault.import_secrets(&blob, "export-pass").await.unwrap();
        // Dev row plus the `all` row travel; the prod row stays home.
        assert_eq!(report.added, 2);
        assert!(target.vault.get_secret("P", Environment::Prod).await.unwrap().is_none());
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    #[tokio::test]
    async fn operations_leave_an_audit_trail() {
        let t = TestVault::init().await;

        t.vault.add_secret("K", "v", Environment::Dev, opts()).await.unwrap();
        t.vault.get_secret("K", Environment::Dev).await.unwrap();
        t.vault.rotate_secret("K", "v2", &[]).await.unwrap();
        t.vault.delete_secret("K", Environment::Dev).await.unwrap();

        let entries = t.vault.audit_logs(AuditFilter::default()).await.unwrap();
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();

        // Newest first.
        assert_eq!(
            actions,
            vec![
                AuditAction::Delete,
                AuditAction::Rotate,
                AuditAction::Read,
                AuditAction::Write
            ]
        );
        assert!(entries.iter().all(|e| e.secret_key == "K"));
        assert!(entries.iter().all(|e| !e.user.is_empty()));

        let reads = t
            .vault
            .audit_logs(AuditFilter {
                action: Some(AuditAction::Read),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(reads.len(), 1);

        assert_eq!(t.vault.audit_count(Some("K")).await.unwrap(), 4);
        assert_eq!(t.vault.audit_count(Some("OTHER")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fallback_read_details_audits_matched_environment() {
        let t = TestVault::init().await;

        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();
        t.vault
            .get_secret_with_details("K", Environment::Dev)
            .await
            .unwrap()
            .unwrap();

        let entries = t
            .vault
            .audit_logs(AuditFilter {
                action: Some(AuditAction::Read),
                ..Default::default()
            })
            .await
            .unwrap();
        // The matched row lives in `all`, and that is what gets recorded.
        assert_eq!(entries[0].environment, "all");
    }

    #[tokio::test]
    async fn prune_keeps_newest_entries() {
        let t = TestVault::init().await;

        for i in 0..8 {
            t.vault
                .add_secret(&format!("K{i}"), "v", Environment::All, opts())
                .await
                .unwrap();
        }

        let removed = t.vault.prune_audit_logs(3).await.unwrap();
        assert_eq!(removed, 5);
        assert_eq!(t.vault.audit_count(None).await.unwrap(), 3);

        let exported = t.vault.export_audit_logs(None).await.unwrap();
        assert_eq!(exported.len(), 3);
    }

    // ========================================================================
    // Re-initialization and state edges
    // ========================================================================

    #[tokio::test]
    async fn reinit_without_force_fails_and_preserves_data() {
        let t = TestVault::init().await;
        t.vault.add_secret("K", "v", Environment::All, opts()).await.unwrap();

        let fresh = t.reopen();
        let result = fresh.initialize(PASSWORD, InitOptions::default()).await;
        assert!(matches!(result, Err(VaultError::AlreadyInitialized)));

        assert_eq!(
            t.vault.get_secret("K", Environment::All).await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn fresh_path_reports_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        let vault = Vault::open(dir.path().join("vault.db"));

        assert_eq!(vault.state().await, VaultState::NotInitialized);
        assert!(matches!(
            vault.unlock(PASSWORD, None).await,
            Err(VaultError::NotInitialized)
        ));
        assert!(matches!(
            vault.create_backup(&dir.path().join("b.enc"), None).await,
            Err(VaultError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn ciphertext_on_disk_never_contains_plaintext() {
        let t = TestVault::init().await;
        let marker = "super-unique-plaintext-marker-4711";

        t.vault.add_secret("K", marker, Environment::All, opts()).await.unwrap();
        t.vault.lock().await;

        let raw = std::fs::read(t.db_path()).unwrap();
        let needle = marker.as_bytes();
        assert!(
            !raw.windows(needle.len()).any(|w| w == needle),
            "plaintext leaked into the database file"
        );

        // Sanity: the stored value is a valid base64 frame, not the value.
        t.vault.unlock(PASSWORD, None).await.unwrap();
        let listed = t.vault.list_secrets(None).await.unwrap();
        assert!(BASE64.decode(&listed[0].value).is_ok());
    }
}
