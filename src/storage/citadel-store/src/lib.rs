//! # Citadel Store
//!
//! SQLite persistence for the Citadel secrets vault: vault metadata,
//! encrypted secret rows, audit log, and project links.
//!
//! The store is deliberately crypto-free. Secret values arrive and leave as
//! opaque ciphertext strings; key derivation and AEAD live in the engine
//! layer above.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod rows;

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use tracing::{debug, info};

pub use error::StoreError;
pub use rows::{AuditRow, NewAuditRow, ProjectRow, SecretRow};

// ============================================================================
// SQL Schema
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vault_meta (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS secrets (
    id           TEXT PRIMARY KEY,
    key          TEXT NOT NULL,
    value        TEXT NOT NULL,
    environment  TEXT NOT NULL,
    description  TEXT,
    tags         TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    last_used_at INTEGER,
    expires_at   INTEGER,
    UNIQUE (key, environment)
);

CREATE INDEX IF NOT EXISTS idx_secrets_key ON secrets (key);
CREATE INDEX IF NOT EXISTS idx_secrets_environment ON secrets (environment);
CREATE INDEX IF NOT EXISTS idx_secrets_updated_at ON secrets (updated_at);
CREATE INDEX IF NOT EXISTS idx_secrets_expires_at ON secrets (expires_at);

CREATE TABLE IF NOT EXISTS projects (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    path           TEXT NOT NULL UNIQUE,
    created_at     INTEGER NOT NULL,
    last_synced_at INTEGER
);

CREATE TABLE IF NOT EXISTS project_secrets (
    project_id  TEXT NOT NULL,
    secret_id   TEXT NOT NULL,
    added_at    INTEGER NOT NULL,
    PRIMARY KEY (project_id, secret_id),
    FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE,
    FOREIGN KEY (secret_id) REFERENCES secrets (id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    action      TEXT NOT NULL,
    secret_key  TEXT NOT NULL,
    environment TEXT NOT NULL,
    user        TEXT NOT NULL,
    ip_address  TEXT,
    metadata    TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs (timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_secret_key ON audit_logs (secret_key);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs (action);
"#;

const SECRET_COLUMNS: &str =
    "id, key, value, environment, description, tags, created_at, updated_at, last_used_at, expires_at";

const AUDIT_COLUMNS: &str =
    "id, timestamp, action, secret_key, environment, user, ip_address, metadata";

// ============================================================================
// Filters
// ============================================================================

/// Filter and pagination for audit log queries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Restrict to entries for one secret key.
    pub secret_key: Option<String>,
    /// Restrict to one action name.
    pub action: Option<String>,
    /// Maximum rows to return.
    pub limit: i64,
    /// Rows to skip (newest-first ordering).
    pub offset: i64,
}

// ============================================================================
// Store
// ============================================================================

/// Handle to the vault database.
///
/// Cloning is cheap: clones share the underlying connection pool.
#[derive(Clone)]
pub struct VaultStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl VaultStore {
    /// Opens (or creates) the vault database at `path`.
    ///
    /// Creates the parent directory with mode `0o700`, runs migrations, and
    /// restricts the database file to `0o600`. Permission failures on
    /// platforms without Unix modes are non-fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the database
    /// cannot be opened or migrated.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::ConnectionFailed(format!("failed to create directory: {e}"))
            })?;
            restrict_permissions(parent, 0o700);
        }

        debug!(path = %path.display(), "Opening vault database");

        // Rollback journal keeps the vault a single file, which the backup
        // codec depends on (it frames the raw database bytes).
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Delete)
            .pragma("case_sensitive_like", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool, path };

        store.migrate().await?;
        restrict_permissions(&store.path, 0o600);

        info!(path = %store.path.display(), "Vault store ready");

        Ok(store)
    }

    /// Returns true if a vault database file exists at `path`.
    ///
    /// Checks file presence only, not schema validity.
    pub fn vault_exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the connection pool. Safe to call more than once.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs database migrations.
    async fn migrate(&self) -> Result<(), StoreError> {
        debug!("Running database migrations");

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::ConnectionFailed(format!("migration failed: {e}")))?;
        }

        Ok(())
    }

    // ========================================================================
    // Vault metadata
    // ========================================================================

    /// Reads a metadata value.
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM vault_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(row.map(|(v,)| v))
    }

    /// Writes a metadata value (upsert).
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vault_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    // ========================================================================
    // Secrets
    // ========================================================================

    /// Inserts a new secret row.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if a row with the same
    /// `(key, environment)` already exists.
    pub async fn insert_secret(&self, row: &SecretRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO secrets (id, key, value, environment, description, tags, created_at, updated_at, last_used_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.key)
        .bind(&row.value)
        .bind(&row.environment)
        .bind(&row.description)
        .bind(&row.tags)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.last_used_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let unique = e
                .as_database_error()
                .map(|db| db.is_unique_violation())
                .unwrap_or(false);
            if unique {
                StoreError::AlreadyExists(format!("{}/{}", row.key, row.environment))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    /// Looks up the row for an exact `(key, environment)` pair.
    pub async fn find_secret(
        &self,
        key: &str,
        environment: &str,
    ) -> Result<Option<SecretRow>, StoreError> {
        sqlx::query_as(&format!(
            "SELECT {SECRET_COLUMNS} FROM secrets WHERE key = ? AND environment = ?"
        ))
        .bind(key)
        .bind(environment)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Returns every row with the given key, across environments.
    pub async fn secrets_for_key(&self, key: &str) -> Result<Vec<SecretRow>, StoreError> {
        sqlx::query_as(&format!(
            "SELECT {SECRET_COLUMNS} FROM secrets WHERE key = ? ORDER BY environment"
        ))
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Lists secret rows, optionally filtered to one environment.
    ///
    /// With a filter, rows in the requested environment and in `all` are
    /// returned. Ordered by `(key, environment)`.
    pub async fn list_secrets(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<SecretRow>, StoreError> {
        match environment {
            Some(env) => sqlx::query_as(&format!(
                "SELECT {SECRET_COLUMNS} FROM secrets
                 WHERE environment = ? OR environment = 'all'
                 ORDER BY key, environment"
            ))
            .bind(env)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err),
            None => sqlx::query_as(&format!(
                "SELECT {SECRET_COLUMNS} FROM secrets ORDER BY key, environment"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(query_err),
        }
    }

    /// Rows relevant for materializing one environment: the environment's own
    /// rows plus the `all` fallbacks. The engine applies the merge rule.
    pub async fn sync_rows(&self, environment: &str) -> Result<Vec<SecretRow>, StoreError> {
        sqlx::query_as(&format!(
            "SELECT {SECRET_COLUMNS} FROM secrets
             WHERE environment = ? OR environment = 'all'
             ORDER BY key"
        ))
        .bind(environment)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Substring search over key and description.
    ///
    /// `%`, `_`, and `\` in the needle are escaped; matching is
    /// case-sensitive (`case_sensitive_like` is enabled on every
    /// connection).
    pub async fn search_secrets(&self, needle: &str) -> Result<Vec<SecretRow>, StoreError> {
        let pattern = format!("%{}%", escape_like(needle));

        sqlx::query_as(&format!(
            "SELECT {SECRET_COLUMNS} FROM secrets
             WHERE key LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\'
             ORDER BY key, environment"
        ))
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Overwrites a secret's ciphertext and bumps `updated_at`. Description
    /// and tags are only touched when provided.
    pub async fn update_secret(
        &self,
        id: &str,
        value: &str,
        description: Option<&str>,
        tags: Option<&str>,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE secrets SET
                 value = ?,
                 description = COALESCE(?, description),
                 tags = COALESCE(?, tags),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(value)
        .bind(description)
        .bind(tags)
        .bind(updated_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    /// Records a read on a secret.
    pub async fn touch_last_used(&self, id: &str, timestamp: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE secrets SET last_used_at = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(())
    }

    /// Deletes one `(key, environment)` row. Returns the number of rows
    /// removed (0 or 1).
    pub async fn delete_secret(&self, key: &str, environment: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM secrets WHERE key = ? AND environment = ?")
            .bind(key)
            .bind(environment)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    /// Deletes every row with the given key. Returns the count removed.
    pub async fn delete_secret_all_envs(&self, key: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM secrets WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Master-key rotation support
    // ========================================================================

    /// Returns `(id, ciphertext)` for every secret row.
    pub async fn all_secret_values(&self) -> Result<Vec<(String, String)>, StoreError> {
        sqlx::query_as("SELECT id, value FROM secrets")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)
    }

    /// Applies a master-key rotation in a single transaction: every secret
    /// row gets its re-encrypted value, and the `salt` and verification
    /// sentinel metadata are replaced. Either all writes land or none do.
    pub async fn apply_rekey(
        &self,
        salt_meta: (&str, &str),
        sentinel_meta: (&str, &str),
        updates: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        for (id, value) in updates {
            sqlx::query("UPDATE secrets SET value = ? WHERE id = ?")
                .bind(value)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        for (key, value) in [salt_meta, sentinel_meta] {
            sqlx::query(
                "INSERT INTO vault_meta (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        info!(rows = updates.len(), "Re-keyed secret rows");

        Ok(())
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    /// Appends an audit entry.
    pub async fn insert_audit(&self, entry: &NewAuditRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_logs (timestamp, action, secret_key, environment, user, ip_address, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.timestamp)
        .bind(&entry.action)
        .bind(&entry.secret_key)
        .bind(&entry.environment)
        .bind(&entry.user)
        .bind(&entry.ip_address)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    /// Queries audit entries, newest first.
    pub async fn audit_logs(&self, query: &AuditQuery) -> Result<Vec<AuditRow>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE 1=1"));

        if let Some(key) = &query.secret_key {
            qb.push(" AND secret_key = ").push_bind(key.as_str());
        }
        if let Some(action) = &query.action {
            qb.push(" AND action = ").push_bind(action.as_str());
        }

        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        qb.build_query_as::<AuditRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)
    }

    /// Total number of audit entries, optionally for one secret key.
    pub async fn audit_count(&self, secret_key: Option<&str>) -> Result<i64, StoreError> {
        let row: (i64,) = match secret_key {
            Some(key) => {
                sqlx::query_as("SELECT COUNT(*) FROM audit_logs WHERE secret_key = ?")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await
            },
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM audit_logs")
                    .fetch_one(&self.pool)
                    .await
            },
        }
        .map_err(query_err)?;

        Ok(row.0)
    }

    /// Deletes every audit entry except the most recent `keep_last_n`.
    /// Returns the number of rows removed.
    pub async fn prune_audit(&self, keep_last_n: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM audit_logs WHERE id NOT IN
                 (SELECT id FROM audit_logs ORDER BY timestamp DESC, id DESC LIMIT ?)",
        )
        .bind(keep_last_n)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Registers a project root, or renames it if the path is known.
    pub async fn upsert_project(
        &self,
        id: &str,
        name: &str,
        path: &str,
        created_at: i64,
    ) -> Result<ProjectRow, StoreError> {
        sqlx::query(
            "INSERT INTO projects (id, name, path, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET name = excluded.name",
        )
        .bind(id)
        .bind(name)
        .bind(path)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        let row: ProjectRow = sqlx::query_as(
            "SELECT id, name, path, created_at, last_synced_at FROM projects WHERE path = ?",
        )
        .bind(path)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(row)
    }

    /// Lists registered projects, ordered by name.
    pub async fn list_projects(&self) -> Result<Vec<ProjectRow>, StoreError> {
        sqlx::query_as(
            "SELECT id, name, path, created_at, last_synced_at FROM projects ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)
    }

    /// Records the time a project last received a secrets sync.
    pub async fn touch_project_sync(&self, id: &str, timestamp: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE projects SET last_synced_at = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(())
    }

    /// Links a secret to a project. Re-linking is a no-op.
    pub async fn link_secret(
        &self,
        project_id: &str,
        secret_id: &str,
        added_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO project_secrets (project_id, secret_id, added_at) VALUES (?, ?, ?)",
        )
        .bind(project_id)
        .bind(secret_id)
        .bind(added_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    /// Secret ids linked to a project.
    pub async fn project_secret_ids(&self, project_id: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT secret_id FROM project_secrets WHERE project_id = ? ORDER BY added_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::QueryFailed(e.to_string())
}

/// Escapes LIKE wildcards in user input, using `\` as the escape character.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}

// ============================================================================
// Tests
// ============================================================================
