//! Typed row structures mapped from the SQLite schema.

/// A secret row. `value` is always ciphertext; the store never sees
/// plaintext secret values.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRow {
    /// Opaque identifier, stable across updates.
    pub id: String,
    /// Secret key (uppercase identifier).
    pub key: String,
    /// AEAD ciphertext of the secret value (base64 frame).
    pub value: String,
    /// Environment label: `dev`, `staging`, `prod`, or `all`.
    pub environment: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Optional JSON array of tags.
    pub tags: Option<String>,
    /// Creation timestamp, milliseconds since epoch.
    pub created_at: i64,
    /// Last-update timestamp, milliseconds since epoch.
    pub updated_at: i64,
    /// Last read timestamp, if ever read.
    pub last_used_at: Option<i64>,
    /// Expiry timestamp, if set.
    pub expires_at: Option<i64>,
}

/// An audit log row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    /// Row id (autoincrement).
    pub id: i64,
    /// Event timestamp, milliseconds since epoch.
    pub timestamp: i64,
    /// Action name: `read`, `write`, `delete`, `rotate`, `export`, `import`.
    pub action: String,
    /// Key of the secret the action touched.
    pub secret_key: String,
    /// Environment of the secret the action touched.
    pub environment: String,
    /// OS username of the actor.
    pub user: String,
    /// Optional source address.
    pub ip_address: Option<String>,
    /// Optional structured metadata, serialized as a string.
    pub metadata: Option<String>,
}

/// Fields for a new audit entry (the store assigns the row id).
#[derive(Debug, Clone)]
pub struct NewAuditRow {
    /// Event timestamp, milliseconds since epoch.
    pub timestamp: i64,
    /// Action name.
    pub action: String,
    /// Key of the secret the action touched.
    pub secret_key: String,
    /// Environment of the secret the action touched.
    pub environment: String,
    /// OS username of the actor.
    pub user: String,
    /// Optional source address.
    pub ip_address: Option<String>,
    /// Optional structured metadata, serialized as a string.
    pub metadata: Option<String>,
}

/// A registered project root.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRow {
    /// Opaque identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Absolute path (unique).
    pub path: String,
    /// Creation timestamp, milliseconds since epoch.
    pub created_at: i64,
    /// Timestamp of the last secrets sync into this project.
    pub last_synced_at: Option<i64>,
}
