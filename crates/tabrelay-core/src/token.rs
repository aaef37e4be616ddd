//! Token issuance, hashing, and persistence.
//!
//! Tokens are opaque bearer strings of the form `tbr_<48 hex chars>`: a
//! fixed prefix for cheap recognition followed by 24 bytes of randomness.
//! Only the SHA-256 digest of the full string is persisted; the plaintext is
//! returned to the caller exactly once at creation time and never stored.
//!
//! # Schema
//!
//! A single `tokens` table with columns `id`, `hash` (uniquely indexed),
//! `name`, `rate_limit`, `created_at`, `last_used_at`, `revoked_at`.
//! Timestamps are RFC 3339 text. Sessions, pending requests, and rate-limit
//! windows are in-memory only; this table is the sole persisted state.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fixed prefix on every issued token.
///
/// A bearer string without this prefix can be rejected before touching the
/// store at all.
pub const TOKEN_PREFIX: &str = "tbr_";

/// Number of random bytes in the token suffix (48 hex characters).
const TOKEN_RANDOM_BYTES: usize = 24;

/// An API token row.
///
/// The digest is carried internally for session lookups but is skipped by
/// serialization and cleared in listings so it never leaves the store
/// boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// Stable row id, used as the rate-limit key and the revocation handle.
    pub id: i64,
    /// SHA-256 hex digest of the plaintext. Never serialized.
    #[serde(skip)]
    pub digest: String,
    /// Display name chosen at creation.
    pub name: String,
    /// Requests-per-minute limit; zero means "use the configured default".
    pub rate_limit: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last successful validation, stamped best-effort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Revocation timestamp; a revoked token never validates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Errors from token store operations.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    /// Revocation targeted a token that does not exist or was already
    /// revoked.
    #[error("token not found or already revoked")]
    NotFoundOrRevoked,

    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Generates a new random token: the fixed prefix plus 24 random bytes in
/// hex.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// SHA-256 hex digest of the full plaintext token.
///
/// Lookups are by exact digest key, so no constant-time comparison is
/// needed.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Token persistence backed by SQLite.
///
/// SQLite is single-writer by nature; all access goes through one connection
/// behind a mutex. Clones share the connection.
#[derive(Debug, Clone)]
pub struct TokenStore {
    conn: Arc<Mutex<Connection>>,
}

impl TokenStore {
    /// Opens (creating if necessary) the token database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self, TokenStoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "token store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store. Test use only; nothing survives drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, TokenStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initializes the database schema.
    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                rate_limit INTEGER NOT NULL DEFAULT 100,
                created_at TEXT NOT NULL,
                last_used_at TEXT,
                revoked_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tokens_revoked ON tokens(revoked_at)",
            [],
        )?;
        Ok(())
    }

    /// Creates a new token and returns the plaintext.
    ///
    /// The plaintext is returned exactly once; only its digest is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn create(&self, name: &str, rate_limit: u32) -> Result<String, TokenStoreError> {
        let token = generate_token();
        let digest = hash_token(&token);

        let conn = self.lock();
        conn.execute(
            "INSERT INTO tokens (hash, name, rate_limit, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![digest, name, rate_limit, Utc::now().to_rfc3339()],
        )?;

        tracing::info!(name, rate_limit, "token created");
        Ok(token)
    }

    /// Validates a plaintext token.
    ///
    /// Returns `Ok(None)` for unknown or revoked tokens, the non-error "not
    /// valid". Callers that want last-used stamping should invoke
    /// [`touch_last_used`](Self::touch_last_used) off the validation path;
    /// validation itself never blocks on it.
    ///
    /// # Errors
    ///
    /// Returns an error only for underlying store failures.
    pub fn validate(&self, plaintext: &str) -> Result<Option<Token>, TokenStoreError> {
        let digest = hash_token(plaintext);

        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, hash, name, rate_limit, created_at, last_used_at, revoked_at
                 FROM tokens WHERE hash = ?1",
                params![digest],
                row_to_token,
            )
            .optional()?;

        match row {
            Some(token) if token.revoked_at.is_some() => Ok(None),
            other => Ok(other),
        }
    }

    /// Stamps the last-used timestamp for a token. Best-effort bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn touch_last_used(&self, id: i64) -> Result<(), TokenStoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Lists all tokens, newest first, with digests cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self) -> Result<Vec<Token>, TokenStoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, rate_limit, created_at, last_used_at, revoked_at
             FROM tokens ORDER BY created_at DESC, id DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            let created_at: String = row.get(3)?;
            let last_used_at: Option<String> = row.get(4)?;
            let revoked_at: Option<String> = row.get(5)?;
            Ok(Token {
                id: row.get(0)?,
                digest: String::new(),
                name: row.get(1)?,
                rate_limit: row.get(2)?,
                created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
                last_used_at: last_used_at.as_deref().and_then(parse_ts),
                revoked_at: revoked_at.as_deref().and_then(parse_ts),
            })
        })?;

        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Revokes a token by id.
    ///
    /// # Errors
    ///
    /// Returns [`TokenStoreError::NotFoundOrRevoked`] when the id does not
    /// exist or the token was already revoked, so a second revocation is
    /// distinguishable from the first.
    pub fn revoke(&self, id: i64) -> Result<(), TokenStoreError> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE tokens SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![Utc::now().to_rfc3339(), id],
        )?;

        if affected == 0 {
            return Err(TokenStoreError::NotFoundOrRevoked);
        }
        tracing::info!(id, "token revoked");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
    let created_at: String = row.get(4)?;
    let last_used_at: Option<String> = row.get(5)?;
    let revoked_at: Option<String> = row.get(6)?;
    Ok(Token {
        id: row.get(0)?,
        digest: row.get(1)?,
        name: row.get(2)?,
        rate_limit: row.get(3)?,
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        last_used_at: last_used_at.as_deref().and_then(parse_ts),
        revoked_at: revoked_at.as_deref().and_then(parse_ts),
    })
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
