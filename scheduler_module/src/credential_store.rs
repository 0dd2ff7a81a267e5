//! Per-user workspace credential records.
//!
//! Token material is stored only as vault envelopes; this store never sees
//! plaintext tokens.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;

/// An encrypted credential record for one connected user.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub user_id: String,
    pub team_id: String,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

/// Read/write access to stored workspace credentials.
pub trait CredentialStore: Send + Sync {
    fn find_by_user(&self, user_id: &str)
        -> Result<Option<CredentialRecord>, CredentialStoreError>;

    /// Save or replace the credential for a user (initial authorization).
    fn upsert(&self, record: &CredentialRecord) -> Result<(), CredentialStoreError>;

    /// Overwrite the token envelopes and expiry in a single update, leaving
    /// all other fields untouched. A `None` refresh envelope keeps the stored
    /// one (the provider did not rotate it).
    fn update_tokens(
        &self,
        user_id: &str,
        encrypted_access_token: &str,
        encrypted_refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialStoreError>;
}

/// SQLite-backed credential store.
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    path: PathBuf,
}

impl SqliteCredentialStore {
    /// Create a new store, initializing the database if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CredentialStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, CredentialStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS workspace_credentials (
                user_id TEXT PRIMARY KEY,
                team_id TEXT NOT NULL,
                encrypted_access_token TEXT NOT NULL,
                encrypted_refresh_token TEXT,
                token_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(conn)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn find_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<CredentialRecord>, CredentialStoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT user_id, team_id, encrypted_access_token, encrypted_refresh_token,
                        token_expires_at, created_at, updated_at
                 FROM workspace_credentials
                 WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((
                user_id,
                team_id,
                encrypted_access_token,
                encrypted_refresh_token,
                token_expires_at,
                created_at,
                updated_at,
            )) => Ok(Some(CredentialRecord {
                user_id,
                team_id,
                encrypted_access_token,
                encrypted_refresh_token,
                token_expires_at: parse_optional_datetime(token_expires_at.as_deref())?,
                created_at: parse_datetime(&created_at)?,
                updated_at: parse_datetime(&updated_at)?,
            })),
            None => Ok(None),
        }
    }

    fn upsert(&self, record: &CredentialRecord) -> Result<(), CredentialStoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO workspace_credentials
                (user_id, team_id, encrypted_access_token, encrypted_refresh_token,
                 token_expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                team_id = excluded.team_id,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                token_expires_at = excluded.token_expires_at,
                updated_at = excluded.updated_at",
            params![
                record.user_id,
                record.team_id,
                record.encrypted_access_token,
                record.encrypted_refresh_token,
                record.token_expires_at.map(format_datetime),
                format_datetime(record.created_at),
                format_datetime(record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn update_tokens(
        &self,
        user_id: &str,
        encrypted_access_token: &str,
        encrypted_refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE workspace_credentials
             SET encrypted_access_token = ?2,
                 encrypted_refresh_token = COALESCE(?3, encrypted_refresh_token),
                 token_expires_at = ?4,
                 updated_at = ?5
             WHERE user_id = ?1",
            params![
                user_id,
                encrypted_access_token,
                encrypted_refresh_token,
                token_expires_at.map(format_datetime),
                format_datetime(now),
            ],
        )?;
        Ok(())
    }
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_optional_datetime(
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    value.map(parse_datetime).transpose()
}
