//! Scheduled-message records and their status transitions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum message payload length accepted at creation.
pub const MESSAGE_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Cancelled,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Sent => "sent",
            MessageStatus::Cancelled => "cancelled",
            MessageStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, MessageStoreError> {
        match value {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "sent" => Ok(MessageStatus::Sent),
            "cancelled" => Ok(MessageStatus::Cancelled),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(MessageStoreError::UnknownStatus(other.to_string())),
        }
    }

    /// Whether the scheduler takes no further action on this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Cancelled | MessageStatus::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub id: i64,
    pub user_id: String,
    pub channel_id: String,
    pub message: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: MessageStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub slack_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a scheduled message.
#[derive(Debug, Clone)]
pub struct NewScheduledMessage {
    pub user_id: String,
    pub channel_id: String,
    pub message: String,
    pub scheduled_time: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("unknown message status: {0}")]
    UnknownStatus(String),
    #[error("message not found: {0}")]
    NotFound(i64),
    #[error("scheduled time {0} is not in the future")]
    ScheduledInPast(DateTime<Utc>),
    #[error("message exceeds {} characters", MESSAGE_MAX_CHARS)]
    MessageTooLong,
}

/// Read/write access to scheduled-message records.
pub trait MessageStore: Send + Sync {
    /// Validate and insert a new `pending` message.
    fn create(
        &self,
        new_message: &NewScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<ScheduledMessage, MessageStoreError>;

    fn get(&self, id: i64) -> Result<Option<ScheduledMessage>, MessageStoreError>;

    /// All `pending` messages whose scheduled time has passed, earliest first.
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>, MessageStoreError>;

    /// Atomically move a message from `pending` to `processing`. Returns
    /// whether this caller won the claim; a concurrent scheduler that lost
    /// the race gets `false` and must skip the message.
    fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<bool, MessageStoreError>;

    fn mark_sent(
        &self,
        id: i64,
        sent_at: DateTime<Utc>,
        slack_message_id: &str,
    ) -> Result<(), MessageStoreError>;

    fn mark_failed(
        &self,
        id: i64,
        sent_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), MessageStoreError>;

    /// Bump the send-attempt counter and return the new count.
    fn increment_retry_count(&self, id: i64) -> Result<u32, MessageStoreError>;

    /// User-initiated cancellation. Only a `pending` message can be
    /// cancelled; returns whether a transition happened.
    fn cancel(&self, id: i64, now: DateTime<Utc>) -> Result<bool, MessageStoreError>;
}

/// SQLite-backed message store.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    path: PathBuf,
}

const MESSAGE_COLUMNS: &str = "id, user_id, channel_id, message, scheduled_time, status, \
     sent_at, error_message, retry_count, slack_message_id, created_at, updated_at";

impl SqliteMessageStore {
    /// Create a new store, initializing the database if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, MessageStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, MessageStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduled_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                message TEXT NOT NULL,
                scheduled_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                sent_at TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                slack_message_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_messages_status_time
                ON scheduled_messages (status, scheduled_time);
            CREATE INDEX IF NOT EXISTS idx_scheduled_messages_user_created
                ON scheduled_messages (user_id, created_at);",
        )?;
        Ok(conn)
    }
}

type MessageRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    Option<String>,
    String,
    String,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn into_message(row: MessageRow) -> Result<ScheduledMessage, MessageStoreError> {
    let (
        id,
        user_id,
        channel_id,
        message,
        scheduled_time,
        status,
        sent_at,
        error_message,
        retry_count,
        slack_message_id,
        created_at,
        updated_at,
    ) = row;
    Ok(ScheduledMessage {
        id,
        user_id,
        channel_id,
        message,
        scheduled_time: parse_datetime(&scheduled_time)?,
        status: MessageStatus::parse(&status)?,
        sent_at: parse_optional_datetime(sent_at.as_deref())?,
        error_message,
        retry_count: retry_count as u32,
        slack_message_id,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl MessageStore for SqliteMessageStore {
    fn create(
        &self,
        new_message: &NewScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<ScheduledMessage, MessageStoreError> {
        if new_message.message.chars().count() > MESSAGE_MAX_CHARS {
            return Err(MessageStoreError::MessageTooLong);
        }
        if new_message.scheduled_time <= now {
            return Err(MessageStoreError::ScheduledInPast(new_message.scheduled_time));
        }

        let conn = self.open()?;
        conn.execute(
            "INSERT INTO scheduled_messages
                (user_id, channel_id, message, scheduled_time, status, retry_count,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
            params![
                new_message.user_id,
                new_message.channel_id,
                new_message.message,
                format_datetime(new_message.scheduled_time),
                format_datetime(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.get(id)?.ok_or(MessageStoreError::NotFound(id))
    }

    fn get(&self, id: i64) -> Result<Option<ScheduledMessage>, MessageStoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()?;
        row.map(into_message).transpose()
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>, MessageStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages
             WHERE status = 'pending' AND scheduled_time <= ?1
             ORDER BY scheduled_time ASC"
        ))?;
        let rows = stmt.query_map(params![format_datetime(now)], read_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(into_message(row?)?);
        }
        Ok(messages)
    }

    fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<bool, MessageStoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE scheduled_messages
             SET status = 'processing', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, format_datetime(now)],
        )?;
        Ok(updated > 0)
    }

    fn mark_sent(
        &self,
        id: i64,
        sent_at: DateTime<Utc>,
        slack_message_id: &str,
    ) -> Result<(), MessageStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE scheduled_messages
             SET status = 'sent', sent_at = ?2, slack_message_id = ?3, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![id, format_datetime(sent_at), slack_message_id],
        )?;
        Ok(())
    }

    fn mark_failed(
        &self,
        id: i64,
        sent_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), MessageStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE scheduled_messages
             SET status = 'failed', sent_at = ?2, error_message = ?3, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![id, format_datetime(sent_at), error_message],
        )?;
        Ok(())
    }

    fn increment_retry_count(&self, id: i64) -> Result<u32, MessageStoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE scheduled_messages SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        let count: i64 = conn.query_row(
            "SELECT retry_count FROM scheduled_messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn cancel(&self, id: i64, now: DateTime<Utc>) -> Result<bool, MessageStoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE scheduled_messages
             SET status = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, format_datetime(now)],
        )?;
        Ok(updated > 0)
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
