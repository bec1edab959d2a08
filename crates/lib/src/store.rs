//! SQLite persistence for conversations, messages, tenants and the dispatch queue.
//!
//! One connection guarded by an async mutex; statements are short and never held
//! across a remote call. Timestamps are stored as unix milliseconds.

use crate::conversation::{Conversation, DeliveryStatus, Message, NewMessage, Role};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS tenants (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_id TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        agent_id TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        welcome_text TEXT,
        report_email TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS tenants_one_active_sender
        ON tenants(sender_id) WHERE active = 1;
    CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_id TEXT NOT NULL,
        end_user TEXT NOT NULL,
        context_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_activity_at INTEGER NOT NULL,
        UNIQUE (sender_id, end_user)
    );
    CREATE INDEX IF NOT EXISTS conversations_by_activity
        ON conversations(last_activity_at);
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        end_user TEXT NOT NULL,
        channel_message_id TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        created_at INTEGER NOT NULL,
        UNIQUE (conversation_id, channel_message_id, role)
    );
    CREATE INDEX IF NOT EXISTS messages_by_conversation
        ON messages(conversation_id, created_at);
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        available_at INTEGER NOT NULL,
        lease_until INTEGER,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS jobs_ready ON jobs(status, available_at);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Shared handle to the database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("store: could not create {}: {}", parent.display(), e);
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Private in-memory database (tests, one-shot tooling).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    pub async fn find_conversation(
        &self,
        sender_id: &str,
        end_user: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock().await;
        select_conversation(&conn, sender_id, end_user)
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock().await;
        let row = conn
            .query_row(
                "SELECT id, sender_id, end_user, context_id, created_at, last_activity_at
                 FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a conversation unless one already exists for the pair; returns the stored row
    /// and whether this call created it.
    pub async fn insert_conversation_or_fetch(
        &self,
        sender_id: &str,
        end_user: &str,
        context_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool), StoreError> {
        let conn = self.lock().await;
        let ts = to_millis(now);
        let inserted = conn.execute(
            "INSERT INTO conversations(sender_id, end_user, context_id, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(sender_id, end_user) DO NOTHING",
            params![sender_id, end_user, context_id, ts],
        )?;
        let conversation = select_conversation(&conn, sender_id, end_user)?.ok_or_else(|| {
            StoreError::Corrupt(format!(
                "conversation {}/{} missing after insert",
                sender_id, end_user
            ))
        })?;
        Ok((conversation, inserted == 1))
    }

    /// Advance last activity. Returns false when the conversation no longer exists.
    pub async fn touch_conversation(
        &self,
        sender_id: &str,
        end_user: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE conversations SET last_activity_at = MAX(last_activity_at, ?3)
             WHERE sender_id = ?1 AND end_user = ?2",
            params![sender_id, end_user, to_millis(now)],
        )?;
        Ok(n == 1)
    }

    /// Delete a conversation and all of its messages. Returns the number of messages removed.
    pub async fn delete_conversation(&self, id: i64) -> Result<usize, StoreError> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed)
    }

    /// Conversations whose last activity is strictly before `cutoff`, oldest first.
    pub async fn idle_conversations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, end_user, context_id, created_at, last_activity_at
             FROM conversations WHERE last_activity_at < ?1
             ORDER BY last_activity_at, id",
        )?;
        let rows = stmt
            .query_map(params![to_millis(cutoff)], conversation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Append a message unless one with the same (conversation, channel message id, role)
    /// exists. Returns the stored row and whether this call created it.
    pub async fn insert_message_or_fetch(
        &self,
        msg: &NewMessage<'_>,
        now: DateTime<Utc>,
    ) -> Result<(Message, bool), StoreError> {
        let conn = self.lock().await;
        let inserted = conn.execute(
            "INSERT INTO messages(conversation_id, role, content, end_user, channel_message_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(conversation_id, channel_message_id, role) DO NOTHING",
            params![
                msg.conversation_id,
                msg.role.as_str(),
                msg.content,
                msg.end_user,
                msg.channel_message_id,
                msg.status.as_str(),
                to_millis(now)
            ],
        )?;
        let stored = select_message(&conn, msg.conversation_id, msg.channel_message_id, msg.role)?
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "message {} missing after insert",
                    msg.channel_message_id
                ))
            })?;
        Ok((stored, inserted == 1))
    }

    pub async fn find_message(
        &self,
        conversation_id: i64,
        channel_message_id: &str,
        role: Role,
    ) -> Result<Option<Message>, StoreError> {
        let conn = self.lock().await;
        select_message(&conn, conversation_id, channel_message_id, role)
    }

    pub async fn set_message_status(
        &self,
        id: i64,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE messages SET status = ?2, error = ?3 WHERE id = ?1",
            params![id, status.as_str(), error],
        )?;
        Ok(())
    }

    /// Transcript of a conversation in creation order.
    pub async fn messages_for(&self, conversation_id: i64) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, end_user, channel_message_id, status, error, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], message_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(message_from_raw).collect()
    }

    /// Creation time of the newest message in a conversation.
    pub async fn latest_message_at(
        &self,
        conversation_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock().await;
        let ms: Option<i64> = conn.query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(ms.map(from_millis))
    }

    pub async fn count_messages(&self, conversation_id: i64) -> Result<usize, StoreError> {
        let conn = self.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn select_conversation(
    conn: &Connection,
    sender_id: &str,
    end_user: &str,
) -> Result<Option<Conversation>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, sender_id, end_user, context_id, created_at, last_activity_at
             FROM conversations WHERE sender_id = ?1 AND end_user = ?2",
            params![sender_id, end_user],
            conversation_from_row,
        )
        .optional()?;
    Ok(row)
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        end_user: row.get(2)?,
        context_id: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        last_activity_at: from_millis(row.get(5)?),
    })
}

/// Raw message columns; role and status are validated afterwards so a bad value
/// surfaces as `StoreError::Corrupt` rather than a sqlite type error.
type RawMessage = (i64, i64, String, String, String, String, String, Option<String>, i64);

fn message_row(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
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
    ))
}

fn message_from_raw(raw: RawMessage) -> Result<Message, StoreError> {
    let (id, conversation_id, role, content, end_user, channel_message_id, status, error, created_at) =
        raw;
    let role = Role::parse(&role)
        .ok_or_else(|| StoreError::Corrupt(format!("message {}: unknown role {}", id, role)))?;
    let status = DeliveryStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("message {}: unknown status {}", id, status)))?;
    Ok(Message {
        id,
        conversation_id,
        role,
        content,
        end_user,
        channel_message_id,
        status,
        error,
        created_at: from_millis(created_at),
    })
}

fn select_message(
    conn: &Connection,
    conversation_id: i64,
    channel_message_id: &str,
    role: Role,
) -> Result<Option<Message>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT id, conversation_id, role, content, end_user, channel_message_id, status, error, created_at
             FROM messages WHERE conversation_id = ?1 AND channel_message_id = ?2 AND role = ?3",
            params![conversation_id, channel_message_id, role.as_str()],
            message_row,
        )
        .optional()?;
    raw.map(message_from_raw).transpose()
}
