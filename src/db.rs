//! Database module
//!
//! Persists per-conversation orchestration state and chat messages.

mod schema;

pub use schema::{Message, MessageRole, SCHEMA};

use crate::state_machine::ConversationState;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use schema::parse_message_role;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored state is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== State Operations ====================

    /// Load the orchestration state; `None` when nothing was stored
    pub fn load_state(&self, conversation_id: &str) -> DbResult<Option<ConversationState>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM conversation_states WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(DbError::from)
    }

    pub fn save_state(&self, conversation_id: &str, state: &ConversationState) -> DbResult<()> {
        let state_json = serde_json::to_string(state)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversation_states (conversation_id, phase, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id) DO UPDATE SET
                phase = excluded.phase,
                state = excluded.state,
                updated_at = excluded.updated_at",
            params![
                conversation_id,
                state.phase.as_str(),
                state_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn clear_state(&self, conversation_id: &str) -> DbResult<()> {
        self.conn()?.execute(
            "DELETE FROM conversation_states WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    /// Conversations currently waiting on a clarification answer
    pub fn collecting_conversations(&self) -> DbResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id FROM conversation_states
             WHERE phase = 'collecting_params' ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Message Operations ====================

    /// Add a message to a conversation
    pub fn add_message(
        &self,
        message_id: &str,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> DbResult<Message> {
        let conn = self.conn()?;
        let now = Utc::now();

        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO messages (id, conversation_id, sequence_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message_id,
                conversation_id,
                sequence_id,
                role.to_string(),
                content,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Message {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_id,
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Get messages for a conversation in creation order
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, role, content, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_id: row.get(2)?,
        role: parse_message_role(&row.get::<_, String>(3)?),
        content: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
