//! Local storage using SQLite: the signed-in session and per-user
//! last-seen watermarks.

use crate::error::Result;
use crate::models::{AuthSession, ConversationKey};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("chatsync.db"))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS session (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                uid TEXT NOT NULL,
                email TEXT NOT NULL,
                display_name TEXT NOT NULL,
                token TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS watermarks (
                user_id TEXT NOT NULL,
                conversation_key TEXT NOT NULL,
                seen_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, conversation_key)
            );
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn save_session(&self, session: &AuthSession) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO session (id, uid, email, display_name, token)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![session.uid, session.email, session.display_name, session.token],
        )?;
        Ok(())
    }

    pub fn get_session(&self) -> Result<Option<AuthSession>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                "SELECT uid, email, display_name, token FROM session WHERE id = 1",
                [],
                |row| {
                    Ok(AuthSession {
                        uid: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        token: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn clear_session(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session", [])?;
        Ok(())
    }

    // ========================================================================
    // Watermarks
    // ========================================================================

    /// Stores `seen_at` unless a later watermark is already stored.
    pub fn save_watermark(
        &self,
        user_id: &str,
        key: &ConversationKey,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watermarks (user_id, conversation_key, seen_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, conversation_key)
             DO UPDATE SET seen_at = MAX(seen_at, excluded.seen_at)",
            params![user_id, key.to_string(), seen_at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn load_watermarks(&self, user_id: &str) -> Result<HashMap<ConversationKey, DateTime<Utc>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT conversation_key, seen_at FROM watermarks WHERE user_id = ?1")?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut watermarks = HashMap::new();
        for row in rows {
            let (key, millis) = row?;
            let Ok(key) = key.parse::<ConversationKey>() else {
                tracing::warn!(%key, "Skipping watermark with unreadable key");
                continue;
            };
            if let Some(seen_at) = Utc.timestamp_millis_opt(millis).single() {
                watermarks.insert(key, seen_at);
            }
        }
        Ok(watermarks)
    }

    pub fn clear_watermarks(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM watermarks WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }
}
