use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool};
use std::path::Path;
use uuid::Uuid;

use crate::models::{ChatMessage, ChatSession, Role};

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Generic key-value store (cache entries, app settings)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

-- Chat Sessions Table
CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix timestamp (milliseconds)
    updated_at INTEGER NOT NULL -- Unix timestamp (milliseconds)
);
CREATE INDEX IF NOT EXISTS idx_chat_sessions_user_recency ON chat_sessions(user_id, updated_at);

-- Chat Messages Table
CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    session_id TEXT NOT NULL,
    role TEXT NOT NULL, -- 'user', 'assistant' or 'system'
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL, -- Unix timestamp (milliseconds)
    language TEXT, -- Optional ISO 639-1 code
    is_voice INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_session_id ON chat_messages(session_id);
CREATE INDEX IF NOT EXISTS idx_chat_messages_timestamp ON chat_messages(timestamp);
";

#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Creates a new StorageManager, connects to the database, and runs migrations.
    pub async fn new(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        // Create the database file if it doesn't exist
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        // Connect to the database
        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        // Run migrations
        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    // --- Generic key-value store ---

    /// Stores a string value at `key`, overwriting any existing entry.
    pub async fn kv_set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to write key-value entry")?;
        Ok(())
    }

    /// Reads the string value at `key`, or None if absent.
    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read key-value entry")?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn kv_remove(&self, key: &str) -> Result<(), anyhow::Error> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to remove key-value entry")?;
        Ok(())
    }

    /// All keys starting with `prefix`.
    pub async fn kv_keys(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        let rows = sqlx::query("SELECT key FROM kv_store")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list key-value keys")?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("key"))
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// Keys starting with `prefix` whose value is valid JSON, ordered by
    /// the `stored_at` field of that JSON, oldest first. Used by the
    /// cache's size-bound eviction.
    pub async fn kv_keys_oldest_first(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        let rows = sqlx::query(
            "SELECT key FROM kv_store
             WHERE json_valid(value)
             ORDER BY json_extract(value, '$.stored_at') ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list key-value keys by age")?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("key"))
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    pub async fn kv_remove_many(&self, keys: &[String]) -> Result<(), anyhow::Error> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for key in keys {
            sqlx::query("DELETE FROM kv_store WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .context("Failed to remove key-value entry")?;
        }
        tx.commit().await.context("Failed to commit bulk removal")?;
        Ok(())
    }

    // --- Chat sessions ---

    /// Creates a new, empty session for `user_id`.
    pub async fn create_session(&self, user_id: &str) -> Result<ChatSession, anyhow::Error> {
        log::info!("Creating new chat session for user {}", user_id);
        let now = now_millis();
        let session = ChatSession {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(session.created_at.timestamp_millis())
        .bind(session.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert new chat session into database")?;

        log::info!("Successfully created session with ID: {}", session.id);
        Ok(session)
    }

    /// Fetches a single session with its messages, ordered by timestamp ascending.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<ChatSession>, anyhow::Error> {
        log::debug!("Fetching session with ID: {}", session_id);
        let row = sqlx::query(
            "SELECT id, user_id, created_at, updated_at FROM chat_sessions WHERE id = ?",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session from database")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut session = session_from_row(&row)?;
        session.messages = self.get_session_messages(session_id).await?;
        Ok(Some(session))
    }

    /// Fetches sessions for a user, most recently updated first.
    pub async fn list_sessions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatSession>, anyhow::Error> {
        log::debug!("Fetching sessions for user {}", user_id);
        let rows = sqlx::query(
            "SELECT id, user_id, created_at, updated_at
             FROM chat_sessions
             WHERE user_id = ?
             ORDER BY updated_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch sessions from database")?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut session = session_from_row(row)?;
            session.messages = self.get_session_messages(session.id).await?;
            sessions.push(session);
        }

        log::info!("Fetched {} sessions for user {}", sessions.len(), user_id);
        Ok(sessions)
    }

    async fn get_session_messages(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ChatMessage>, anyhow::Error> {
        let rows = sqlx::query(
            "SELECT id, role, content, timestamp, language, is_voice
             FROM chat_messages
             WHERE session_id = ?
             ORDER BY timestamp ASC, rowid ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages from database")?;

        rows.iter().map(message_from_row).collect()
    }

    /// Appends a message and bumps the session's `updated_at` in a single
    /// transaction, so the message list and timestamp can never diverge.
    /// Returns the new `updated_at`.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        message: &ChatMessage,
    ) -> Result<DateTime<Utc>, anyhow::Error> {
        log::debug!("Appending message {} to session {}", message.id, session_id);
        let updated_at = now_millis();

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, timestamp, language, is_voice)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(session_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .bind(message.language.as_deref())
        .bind(message.is_voice as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to insert message into database")?;

        let result = sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
            .bind(updated_at.timestamp_millis())
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to update session timestamp")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Session {} not found for message append", session_id);
        }

        tx.commit().await.context("Failed to commit message append")?;

        log::info!("Successfully saved message ID: {}", message.id);
        Ok(updated_at)
    }

    /// Deletes a single message (used when regenerating the last reply).
    pub async fn delete_message(&self, message_id: Uuid) -> Result<(), anyhow::Error> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE id = ?")
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete message from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent message: {}", message_id);
        }
        Ok(())
    }

    /// Deletes a session and its messages.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), anyhow::Error> {
        log::warn!("Deleting session with ID: {}", session_id);

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete session messages from database")?;

        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete session from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent session: {}", session_id);
        }

        tx.commit().await.context("Failed to commit session deletion")?;

        log::info!("Successfully deleted session {}", session_id);
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// Current time truncated to millisecond precision, matching the database's
// timestamp columns, so returned values equal what a reload would produce.
fn now_millis() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_else(Utc::now)
}

fn session_from_row(row: &SqliteRow) -> Result<ChatSession, anyhow::Error> {
    Ok(ChatSession {
        id: Uuid::parse_str(&row.get::<String, _>("id")).context("Failed to parse session ID")?,
        user_id: row.get("user_id"),
        messages: Vec::new(),
        created_at: DateTime::from_timestamp_millis(row.get::<i64, _>("created_at"))
            .context("Invalid created_at timestamp")?,
        updated_at: DateTime::from_timestamp_millis(row.get::<i64, _>("updated_at"))
            .context("Invalid updated_at timestamp")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage, anyhow::Error> {
    let role_str: String = row.get("role");
    Ok(ChatMessage {
        id: Uuid::parse_str(&row.get::<String, _>("id")).context("Failed to parse message ID")?,
        role: Role::parse(&role_str)
            .with_context(|| format!("Unknown message role: {}", role_str))?,
        content: row.get("content"),
        timestamp: DateTime::from_timestamp_millis(row.get::<i64, _>("timestamp"))
            .context("Invalid message timestamp")?,
        language: row.get("language"),
        is_voice: row.get::<i64, _>("is_voice") != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_storage() -> (StorageManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageManager::new(&dir.path().join("test.sqlite"))
            .await
            .expect("storage init");
        (storage, dir)
    }

    #[tokio::test]
    async fn kv_round_trip_and_removal() {
        let (storage, _dir) = test_storage().await;

        storage.kv_set("a", "1").await.unwrap();
        storage.kv_set("a", "2").await.unwrap(); // overwrite
        assert_eq!(storage.kv_get("a").await.unwrap().as_deref(), Some("2"));

        storage.kv_remove("a").await.unwrap();
        assert_eq!(storage.kv_get("a").await.unwrap(), None);
        assert_eq!(storage.kv_get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_keys_filters_by_prefix() {
        let (storage, _dir) = test_storage().await;

        storage.kv_set("cache_one", "{}").await.unwrap();
        storage.kv_set("cache_two", "{}").await.unwrap();
        storage.kv_set("settings", "{}").await.unwrap();

        let mut keys = storage.kv_keys("cache_").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache_one", "cache_two"]);

        storage
            .kv_remove_many(&["cache_one".to_string(), "cache_two".to_string()])
            .await
            .unwrap();
        assert!(storage.kv_keys("cache_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_create_append_and_reload() {
        let (storage, _dir) = test_storage().await;

        let session = storage.create_session("user-1").await.unwrap();
        let before = session.updated_at;

        let msg = ChatMessage::user("hello", "en", false);
        let updated_at = storage.append_message(session.id, &msg).await.unwrap();
        assert!(updated_at >= before);

        let reloaded = storage.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(reloaded.user_id, "user-1");
        assert_eq!(reloaded.messages.len(), 1);
        assert_eq!(reloaded.messages[0].content, "hello");
        assert_eq!(reloaded.messages[0].role, Role::User);
        assert_eq!(reloaded.messages[0].language.as_deref(), Some("en"));
        assert!(!reloaded.messages[0].is_voice);
        assert_eq!(reloaded.updated_at, updated_at);
    }

    #[tokio::test]
    async fn append_to_missing_session_fails() {
        let (storage, _dir) = test_storage().await;
        let msg = ChatMessage::user("orphan", "en", false);
        let result = storage.append_message(Uuid::new_v4(), &msg).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_sessions_is_user_scoped_and_recency_ordered() {
        let (storage, _dir) = test_storage().await;

        let first = storage.create_session("user-1").await.unwrap();
        let second = storage.create_session("user-1").await.unwrap();
        storage.create_session("someone-else").await.unwrap();

        // Appending to the older session makes it the most recent. The
        // sleep keeps the bumped timestamp strictly later at millisecond
        // resolution.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        storage
            .append_message(first.id, &ChatMessage::user("bump", "en", false))
            .await
            .unwrap();

        let sessions = storage.list_sessions("user-1", 50).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, first.id);
        assert_eq!(sessions[1].id, second.id);
    }

    #[tokio::test]
    async fn delete_session_removes_messages() {
        let (storage, _dir) = test_storage().await;

        let session = storage.create_session("user-1").await.unwrap();
        storage
            .append_message(session.id, &ChatMessage::user("hi", "en", false))
            .await
            .unwrap();

        storage.delete_session(session.id).await.unwrap();
        assert!(storage.get_session(session.id).await.unwrap().is_none());

        // Messages are gone too, not just orphaned.
        let rows = sqlx::query("SELECT COUNT(*) as count FROM chat_messages")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(rows.get::<i64, _>("count"), 0);
    }
}
