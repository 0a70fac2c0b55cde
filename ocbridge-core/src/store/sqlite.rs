//! SQLite repository implementation.
//!
//! Default durable backend for the bridge. Uses connection pooling and WAL
//! mode; migrations run automatically on startup.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::store::{BridgeStore, StorageError};

/// SQLite-backed [`BridgeStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store from a database URL of the form `sqlite:path.db`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the connection fails and
    /// [`StorageError::Migration`] if migrations fail.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let path = database_url
            .strip_prefix("sqlite:")
            .unwrap_or(database_url);

        // Ensure the parent directory exists for file-backed databases.
        if path != ":memory:" {
            let path = PathBuf::from(path);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Database(format!("failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))
    }
}

#[async_trait]
impl BridgeStore for SqliteStore {
    async fn upsert_allowed(&self, user_id: i64) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO allowed_users (user_id, created_at) VALUES (?, ?)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn remove_allowed(&self, user_id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM allowed_users WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn allowed_contains(&self, user_id: i64) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM allowed_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn list_allowed(&self) -> Result<Vec<i64>, StorageError> {
        let rows = sqlx::query("SELECT user_id FROM allowed_users ORDER BY user_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("user_id")).collect())
    }

    async fn upsert_admin(&self, user_id: i64) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO admin_users (user_id, created_at) VALUES (?, ?)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn admin_contains(&self, user_id: i64) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM admin_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn list_admins(&self) -> Result<Vec<i64>, StorageError> {
        let rows = sqlx::query("SELECT user_id FROM admin_users ORDER BY user_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("user_id")).collect())
    }

    async fn get_session_link(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            "SELECT session_id FROM session_links WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(row.map(|r| r.get("session_id")))
    }

    async fn set_session_link(
        &self,
        chat_id: i64,
        user_id: i64,
        session_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO session_links (chat_id, user_id, session_id, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (chat_id, user_id)
            DO UPDATE SET session_id = excluded.session_id, updated_at = excluded.updated_at
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn clear_session_link(&self, chat_id: i64, user_id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM session_links WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_recipients_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<(i64, i64)>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT chat_id, user_id FROM session_links
            WHERE session_id = ?
            ORDER BY chat_id ASC, user_id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|r| (r.get("chat_id"), r.get("user_id")))
            .collect())
    }

    async fn get_session_model(&self, session_id: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT model_id FROM session_models WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(row.map(|r| r.get("model_id")))
    }

    async fn set_session_model(
        &self,
        session_id: &str,
        model_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO session_models (session_id, model_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (session_id)
            DO UPDATE SET model_id = excluded.model_id, updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(model_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn clear_session_model(&self, session_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM session_models WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Create the default repository from a database URL.
///
/// # Errors
///
/// Returns [`StorageError`] if store creation fails.
pub async fn create_store(database_url: &str) -> Result<Arc<dyn BridgeStore>, StorageError> {
    let store = SqliteStore::new(database_url).await?;
    Ok(Arc::new(store))
}
