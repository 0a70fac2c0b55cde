//! Repository contract for bridge persistence.
//!
//! Provides the [`BridgeStore`] trait as a port over the durable tables the
//! core reads and mutates: allowed users, admin users, session links and
//! per-session model overrides. The SQLite adapter is the default backend;
//! [`MemoryStore`] backs tests.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, create_store};

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// A migration operation failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// Invalid data was encountered in the store.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Port over the bridge's durable state.
///
/// Each call is atomic on its own; the core never requires a multi-call
/// transaction. Authorization semantics (admins are implicitly allowed)
/// live above this trait.
#[async_trait]
pub trait BridgeStore: Send + Sync {
    /// Insert a user id into the allowed set. Idempotent.
    async fn upsert_allowed(&self, user_id: i64) -> Result<(), StorageError>;

    /// Remove a user id from the allowed set.
    ///
    /// Returns `true` when a row was deleted.
    async fn remove_allowed(&self, user_id: i64) -> Result<bool, StorageError>;

    /// Whether the id is present in the allowed set (admins not considered).
    async fn allowed_contains(&self, user_id: i64) -> Result<bool, StorageError>;

    /// All allowed user ids, ascending.
    async fn list_allowed(&self) -> Result<Vec<i64>, StorageError>;

    /// Insert a user id into the admin set. Idempotent.
    async fn upsert_admin(&self, user_id: i64) -> Result<(), StorageError>;

    /// Whether the id is present in the admin set.
    async fn admin_contains(&self, user_id: i64) -> Result<bool, StorageError>;

    /// All admin user ids, ascending.
    async fn list_admins(&self) -> Result<Vec<i64>, StorageError>;

    /// The session id linked to this conversation, if any.
    async fn get_session_link(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<Option<String>, StorageError>;

    /// Upsert the session link for a conversation. At most one session id
    /// exists per `(chat_id, user_id)`.
    async fn set_session_link(
        &self,
        chat_id: i64,
        user_id: i64,
        session_id: &str,
    ) -> Result<(), StorageError>;

    /// Delete the session link for a conversation.
    ///
    /// Returns `true` when a row was deleted.
    async fn clear_session_link(&self, chat_id: i64, user_id: i64) -> Result<bool, StorageError>;

    /// Reverse index: every `(chat_id, user_id)` currently linked to the
    /// session. One session may fan out to multiple conversations.
    async fn find_recipients_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<(i64, i64)>, StorageError>;

    /// The model override for a session, if any.
    async fn get_session_model(&self, session_id: &str) -> Result<Option<String>, StorageError>;

    /// Upsert the model override for a session.
    async fn set_session_model(
        &self,
        session_id: &str,
        model_id: &str,
    ) -> Result<(), StorageError>;

    /// Delete the model override for a session.
    ///
    /// Returns `true` when a row was deleted.
    async fn clear_session_model(&self, session_id: &str) -> Result<bool, StorageError>;
}
