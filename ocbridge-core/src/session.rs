//! Session affinity: which backend session a conversation talks to.
//!
//! Resolves and persists the per-(chat, user) session link, applying the
//! configured default on first contact.

use std::sync::Arc;

use crate::store::{BridgeStore, StorageError};

/// Whether a string is a well-formed backend session id (`ses_` followed by
/// one or more ASCII alphanumerics).
pub fn is_valid_session_id(id: &str) -> bool {
    match id.strip_prefix("ses_") {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_alphanumeric()),
        None => false,
    }
}

/// Resolves and persists session links for conversations.
pub struct SessionService {
    store: Arc<dyn BridgeStore>,
    default_session_id: Option<String>,
}

impl SessionService {
    /// Create the service. `default_session_id` is applied write-through to
    /// conversations that have no persisted link yet.
    pub fn new(store: Arc<dyn BridgeStore>, default_session_id: Option<String>) -> Self {
        Self {
            store,
            default_session_id,
        }
    }

    /// The session linked to this conversation.
    ///
    /// When no link exists and a default is configured, the default is
    /// persisted for this conversation and returned: the first call writes
    /// through, subsequent calls are plain reads.
    pub async fn get_session(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<Option<String>, StorageError> {
        if let Some(existing) = self.store.get_session_link(chat_id, user_id).await? {
            return Ok(Some(existing));
        }
        match &self.default_session_id {
            Some(default) => {
                self.store
                    .set_session_link(chat_id, user_id, default)
                    .await?;
                Ok(Some(default.clone()))
            }
            None => Ok(None),
        }
    }

    /// Upsert the link for this conversation.
    pub async fn set_session(
        &self,
        chat_id: i64,
        user_id: i64,
        session_id: &str,
    ) -> Result<(), StorageError> {
        self.store
            .set_session_link(chat_id, user_id, session_id)
            .await
    }

    /// Delete the link for this conversation.
    pub async fn clear_session(&self, chat_id: i64, user_id: i64) -> Result<bool, StorageError> {
        self.store.clear_session_link(chat_id, user_id).await
    }

    /// The configured default session id, if any.
    pub fn default_session_id(&self) -> Option<&str> {
        self.default_session_id.as_deref()
    }
}
