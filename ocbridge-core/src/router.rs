//! Prompt routing: reconciling a conversation's session with the backend.
//!
//! [`PromptRouter::route`] runs the serialized heart of a prompt: resolve the
//! linked session, capture a pre-prompt snapshot, apply any model override,
//! submit the prompt, and persist whatever session id the backend actually
//! used, before the caller acknowledges anything to the user.

use std::sync::Arc;

use thiserror::Error;

use crate::client::{AssistantSnapshot, OpencodeClient};
use crate::error::BackendError;
use crate::session::SessionService;
use crate::store::{BridgeStore, StorageError};

/// Failure of a routed prompt.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The backend rejected or never received the prompt.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The repository failed while resolving or persisting state.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RouteError {
    /// The fixed reply shown to the Telegram user for this failure.
    pub fn user_message(&self) -> &'static str {
        match self {
            RouteError::Backend(e) => e.user_message(),
            RouteError::Storage(_) => "No se pudo enviar el mensaje a OpenCode.",
        }
    }
}

/// Result of a successfully routed prompt.
#[derive(Debug, Clone)]
pub struct RoutedPrompt {
    /// The session the prompt landed in, already persisted for this
    /// conversation.
    pub session_id: String,
    /// Snapshot taken before the prompt was submitted; the reply waiter
    /// compares against it.
    pub previous: AssistantSnapshot,
}

/// Serialized prompt-routing logic shared by the dispatcher.
pub struct PromptRouter {
    client: Arc<OpencodeClient>,
    sessions: Arc<SessionService>,
    store: Arc<dyn BridgeStore>,
}

impl PromptRouter {
    /// Create the router.
    pub fn new(
        client: Arc<OpencodeClient>,
        sessions: Arc<SessionService>,
        store: Arc<dyn BridgeStore>,
    ) -> Self {
        Self {
            client,
            sessions,
            store,
        }
    }

    /// Route one prompt for a conversation. Must be called under the
    /// conversation's serializer lane.
    ///
    /// # Errors
    ///
    /// Backend failures other than a stale session (which the client already
    /// recovers) propagate unchanged; nothing is retried here.
    pub async fn route(
        &self,
        chat_id: i64,
        user_id: i64,
        prompt: &str,
    ) -> Result<RoutedPrompt, RouteError> {
        let linked = self.sessions.get_session(chat_id, user_id).await?;

        // Best effort: a failed snapshot only means the waiter starts from
        // an empty baseline.
        let previous = match linked.as_deref() {
            Some(sid) => self
                .client
                .assistant_snapshot(sid)
                .await
                .unwrap_or_default(),
            None => AssistantSnapshot::default(),
        };

        let model = match linked.as_deref() {
            Some(sid) => self.store.get_session_model(sid).await?,
            None => None,
        };

        let effective = self
            .client
            .run_prompt(prompt, linked.as_deref(), model.as_deref())
            .await?;

        if linked.as_deref() != Some(effective.as_str()) {
            self.sessions
                .set_session(chat_id, user_id, &effective)
                .await?;
            // Carry the override over to the replacement session.
            if let (Some(old), Some(model)) = (linked.as_deref(), model.as_deref()) {
                self.store.set_session_model(&effective, model).await?;
                self.store.clear_session_model(old).await?;
            }
        }

        Ok(RoutedPrompt {
            session_id: effective,
            previous,
        })
    }
}
