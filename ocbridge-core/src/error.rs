//! Error taxonomy for the OpenCode backend.
//!
//! Every failure the backend client can produce collapses into the closed
//! [`BackendError`] set. The bridge dispatcher maps each kind to a fixed
//! user-facing reply; stale sessions are the only kind recovered
//! automatically (one retry with a fresh session).

use thiserror::Error;

/// Errors produced by the OpenCode backend client.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level failure: connection refused, DNS, broken pipe.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The per-call deadline elapsed before a response arrived.
    #[error("backend timeout")]
    Timeout,

    /// The backend rejected our credentials (HTTP 401/403).
    #[error("backend rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    /// A message POST hit a session the backend no longer knows (HTTP 404).
    #[error("stale session: {0}")]
    StaleSession(String),

    /// Any other >= 400 response.
    #[error("backend request failed: HTTP {status}: {body}")]
    Failed {
        /// HTTP status code of the failing response.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Malformed JSON or a response missing a required field.
    #[error("invalid backend response: {0}")]
    Invalid(String),

    /// The operation was canceled during shutdown.
    #[error("operation canceled")]
    Canceled,
}

impl BackendError {
    /// Classify a transport error from reqwest.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Invalid(err.to_string())
        } else {
            BackendError::Unreachable(err.to_string())
        }
    }

    /// Classify a non-success HTTP status with its response body.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => BackendError::Unauthorized(status),
            _ => BackendError::Failed { status, body },
        }
    }

    /// The fixed reply shown to the Telegram user for this error kind.
    ///
    /// Stale sessions are recovered inside the client and should never reach
    /// the user; if one does, it falls back to the generic reply.
    pub fn user_message(&self) -> &'static str {
        match self {
            BackendError::Unreachable(_) => {
                "OpenCode no esta disponible. Revisa OPENCODE_SERVER_URL y que el servidor este corriendo."
            }
            BackendError::Timeout => {
                "OpenCode no respondio a tiempo. Revisa OPENCODE_TIMEOUT_MS o la carga del servidor."
            }
            BackendError::Unauthorized(_) => {
                "OpenCode rechazo credenciales. Revisa OPENCODE_SERVER_USERNAME y OPENCODE_SERVER_PASSWORD."
            }
            BackendError::StaleSession(_)
            | BackendError::Failed { .. }
            | BackendError::Invalid(_)
            | BackendError::Canceled => "No se pudo enviar el mensaje a OpenCode.",
        }
    }
}
