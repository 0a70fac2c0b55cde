//! Typed client for the OpenCode HTTP API.
//!
//! Wraps session CRUD, prompt submission, status and snapshot queries, the
//! favorite-model discovery chain, and the session listing (endpoint, CLI or
//! both). The event stream lives in [`events`]. Two HTTP handles are held:
//! a bounded one whose per-call timeout comes from `OPENCODE_TIMEOUT_MS`,
//! and an unbounded one reserved for the `/event` stream.

pub mod events;

#[cfg(test)]
mod tests;

use std::time::Duration;

use reqwest::{Method, StatusCode, header};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::{BackendConfig, SessionsSource};
use crate::error::BackendError;
use crate::session::is_valid_session_id;
use crate::text::{extract_text, parse_timestamp};

/// Assistant-visible state of a session at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantSnapshot {
    /// Number of assistant-roled messages.
    pub count: usize,
    /// Text of the newest assistant message, trimmed.
    pub last: String,
}

/// One row of the `/sessions` listing.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Backend session id (`ses_...`).
    pub id: String,
    /// Human-readable title, possibly empty.
    pub title: String,
    /// Last-update instant in Unix milliseconds, 0 when unknown.
    pub updated_ms: i64,
}

/// A selectable model, as discovered from the backend configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Model identifier, `provider/model` qualified where needed.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether the backend marks it as a favorite.
    pub favorite: bool,
}

/// Combined `/status` answer for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// The session this status describes.
    pub session_id: String,
    /// Lowercased backend state, `"unknown"` when absent.
    pub status: String,
    /// `provider/model` label of the last assistant message, possibly empty.
    pub model: String,
}

/// HTTP client for the OpenCode server.
pub struct OpencodeClient {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    cli_bin: String,
}

impl OpencodeClient {
    /// Build the client from backend configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Invalid`] if an HTTP handle cannot be built.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| BackendError::Invalid(e.to_string()))?;
        // The event stream stays open indefinitely; only connect is bounded.
        let stream_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| BackendError::Invalid(e.to_string()))?;

        Ok(Self {
            http,
            stream_http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            cli_bin: config.cli_bin.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(header::ACCEPT, "application/json");
        if let Some(ref username) = self.username {
            req = req.basic_auth(username, self.password.as_deref());
        }
        req
    }

    pub(crate) fn stream_request(&self) -> reqwest::RequestBuilder {
        let mut req = self
            .stream_http
            .get(format!("{}/event", self.base_url))
            .header(header::ACCEPT, "text/event-stream");
        if let Some(ref username) = self.username {
            req = req.basic_auth(username, self.password.as_deref());
        }
        req
    }

    /// Check the status and parse the body as JSON.
    async fn parse_json(response: reqwest::Response) -> Result<Value, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| BackendError::Invalid(e.to_string()))
    }

    /// Create a fresh backend session and return its id.
    pub async fn create_session(&self) -> Result<String, BackendError> {
        let response = self
            .request(Method::POST, "/session")
            .send()
            .await
            .map_err(BackendError::from_transport)?;
        let value = Self::parse_json(response).await?;

        match value.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(BackendError::Invalid(
                "session create response has no id".to_string(),
            )),
        }
    }

    /// Submit a prompt, creating or replacing the session as needed, and
    /// return the session id the prompt actually landed in.
    ///
    /// An empty/absent `session_id` creates a session first. A 404 on the
    /// message POST means the backend dropped the session: one fresh session
    /// is created and the prompt retried once.
    pub async fn run_prompt(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, BackendError> {
        let sid = match session_id {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => self.create_session().await?,
        };

        match self.post_message(&sid, prompt, model).await {
            Ok(()) => Ok(sid),
            Err(BackendError::StaleSession(_)) => {
                tracing::info!(session_id = %sid, "backend lost session, retrying with a fresh one");
                let fresh = self.create_session().await?;
                self.post_message(&fresh, prompt, model).await?;
                Ok(fresh)
            }
            Err(e) => Err(e),
        }
    }

    async fn post_message(
        &self,
        session_id: &str,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<(), BackendError> {
        let mut body = json!({
            "parts": [{ "type": "text", "text": prompt }],
        });
        if let Some(model) = model {
            body["model"] = Value::String(model.to_string());
        }

        let response = self
            .request(Method::POST, &format!("/session/{}/message", session_id))
            .json(&body)
            .send()
            .await
            .map_err(BackendError::from_transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::StaleSession(session_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }
        Ok(())
    }

    /// Count and newest text of the session's assistant messages.
    pub async fn assistant_snapshot(
        &self,
        session_id: &str,
    ) -> Result<AssistantSnapshot, BackendError> {
        let response = self
            .request(Method::GET, &format!("/session/{}/message", session_id))
            .send()
            .await
            .map_err(BackendError::from_transport)?;
        let value = Self::parse_json(response).await?;

        let messages = value
            .as_array()
            .ok_or_else(|| BackendError::Invalid("message list is not an array".to_string()))?;
        Ok(snapshot_from_messages(messages))
    }

    /// Poll snapshots until a new assistant message shows up, then return its
    /// trimmed text. Honors cancellation between polls.
    pub async fn wait_for_assistant_message(
        &self,
        session_id: &str,
        previous: &AssistantSnapshot,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let previous_last = previous.last.trim();
        loop {
            if cancel.is_cancelled() {
                return Err(BackendError::Canceled);
            }

            let snapshot = self.assistant_snapshot(session_id).await?;
            let last = snapshot.last.trim();
            if snapshot.count > previous.count || last != previous_last {
                return Ok(last.to_string());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Canceled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Lowercased backend state of a session, `"unknown"` when the status
    /// map has no entry for it.
    pub async fn session_state(&self, session_id: &str) -> Result<String, BackendError> {
        let response = self
            .request(Method::GET, "/session/status")
            .send()
            .await
            .map_err(BackendError::from_transport)?;
        let value = Self::parse_json(response).await?;

        let state = value
            .get(session_id)
            .map(|entry| {
                ["type", "status", "state"]
                    .iter()
                    .find_map(|key| entry.get(key).and_then(Value::as_str))
                    .unwrap_or("unknown")
                    .to_lowercase()
            })
            .unwrap_or_else(|| "unknown".to_string());
        Ok(state)
    }

    /// Combined state + model label for `/status`.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, BackendError> {
        let status = self.session_state(session_id).await?;

        let model = match self
            .request(Method::GET, &format!("/session/{}", session_id))
            .send()
            .await
            .map_err(BackendError::from_transport)
        {
            Ok(response) => Self::parse_json(response)
                .await
                .map(|value| model_label(&value))
                .unwrap_or_default(),
            Err(_) => String::new(),
        };

        Ok(SessionStatus {
            session_id: session_id.to_string(),
            status,
            model,
        })
    }

    /// Ask the backend to compact the session's context.
    pub async fn compact_session(&self, session_id: &str) -> Result<(), BackendError> {
        let response = self
            .request(Method::POST, &format!("/session/{}/command", session_id))
            .json(&json!({ "command": "compact", "arguments": [] }))
            .send()
            .await
            .map_err(BackendError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }
        Ok(())
    }

    /// List sessions from the configured source, newest first, at most
    /// `limit` entries. `current` (when non-empty) is guaranteed a row.
    pub async fn list_sessions(
        &self,
        current: &str,
        limit: usize,
        source: SessionsSource,
    ) -> Result<Vec<SessionSummary>, BackendError> {
        let mut sessions: Vec<SessionSummary> = Vec::new();

        if matches!(source, SessionsSource::Endpoint | SessionsSource::Both) {
            match self.endpoint_sessions(limit).await {
                Ok(found) => sessions.extend(found),
                Err(e) if source == SessionsSource::Endpoint => return Err(e),
                Err(e) => tracing::warn!("endpoint session listing failed: {}", e),
            }
        }

        if matches!(source, SessionsSource::Cli | SessionsSource::Both) {
            match self.cli_sessions().await {
                Ok(found) => {
                    for summary in found {
                        if !sessions.iter().any(|s| s.id == summary.id) {
                            sessions.push(summary);
                        }
                    }
                }
                Err(e) if source == SessionsSource::Cli => return Err(e),
                Err(e) => tracing::warn!("cli session listing failed: {}", e),
            }
        }

        if !current.is_empty() && !sessions.iter().any(|s| s.id == current) {
            sessions.push(self.fetch_session_summary(current).await);
        }

        // Stable sort keeps the endpoint-before-CLI order on equal stamps.
        sessions.sort_by(|a, b| b.updated_ms.cmp(&a.updated_ms));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn endpoint_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>, BackendError> {
        let limited = self
            .request(Method::GET, &format!("/session?limit={}", limit))
            .send()
            .await
            .map_err(BackendError::from_transport);
        let value = match limited {
            Ok(response) => Self::parse_json(response).await,
            Err(e) => Err(e),
        };

        // Some backend builds reject the limit parameter; retry ungated.
        let value = match value {
            Ok(v) => v,
            Err(_) => {
                let response = self
                    .request(Method::GET, "/session")
                    .send()
                    .await
                    .map_err(BackendError::from_transport)?;
                Self::parse_json(response).await?
            }
        };

        let entries = value
            .as_array()
            .ok_or_else(|| BackendError::Invalid("session list is not an array".to_string()))?;
        Ok(entries.iter().filter_map(summary_from_value).collect())
    }

    async fn cli_sessions(&self) -> Result<Vec<SessionSummary>, BackendError> {
        let output = tokio::process::Command::new(&self.cli_bin)
            .args(["session", "list"])
            .output()
            .await
            .map_err(|e| BackendError::Unreachable(format!("{}: {}", self.cli_bin, e)))?;

        if !output.status.success() {
            return Err(BackendError::Failed {
                status: output.status.code().unwrap_or(-1).max(0) as u16,
                body: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(parse_cli_session_line).collect())
    }

    async fn fetch_session_summary(&self, session_id: &str) -> SessionSummary {
        let fetched = match self
            .request(Method::GET, &format!("/session/{}", session_id))
            .send()
            .await
        {
            Ok(response) => Self::parse_json(response).await.ok(),
            Err(_) => None,
        };

        fetched
            .as_ref()
            .and_then(summary_from_value)
            .unwrap_or_else(|| SessionSummary {
                id: session_id.to_string(),
                title: String::new(),
                updated_ms: 0,
            })
    }

    /// Discover selectable models, favorites first-class.
    ///
    /// Probes `/config` for a `models[]` array with `favorite:true` entries,
    /// then for a `favoriteModels[]` string list, then falls back to walking
    /// `/config/providers`.
    pub async fn list_favorite_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        if let Some(config) = self.fetch_json("/config").await {
            if let Some(models) = config.get("models").and_then(Value::as_array) {
                let favorites: Vec<ModelInfo> = models
                    .iter()
                    .filter(|m| is_favorite(m))
                    .filter_map(model_from_value)
                    .collect();
                if !favorites.is_empty() {
                    return Ok(favorites);
                }
            }
            if let Some(names) = config.get("favoriteModels").and_then(Value::as_array) {
                let favorites: Vec<ModelInfo> = names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|name| ModelInfo {
                        id: name.to_string(),
                        name: name.to_string(),
                        favorite: true,
                    })
                    .collect();
                if !favorites.is_empty() {
                    return Ok(favorites);
                }
            }
        }

        let providers = self
            .fetch_json("/config/providers")
            .await
            .ok_or_else(|| BackendError::Invalid("no model configuration available".to_string()))?;
        Ok(provider_favorites(&providers))
    }

    async fn fetch_json(&self, path: &str) -> Option<Value> {
        let response = self.request(Method::GET, path).send().await.ok()?;
        Self::parse_json(response).await.ok()
    }
}

/// Lowercased role of a message object (`role` or `info.role`).
fn role_of(message: &Value) -> String {
    message
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .get("info")
                .and_then(|info| info.get("role"))
                .and_then(Value::as_str)
        })
        .unwrap_or("")
        .to_lowercase()
}

/// Walk a message array (oldest first) into an [`AssistantSnapshot`].
pub(crate) fn snapshot_from_messages(messages: &[Value]) -> AssistantSnapshot {
    let mut count = 0;
    let mut last = String::new();
    let mut fallback = String::new();

    for message in messages.iter().rev() {
        let role = role_of(message);
        if role.contains("assistant") {
            count += 1;
            if last.is_empty() {
                let text = extract_text(message);
                if !text.trim().is_empty() {
                    last = text.trim().to_string();
                }
            }
        } else if !role.contains("user") && fallback.is_empty() {
            let text = extract_text(message);
            if !text.trim().is_empty() {
                fallback = text.trim().to_string();
            }
        }
    }

    if last.is_empty() {
        last = fallback;
    }
    AssistantSnapshot { count, last }
}

/// `provider/model` of the newest assistant message carrying one.
fn model_label(value: &Value) -> String {
    let empty = Vec::new();
    let messages = value
        .get("messages")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())
        .unwrap_or(&empty);

    for message in messages.iter().rev() {
        if !role_of(message).contains("assistant") {
            continue;
        }
        if let Some(label) = provider_model_of(message) {
            return label;
        }
    }
    String::new()
}

fn provider_model_of(message: &Value) -> Option<String> {
    let candidates = [
        Some(message),
        message.get("info"),
        message.get("model"),
        message.get("info").and_then(|info| info.get("model")),
    ];
    for candidate in candidates.into_iter().flatten() {
        let provider = candidate
            .get("providerID")
            .or_else(|| candidate.get("providerId"))
            .and_then(Value::as_str);
        let model = candidate
            .get("modelID")
            .or_else(|| candidate.get("modelId"))
            .and_then(Value::as_str);
        if let (Some(provider), Some(model)) = (provider, model) {
            return Some(format!("{}/{}", provider, model));
        }
    }
    None
}

/// Build a summary from one endpoint session object.
fn summary_from_value(value: &Value) -> Option<SessionSummary> {
    let id = value.get("id").and_then(Value::as_str)?;
    if id.is_empty() {
        return None;
    }

    let title = value
        .get("title")
        .or_else(|| value.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let updated = value
        .get("updated")
        .or_else(|| value.get("updatedAt"))
        .or_else(|| value.get("time").and_then(|t| t.get("updated")));
    let updated_ms = match updated {
        Some(Value::String(s)) => parse_timestamp(s),
        Some(Value::Number(n)) => parse_timestamp(&n.to_string()),
        _ => 0,
    };

    Some(SessionSummary {
        id: id.to_string(),
        title,
        updated_ms,
    })
}

/// Parse one line of `opencode session list` tabular output.
///
/// The first column is the session id; a trailing `H:MM AM|PM` clock,
/// optionally followed by ` · M/D/YYYY`, is the update stamp; everything in
/// between is the title. Lines whose first column is not a session id
/// (headers, separators) yield `None`.
pub(crate) fn parse_cli_session_line(line: &str) -> Option<SessionSummary> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (&id, rest) = tokens.split_first()?;
    if !is_valid_session_id(id) {
        return None;
    }

    let mut title_end = rest.len();
    let mut updated_ms = 0;

    if rest.len() >= 4 && rest[rest.len() - 2] == "·" {
        let stamp = format!(
            "{} {} · {}",
            rest[rest.len() - 4],
            rest[rest.len() - 3],
            rest[rest.len() - 1]
        );
        let ms = parse_timestamp(&stamp);
        if ms > 0 {
            updated_ms = ms;
            title_end = rest.len() - 4;
        }
    }
    if updated_ms == 0 && rest.len() >= 2 {
        let stamp = format!("{} {}", rest[rest.len() - 2], rest[rest.len() - 1]);
        let ms = parse_timestamp(&stamp);
        if ms > 0 {
            updated_ms = ms;
            title_end = rest.len() - 2;
        }
    }

    Some(SessionSummary {
        id: id.to_string(),
        title: rest[..title_end].join(" "),
        updated_ms,
    })
}

fn is_favorite(value: &Value) -> bool {
    value.get("favorite").and_then(Value::as_bool) == Some(true)
}

fn model_from_value(value: &Value) -> Option<ModelInfo> {
    let id = value
        .get("id")
        .or_else(|| value.get("name"))
        .and_then(Value::as_str)?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(id);
    Some(ModelInfo {
        id: id.to_string(),
        name: name.to_string(),
        favorite: is_favorite(value),
    })
}

/// Collect favorite models across the `/config/providers` answer, id-prefixed
/// with the provider unless already qualified.
fn provider_favorites(value: &Value) -> Vec<ModelInfo> {
    let empty = Vec::new();
    let providers = value
        .get("providers")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())
        .unwrap_or(&empty);

    let mut favorites = Vec::new();
    for provider in providers {
        let provider_id = provider
            .get("id")
            .or_else(|| provider.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let models: Vec<&Value> = match provider.get("models") {
            Some(Value::Array(list)) => list.iter().collect(),
            Some(Value::Object(map)) => map.values().collect(),
            _ => Vec::new(),
        };

        for model in models {
            if !is_favorite(model) {
                continue;
            }
            let Some(mut info) = model_from_value(model) else {
                continue;
            };
            if !info.id.contains('/') && !provider_id.is_empty() {
                info.id = format!("{}/{}", provider_id, info.id);
            }
            favorites.push(info);
        }
    }
    favorites
}
