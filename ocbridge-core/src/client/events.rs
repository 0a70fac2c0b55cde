//! Server-sent-events stream from the backend's `/event` endpoint.
//!
//! Each SSE data payload is a single JSON object describing a session event.
//! Parsing is tolerant of the backend's key variants: the event type may be
//! under `type`, `event` or `name`; the session id may sit at the top level
//! or nested in `data`; text follows the same extraction rule as message
//! snapshots.

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::OpencodeClient;
use crate::error::BackendError;
use crate::text::extract_text;

/// One event from the backend stream, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    /// Event type, e.g. `message.updated` or `session.idle`.
    pub event_type: String,
    /// Session the event belongs to, possibly empty.
    pub session_id: String,
    /// Assistant text carried by the event, trimmed, possibly empty.
    pub text: String,
    /// Whether the backend marks this text as the turn's terminal output.
    pub is_final: bool,
}

impl OpencodeClient {
    /// Open the `/event` stream and yield normalized events.
    ///
    /// The stream closes cleanly on cancellation or EOF. A transport error
    /// while the token is still live is yielded once, then the stream closes;
    /// the caller decides whether to reopen.
    pub fn stream_events(
        &self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<RelayEvent, BackendError>> + Send + use<> {
        let request = self.stream_request();

        async_stream::stream! {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        yield Err(BackendError::from_transport(e));
                    }
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield Err(BackendError::from_status(status.as_u16(), body));
                return;
            }

            let mut sse = response.bytes_stream().eventsource();
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = sse.next() => item,
                };
                match item {
                    None => return,
                    Some(Ok(event)) => {
                        if let Some(parsed) = parse_relay_event(&event.data) {
                            yield Ok(parsed);
                        }
                    }
                    Some(Err(e)) => {
                        if !cancel.is_cancelled() {
                            yield Err(BackendError::Unreachable(e.to_string()));
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Parse one SSE data payload into a [`RelayEvent`].
///
/// Payloads that are not a JSON object are dropped silently; the stream
/// carries heartbeats and unrelated noise.
pub(crate) fn parse_relay_event(data: &str) -> Option<RelayEvent> {
    let value: Value = serde_json::from_str(data).ok()?;
    if !value.is_object() {
        return None;
    }

    let event_type = ["type", "event", "name"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .unwrap_or("")
        .to_string();

    let payload = value.get("data").filter(|d| d.is_object());

    // A bare top-level `id` is the event's own id more often than a session
    // id, so the nested payload is consulted before falling back to it.
    let session_id = find_str(&value, &["sessionID", "sessionId", "session"])
        .or_else(|| payload.and_then(|d| find_str(d, &["sessionID", "sessionId", "session", "id"])))
        .or_else(|| find_str(&value, &["id"]))
        .unwrap_or_default();

    let text = match payload {
        Some(data) => {
            let text = extract_text(data);
            if text.trim().is_empty() {
                extract_text(&value)
            } else {
                text
            }
        }
        None => extract_text(&value),
    };

    let flags = payload.unwrap_or(&value);
    let is_final = flags.get("final").and_then(Value::as_bool) == Some(true)
        || flags.get("isFinal").and_then(Value::as_bool) == Some(true)
        || matches!(
            flags.get("status").and_then(Value::as_str),
            Some("final") | Some("completed")
        );

    Some(RelayEvent {
        event_type,
        session_id,
        text: text.trim().to_string(),
        is_final,
    })
}

fn find_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
