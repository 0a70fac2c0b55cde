//! Streaming relay: backend events in, Telegram sends out.
//!
//! The engine consumes the backend event stream, caches the latest assistant
//! text per session, and on `session.idle` dispatches to every chat linked
//! to that session. Delivery is at-most-once per idle event: the cache entry
//! is consumed no matter how dispatch goes. The cache lock is never held
//! across I/O.

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::OpencodeClient;
use crate::client::events::RelayEvent;
use crate::config::{RelayConfig, RelayMode};
use crate::store::BridgeStore;

/// Delay before reopening the event stream after it drops.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Boxed error from an outbound delivery attempt.
pub type OutboundError = Box<dyn std::error::Error + Send + Sync>;

/// Sink for relay dispatches; the Telegram side implements this.
#[async_trait]
pub trait RelayOutbound: Send + Sync {
    /// Deliver assistant text to a chat. Best effort; the relay logs and
    /// moves on when this fails.
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<(), OutboundError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    text: String,
    is_final: bool,
    updated: Instant,
}

/// The streaming relay engine.
pub struct RelayEngine {
    client: Arc<OpencodeClient>,
    store: Arc<dyn BridgeStore>,
    outbound: Arc<dyn RelayOutbound>,
    config: RelayConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl RelayEngine {
    /// Create the engine.
    pub fn new(
        client: Arc<OpencodeClient>,
        store: Arc<dyn BridgeStore>,
        outbound: Arc<dyn RelayOutbound>,
        config: RelayConfig,
    ) -> Self {
        Self {
            client,
            store,
            outbound,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Consume the backend event stream until the token cancels, reopening
    /// the stream after transport drops.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let stream = self.client.stream_events(cancel.clone());
            self.process(stream, &cancel).await;

            if cancel.is_cancelled() {
                tracing::info!("relay stream stopped");
                return;
            }
            tracing::warn!("event stream closed, reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
            }
        }
    }

    /// Drain one event stream. Exposed separately so tests can feed events
    /// directly.
    pub async fn process<S>(&self, events: S, cancel: &CancellationToken)
    where
        S: Stream<Item = Result<RelayEvent, crate::error::BackendError>> + Send,
    {
        tokio::pin!(events);
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = events.next() => item,
            };
            match item {
                None => return,
                Some(Ok(event)) => self.handle_event(event, cancel).await,
                Some(Err(e)) => tracing::warn!("event stream error: {}", e),
            }
        }
    }

    async fn handle_event(&self, event: RelayEvent, cancel: &CancellationToken) {
        if event.session_id.is_empty() {
            return;
        }
        match event.event_type.as_str() {
            "message.updated" => {
                if event.text.is_empty() {
                    return;
                }
                // Last writer wins; a final entry may be overwritten by a
                // later draft, consumption happens on idle.
                let mut cache = self.cache.write().unwrap();
                cache.insert(
                    event.session_id,
                    CacheEntry {
                        text: event.text,
                        is_final: event.is_final,
                        updated: Instant::now(),
                    },
                );
            }
            "session.idle" => self.on_idle(&event.session_id, cancel).await,
            _ => {}
        }
    }

    async fn on_idle(&self, session_id: &str, cancel: &CancellationToken) {
        match self.config.mode {
            RelayMode::Last => {
                let cached = self.take_cached(session_id);
                let text = match cached {
                    Some(entry) if !entry.text.is_empty() => entry.text,
                    _ => self.fetch_last_text(session_id).await,
                };
                if !text.is_empty() {
                    self.dispatch(session_id, &text).await;
                }
            }
            RelayMode::Final => {
                let final_text = {
                    let cache = self.cache.read().unwrap();
                    cache
                        .get(session_id)
                        .filter(|entry| entry.is_final && !entry.text.is_empty())
                        .map(|entry| entry.text.clone())
                };

                if let Some(text) = final_text {
                    self.take_cached(session_id);
                    self.dispatch(session_id, &text).await;
                    return;
                }

                if !self.config.fallback {
                    // Silent drop; the entry is still consumed so it cannot
                    // leak into a later idle.
                    self.take_cached(session_id);
                    return;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(self.config.fallback_delay_ms)) => {}
                }

                // A final message may have landed during the wait.
                let cached = self.take_cached(session_id);
                let text = match cached {
                    Some(entry) if !entry.text.is_empty() => entry.text,
                    _ => self.fetch_last_text(session_id).await,
                };
                if !text.is_empty() {
                    self.dispatch(session_id, &text).await;
                }
            }
        }
    }

    fn take_cached(&self, session_id: &str) -> Option<CacheEntry> {
        let entry = self.cache.write().unwrap().remove(session_id);
        if let Some(ref entry) = entry {
            tracing::debug!(
                session_id,
                is_final = entry.is_final,
                age_ms = entry.updated.elapsed().as_millis() as u64,
                "cache entry consumed"
            );
        }
        entry
    }

    async fn fetch_last_text(&self, session_id: &str) -> String {
        match self.client.assistant_snapshot(session_id).await {
            Ok(snapshot) => snapshot.last,
            Err(e) => {
                tracing::warn!(session_id, "failed to fetch assistant text: {}", e);
                String::new()
            }
        }
    }

    /// Send `text` once to every chat linked to the session.
    async fn dispatch(&self, session_id: &str, text: &str) {
        let recipients = match self.store.find_recipients_by_session(session_id).await {
            Ok(recipients) => recipients,
            Err(e) => {
                tracing::error!(session_id, "recipient lookup failed: {}", e);
                return;
            }
        };
        if recipients.is_empty() {
            tracing::debug!(session_id, "idle session has no linked chats");
            return;
        }

        // One session can be linked by several users of the same chat; the
        // chat still gets the text once.
        let chats: BTreeSet<i64> = recipients.into_iter().map(|(chat_id, _)| chat_id).collect();
        for chat_id in chats {
            if let Err(e) = self.outbound.deliver(chat_id, text).await {
                tracing::warn!(chat_id, session_id, "relay delivery failed: {}", e);
            }
        }
    }

    #[cfg(test)]
    fn cached_sessions(&self) -> usize {
        self.cache.read().unwrap().len()
    }
}
