use std::sync::Mutex;
use std::time::Duration;

use futures::stream;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::client::events::RelayEvent;
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::store::MemoryStore;

/// Records every delivery; optionally fails for a chosen chat.
#[derive(Default)]
struct MockOutbound {
    sends: Mutex<Vec<(i64, String)>>,
    fail_chat: Option<i64>,
}

#[async_trait]
impl RelayOutbound for MockOutbound {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<(), OutboundError> {
        if self.fail_chat == Some(chat_id) {
            return Err("telegram said no".into());
        }
        self.sends.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

fn updated(session_id: &str, text: &str, is_final: bool) -> Result<RelayEvent, BackendError> {
    Ok(RelayEvent {
        event_type: "message.updated".to_string(),
        session_id: session_id.to_string(),
        text: text.to_string(),
        is_final,
    })
}

fn idle(session_id: &str) -> Result<RelayEvent, BackendError> {
    Ok(RelayEvent {
        event_type: "session.idle".to_string(),
        session_id: session_id.to_string(),
        text: String::new(),
        is_final: false,
    })
}

fn relay_config(mode: RelayMode, fallback: bool, delay_ms: u64) -> RelayConfig {
    RelayConfig {
        mode,
        fallback,
        fallback_delay_ms: delay_ms,
        sse_enabled: true,
    }
}

/// Client pointing at a closed port, for tests that must not fetch anything.
fn offline_client() -> Arc<OpencodeClient> {
    Arc::new(
        OpencodeClient::new(&BackendConfig {
            server_url: "http://127.0.0.1:9".to_string(),
            username: None,
            password: None,
            timeout_ms: 200,
            cli_bin: "opencode".to_string(),
        })
        .unwrap(),
    )
}

struct Fixture {
    engine: RelayEngine,
    outbound: Arc<MockOutbound>,
    store: Arc<MemoryStore>,
}

async fn fixture(client: Arc<OpencodeClient>, config: RelayConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let outbound = Arc::new(MockOutbound::default());
    let engine = RelayEngine::new(client, store.clone(), outbound.clone(), config);
    Fixture {
        engine,
        outbound,
        store,
    }
}

#[tokio::test]
async fn test_last_mode_dispatches_cached_text_once() {
    let f = fixture(offline_client(), relay_config(RelayMode::Last, true, 3000)).await;
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![updated("ses_1", "draft", false), idle("ses_1")]);
    f.engine.process(events, &CancellationToken::new()).await;

    assert_eq!(
        *f.outbound.sends.lock().unwrap(),
        vec![(10, "draft".to_string())]
    );
    assert_eq!(f.engine.cached_sessions(), 0);
}

#[tokio::test]
async fn test_last_mode_later_update_overwrites() {
    let f = fixture(offline_client(), relay_config(RelayMode::Last, true, 3000)).await;
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![
        updated("ses_1", "first", true),
        updated("ses_1", "second", false),
        idle("ses_1"),
    ]);
    f.engine.process(events, &CancellationToken::new()).await;

    assert_eq!(
        *f.outbound.sends.lock().unwrap(),
        vec![(10, "second".to_string())]
    );
}

#[tokio::test]
async fn test_last_mode_fetches_when_cache_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session/ses_1/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"role": "assistant", "text": "fetched reply"},
        ])))
        .mount(&server)
        .await;
    let client = Arc::new(
        OpencodeClient::new(&BackendConfig {
            server_url: server.uri(),
            username: None,
            password: None,
            timeout_ms: 5_000,
            cli_bin: "opencode".to_string(),
        })
        .unwrap(),
    );

    let f = fixture(client, relay_config(RelayMode::Last, true, 3000)).await;
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![idle("ses_1")]);
    f.engine.process(events, &CancellationToken::new()).await;

    assert_eq!(
        *f.outbound.sends.lock().unwrap(),
        vec![(10, "fetched reply".to_string())]
    );
}

#[tokio::test]
async fn test_final_mode_immediate_on_final_entry() {
    // Long fallback delay: a final entry must not wait for it.
    let f = fixture(offline_client(), relay_config(RelayMode::Final, true, 5000)).await;
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![updated("ses_1", "final text", true), idle("ses_1")]);
    tokio::time::timeout(
        Duration::from_secs(1),
        f.engine.process(events, &CancellationToken::new()),
    )
    .await
    .expect("final entry must dispatch without the fallback wait");

    assert_eq!(
        *f.outbound.sends.lock().unwrap(),
        vec![(10, "final text".to_string())]
    );
    assert_eq!(f.engine.cached_sessions(), 0);
}

#[tokio::test]
async fn test_final_mode_fallback_dispatches_draft_after_delay() {
    let f = fixture(offline_client(), relay_config(RelayMode::Final, true, 10)).await;
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![updated("ses_1", "draft", false), idle("ses_1")]);
    f.engine.process(events, &CancellationToken::new()).await;

    assert_eq!(
        *f.outbound.sends.lock().unwrap(),
        vec![(10, "draft".to_string())]
    );
}

#[tokio::test]
async fn test_final_mode_without_fallback_drops_draft() {
    let f = fixture(offline_client(), relay_config(RelayMode::Final, false, 10)).await;
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![updated("ses_1", "draft", false), idle("ses_1")]);
    f.engine.process(events, &CancellationToken::new()).await;

    assert!(f.outbound.sends.lock().unwrap().is_empty());
    assert_eq!(f.engine.cached_sessions(), 0);
}

#[tokio::test]
async fn test_dispatch_fans_out_to_all_linked_chats_once() {
    let f = fixture(offline_client(), relay_config(RelayMode::Last, true, 3000)).await;
    // Two users in chat 10 share the session; chat 11 is linked as well.
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();
    f.store.set_session_link(10, 21, "ses_1").await.unwrap();
    f.store.set_session_link(11, 30, "ses_1").await.unwrap();
    f.store.set_session_link(12, 40, "ses_other").await.unwrap();

    let events = stream::iter(vec![updated("ses_1", "hola", false), idle("ses_1")]);
    f.engine.process(events, &CancellationToken::new()).await;

    let sends = f.outbound.sends.lock().unwrap();
    assert_eq!(
        *sends,
        vec![(10, "hola".to_string()), (11, "hola".to_string())]
    );
}

#[tokio::test]
async fn test_delivery_failure_still_consumes_cache() {
    let store = Arc::new(MemoryStore::new());
    let outbound = Arc::new(MockOutbound {
        sends: Mutex::new(Vec::new()),
        fail_chat: Some(10),
    });
    let engine = RelayEngine::new(
        offline_client(),
        store.clone(),
        outbound.clone(),
        relay_config(RelayMode::Last, true, 3000),
    );
    store.set_session_link(10, 20, "ses_1").await.unwrap();
    store.set_session_link(11, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![updated("ses_1", "hola", false), idle("ses_1")]);
    engine.process(events, &CancellationToken::new()).await;

    // Chat 10 failed; chat 11 was still served and the entry is gone.
    assert_eq!(
        *outbound.sends.lock().unwrap(),
        vec![(11, "hola".to_string())]
    );
    assert_eq!(engine.cached_sessions(), 0);
}

#[tokio::test]
async fn test_unrelated_events_ignored() {
    let f = fixture(offline_client(), relay_config(RelayMode::Last, true, 3000)).await;
    f.store.set_session_link(10, 20, "ses_1").await.unwrap();

    let events = stream::iter(vec![
        Ok(RelayEvent {
            event_type: "storage.write".to_string(),
            session_id: "ses_1".to_string(),
            text: "noise".to_string(),
            is_final: false,
        }),
        // Empty text never enters the cache.
        updated("ses_1", "", false),
        Err(BackendError::Unreachable("blip".to_string())),
    ]);
    f.engine.process(events, &CancellationToken::new()).await;

    assert!(f.outbound.sends.lock().unwrap().is_empty());
    assert_eq!(f.engine.cached_sessions(), 0);
}

#[tokio::test]
async fn test_process_stops_on_cancellation() {
    let f = fixture(offline_client(), relay_config(RelayMode::Last, true, 3000)).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    // An endless stream: only cancellation can end processing.
    let events = stream::unfold((), |()| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some((idle("ses_1"), ()))
    });

    tokio::time::timeout(Duration::from_secs(1), f.engine.process(events, &cancel))
        .await
        .expect("cancellation must stop the relay loop");
}
