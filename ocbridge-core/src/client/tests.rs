use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::config::BackendConfig;

fn backend_config(server: &MockServer) -> BackendConfig {
    BackendConfig {
        server_url: server.uri(),
        username: None,
        password: None,
        timeout_ms: 5_000,
        cli_bin: "opencode".to_string(),
    }
}

async fn client_for(server: &MockServer) -> OpencodeClient {
    OpencodeClient::new(&backend_config(server)).unwrap()
}

// --- create_session ---

#[tokio::test]
async fn test_create_session_returns_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ses_ABC"})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert_eq!(client.create_session().await.unwrap(), "ses_ABC");
}

#[tokio::test]
async fn test_create_session_empty_id_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": ""})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert!(matches!(
        client.create_session().await,
        Err(BackendError::Invalid(_))
    ));
}

#[tokio::test]
async fn test_create_session_auth_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert!(matches!(
        client.create_session().await,
        Err(BackendError::Unauthorized(401))
    ));
}

#[tokio::test]
async fn test_basic_auth_header_sent() {
    let server = MockServer::start().await;
    // "user:pass" base64-encoded.
    Mock::given(method("POST"))
        .and(path("/session"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ses_1"})))
        .mount(&server)
        .await;

    let mut config = backend_config(&server);
    config.username = Some("user".to_string());
    config.password = Some("pass".to_string());
    let client = OpencodeClient::new(&config).unwrap();
    assert_eq!(client.create_session().await.unwrap(), "ses_1");
}

// --- run_prompt ---

#[tokio::test]
async fn test_run_prompt_existing_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session/ses_A/message"))
        .and(body_partial_json(json!({
            "parts": [{"type": "text", "text": "hi"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let sid = client.run_prompt("hi", Some("ses_A"), None).await.unwrap();
    assert_eq!(sid, "ses_A");
}

#[tokio::test]
async fn test_run_prompt_creates_session_when_missing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ses_NEW"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/session/ses_NEW/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let sid = client.run_prompt("hi", None, None).await.unwrap();
    assert_eq!(sid, "ses_NEW");
}

#[tokio::test]
async fn test_run_prompt_recovers_stale_session_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session/ses_OLD/message"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ses_NEW"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/session/ses_NEW/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let sid = client.run_prompt("hi", Some("ses_OLD"), None).await.unwrap();
    assert_eq!(sid, "ses_NEW");
}

#[tokio::test]
async fn test_run_prompt_includes_model_override() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session/ses_A/message"))
        .and(body_partial_json(json!({"model": "anthropic/claude-sonnet-4"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client
        .run_prompt("hi", Some("ses_A"), Some("anthropic/claude-sonnet-4"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_run_prompt_surfaces_backend_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session/ses_A/message"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    match client.run_prompt("hi", Some("ses_A"), None).await {
        Err(BackendError::Failed { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected Failed, got {:?}", other),
    }
}

// --- snapshots ---

#[test]
fn test_snapshot_counts_and_newest_text() {
    let messages = vec![
        json!({"role": "user", "text": "question"}),
        json!({"role": "Assistant", "parts": [{"type": "text", "text": "first answer"}]}),
        json!({"role": "user", "text": "followup"}),
        json!({"role": "assistant", "text": "  second answer  "}),
    ];
    let snapshot = snapshot_from_messages(&messages);
    assert_eq!(snapshot.count, 2);
    assert_eq!(snapshot.last, "second answer");
}

#[test]
fn test_snapshot_nested_info_role() {
    let messages = vec![json!({"info": {"role": "assistant"}, "parts": [{"text": "hola"}]})];
    let snapshot = snapshot_from_messages(&messages);
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.last, "hola");
}

#[test]
fn test_snapshot_falls_back_to_non_user_text() {
    let messages = vec![
        json!({"role": "user", "text": "question"}),
        json!({"role": "system", "text": "system note"}),
        json!({"role": "assistant", "parts": []}),
    ];
    let snapshot = snapshot_from_messages(&messages);
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.last, "system note");
}

#[test]
fn test_snapshot_empty() {
    let snapshot = snapshot_from_messages(&[]);
    assert_eq!(snapshot, AssistantSnapshot::default());
}

#[tokio::test]
async fn test_assistant_snapshot_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session/ses_1/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"role": "user", "text": "hi"},
            {"role": "assistant", "text": "hello"},
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let snapshot = client.assistant_snapshot("ses_1").await.unwrap();
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.last, "hello");
}

#[tokio::test]
async fn test_wait_for_assistant_message_returns_on_change() {
    let server = MockServer::start().await;
    // First poll: unchanged. Second poll: a new assistant message.
    Mock::given(method("GET"))
        .and(path("/session/ses_1/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"role": "assistant", "text": "old"},
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/session/ses_1/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"role": "assistant", "text": "old"},
            {"role": "assistant", "text": "new reply"},
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let previous = AssistantSnapshot {
        count: 1,
        last: "old".to_string(),
    };
    let cancel = CancellationToken::new();
    let text = client
        .wait_for_assistant_message("ses_1", &previous, Duration::from_millis(10), &cancel)
        .await
        .unwrap();
    assert_eq!(text, "new reply");
}

#[tokio::test]
async fn test_wait_for_assistant_message_honors_cancel() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session/ses_1/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let cancel = CancellationToken::new();
    let snapshot = AssistantSnapshot::default();
    let waiting = client.wait_for_assistant_message(
        "ses_1",
        &snapshot,
        Duration::from_millis(10),
        &cancel,
    );
    tokio::pin!(waiting);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(30)) => cancel.cancel(),
        _ = &mut waiting => panic!("wait must not complete on an unchanged snapshot"),
    }
    assert!(matches!(waiting.await, Err(BackendError::Canceled)));
}

// --- session state / status ---

#[tokio::test]
async fn test_session_state_lowercased() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ses_1": {"type": "Idle"},
            "ses_2": {"status": "BUSY", "attempt": 2},
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert_eq!(client.session_state("ses_1").await.unwrap(), "idle");
    assert_eq!(client.session_state("ses_2").await.unwrap(), "busy");
    assert_eq!(client.session_state("ses_9").await.unwrap(), "unknown");
}

#[tokio::test]
async fn test_status_combines_state_and_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ses_1": {"type": "idle"},
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/session/ses_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                {"role": "user", "text": "hi"},
                {"role": "assistant", "providerID": "anthropic", "modelID": "claude-sonnet-4"},
            ],
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let status = client.status("ses_1").await.unwrap();
    assert_eq!(status.session_id, "ses_1");
    assert_eq!(status.status, "idle");
    assert_eq!(status.model, "anthropic/claude-sonnet-4");
}

#[tokio::test]
async fn test_compact_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/command"))
        .and(body_partial_json(json!({"command": "compact", "arguments": []})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client.compact_session("ses_1").await.unwrap();
}

// --- session listing ---

#[tokio::test]
async fn test_list_sessions_endpoint_sorted_and_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "ses_old", "title": "old", "updated": 1000},
            {"id": "ses_new", "title": "new", "updated": 3000},
            {"id": "ses_mid", "title": "mid", "updated": 2000},
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let sessions = client
        .list_sessions("", 2, SessionsSource::Endpoint)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, "ses_new");
    assert_eq!(sessions[1].id, "ses_mid");
}

#[tokio::test]
async fn test_list_sessions_appends_missing_current() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "ses_a", "title": "a", "updated": 1000},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/session/ses_current"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(
            {"id": "ses_current", "title": "mine", "updated": 5000}
        )))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let sessions = client
        .list_sessions("ses_current", 5, SessionsSource::Endpoint)
        .await
        .unwrap();
    assert_eq!(sessions[0].id, "ses_current");
    assert!(sessions.iter().any(|s| s.id == "ses_a"));
}

#[tokio::test]
async fn test_list_sessions_falls_back_to_ungated_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "ses_a", "title": "a", "updated": 1000},
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let sessions = client
        .list_sessions("", 5, SessionsSource::Endpoint)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, "ses_a");
}

#[test]
fn test_summary_from_value_timestamp_shapes() {
    let nested = summary_from_value(&json!({
        "id": "ses_1", "title": "t", "time": {"updated": 1739714400000i64}
    }))
    .unwrap();
    assert_eq!(nested.updated_ms, 1739714400000);

    let seconds = summary_from_value(&json!({"id": "ses_2", "updated": 1739714400})).unwrap();
    assert_eq!(seconds.updated_ms, 1739714400000);

    let rfc = summary_from_value(&json!({
        "id": "ses_3", "updatedAt": "2025-02-16T14:00:00Z"
    }))
    .unwrap();
    assert_eq!(rfc.updated_ms, 1739714400000);

    assert!(summary_from_value(&json!({"title": "no id"})).is_none());
}

#[test]
fn test_parse_cli_session_line_with_date() {
    let line = "ses_Abc123   Fix the flaky test   6:03 PM · 2/17/2025";
    let summary = parse_cli_session_line(line).unwrap();
    assert_eq!(summary.id, "ses_Abc123");
    assert_eq!(summary.title, "Fix the flaky test");
    assert!(summary.updated_ms > 0);
}

#[test]
fn test_parse_cli_session_line_time_only() {
    let line = "ses_Abc123  Morning refactor  9:15 AM";
    let summary = parse_cli_session_line(line).unwrap();
    assert_eq!(summary.title, "Morning refactor");
    assert!(summary.updated_ms > 0);
}

#[test]
fn test_parse_cli_session_line_no_timestamp() {
    let summary = parse_cli_session_line("ses_Abc123 just a title").unwrap();
    assert_eq!(summary.title, "just a title");
    assert_eq!(summary.updated_ms, 0);
}

#[test]
fn test_parse_cli_session_line_rejects_headers() {
    assert!(parse_cli_session_line("ID  TITLE  UPDATED").is_none());
    assert!(parse_cli_session_line("").is_none());
    assert!(parse_cli_session_line("---  ---").is_none());
}

// --- favorite models ---

#[tokio::test]
async fn test_models_from_config_models_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"id": "anthropic/claude-sonnet-4", "name": "Sonnet", "favorite": true},
                {"id": "openai/gpt-4o", "name": "GPT-4o", "favorite": false},
            ],
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let models = client.list_favorite_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "anthropic/claude-sonnet-4");
    assert_eq!(models[0].name, "Sonnet");
    assert!(models[0].favorite);
}

#[tokio::test]
async fn test_models_from_favorite_models_strings() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "favoriteModels": ["anthropic/claude-sonnet-4", "openai/gpt-4o"],
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let models = client.list_favorite_models().await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "anthropic/claude-sonnet-4");
    assert_eq!(models[0].name, "anthropic/claude-sonnet-4");
}

#[tokio::test]
async fn test_models_fall_back_to_providers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/config/providers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "providers": [
                {
                    "id": "anthropic",
                    "models": [
                        {"id": "claude-sonnet-4", "favorite": true},
                        {"id": "claude-haiku-4", "favorite": false},
                    ],
                },
                {
                    "id": "openai",
                    "models": [
                        {"id": "openai/gpt-4o", "favorite": true},
                    ],
                },
            ],
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let models = client.list_favorite_models().await.unwrap();
    assert_eq!(models.len(), 2);
    // Unqualified ids get the provider prefix; qualified ids are kept.
    assert_eq!(models[0].id, "anthropic/claude-sonnet-4");
    assert_eq!(models[1].id, "openai/gpt-4o");
}

// --- event stream ---

#[tokio::test]
async fn test_stream_events_round_trip() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"type\":\"message.updated\",\"data\":{\"sessionID\":\"ses_1\",\"text\":\" hola \",\"final\":true}}\n\n",
        "data: not-json\n\n",
        "data: {\"type\":\"session.idle\",\"data\":{\"sessionID\":\"ses_1\"}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/event"))
        .and(header("accept", "text/event-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let cancel = CancellationToken::new();
    let stream = client.stream_events(cancel);
    tokio::pin!(stream);

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.event_type, "message.updated");
    assert_eq!(first.session_id, "ses_1");
    assert_eq!(first.text, "hola");
    assert!(first.is_final);

    // The unparseable payload is skipped, not surfaced.
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.event_type, "session.idle");
    assert!(second.text.is_empty());

    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_stream_events_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/event"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let stream = client.stream_events(CancellationToken::new());
    tokio::pin!(stream);

    assert!(matches!(
        stream.next().await,
        Some(Err(BackendError::Unauthorized(403)))
    ));
    assert!(stream.next().await.is_none());
}
