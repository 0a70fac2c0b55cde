//! Telegram message handling: authorization, serialized prompt forwarding,
//! and the synchronous reply waiter used when the event stream is disabled.

use std::sync::Arc;
use std::time::Duration;

use ocbridge_core::client::AssistantSnapshot;
use ocbridge_core::{
    Authorizer, BackendError, BridgeStore, Config, KeyedSerializer, OpencodeClient, PromptRouter,
    RouteError, SessionService,
};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, Message as TgMessage};
use teloxide::utils::command::BotCommands;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::format::chunk_message;

/// Reply for users outside the allowed set.
pub const NO_AUTORIZADO: &str = "No autorizado. Pide acceso al admin con tu userId.";

/// Acknowledgement sent once a prompt reached the backend.
pub const PROCESANDO: &str = "Procesando solicitud…";

/// Informational reply when the backend produced no new text.
pub const SIN_RESPUESTA: &str =
    "OpenCode no devolvio texto nuevo. Usa /status para revisar la sesion.";

/// Hint shown when a command needs an active session.
pub const SIN_SESION: &str = "No hay sesion activa. Envia un mensaje para crear una.";

/// How often the waiter re-reads the assistant snapshot and session state.
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How often the waiter refreshes the typing indicator.
const TYPING_PING_INTERVAL: Duration = Duration::from_secs(4);

/// Hard ceiling on one synchronous reply wait.
const REPLY_DEADLINE: Duration = Duration::from_secs(300);

/// States meaning the session finished its turn.
const IDLE_STATES: &[&str] = &["idle", "completed", "done", "ready"];

/// Substrings marking a failed turn.
const ERROR_MARKERS: &[&str] = &["error", "failed", "abort"];

/// Shared handler dependencies, injected into the dispatcher tree as one Arc.
pub struct BridgeDeps {
    pub config: Arc<Config>,
    pub client: Arc<OpencodeClient>,
    pub authz: Arc<Authorizer>,
    pub sessions: Arc<SessionService>,
    pub store: Arc<dyn BridgeStore>,
    pub router: Arc<PromptRouter>,
    pub serializer: Arc<KeyedSerializer>,
    pub cancel: CancellationToken,
}

/// Handle a plain text message (the prompt path).
///
/// Unknown slash commands fall through to here and get the supported-command
/// list. Prompts from the same conversation run strictly one at a time.
pub async fn handle_message(
    bot: Bot,
    msg: TgMessage,
    deps: Arc<BridgeDeps>,
) -> ResponseResult<()> {
    let Some(user_id) = msg.from.as_ref().map(|u| u.id.0 as i64) else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    let text = match msg.text().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => return Ok(()),
    };

    // Commands are routed before this handler; anything slash-prefixed left
    // over is unknown.
    if text.starts_with('/') {
        bot.send_message(
            msg.chat.id,
            crate::commands::Command::descriptions().to_string(),
        )
        .await?;
        return Ok(());
    }

    if !check_allowed(&deps.authz, user_id).await {
        bot.send_message(msg.chat.id, NO_AUTORIZADO).await?;
        return Ok(());
    }

    let key = format!("{}:{}", chat_id, user_id);
    match deps
        .serializer
        .run(&key, &deps.cancel, handle_prompt(&bot, &deps, chat_id, user_id, &text))
        .await
    {
        Ok(result) => result,
        Err(_) => {
            tracing::info!(chat_id, user_id, "queued prompt dropped during shutdown");
            Ok(())
        }
    }
}

/// One serialized prompt cycle: route, acknowledge, await, reply.
async fn handle_prompt(
    bot: &Bot,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
    prompt: &str,
) -> ResponseResult<()> {
    let routed = match deps.router.route(chat_id, user_id, prompt).await {
        Ok(routed) => routed,
        Err(RouteError::Backend(BackendError::Canceled)) => {
            tracing::info!(chat_id, user_id, "prompt canceled during shutdown");
            return Ok(());
        }
        Err(e) => {
            tracing::error!(chat_id, user_id, "prompt routing failed: {}", e);
            bot.send_message(ChatId(chat_id), e.user_message()).await?;
            return Ok(());
        }
    };

    bot.send_message(ChatId(chat_id), PROCESANDO).await?;

    // With the event stream on, the relay delivers the reply; the two
    // strategies are never combined.
    if deps.config.relay.sse_enabled {
        return Ok(());
    }

    match wait_for_reply(
        bot,
        &deps.client,
        chat_id,
        &routed.session_id,
        &routed.previous,
        &deps.cancel,
    )
    .await
    {
        Ok(text) if text.is_empty() => {
            bot.send_message(ChatId(chat_id), SIN_RESPUESTA).await?;
        }
        Ok(text) => {
            for chunk in chunk_message(&text) {
                bot.send_message(ChatId(chat_id), chunk).await?;
            }
        }
        Err(BackendError::Canceled) => {
            tracing::info!(chat_id, user_id, "reply wait canceled during shutdown");
        }
        Err(e) => {
            tracing::error!(chat_id, user_id, session_id = %routed.session_id, "reply wait failed: {}", e);
            bot.send_message(ChatId(chat_id), e.user_message()).await?;
        }
    }
    Ok(())
}

/// Wait synchronously for the assistant's reply.
///
/// Polls the snapshot every 2 s, refreshes the typing indicator every 4 s,
/// and watches the session state: an error-like state fails the wait, an
/// idle-like state (after the session was seen working) ends it with
/// whatever new text the snapshot holds. A 5-minute deadline bounds
/// everything.
async fn wait_for_reply(
    bot: &Bot,
    client: &OpencodeClient,
    chat_id: i64,
    session_id: &str,
    previous: &AssistantSnapshot,
    cancel: &CancellationToken,
) -> Result<String, BackendError> {
    let deadline = Instant::now() + REPLY_DEADLINE;

    let wait = client.wait_for_assistant_message(session_id, previous, SNAPSHOT_POLL_INTERVAL, cancel);
    tokio::pin!(wait);

    let mut typing = tokio::time::interval(TYPING_PING_INTERVAL);
    // The session may still report idle right after submission; only treat
    // idle as terminal once it was seen doing something.
    let mut state_poll =
        tokio::time::interval_at(Instant::now() + SNAPSHOT_POLL_INTERVAL, SNAPSHOT_POLL_INTERVAL);
    let mut saw_activity = false;

    loop {
        tokio::select! {
            result = &mut wait => return result,
            _ = tokio::time::sleep_until(deadline) => return Err(BackendError::Timeout),
            _ = typing.tick() => {
                bot.send_chat_action(ChatId(chat_id), ChatAction::Typing).await.ok();
            }
            _ = state_poll.tick() => {
                // State probing is best-effort; the snapshot poller is the
                // primary signal.
                let Ok(state) = client.session_state(session_id).await else {
                    continue;
                };
                if is_error_state(&state) {
                    return Err(BackendError::Failed {
                        status: 0,
                        body: format!("session entered state '{}'", state),
                    });
                }
                if is_idle_state(&state) {
                    if saw_activity {
                        let snapshot = client.assistant_snapshot(session_id).await.unwrap_or_default();
                        return Ok(reply_from_snapshot(&snapshot, previous));
                    }
                } else if state != "unknown" {
                    saw_activity = true;
                }
            }
        }
    }
}

/// Whether the lowercased state means the turn is over.
pub(crate) fn is_idle_state(state: &str) -> bool {
    IDLE_STATES.contains(&state)
}

/// Whether the lowercased state means the turn failed.
pub(crate) fn is_error_state(state: &str) -> bool {
    ERROR_MARKERS.iter().any(|marker| state.contains(marker))
}

/// New assistant text relative to the pre-prompt snapshot, empty when
/// nothing changed.
pub(crate) fn reply_from_snapshot(
    snapshot: &AssistantSnapshot,
    previous: &AssistantSnapshot,
) -> String {
    let last = snapshot.last.trim();
    if snapshot.count > previous.count || last != previous.last.trim() {
        last.to_string()
    } else {
        String::new()
    }
}

/// Authorization check with a conservative default on storage failure.
pub(crate) async fn check_allowed(authz: &Authorizer, user_id: i64) -> bool {
    match authz.is_allowed(user_id).await {
        Ok(allowed) => allowed,
        Err(e) => {
            tracing::error!(user_id, "authorization check failed: {}", e);
            false
        }
    }
}

/// Admin check with the same conservative default.
pub(crate) async fn check_admin(authz: &Authorizer, user_id: i64) -> bool {
    match authz.is_admin(user_id).await {
        Ok(admin) => admin,
        Err(e) => {
            tracing::error!(user_id, "admin check failed: {}", e);
            false
        }
    }
}
