//! Session selection: `/sessions` rendering and inline-keyboard callbacks.
//!
//! Each listed session becomes one button whose callback data is
//! `session_use:<id>`. Tapping it re-links the conversation to that session.

use chrono::{Local, TimeZone};
use ocbridge_core::{SessionSummary, is_valid_session_id};
use teloxide::payloads::{AnswerCallbackQuerySetters, SendMessageSetters};
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::types::Message as TgMessage;

use crate::handlers::{BridgeDeps, NO_AUTORIZADO, check_allowed};

/// Callback-data prefix for session selection buttons.
pub(crate) const CALLBACK_PREFIX: &str = "session_use:";

/// Maximum button label length in characters.
const LABEL_MAX_CHARS: usize = 40;

/// Answer for callback data the bot does not understand.
const ACCION_NO_SOPORTADA: &str = "Accion no soportada";

/// `/sessions` and `/session list`: numbered list plus selection keyboard.
pub(super) async fn cmd_sessions(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
) -> ResponseResult<()> {
    let current = deps
        .sessions
        .get_session(chat_id, user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

    let sessions = match deps
        .client
        .list_sessions(
            &current,
            deps.config.sessions.list_limit,
            deps.config.sessions.source,
        )
        .await
    {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::error!("session listing failed: {}", e);
            bot.send_message(msg.chat.id, e.user_message()).await?;
            return Ok(());
        }
    };

    if sessions.is_empty() {
        bot.send_message(msg.chat.id, "No hay sesiones disponibles.")
            .await?;
        return Ok(());
    }

    if deps.config.sessions.show_id_list {
        bot.send_message(msg.chat.id, render_sessions_list(&sessions, &current))
            .await?;
    }

    bot.send_message(msg.chat.id, "Elige una sesion:")
        .reply_markup(build_sessions_keyboard(&sessions, &current))
        .await?;
    Ok(())
}

/// Numbered plain-text session list; the current session is starred.
pub(crate) fn render_sessions_list(sessions: &[SessionSummary], current: &str) -> String {
    let mut out = String::from("Sesiones:\n");
    for (i, session) in sessions.iter().enumerate() {
        let marker = if session.id == current { "*" } else { " " };
        if session.title.is_empty() {
            out.push_str(&format!("{}. [{}] {}\n", i + 1, marker, session.id));
        } else {
            out.push_str(&format!(
                "{}. [{}] {} — {}\n",
                i + 1,
                marker,
                session.id,
                session.title
            ));
        }
    }
    out.trim_end().to_string()
}

/// One selection button per session.
pub(crate) fn build_sessions_keyboard(
    sessions: &[SessionSummary],
    current: &str,
) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = sessions
        .iter()
        .map(|session| {
            let label = session_button_label(session, session.id == current);
            let data = format!("{}{}", CALLBACK_PREFIX, session.id);
            vec![InlineKeyboardButton::callback(label, data)]
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

/// Button label: local update time plus title, at most 40 characters,
/// `* `-prefixed for the current session. Falls back to the session id when
/// there is no title.
pub(crate) fn session_button_label(session: &SessionSummary, is_current: bool) -> String {
    let mut label = String::new();
    if is_current {
        label.push_str("* ");
    }

    if session.updated_ms > 0
        && let Some(stamp) = Local.timestamp_millis_opt(session.updated_ms).single()
    {
        label.push_str(&stamp.format("%-m/%-d %H:%M").to_string());
        label.push(' ');
    }

    if session.title.is_empty() {
        label.push_str(&session.id);
    } else {
        label.push_str(session.title.trim());
    }

    ocbridge_core::text::truncate(&label, LABEL_MAX_CHARS)
}

/// Handle inline-keyboard taps.
///
/// Only `session_use:<id>` is supported; the id must match the session
/// pattern and the user must be allowed before anything is persisted.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    deps: std::sync::Arc<BridgeDeps>,
) -> ResponseResult<()> {
    let data = match q.data.as_deref() {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => return Ok(()),
    };
    let user_id = q.from.id.0 as i64;

    let Some(session_id) = data.strip_prefix(CALLBACK_PREFIX) else {
        bot.answer_callback_query(q.id)
            .text(ACCION_NO_SOPORTADA)
            .await?;
        return Ok(());
    };

    if !is_valid_session_id(session_id) {
        bot.answer_callback_query(q.id)
            .text(ACCION_NO_SOPORTADA)
            .await?;
        return Ok(());
    }

    if !check_allowed(&deps.authz, user_id).await {
        bot.answer_callback_query(q.id).text(NO_AUTORIZADO).await?;
        return Ok(());
    }

    let Some(message) = q.regular_message() else {
        tracing::warn!("callback query without an attached message");
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    let chat_id = message.chat.id;

    if let Err(e) = deps
        .sessions
        .set_session(chat_id.0, user_id, session_id)
        .await
    {
        tracing::error!(chat_id = chat_id.0, user_id, "session select failed: {}", e);
        bot.answer_callback_query(q.id)
            .text("No se pudo guardar la sesion.")
            .await?;
        return Ok(());
    }

    bot.answer_callback_query(q.id)
        .text("Sesion seleccionada")
        .await?;
    bot.send_message(chat_id, format!("Sesion activa: {}", session_id))
        .await?;
    Ok(())
}
