//! Slash commands for the bridge bot.
//!
//! Session management, model overrides and admin access control. None of
//! these commands forward anything to the assistant; prompts go through the
//! message handler.

pub(crate) mod keyboard;


use std::sync::Arc;

use ocbridge_core::BridgeStore;
use teloxide::prelude::*;
use teloxide::types::Message as TgMessage;
use teloxide::utils::command::BotCommands;

use crate::handlers::{BridgeDeps, NO_AUTORIZADO, SIN_SESION, check_admin, check_allowed};

/// Reply for allowed users invoking an admin-only command.
const SOLO_ADMINS: &str = "Comando solo para admins.";

/// All slash commands supported by the bridge bot.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Comandos disponibles:")]
pub enum Command {
    /// Warm up the conversation's session.
    #[command(description = "Prepara la sesion y saluda")]
    Start,
    /// Show session id, backend state and model.
    #[command(description = "Sesion, estado y modelo actuales")]
    Status,
    /// Compact the session's context on the backend.
    #[command(description = "Compacta el contexto de la sesion")]
    Compact,
    /// List selectable sessions with an inline keyboard.
    #[command(description = "Lista las sesiones disponibles")]
    Sessions,
    /// Session management: `/session [list|use <id>|new]`.
    #[command(description = "Gestiona la sesion: /session [list|use <id>|new]")]
    Session(String),
    /// Model overrides: `/models [list|set <id>|clear]`.
    #[command(description = "Modelos: /models [list|set <id>|clear]")]
    Models(String),
    /// Add a user id to the allowed list (admin).
    #[command(description = "Autoriza un userId (admin)")]
    Allow(String),
    /// Remove a user id from the allowed list (admin).
    #[command(description = "Revoca un userId (admin)")]
    Deny(String),
    /// Show admins and allowed users (admin).
    #[command(description = "Muestra admins y usuarios permitidos (admin)")]
    List,
    /// Show this command list.
    #[command(description = "Muestra los comandos")]
    Help,
}

/// Subcommands of `/session`.
#[derive(Debug, PartialEq)]
pub(crate) enum SessionAction {
    Show,
    List,
    Use(String),
    New,
    Invalid,
}

/// Subcommands of `/models`.
#[derive(Debug, PartialEq)]
pub(crate) enum ModelsAction {
    List,
    Set(String),
    Clear,
    Invalid,
}

pub(crate) fn parse_session_args(args: &str) -> SessionAction {
    let mut parts = args.split_whitespace();
    match parts.next() {
        None => SessionAction::Show,
        Some("list") => SessionAction::List,
        Some("new") => SessionAction::New,
        Some("use") => match parts.next() {
            Some(id) => SessionAction::Use(id.to_string()),
            None => SessionAction::Invalid,
        },
        Some(_) => SessionAction::Invalid,
    }
}

pub(crate) fn parse_models_args(args: &str) -> ModelsAction {
    let mut parts = args.split_whitespace();
    match parts.next() {
        None | Some("list") => ModelsAction::List,
        Some("set") => match parts.next() {
            Some(id) => ModelsAction::Set(id.to_string()),
            None => ModelsAction::Invalid,
        },
        Some("clear") => ModelsAction::Clear,
        Some(_) => ModelsAction::Invalid,
    }
}

/// Parse a positive 64-bit user id argument.
pub(crate) fn parse_user_id(args: &str) -> Option<i64> {
    args.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Entry point for all slash commands.
pub async fn handle_command(
    bot: Bot,
    msg: TgMessage,
    cmd: Command,
    deps: Arc<BridgeDeps>,
) -> ResponseResult<()> {
    let Some(user_id) = msg.from.as_ref().map(|u| u.id.0 as i64) else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;

    if !check_allowed(&deps.authz, user_id).await {
        bot.send_message(msg.chat.id, NO_AUTORIZADO).await?;
        return Ok(());
    }

    match cmd {
        Command::Start => cmd_start(&bot, &msg, &deps, chat_id, user_id).await,
        Command::Status => cmd_status(&bot, &msg, &deps, chat_id, user_id).await,
        Command::Compact => cmd_compact(&bot, &msg, &deps, chat_id, user_id).await,
        Command::Sessions => keyboard::cmd_sessions(&bot, &msg, &deps, chat_id, user_id).await,
        Command::Session(args) => match parse_session_args(&args) {
            SessionAction::Show => cmd_session_show(&bot, &msg, &deps, chat_id, user_id).await,
            SessionAction::List => keyboard::cmd_sessions(&bot, &msg, &deps, chat_id, user_id).await,
            SessionAction::Use(id) => {
                cmd_session_use(&bot, &msg, &deps, chat_id, user_id, &id).await
            }
            SessionAction::New => cmd_session_new(&bot, &msg, &deps, chat_id, user_id).await,
            SessionAction::Invalid => {
                bot.send_message(msg.chat.id, "Uso: /session [list|use <id>|new]")
                    .await?;
                Ok(())
            }
        },
        Command::Models(args) => match parse_models_args(&args) {
            ModelsAction::List => cmd_models_list(&bot, &msg, &deps).await,
            ModelsAction::Set(id) => cmd_models_set(&bot, &msg, &deps, chat_id, user_id, &id).await,
            ModelsAction::Clear => cmd_models_clear(&bot, &msg, &deps, chat_id, user_id).await,
            ModelsAction::Invalid => {
                bot.send_message(msg.chat.id, "Uso: /models [list|set <id>|clear]")
                    .await?;
                Ok(())
            }
        },
        Command::Allow(args) => cmd_allow(&bot, &msg, &deps, user_id, &args).await,
        Command::Deny(args) => cmd_deny(&bot, &msg, &deps, user_id, &args).await,
        Command::List => cmd_list(&bot, &msg, &deps, user_id).await,
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
            Ok(())
        }
    }
}

/// Pre-warm the session link and confirm readiness.
async fn cmd_start(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
) -> ResponseResult<()> {
    if let Err(e) = deps.sessions.get_session(chat_id, user_id).await {
        tracing::warn!(chat_id, user_id, "session pre-warm failed: {}", e);
    }
    bot.send_message(msg.chat.id, "Listo. Envia un mensaje para hablar con OpenCode.")
        .await?;
    Ok(())
}

async fn cmd_status(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
) -> ResponseResult<()> {
    let session_id = match deps.sessions.get_session(chat_id, user_id).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            bot.send_message(msg.chat.id, SIN_SESION).await?;
            return Ok(());
        }
        Err(e) => {
            tracing::error!(chat_id, user_id, "session lookup failed: {}", e);
            bot.send_message(msg.chat.id, "No se pudo consultar la sesion.")
                .await?;
            return Ok(());
        }
    };

    match deps.client.status(&session_id).await {
        Ok(status) => {
            let model = if status.model.is_empty() {
                "-".to_string()
            } else {
                status.model
            };
            bot.send_message(
                msg.chat.id,
                format!(
                    "Sesion: {}\nEstado: {}\nModelo: {}",
                    status.session_id, status.status, model
                ),
            )
            .await?;
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, "status query failed: {}", e);
            bot.send_message(msg.chat.id, e.user_message()).await?;
        }
    }
    Ok(())
}

async fn cmd_compact(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
) -> ResponseResult<()> {
    let session_id = match deps.sessions.get_session(chat_id, user_id).await {
        Ok(Some(id)) => id,
        _ => {
            bot.send_message(msg.chat.id, SIN_SESION).await?;
            return Ok(());
        }
    };

    match deps.client.compact_session(&session_id).await {
        Ok(()) => {
            bot.send_message(msg.chat.id, "Contexto compactado.").await?;
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, "compact failed: {}", e);
            bot.send_message(msg.chat.id, e.user_message()).await?;
        }
    }
    Ok(())
}

async fn cmd_session_show(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
) -> ResponseResult<()> {
    let reply = match deps.sessions.get_session(chat_id, user_id).await {
        Ok(Some(id)) => format!("Sesion actual: {}", id),
        _ => "Sin sesion. Se creara una nueva en el proximo mensaje.".to_string(),
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn cmd_session_use(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
    session_id: &str,
) -> ResponseResult<()> {
    if !ocbridge_core::is_valid_session_id(session_id) {
        bot.send_message(msg.chat.id, "Identificador invalido. Formato: ses_...")
            .await?;
        return Ok(());
    }

    match deps.sessions.set_session(chat_id, user_id, session_id).await {
        Ok(()) => {
            bot.send_message(msg.chat.id, format!("Sesion actualizada: {}", session_id))
                .await?;
        }
        Err(e) => {
            tracing::error!(chat_id, user_id, "session update failed: {}", e);
            bot.send_message(msg.chat.id, "No se pudo guardar la sesion.")
                .await?;
        }
    }
    Ok(())
}

async fn cmd_session_new(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
) -> ResponseResult<()> {
    if let Err(e) = deps.sessions.clear_session(chat_id, user_id).await {
        tracing::error!(chat_id, user_id, "session clear failed: {}", e);
        bot.send_message(msg.chat.id, "No se pudo reiniciar la sesion.")
            .await?;
        return Ok(());
    }

    let reply = match deps.sessions.default_session_id() {
        Some(default) => {
            // Re-reading re-persists the configured default for this chat.
            if let Err(e) = deps.sessions.get_session(chat_id, user_id).await {
                tracing::warn!(chat_id, user_id, "default session reapply failed: {}", e);
            }
            format!("Sesion reiniciada. Se usara la sesion por defecto {}.", default)
        }
        None => "Sesion reiniciada. Se creara una nueva en el proximo mensaje.".to_string(),
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn cmd_models_list(bot: &Bot, msg: &TgMessage, deps: &BridgeDeps) -> ResponseResult<()> {
    match deps.client.list_favorite_models().await {
        Ok(models) if models.is_empty() => {
            bot.send_message(msg.chat.id, "No hay modelos favoritos configurados.")
                .await?;
        }
        Ok(models) => {
            let mut out = String::from("Modelos favoritos:\n");
            for (i, model) in models.iter().enumerate() {
                if model.name != model.id {
                    out.push_str(&format!("{}. {} — {}\n", i + 1, model.name, model.id));
                } else {
                    out.push_str(&format!("{}. {}\n", i + 1, model.id));
                }
            }
            bot.send_message(msg.chat.id, out.trim_end().to_string()).await?;
        }
        Err(e) => {
            tracing::error!("model listing failed: {}", e);
            bot.send_message(msg.chat.id, e.user_message()).await?;
        }
    }
    Ok(())
}

async fn cmd_models_set(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
    model_id: &str,
) -> ResponseResult<()> {
    let Ok(Some(session_id)) = deps.sessions.get_session(chat_id, user_id).await else {
        bot.send_message(msg.chat.id, SIN_SESION).await?;
        return Ok(());
    };

    match deps.store.set_session_model(&session_id, model_id).await {
        Ok(()) => {
            bot.send_message(msg.chat.id, format!("Modelo fijado: {}", model_id))
                .await?;
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, "model override failed: {}", e);
            bot.send_message(msg.chat.id, "No se pudo guardar el modelo.")
                .await?;
        }
    }
    Ok(())
}

async fn cmd_models_clear(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    chat_id: i64,
    user_id: i64,
) -> ResponseResult<()> {
    let Ok(Some(session_id)) = deps.sessions.get_session(chat_id, user_id).await else {
        bot.send_message(msg.chat.id, SIN_SESION).await?;
        return Ok(());
    };

    match deps.store.clear_session_model(&session_id).await {
        Ok(_) => {
            bot.send_message(msg.chat.id, "Modelo restablecido.").await?;
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, "model clear failed: {}", e);
            bot.send_message(msg.chat.id, "No se pudo restablecer el modelo.")
                .await?;
        }
    }
    Ok(())
}

async fn cmd_allow(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    user_id: i64,
    args: &str,
) -> ResponseResult<()> {
    if !check_admin(&deps.authz, user_id).await {
        bot.send_message(msg.chat.id, SOLO_ADMINS).await?;
        return Ok(());
    }
    let Some(target) = parse_user_id(args) else {
        bot.send_message(msg.chat.id, "userId invalido. Debe ser un entero positivo.")
            .await?;
        return Ok(());
    };

    match deps.authz.allow(target).await {
        Ok(()) => {
            bot.send_message(msg.chat.id, format!("Usuario {} autorizado.", target))
                .await?;
        }
        Err(e) => {
            tracing::error!(target, "allow failed: {}", e);
            bot.send_message(msg.chat.id, "No se pudo autorizar al usuario.")
                .await?;
        }
    }
    Ok(())
}

async fn cmd_deny(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    user_id: i64,
    args: &str,
) -> ResponseResult<()> {
    if !check_admin(&deps.authz, user_id).await {
        bot.send_message(msg.chat.id, SOLO_ADMINS).await?;
        return Ok(());
    }
    let Some(target) = parse_user_id(args) else {
        bot.send_message(msg.chat.id, "userId invalido. Debe ser un entero positivo.")
            .await?;
        return Ok(());
    };

    let reply = match deps.authz.deny(target).await {
        Ok(true) => format!("Usuario {} revocado.", target),
        Ok(false) => format!("El usuario {} no estaba en la lista.", target),
        Err(e) => {
            tracing::error!(target, "deny failed: {}", e);
            "No se pudo revocar al usuario.".to_string()
        }
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn cmd_list(
    bot: &Bot,
    msg: &TgMessage,
    deps: &BridgeDeps,
    user_id: i64,
) -> ResponseResult<()> {
    if !check_admin(&deps.authz, user_id).await {
        bot.send_message(msg.chat.id, SOLO_ADMINS).await?;
        return Ok(());
    }

    let admins = deps.authz.list_admins().await.unwrap_or_default();
    let allowed = deps.authz.list_allowed().await.unwrap_or_default();
    bot.send_message(
        msg.chat.id,
        format!(
            "Admins: {}\nPermitidos: {}",
            format_id_list(&admins),
            format_id_list(&allowed)
        ),
    )
    .await?;
    Ok(())
}

fn format_id_list(ids: &[i64]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
