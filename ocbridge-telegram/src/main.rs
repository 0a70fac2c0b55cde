//! ocbridge Telegram bot: gateway between Telegram and an OpenCode server.
//!
//! Authorizes users by numeric id, forwards their prompts to persistent
//! backend sessions (one serialized lane per conversation), and relays the
//! assistant's replies back, via the streaming relay when the event stream
//! is enabled, or the synchronous waiter otherwise.

mod commands;
mod format;
mod handlers;
mod health;
mod outbound;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use handlers::BridgeDeps;
use ocbridge_core::{
    Authorizer, Config, KeyedSerializer, OpencodeClient, PromptRouter, RelayEngine,
    SessionService, Transport, create_store,
};
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use teloxide::types::AllowedUpdate;
use teloxide::update_listeners::{Polling, webhooks};
use teloxide::utils::command::BotCommands;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use crate::outbound::TelegramOutbound;

/// ocbridge Telegram bot, an OpenCode gateway
#[derive(Parser)]
#[command(name = "ocbridge-telegram")]
struct Args {
    /// Path to a .env file loaded before the environment is read.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

/// Default tracing directives enabling info-level logs for this crate and the core.
const DEFAULT_DIRECTIVES: &[&str] = &["ocbridge_telegram=info", "ocbridge_core=info"];

/// Grace period for background tasks after the dispatcher stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Build the default `EnvFilter`: RUST_LOG (if set) plus our default directives.
fn default_env_filter() -> anyhow::Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Initialize the tracing subscriber.
///
/// With `LOG_DIR` configured, a rolling-file layer runs next to stdout;
/// otherwise output is stdout-only. Returns the non-blocking writer guard
/// that must be held for the process lifetime.
fn init_tracing(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(ref lc) = config.logging else {
        tracing_subscriber::fmt()
            .with_env_filter(default_env_filter()?)
            .init();
        return Ok(None);
    };

    if let Err(e) = std::fs::create_dir_all(&lc.directory) {
        eprintln!(
            "Warning: failed to create log directory '{}': {}. Falling back to stdout-only.",
            lc.directory, e
        );
        tracing_subscriber::fmt()
            .with_env_filter(default_env_filter()?)
            .init();
        return Ok(None);
    }

    let rotation = match lc.rotation.as_str() {
        "daily" => tracing_appender::rolling::Rotation::DAILY,
        "hourly" => tracing_appender::rolling::Rotation::HOURLY,
        "never" => tracing_appender::rolling::Rotation::NEVER,
        other => {
            eprintln!("Warning: unknown rotation '{}', falling back to daily", other);
            tracing_appender::rolling::Rotation::DAILY
        }
    };

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix("ocbridge-telegram")
        .filename_suffix("log")
        .max_log_files(lc.max_files)
        .build(&lc.directory)
        .context("failed to create rolling file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(default_env_filter()?)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1. Load .env, then the typed configuration. The token is never logged.
    match args.env_file {
        Some(ref path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file '{}'", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    let config = Arc::new(Config::from_env().context("invalid configuration")?);

    // 2. Tracing (stdout-only or stdout+file depending on LOG_DIR).
    let _guard = init_tracing(&config)?;
    tracing::info!("starting ocbridge");

    // 3. Repository, seeded with the configured access lists.
    let store = create_store(&config.database_url)
        .await
        .context("failed to open repository")?;
    let authz = Arc::new(Authorizer::new(store.clone()));
    authz
        .seed(
            &config.telegram.admin_user_ids,
            &config.telegram.allowed_user_ids,
        )
        .await
        .context("failed to seed access control")?;

    // 4. Backend client and services.
    let client = Arc::new(OpencodeClient::new(&config.backend).context("failed to build backend client")?);
    let sessions = Arc::new(SessionService::new(
        store.clone(),
        config.default_session_id.clone(),
    ));
    let router = Arc::new(PromptRouter::new(
        client.clone(),
        sessions.clone(),
        store.clone(),
    ));
    let serializer = Arc::new(KeyedSerializer::new());

    // 5. Root cancellation token; signals cancel everything downstream.
    let cancel = CancellationToken::new();

    let bot = Bot::new(config.telegram.bot_token.clone());
    let deps = Arc::new(BridgeDeps {
        config: config.clone(),
        client: client.clone(),
        authz: authz.clone(),
        sessions: sessions.clone(),
        store: store.clone(),
        router,
        serializer,
        cancel: cancel.clone(),
    });

    // 6. Streaming relay, only when the event stream is enabled.
    let relay_task = if config.relay.sse_enabled {
        let engine = Arc::new(RelayEngine::new(
            client.clone(),
            store.clone(),
            Arc::new(TelegramOutbound::new(bot.clone())),
            config.relay.clone(),
        ));
        let token = cancel.clone();
        tracing::info!(mode = ?config.relay.mode, "streaming relay enabled");
        Some(tokio::spawn(async move { engine.run(token).await }))
    } else {
        None
    };

    // 7. Health endpoint.
    let health_task = {
        let token = cancel.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, token).await {
                tracing::error!("health endpoint failed: {}", e);
            }
        })
    };

    // 8. Bot identity (required by filter_command) and the command menu.
    let me = bot.get_me().await.context("failed to fetch bot identity")?;
    if let Err(e) = bot.set_my_commands(commands::Command::bot_commands()).await {
        tracing::warn!("failed to register bot commands: {}", e);
    }

    // 9. Handler tree: commands and callbacks route separately from prompts.
    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<commands::Command>()
                        .endpoint(commands::handle_command),
                )
                .branch(dptree::entry().endpoint(handlers::handle_message)),
        )
        .branch(Update::filter_callback_query().endpoint(commands::keyboard::handle_callback));

    // Updates are handled concurrently; the keyed serializer alone enforces
    // per-conversation ordering, so commands never queue behind a prompt.
    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![me, Arc::clone(&deps)])
        .distribution_function(|_| None::<std::convert::Infallible>)
        .build();

    // 10. Signals cancel the root token and stop the dispatcher.
    let shutdown_token = dispatcher.shutdown_token();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
            if let Ok(stopped) = shutdown_token.shutdown() {
                stopped.await;
            }
        });
    }

    // 11. Ingest updates: long polling by default, webhook when configured.
    match config.telegram.transport {
        Transport::Polling => {
            // A leftover webhook registration would make getUpdates return 409.
            if let Err(e) = bot.delete_webhook().await {
                tracing::warn!("failed to delete webhook registration: {}", e);
            }
            let listener = Polling::builder(bot.clone())
                .timeout(Duration::from_secs(config.telegram.long_poll_timeout_secs()))
                .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
                .build();
            tracing::info!("dispatcher ready — polling for updates");
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("polling listener error"),
                )
                .await;
        }
        Transport::Webhook => {
            let url = config
                .telegram
                .webhook_url
                .as_deref()
                .context("WEBHOOK_URL is required in webhook mode")?
                .parse::<url::Url>()
                .context("WEBHOOK_URL is not a valid URL")?;
            let addr = parse_listen_addr(&config.telegram.webhook_listen_addr)?;
            let listener = webhooks::axum(bot.clone(), webhooks::Options::new(addr, url))
                .await
                .context("failed to register webhook")?;
            tracing::info!(%addr, "dispatcher ready — webhook listening");
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("webhook listener error"),
                )
                .await;
        }
    }

    // 12. Drain background tasks within the grace period.
    cancel.cancel();
    if let Some(task) = relay_task
        && tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err()
    {
        tracing::warn!("relay did not stop within the grace period");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, health_task).await.is_err() {
        tracing::warn!("health endpoint did not stop within the grace period");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Parse a listen address, accepting the `:port` shorthand.
fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    normalized
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid listen address '{}'", addr))
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
