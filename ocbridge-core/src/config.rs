//! Configuration for the gateway bridge.
//!
//! All options come from the environment, are read exactly once at startup,
//! and are validated into a plain [`Config`] value handed to constructors.
//! Nothing here is runtime-mutable; tests build a `Config` directly or feed
//! [`Config::from_lookup`] a closure over a map.

use thiserror::Error;

/// Errors produced while reading and validating the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is absent or blank.
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// A variable is present but unusable.
    #[error("invalid value for {name}: '{value}' ({reason})")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// How Telegram updates are ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Long-poll `getUpdates` (default).
    Polling,
    /// Registered webhook with a local listener.
    Webhook,
}

/// Relay dispatch policy on `session.idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Dispatch the latest cached text, fetching it if the cache is empty.
    Last,
    /// Dispatch only explicitly-final text, with an optional delayed fallback.
    Final,
}

/// Where `/sessions` obtains its list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionsSource {
    /// The HTTP endpoint only.
    Endpoint,
    /// The external CLI only.
    Cli,
    /// Endpoint first, CLI entries appended (default).
    Both,
}

/// Telegram transport and access-control options.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot API token. Never logged.
    pub bot_token: String,
    /// Administrator user ids. At least one is required.
    pub admin_user_ids: Vec<i64>,
    /// Additional allowed user ids seeded at startup.
    pub allowed_user_ids: Vec<i64>,
    /// Update ingestion mode.
    pub transport: Transport,
    /// Public webhook URL, required in webhook mode.
    pub webhook_url: Option<String>,
    /// Local address the webhook listener binds.
    pub webhook_listen_addr: String,
    /// Idle sleep between empty polling batches, in seconds.
    pub polling_interval_secs: u64,
}

impl TelegramConfig {
    /// The long-poll timeout: the polling interval clamped to Telegram's
    /// accepted `[1, 50]` second range.
    pub fn long_poll_timeout_secs(&self) -> u64 {
        self.polling_interval_secs.clamp(1, 50)
    }
}

/// OpenCode server connection options.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the OpenCode HTTP API.
    pub server_url: String,
    /// Optional HTTP Basic username.
    pub username: Option<String>,
    /// Optional HTTP Basic password.
    pub password: Option<String>,
    /// Per-call timeout for the bounded HTTP handle, in milliseconds.
    pub timeout_ms: u64,
    /// External binary used by the CLI session-list source.
    pub cli_bin: String,
}

/// Relay engine options.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Dispatch policy.
    pub mode: RelayMode,
    /// In `final` mode, whether to fall back after a delay when no final
    /// text has arrived by idle time.
    pub fallback: bool,
    /// Fallback delay in milliseconds.
    pub fallback_delay_ms: u64,
    /// Whether the streaming relay runs at all. When false, the dispatcher
    /// waits for replies synchronously.
    pub sse_enabled: bool,
}

/// `/sessions` listing options.
#[derive(Debug, Clone)]
pub struct SessionsConfig {
    /// Maximum entries shown, minimum 1.
    pub list_limit: usize,
    /// List source.
    pub source: SessionsSource,
    /// Whether the numbered id list is rendered above the keyboard.
    pub show_id_list: bool,
}

/// Optional rolling-file logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for log files.
    pub directory: String,
    /// Rotation: "daily", "hourly" or "never".
    pub rotation: String,
    /// Maximum rotated files kept.
    pub max_files: usize,
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram options.
    pub telegram: TelegramConfig,
    /// OpenCode server options.
    pub backend: BackendConfig,
    /// Relay options.
    pub relay: RelayConfig,
    /// `/sessions` options.
    pub sessions: SessionsConfig,
    /// Session id applied to conversations without a persisted link.
    pub default_session_id: Option<String>,
    /// sqlx database URL for the repository.
    pub database_url: String,
    /// Port of the local health endpoint.
    pub health_port: u16,
    /// Rolling-file logging, enabled when `LOG_DIR` is set.
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Load and validate configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required variable is missing or any
    /// value fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    ///
    /// Blank values are treated as unset. This is the seam tests use.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bot_token = get("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;
        let admin_user_ids = parse_id_list("ADMIN_USER_IDS", get("ADMIN_USER_IDS"))?;
        if admin_user_ids.is_empty() {
            return Err(ConfigError::Missing("ADMIN_USER_IDS"));
        }
        let allowed_user_ids = parse_id_list("ALLOWED_USER_IDS", get("ALLOWED_USER_IDS"))?;

        let transport = match get("BOT_TRANSPORT").as_deref() {
            None | Some("polling") => Transport::Polling,
            Some("webhook") => Transport::Webhook,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "BOT_TRANSPORT",
                    value: other.to_string(),
                    reason: "expected 'polling' or 'webhook'".to_string(),
                });
            }
        };

        let webhook_url = get("WEBHOOK_URL");
        if transport == Transport::Webhook && webhook_url.is_none() {
            return Err(ConfigError::Missing("WEBHOOK_URL"));
        }

        let server_url = get("OPENCODE_SERVER_URL")
            .ok_or(ConfigError::Missing("OPENCODE_SERVER_URL"))?
            .trim_end_matches('/')
            .to_string();

        let default_session_id = get("DEFAULT_SESSION_ID");
        if let Some(ref id) = default_session_id
            && !crate::session::is_valid_session_id(id)
        {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_SESSION_ID",
                value: id.clone(),
                reason: "expected a 'ses_' identifier".to_string(),
            });
        }

        let relay = RelayConfig {
            mode: match get("RELAY_MODE").as_deref() {
                None | Some("last") => RelayMode::Last,
                Some("final") => RelayMode::Final,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        name: "RELAY_MODE",
                        value: other.to_string(),
                        reason: "expected 'last' or 'final'".to_string(),
                    });
                }
            },
            fallback: parse_bool("RELAY_FALLBACK", get("RELAY_FALLBACK"), true)?,
            fallback_delay_ms: parse_number("RELAY_FALLBACK_DELAY_MS", get("RELAY_FALLBACK_DELAY_MS"), 3000)?,
            sse_enabled: parse_bool("RELAY_SSE_ENABLED", get("RELAY_SSE_ENABLED"), false)?,
        };

        let sessions = SessionsConfig {
            list_limit: (parse_number("SESSIONS_LIST_LIMIT", get("SESSIONS_LIST_LIMIT"), 5)? as usize).max(1),
            source: match get("SESSIONS_SOURCE").as_deref() {
                None | Some("both") => SessionsSource::Both,
                Some("endpoint") => SessionsSource::Endpoint,
                Some("cli") => SessionsSource::Cli,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        name: "SESSIONS_SOURCE",
                        value: other.to_string(),
                        reason: "expected 'endpoint', 'cli' or 'both'".to_string(),
                    });
                }
            },
            show_id_list: parse_bool("SESSIONS_SHOW_ID_LIST", get("SESSIONS_SHOW_ID_LIST"), true)?,
        };

        let logging = get("LOG_DIR").map(|directory| {
            Ok::<_, ConfigError>(LoggingConfig {
                directory,
                rotation: get("LOG_ROTATION").unwrap_or_else(|| "daily".to_string()),
                max_files: parse_number("LOG_MAX_FILES", get("LOG_MAX_FILES"), 7)? as usize,
            })
        });
        let logging = logging.transpose()?;

        Ok(Self {
            telegram: TelegramConfig {
                bot_token,
                admin_user_ids,
                allowed_user_ids,
                transport,
                webhook_url,
                webhook_listen_addr: get("WEBHOOK_LISTEN_ADDR")
                    .unwrap_or_else(|| ":8090".to_string()),
                polling_interval_secs: parse_number(
                    "BOT_POLLING_INTERVAL_SECONDS",
                    get("BOT_POLLING_INTERVAL_SECONDS"),
                    2,
                )?,
            },
            backend: BackendConfig {
                server_url,
                username: get("OPENCODE_SERVER_USERNAME"),
                password: get("OPENCODE_SERVER_PASSWORD"),
                timeout_ms: parse_number("OPENCODE_TIMEOUT_MS", get("OPENCODE_TIMEOUT_MS"), 120_000)?,
                cli_bin: get("OPENCODE_BIN").unwrap_or_else(|| "opencode".to_string()),
            },
            relay,
            sessions,
            default_session_id,
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite:ocbridge.db".to_string()),
            health_port: parse_number("HEALTH_PORT", get("HEALTH_PORT"), 4097)? as u16,
            logging,
        })
    }
}

/// Parse a comma-separated list of positive 64-bit user ids.
fn parse_id_list(name: &'static str, raw: Option<String>) -> Result<Vec<i64>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut ids = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<i64>() {
            Ok(id) if id > 0 => ids.push(id),
            _ => {
                return Err(ConfigError::Invalid {
                    name,
                    value: token.to_string(),
                    reason: "expected a positive 64-bit integer".to_string(),
                });
            }
        }
    }
    Ok(ids)
}

fn parse_bool(name: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref() {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_number(name: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(v) => v.parse::<u64>().map_err(|_| ConfigError::Invalid {
            name,
            value: v,
            reason: "expected a non-negative integer".to_string(),
        }),
    }
}
