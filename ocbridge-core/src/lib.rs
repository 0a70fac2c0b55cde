//! ocbridge core library.
//!
//! Connects a Telegram front-end to an OpenCode server: the backend client
//! and its event stream, the keyed serializer, the prompt router, the relay
//! engine, and the authorization/session services over the repository
//! contract.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod relay;
pub mod router;
pub mod serialize;
pub mod session;
pub mod store;
pub mod text;

pub use auth::Authorizer;
pub use client::{
    AssistantSnapshot, ModelInfo, OpencodeClient, SessionStatus, SessionSummary,
    events::RelayEvent,
};
pub use config::{Config, ConfigError, RelayMode, SessionsSource, Transport};
pub use error::BackendError;
pub use relay::{RelayEngine, RelayOutbound};
pub use router::{PromptRouter, RouteError, RoutedPrompt};
pub use serialize::{KeyedSerializer, LaneCanceled};
pub use session::{SessionService, is_valid_session_id};
pub use store::{BridgeStore, MemoryStore, SqliteStore, StorageError, create_store};
