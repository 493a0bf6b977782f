//! Marki Core - Streaming Chat Client for Personality-Driven Conversations
//!
//! This crate is the protocol client and conversation state machine behind
//! the Marki chat surfaces. It opens one streaming exchange per user turn,
//! assembles the assistant's answer from partial frames, reconciles
//! optimistic local messages with server ids, and keeps paginated
//! conversation history for guest and authenticated sessions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Surfaces (CLI, ...)                       │
//! │           snapshot() / subscribe()  ▲     │  send, select, ...    │
//! └─────────────────────────────────────┼─────┼───────────────────────┘
//!                                       │     ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          MARKI CORE                               │
//! │  ┌────────────────┐   ┌──────────────────────────────────────┐   │
//! │  │ SessionTracker │──►│ SessionModeGate ──► ChatStore         │   │
//! │  └───────┬────────┘   │                      │    │           │   │
//! │          │            │      ExchangeCoordinator  │           │   │
//! │          │            │             │             │           │   │
//! │          │            │       StreamAdapter       │           │   │
//! │          │            └─────────────┼─────────────┼───────────┘   │
//! │          ▼                          ▼             ▼               │
//! │   IdentityService           StreamTransport  ConversationService  │
//! └──────────┬──────────────────────────┬─────────────┬──────────────┘
//!            └──────────── HttpBackend / SseTransport ┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatStore`]: The authoritative conversation state and its operations
//! - [`ExchangeCoordinator`]: Builds requests and drives one exchange
//! - [`StreamAdapter`]: One open stream at a time, frame order, cancellation
//! - [`SessionModeGate`]: Keeps guest/authenticated mode in line with the session
//! - [`HttpBackend`]: REST client for conversations and identity
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use marki_core::{load_config, ChatStore, HttpBackend, NoHistory, SseTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let backend = Arc::new(HttpBackend::new(&config.base_url, config.request_timeout)?);
//!     let transport = Arc::new(SseTransport::new(
//!         backend.client(),
//!         &config.base_url,
//!         &config.stream_path,
//!     ));
//!     let store = ChatStore::new(&config, transport, backend, Arc::new(NoHistory));
//!
//!     store.send_message("Hello!").await?;
//!     println!("{:?}", store.snapshot().messages);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: SSE transport, frame codec and the stream adapter
//! - [`exchange`]: Exchange coordination and callbacks
//! - [`store`]: Conversation state store
//! - [`conversation`]: Conversation records, index and message window
//! - [`messages`]: Message, id and update types
//! - [`backend`]: Persistence and identity services
//! - [`history`]: Guest history persistence
//! - [`session`]: Session status tracking
//! - [`gate`]: Session mode gate
//! - [`config`]: TOML configuration
//! - [`personality`]: Built-in personality catalogue
//!
//! # No UI Dependencies
//!
//! Rendering, markdown and layout are left to the surfaces. Everything here
//! is plain state and protocol logic.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod conversation;
pub mod error;
pub mod exchange;
pub mod gate;
pub mod history;
pub mod messages;
pub mod personality;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use backend::{
    ApiError, ConversationService, HttpBackend, IdentityService, SessionUser, UserRole,
};
pub use conversation::{
    Conversation, ConversationDetail, ConversationIndex, ConversationPage, ConversationSummary,
    MessagePage, MessageWindow,
};
pub use error::ChatError;
pub use exchange::{
    Exchange, ExchangeCallbacks, ExchangeCanceller, ExchangeCoordinator, ExchangeEvent,
    ExchangeId, ExchangeOptions, ExchangeOutcome, ValidationError,
};
pub use gate::SessionModeGate;
pub use history::{FileHistory, GuestHistory, HistoryError, NoHistory};
pub use messages::{
    ConversationId, ExchangeState, Message, MessageId, MessageOrigin, Mode, Sender, StoreUpdate,
};
pub use personality::{Personality, DEFAULT_PERSONALITY_SLUG, PERSONALITIES};
pub use session::{SessionError, SessionStatus, SessionTracker};
pub use store::{ChatStore, SendOutcome, StoreSnapshot};
pub use transport::{
    DecodeError, ExchangeRequest, Frame, FrameHandle, HandleId, SseTransport, StreamAdapter,
    StreamTransport, TransportError,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ClientConfig, ClientToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
