//! Chat Messages
//!
//! Message, identifier and update types shared by the Store, the Exchange
//! Coordinator and whatever surface renders the conversation.
//!
//! # Design Philosophy
//!
//! Surfaces are pure renderers. They read a [`StoreSnapshot`](crate::store::StoreSnapshot)
//! and react to [`StoreUpdate`] hints; they never mutate messages themselves.
//! Message identity starts local (a provisional id) and is replaced in place
//! once the backend confirms it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a provisional id for an optimistically inserted user message
    #[must_use]
    pub fn provisional() -> Self {
        Self::local("temp")
    }

    /// Generate a locally-scoped id with the given prefix (`ai`, `error`, ...)
    #[must_use]
    pub fn local(prefix: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let millis = Utc::now().timestamp_millis();
        Self(format!("{prefix}-{millis}-{count}"))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Server-assigned conversation identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Who sent a message
///
/// The backend calls the assistant `ai`; `assistant` is accepted on input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// User input
    User,
    /// The personality answering
    #[serde(rename = "ai", alias = "assistant")]
    Assistant,
    /// Locally generated notices (errors and the like)
    System,
}

/// Where a message id came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    /// Id was assigned by the backend
    #[default]
    Server,
    /// Id was generated locally and the backend has never seen it
    Local,
}

/// A message in the active conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id (provisional until reconciled)
    pub id: MessageId,
    /// Who sent this message
    pub sender: Sender,
    /// Message content
    pub content: String,
    /// Creation time
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
    /// Whether `id` is server-confirmed
    #[serde(default)]
    pub origin: MessageOrigin,
}

impl Message {
    /// Create a server-confirmed message
    pub fn new(
        id: MessageId,
        sender: Sender,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender,
            content: content.into(),
            created_at,
            origin: MessageOrigin::Server,
        }
    }

    /// Create an optimistic user message with a provisional id
    pub fn provisional_user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::provisional(),
            sender: Sender::User,
            content: content.into(),
            created_at: Utc::now(),
            origin: MessageOrigin::Local,
        }
    }

    /// Create a local system notice (never sent to the server)
    pub fn system_notice(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::local("error"),
            sender: Sender::System,
            content: content.into(),
            created_at: Utc::now(),
            origin: MessageOrigin::Local,
        }
    }

    /// Whether the backend knows this message by its current id
    #[must_use]
    pub fn is_server_known(&self) -> bool {
        self.origin == MessageOrigin::Server
    }

    /// Replace the provisional id with the server-assigned one
    pub fn confirm(&mut self, id: MessageId) {
        self.id = id;
        self.origin = MessageOrigin::Server;
    }
}

/// Session mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No server-side history; the client re-sends history on every exchange
    #[default]
    Guest,
    /// Durable, server-held conversations
    Authenticated,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => f.write_str("guest"),
            Self::Authenticated => f.write_str("authenticated"),
        }
    }
}

/// State of the single exchange a Store can run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeState {
    /// Nothing in flight
    #[default]
    Idle,
    /// Response is being accumulated
    Streaming,
}

/// Change notifications emitted by the Store
///
/// These are hints: a surface re-reads the snapshot it needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreUpdate {
    /// Message list changed (append, reconcile, prepend, truncate, reset)
    MessagesChanged,
    /// Streaming buffer changed; carries the full accumulated text
    StreamingText(String),
    /// Exchange state changed
    ExchangeState(ExchangeState),
    /// The active conversation record changed
    ConversationChanged,
    /// The conversation index changed
    ConversationsChanged,
    /// Mode switched
    ModeChanged(Mode),
}
