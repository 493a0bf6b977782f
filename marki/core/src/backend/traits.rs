//! Backend Service Traits
//!
//! Boundaries to the persistence service (conversations, messages,
//! pagination) and the identity service (current principal, login).
//!
//! # Design Philosophy
//!
//! The Store and the session tracker only ever see these traits, so tests
//! swap in recording mocks and the HTTP details stay in one place. Every
//! call is plain request/response with standard error propagation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::{ConversationDetail, ConversationPage, MessagePage};
use crate::messages::{ConversationId, MessageId};

/// A persistence or identity call failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Backend answered with a non-success status
    #[error("request failed with status {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, if any
        body: String,
    },
    /// Request never got an answer
    #[error("network error: {0}")]
    Network(String),
    /// Response body was not what we expected
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the backend rejected the session
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }
}

/// Account role
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Anonymous visitor
    Guest,
    /// Regular account
    #[default]
    Member,
    /// Quest author
    QuestExpert,
    /// Administrator
    Admin,
}

/// The authenticated principal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Account id
    pub id: String,
    /// Login email
    pub email: String,
    /// Account role
    #[serde(default)]
    pub role: UserRole,
    /// Chosen display name
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Conversation and message persistence
#[async_trait]
pub trait ConversationService: Send + Sync {
    /// One page of the conversation index
    async fn list_conversations(
        &self,
        skip: usize,
        limit: usize,
    ) -> Result<ConversationPage, ApiError>;

    /// Full record of one conversation
    async fn conversation(&self, id: &ConversationId) -> Result<ConversationDetail, ApiError>;

    /// One page of messages; `cursor = None` asks for the newest page
    async fn messages(
        &self,
        id: &ConversationId,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ApiError>;

    /// Switch the conversation's personality
    async fn update_personality(
        &self,
        id: &ConversationId,
        personality_slug: &str,
    ) -> Result<ConversationDetail, ApiError>;

    /// Replace the conversation's context override
    async fn update_context(
        &self,
        id: &ConversationId,
        context: &str,
    ) -> Result<ConversationDetail, ApiError>;

    /// Delete one message
    async fn delete_message(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ApiError>;

    /// Delete a whole conversation
    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError>;
}

/// Session and account calls
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Principal behind the current session cookie
    async fn current_user(&self) -> Result<SessionUser, ApiError>;

    /// Log in with credentials
    async fn login(&self, email: &str, password: &str) -> Result<SessionUser, ApiError>;

    /// End the session
    async fn logout(&self) -> Result<(), ApiError>;

    /// Change the display name
    async fn update_display_name(&self, display_name: &str) -> Result<SessionUser, ApiError>;
}
