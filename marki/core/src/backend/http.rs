//! HTTP Backend
//!
//! `reqwest` implementation of [`ConversationService`] and
//! [`IdentityService`] against the chat backend's REST API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::traits::{ApiError, ConversationService, IdentityService, SessionUser};
use crate::conversation::{ConversationDetail, ConversationPage, MessagePage};
use crate::messages::{ConversationId, Message, MessageId, Sender};

/// Default per-request timeout for REST calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Message as the backend sends it
#[derive(Debug, Deserialize)]
struct WireMessage {
    id: MessageId,
    sender: Sender,
    #[serde(default)]
    content: String,
    #[serde(default)]
    created_at: String,
}

/// Convert one page, keeping server order for unparseable timestamps
///
/// A message whose `created_at` cannot be parsed takes the timestamp of the
/// message before it (or of the first parseable one), so the stable sort in
/// the message window leaves it where the server put it.
fn page_messages(wire: Vec<WireMessage>) -> Vec<Message> {
    let parsed: Vec<Option<DateTime<Utc>>> =
        wire.iter().map(|m| parse_timestamp(&m.created_at)).collect();
    let mut previous = parsed.iter().flatten().next().copied();

    wire.into_iter()
        .zip(parsed)
        .map(|(m, ts)| {
            let created_at = match ts {
                Some(ts) => {
                    previous = Some(ts);
                    ts
                }
                None => {
                    tracing::warn!(
                        message = %m.id,
                        timestamp = %m.created_at,
                        "Unparseable message timestamp, keeping page order"
                    );
                    previous.unwrap_or_else(Utc::now)
                }
            };
            Message::new(m.id, m.sender, m.content, created_at)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Parse a backend timestamp
///
/// Accepts RFC 3339 and naive ISO datetimes (taken as UTC).
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// REST client for conversations and sessions
#[derive(Clone)]
pub struct HttpBackend {
    /// Backend base URL, without trailing slash
    base_url: String,
    /// Timeout applied to each REST request
    request_timeout: Duration,
    /// HTTP client with a cookie store
    http_client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend client with its own cookie store
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Network`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ApiError> {
        let http_client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self::with_client(http_client, base_url, request_timeout))
    }

    /// Create a backend client on top of an existing client
    pub fn with_client(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            http_client,
        }
    }

    /// The underlying client, for sharing the session cookie with the stream
    /// transport
    #[must_use]
    pub fn client(&self) -> reqwest::Client {
        self.http_client.clone()
    }

    /// Backend base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn conversation_url(&self, id: &ConversationId) -> String {
        self.url(&format!("/api/conversations/{id}"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status, body = %body, "Backend request failed");
            return Err(ApiError::Status { status, body });
        }

        Ok(response)
    }

    async fn json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ConversationService for HttpBackend {
    async fn list_conversations(
        &self,
        skip: usize,
        limit: usize,
    ) -> Result<ConversationPage, ApiError> {
        let request = self
            .http_client
            .get(self.url("/api/conversations/"))
            .query(&[("skip", skip), ("limit", limit)]);
        self.json(request).await
    }

    async fn conversation(&self, id: &ConversationId) -> Result<ConversationDetail, ApiError> {
        self.json(self.http_client.get(self.conversation_url(id)))
            .await
    }

    async fn messages(
        &self,
        id: &ConversationId,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ApiError> {
        let mut request = self
            .http_client
            .get(format!("{}/messages", self.conversation_url(id)))
            .query(&[("limit", limit)]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response: MessageListResponse = self.json(request).await?;
        Ok(MessagePage {
            messages: page_messages(response.messages),
            has_more: response.has_more,
            next_cursor: response.next_cursor,
        })
    }

    async fn update_personality(
        &self,
        id: &ConversationId,
        personality_slug: &str,
    ) -> Result<ConversationDetail, ApiError> {
        let request = self
            .http_client
            .patch(self.conversation_url(id))
            .json(&serde_json::json!({ "personality_slug": personality_slug }));
        self.json(request).await
    }

    async fn update_context(
        &self,
        id: &ConversationId,
        context: &str,
    ) -> Result<ConversationDetail, ApiError> {
        let request = self
            .http_client
            .patch(format!("{}/context", self.conversation_url(id)))
            .json(&serde_json::json!({ "context": context }));
        self.json(request).await
    }

    async fn delete_message(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ApiError> {
        let url = format!("{}/messages/{message_id}", self.conversation_url(id));
        self.send(self.http_client.delete(url)).await?;
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError> {
        self.send(self.http_client.delete(self.conversation_url(id)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityService for HttpBackend {
    async fn current_user(&self) -> Result<SessionUser, ApiError> {
        self.json(self.http_client.get(self.url("/api/auth/me")))
            .await
    }

    async fn login(&self, email: &str, password: &str) -> Result<SessionUser, ApiError> {
        let request = self
            .http_client
            .post(self.url("/api/auth/login"))
            .json(&serde_json::json!({ "email": email, "password": password }));
        self.json(request).await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.send(self.http_client.post(self.url("/api/auth/logout")))
            .await?;
        Ok(())
    }

    async fn update_display_name(&self, display_name: &str) -> Result<SessionUser, ApiError> {
        let request = self
            .http_client
            .patch(self.url("/api/users/me"))
            .json(&serde_json::json!({ "display_name": display_name }));
        self.json(request).await
    }
}
