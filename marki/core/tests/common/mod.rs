//! Shared fixtures for integration tests
//!
//! - [`ScriptedTransport`]: hands every opened stream to the test, which
//!   then plays frames into it by hand
//! - [`MockService`]: in-memory persistence that records calls and can be
//!   told to fail or to hold message fetches

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use marki_core::{
    ApiError, ChatStore, ClientConfig, ConversationDetail, ConversationId, ConversationPage,
    ConversationService, ExchangeRequest, GuestHistory, Message, MessageId, MessagePage, Mode,
    NoHistory, Sender, StreamTransport, TransportError,
};
use marki_core::transport::{RawEvent, TransportItem};

/// How long a test waits for something before failing
pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Transport
// =============================================================================

/// One stream opened by the store, driven by the test
pub struct StreamControl {
    /// Request the store sent
    pub request: ExchangeRequest,
    tx: mpsc::Sender<TransportItem>,
    /// Token the adapter cancels
    pub cancel: CancellationToken,
}

impl StreamControl {
    /// Send a raw event; returns false once the consumer is gone
    pub async fn raw(&self, event: &str, data: &str) -> bool {
        self.tx
            .send(TransportItem::Event(RawEvent::new(event, data)))
            .await
            .is_ok()
    }

    pub async fn start(&self, conversation_id: Option<&str>, user_message_id: Option<&str>) {
        let data = serde_json::json!({
            "conversation_id": conversation_id,
            "user_message_id": user_message_id,
        });
        self.raw("start", &data.to_string()).await;
    }

    pub async fn chunk(&self, text: &str) {
        let data = serde_json::json!({ "content": text });
        self.raw("chunk", &data.to_string()).await;
    }

    pub async fn end(&self, content: &str, ai_message_id: Option<&str>) {
        let data = serde_json::json!({ "content": content, "ai_message_id": ai_message_id });
        self.raw("end", &data.to_string()).await;
    }

    pub async fn end_in(&self, conversation_id: &str, content: &str, ai_message_id: &str) {
        let data = serde_json::json!({
            "conversation_id": conversation_id,
            "content": content,
            "ai_message_id": ai_message_id,
        });
        self.raw("end", &data.to_string()).await;
    }

    pub async fn error(&self, message: &str) {
        let data = serde_json::json!({ "message": message });
        self.raw("error", &data.to_string()).await;
    }

    pub async fn fail(&self, error: TransportError) {
        let _ = self.tx.send(TransportItem::Failed(error)).await;
    }

    /// Close the stream without a terminal frame
    pub fn close(self) {
        drop(self);
    }
}

/// Transport whose streams are played by the test
pub struct ScriptedTransport {
    opened: Mutex<Vec<ExchangeRequest>>,
    streams_tx: mpsc::UnboundedSender<StreamControl>,
    streams_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamControl>>,
    fail_next: Mutex<Option<TransportError>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            opened: Mutex::new(Vec::new()),
            streams_tx,
            streams_rx: tokio::sync::Mutex::new(streams_rx),
            fail_next: Mutex::new(None),
        })
    }

    /// Wait for the store to open the next stream
    pub async fn next_stream(&self) -> StreamControl {
        let mut rx = self.streams_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no stream opened in time")
            .expect("transport dropped")
    }

    /// Requests seen so far
    pub fn opened(&self) -> Vec<ExchangeRequest> {
        self.opened.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    /// Make the next open fail
    pub fn fail_next_open(&self, error: TransportError) {
        *self.fail_next.lock() = Some(error);
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn open(
        &self,
        request: &ExchangeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportItem>, TransportError> {
        self.opened.lock().push(request.clone());
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(64);
        let _ = self.streams_tx.send(StreamControl {
            request: request.clone(),
            tx,
            cancel,
        });
        Ok(rx)
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// In-memory persistence service
#[derive(Default)]
pub struct MockService {
    conversations: Mutex<HashMap<ConversationId, ConversationDetail>>,
    pages: Mutex<HashMap<(ConversationId, Option<String>), MessagePage>>,
    index: Mutex<Vec<ConversationPage>>,
    deleted: Mutex<Vec<MessageId>>,
    fail_deletes: Mutex<HashSet<MessageId>>,
    fail_detail: Mutex<bool>,
    message_calls: AtomicUsize,
    list_calls: AtomicUsize,
    hold: Mutex<Option<Arc<Semaphore>>>,
    mutation_calls: AtomicUsize,
    hold_mutations: Mutex<Option<Arc<Semaphore>>>,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, detail: ConversationDetail) {
        self.conversations.lock().insert(detail.id.clone(), detail);
    }

    /// Page returned for `(id, cursor)`
    pub fn add_page(&self, id: &str, cursor: Option<&str>, page: MessagePage) {
        self.pages
            .lock()
            .insert((ConversationId::from(id), cursor.map(str::to_string)), page);
    }

    /// Index pages returned in order
    pub fn add_index_page(&self, page: ConversationPage) {
        self.index.lock().push(page);
    }

    pub fn fail_delete_of(&self, id: &str) {
        self.fail_deletes.lock().insert(MessageId::from(id));
    }

    pub fn fail_detail(&self, fail: bool) {
        *self.fail_detail.lock() = fail;
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().iter().map(|id| id.0.clone()).collect()
    }

    pub fn message_calls(&self) -> usize {
        self.message_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Hold every message fetch until [`release`](Self::release)
    pub fn hold_messages(&self) {
        *self.hold.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held fetches through
    pub fn release(&self, n: usize) {
        if let Some(hold) = self.hold.lock().as_ref() {
            hold.add_permits(n);
        }
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    /// Hold every conversation update and delete until
    /// [`release_mutations`](Self::release_mutations)
    pub fn hold_mutations(&self) {
        *self.hold_mutations.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held updates or deletes through
    pub fn release_mutations(&self, n: usize) {
        if let Some(hold) = self.hold_mutations.lock().as_ref() {
            hold.add_permits(n);
        }
    }

    async fn mutation(&self) {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold_mutations.lock().clone();
        if let Some(hold) = hold {
            hold.acquire().await.expect("semaphore closed").forget();
        }
    }

    fn not_found() -> ApiError {
        ApiError::Status {
            status: 404,
            body: "not found".to_string(),
        }
    }
}

#[async_trait]
impl ConversationService for MockService {
    async fn list_conversations(
        &self,
        _skip: usize,
        _limit: usize,
    ) -> Result<ConversationPage, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut index = self.index.lock();
        if index.is_empty() {
            return Ok(ConversationPage::default());
        }
        Ok(index.remove(0))
    }

    async fn conversation(&self, id: &ConversationId) -> Result<ConversationDetail, ApiError> {
        if *self.fail_detail.lock() {
            return Err(ApiError::Network("detail unavailable".to_string()));
        }
        self.conversations
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(Self::not_found)
    }

    async fn messages(
        &self,
        id: &ConversationId,
        _limit: usize,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ApiError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().clone();
        if let Some(hold) = hold {
            hold.acquire().await.expect("semaphore closed").forget();
        }
        self.pages
            .lock()
            .get(&(id.clone(), cursor.map(str::to_string)))
            .cloned()
            .ok_or_else(Self::not_found)
    }

    async fn update_personality(
        &self,
        id: &ConversationId,
        personality_slug: &str,
    ) -> Result<ConversationDetail, ApiError> {
        self.mutation().await;
        let mut conversations = self.conversations.lock();
        let detail = conversations.get_mut(id).ok_or_else(Self::not_found)?;
        detail.personality_slug = personality_slug.to_string();
        detail.updated_at = "2099-01-01T00:00:00".to_string();
        Ok(detail.clone())
    }

    async fn update_context(
        &self,
        id: &ConversationId,
        context: &str,
    ) -> Result<ConversationDetail, ApiError> {
        self.mutation().await;
        let mut conversations = self.conversations.lock();
        let detail = conversations.get_mut(id).ok_or_else(Self::not_found)?;
        detail.context_override = Some(context.to_string());
        Ok(detail.clone())
    }

    async fn delete_message(
        &self,
        _id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ApiError> {
        if self.fail_deletes.lock().contains(message_id) {
            return Err(ApiError::Status {
                status: 500,
                body: "delete failed".to_string(),
            });
        }
        self.deleted.lock().push(message_id.clone());
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError> {
        self.mutation().await;
        self.conversations
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(Self::not_found)
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

pub fn message(id: &str, sender: Sender, minute: u32) -> Message {
    Message::new(MessageId::from(id), sender, format!("content {id}"), at(minute))
}

pub fn detail(id: &str, updated_at: &str) -> ConversationDetail {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": format!("Conversation {id}"),
        "personality_slug": "vinhyet",
        "personality_name": "Vinh yet",
        "message_count": 0,
        "created_at": "2024-05-01T10:00:00",
        "updated_at": updated_at,
    }))
    .unwrap()
}

pub struct Fixture {
    pub store: ChatStore,
    pub transport: Arc<ScriptedTransport>,
    pub service: Arc<MockService>,
}

pub fn fixture() -> Fixture {
    fixture_with(&ClientConfig::default(), Arc::new(NoHistory))
}

pub fn fixture_with(config: &ClientConfig, history: Arc<dyn GuestHistory>) -> Fixture {
    let transport = ScriptedTransport::new();
    let service = MockService::new();
    let store = ChatStore::new(config, transport.clone(), service.clone(), history);
    Fixture {
        store,
        transport,
        service,
    }
}

/// Authenticated fixture with conversation `c1` holding `count` messages
/// (`m0`..), alternating user and assistant
pub async fn authenticated_with_messages(count: u32) -> Fixture {
    let fx = fixture();
    fx.store.switch_mode(Mode::Authenticated);
    fx.service.add_conversation(detail("c1", "2024-05-01T12:00:00"));
    let messages = (0..count)
        .map(|i| {
            let sender = if i % 2 == 0 { Sender::User } else { Sender::Assistant };
            message(&format!("m{i}"), sender, i)
        })
        .collect();
    fx.service.add_page(
        "c1",
        None,
        MessagePage {
            messages,
            has_more: false,
            next_cursor: None,
        },
    );
    fx.store
        .select_conversation(Some(ConversationId::from("c1")))
        .await
        .unwrap();
    fx
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
