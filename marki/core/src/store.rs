//! Conversation State Store
//!
//! The authoritative in-memory model of one chat session: mode, active
//! conversation, message window, conversation index, streaming buffer and
//! the selected personality.
//!
//! # State Machine
//!
//! ```text
//!   idle ──send_message──► streaming ──on_end────► (committed) ──► idle
//!                              │      ──on_error──► (errored)  ──► idle
//!                              └──────cancel──────► (cancelled)──► idle
//! ```
//!
//! # Design Philosophy
//!
//! [`ChatStore`] is a cheap clonable handle; every clone sees the same state.
//! The state lock is never held across an `.await`, so a surface can cancel,
//! select or switch modes while a send or fetch is outstanding. Each
//! operation that resumes after a suspension point re-checks an epoch (or
//! the active exchange id) and silently drops results that no longer apply.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::backend::{ApiError, ConversationService};
use crate::config::ClientConfig;
use crate::conversation::{
    Conversation, ConversationDetail, ConversationIndex, ConversationSummary, MessagePage,
    MessageWindow,
};
use crate::error::{ChatError, Result};
use crate::exchange::{
    history_payload, ExchangeCallbacks, ExchangeCanceller, ExchangeCoordinator, ExchangeId,
    ExchangeOptions, ExchangeOutcome,
};
use crate::history::GuestHistory;
use crate::messages::{
    ConversationId, ExchangeState, Message, MessageId, MessageOrigin, Mode, Sender, StoreUpdate,
};
use crate::transport::StreamTransport;

/// Capacity of the update broadcast channel
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Tunables the Store reads from the client configuration
#[derive(Clone, Debug)]
struct StoreSettings {
    message_page_size: usize,
    conversation_page_size: usize,
    default_personality: String,
}

/// How a [`ChatStore::send_message`] call ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Not started: an exchange is streaming or a conversation is loading
    Ignored,
    /// Assistant message committed
    Completed,
    /// Error notice appended
    Failed,
    /// Cancelled before a terminal frame was applied
    Cancelled,
}

/// Cloned view of the Store for rendering
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Session mode
    pub mode: Mode,
    /// Active conversation
    pub conversation: Conversation,
    /// Messages, oldest first
    pub messages: Vec<Message>,
    /// Exchange state
    pub exchange: ExchangeState,
    /// Text accumulated by the streaming exchange
    pub streaming_text: String,
    /// Older messages exist
    pub has_more_messages: bool,
    /// A conversation selection is loading
    pub loading_conversation: bool,
    /// An older page is loading
    pub loading_older_messages: bool,
    /// Conversation index, most recently updated first
    pub conversations: Vec<ConversationSummary>,
    /// More index pages exist
    pub has_more_conversations: bool,
    /// An index page is loading
    pub loading_conversations: bool,
    /// Selected personality
    pub personality: String,
}

impl StoreSnapshot {
    /// Whether an exchange is in flight
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.exchange == ExchangeState::Streaming
    }
}

/// The exchange currently allowed to mutate the Store
struct ActiveExchange {
    id: ExchangeId,
    canceller: ExchangeCanceller,
}

struct StoreState {
    mode: Mode,
    conversation: Conversation,
    window: MessageWindow,
    index: ConversationIndex,
    personality: String,
    exchange: ExchangeState,
    streaming_text: String,
    active: Option<ActiveExchange>,
    loading_conversation: bool,
    /// Bumped by mode switches; guards index and session-wide results
    session_epoch: u64,
    /// Bumped by selections and mode switches; guards conversation results
    selection_epoch: u64,
}

impl StoreState {
    fn new(personality: &str) -> Self {
        Self {
            mode: Mode::Guest,
            conversation: Conversation::draft(personality),
            window: MessageWindow::default(),
            index: ConversationIndex::default(),
            personality: personality.to_string(),
            exchange: ExchangeState::Idle,
            streaming_text: String::new(),
            active: None,
            loading_conversation: false,
            session_epoch: 0,
            selection_epoch: 0,
        }
    }

    /// Current `(session, selection)` epochs
    fn epochs(&self) -> (u64, u64) {
        (self.session_epoch, self.selection_epoch)
    }

    fn is_active(&self, id: ExchangeId) -> bool {
        self.active.as_ref().is_some_and(|active| active.id == id)
    }

    /// Cancel the in-flight exchange and return to idle
    fn abort_exchange(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        active.canceller.cancel();
        self.exchange = ExchangeState::Idle;
        self.streaming_text.clear();
        tracing::debug!(exchange = %active.id, "Exchange cancelled by store");
        true
    }

    fn finish_exchange(&mut self) {
        self.active = None;
        self.exchange = ExchangeState::Idle;
        self.streaming_text.clear();
    }

    fn reset_conversation(&mut self, default_personality: &str) {
        self.conversation = Conversation::draft(default_personality);
        self.personality = default_personality.to_string();
        self.window.clear();
        self.loading_conversation = false;
    }

    fn apply_detail(&mut self, conversation: Conversation, default_personality: &str) {
        self.personality = if conversation.personality_slug.is_empty() {
            default_personality.to_string()
        } else {
            conversation.personality_slug.clone()
        };
        self.conversation = conversation;
    }
}

struct Inner {
    state: Mutex<StoreState>,
    coordinator: ExchangeCoordinator,
    service: Arc<dyn ConversationService>,
    guest_history: Arc<dyn GuestHistory>,
    updates: broadcast::Sender<StoreUpdate>,
    settings: StoreSettings,
}

impl Inner {
    fn emit(&self, update: StoreUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

/// Clonable handle to one session's conversation state
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Inner>,
}

impl ChatStore {
    /// Create a Store in guest mode with an empty draft conversation
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn StreamTransport>,
        service: Arc<dyn ConversationService>,
        guest_history: Arc<dyn GuestHistory>,
    ) -> Self {
        let settings = StoreSettings {
            message_page_size: config.message_page_size,
            conversation_page_size: config.conversation_page_size,
            default_personality: config.default_personality.clone(),
        };
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::new(&settings.default_personality)),
                coordinator: ExchangeCoordinator::new(transport, config.history_limit),
                service,
                guest_history,
                updates,
                settings,
            }),
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Cloned view of the current state
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.inner.state.lock();
        StoreSnapshot {
            mode: state.mode,
            conversation: state.conversation.clone(),
            messages: state.window.messages().to_vec(),
            exchange: state.exchange,
            streaming_text: state.streaming_text.clone(),
            has_more_messages: state.window.has_more,
            loading_conversation: state.loading_conversation,
            loading_older_messages: state.window.loading_older,
            conversations: state.index.items().to_vec(),
            has_more_conversations: state.index.has_more,
            loading_conversations: state.index.loading,
            personality: state.personality.clone(),
        }
    }

    /// Receive change hints
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.inner.updates.subscribe()
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.state.lock().mode
    }

    /// Current exchange state
    #[must_use]
    pub fn exchange_state(&self) -> ExchangeState {
        self.inner.state.lock().exchange
    }

    // ========================================================================
    // Exchanges
    // ========================================================================

    /// Send a user message and drive the exchange to its end
    ///
    /// The message is appended optimistically with a provisional id. Returns
    /// [`SendOutcome::Ignored`] without touching state while another exchange
    /// is streaming or a conversation is loading.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for blank input or a guest send
    /// without personality; nothing is mutated in that case. Exchange
    /// failures are not errors: they end as an `Error: ...` system message.
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome> {
        let inner = &self.inner;

        let (exchange, provisional_id, start_conversation, mode, epoch) = {
            let mut state = inner.state.lock();
            if state.exchange == ExchangeState::Streaming || state.loading_conversation {
                tracing::debug!("Ignoring send while busy");
                return Ok(SendOutcome::Ignored);
            }

            let history = match state.mode {
                Mode::Guest => history_payload(
                    state.window.messages(),
                    inner.coordinator.history_limit(),
                ),
                Mode::Authenticated => Vec::new(),
            };
            let options = ExchangeOptions {
                mode: state.mode,
                conversation_id: state.conversation.id.clone(),
                personality: Some(state.personality.clone()),
                history,
            };
            let request = inner.coordinator.prepare(text, options)?;

            let user_message = Message::provisional_user(request.message.clone());
            let provisional_id = user_message.id.clone();
            state.window.push(user_message);
            state.exchange = ExchangeState::Streaming;
            state.streaming_text.clear();

            let exchange = inner.coordinator.start_exchange(request);
            state.active = Some(ActiveExchange {
                id: exchange.id(),
                canceller: exchange.canceller(),
            });

            (
                exchange,
                provisional_id,
                state.conversation.id.clone(),
                state.mode,
                state.selection_epoch,
            )
        };
        let exchange_id = exchange.id();

        inner.emit(StoreUpdate::MessagesChanged);
        inner.emit(StoreUpdate::ExchangeState(ExchangeState::Streaming));

        let mut sink = StoreSink {
            inner,
            id: exchange_id,
            provisional_id,
            conversation_id: start_conversation,
            settled: false,
        };
        let outcome = exchange.drive(&mut sink).await;
        let conversation_id = sink.conversation_id;

        // A terminal frame that lost the race with a cancel counts as cancelled
        let outcome = match outcome {
            ExchangeOutcome::Completed if sink.settled => SendOutcome::Completed,
            ExchangeOutcome::Failed if sink.settled => SendOutcome::Failed,
            _ => {
                let released = {
                    let mut state = inner.state.lock();
                    if state.is_active(exchange_id) {
                        state.finish_exchange();
                        true
                    } else {
                        false
                    }
                };
                if released {
                    inner.emit(StoreUpdate::ExchangeState(ExchangeState::Idle));
                }
                return Ok(SendOutcome::Cancelled);
            }
        };

        let still_current = {
            let state = inner.state.lock();
            state.selection_epoch == epoch && state.mode == mode
        };
        if !still_current {
            tracing::debug!(exchange = %exchange_id, "Skipping post-exchange sync for stale selection");
            return Ok(outcome);
        }

        match mode {
            Mode::Authenticated => {
                if let Some(id) = conversation_id {
                    self.refresh_conversation_metadata(&id).await;
                }
            }
            Mode::Guest => self.save_guest_history().await,
        }

        Ok(outcome)
    }

    /// Cancel the in-flight exchange
    ///
    /// The Store returns to idle immediately, the streaming buffer is cleared
    /// and the optimistic user message stays. Returns whether anything was
    /// cancelled.
    pub fn cancel_exchange(&self) -> bool {
        let cancelled = self.inner.state.lock().abort_exchange();
        if cancelled {
            self.inner.emit(StoreUpdate::StreamingText(String::new()));
            self.inner
                .emit(StoreUpdate::ExchangeState(ExchangeState::Idle));
        }
        cancelled
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Select a conversation, or `None` for a new empty one
    ///
    /// Any in-flight exchange is cancelled first. Selecting an id fetches
    /// the conversation record and the newest message page concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::WrongMode`] in guest mode and
    /// [`ChatError::Persistence`] if either fetch fails; the previously shown
    /// conversation then stays in place and the Store is idle.
    pub async fn select_conversation(&self, id: Option<ConversationId>) -> Result<()> {
        let inner = &self.inner;

        let Some(id) = id else {
            {
                let mut state = inner.state.lock();
                state.abort_exchange();
                state.selection_epoch += 1;
                state.reset_conversation(&inner.settings.default_personality);
            }
            inner.emit(StoreUpdate::ExchangeState(ExchangeState::Idle));
            inner.emit(StoreUpdate::ConversationChanged);
            inner.emit(StoreUpdate::MessagesChanged);
            return Ok(());
        };

        let epoch = {
            let mut state = inner.state.lock();
            if state.mode != Mode::Authenticated {
                return Err(ChatError::WrongMode(Mode::Authenticated));
            }
            state.abort_exchange();
            state.selection_epoch += 1;
            state.loading_conversation = true;
            state.selection_epoch
        };
        inner.emit(StoreUpdate::ExchangeState(ExchangeState::Idle));
        tracing::debug!(conversation = %id, "Selecting conversation");

        let (detail, page) = tokio::join!(
            inner.service.conversation(&id),
            inner
                .service
                .messages(&id, inner.settings.message_page_size, None),
        );

        {
            let mut state = inner.state.lock();
            if state.selection_epoch != epoch {
                tracing::debug!(conversation = %id, "Discarding stale conversation fetch");
                return Ok(());
            }
            state.loading_conversation = false;

            let (detail, page) = match (detail, page) {
                (Ok(detail), Ok(page)) => (detail, page),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(conversation = %id, error = %e, "Failed to load conversation");
                    // An older page superseded by this selection was discarded
                    state.window.loading_older = false;
                    return Err(ChatError::Persistence(e));
                }
            };

            state.apply_detail(Conversation::from(detail), &inner.settings.default_personality);
            state.window.replace(page);
        }

        inner.emit(StoreUpdate::ConversationChanged);
        inner.emit(StoreUpdate::MessagesChanged);
        Ok(())
    }

    /// Prepend the next older page of the selected conversation
    ///
    /// No-op when nothing is selected, the cursor is exhausted or a page is
    /// already loading. Returns the number of messages prepended.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] if the fetch fails; the window is
    /// left unchanged.
    pub async fn load_older_messages(&self) -> Result<usize> {
        let inner = &self.inner;

        let (id, cursor, epoch) = {
            let mut state = inner.state.lock();
            if state.mode != Mode::Authenticated || !state.window.can_load_older() {
                return Ok(0);
            }
            let (Some(id), Some(cursor)) = (
                state.conversation.id.clone(),
                state.window.next_cursor.clone(),
            ) else {
                return Ok(0);
            };
            state.window.loading_older = true;
            (id, cursor, state.selection_epoch)
        };

        let result = inner
            .service
            .messages(&id, inner.settings.message_page_size, Some(&cursor))
            .await;

        let count = {
            let mut state = inner.state.lock();
            if state.selection_epoch != epoch {
                tracing::debug!(conversation = %id, "Discarding stale older page");
                if state.conversation.id.as_ref() == Some(&id) {
                    state.window.loading_older = false;
                }
                return Ok(0);
            }
            state.window.loading_older = false;

            let page = result.map_err(|e| {
                tracing::warn!(conversation = %id, error = %e, "Failed to load older messages");
                ChatError::Persistence(e)
            })?;
            let before = state.window.len();
            state.window.prepend(page);
            state.window.len() - before
        };

        inner.emit(StoreUpdate::MessagesChanged);
        Ok(count)
    }

    /// Truncate the message list to `[0, index)`
    ///
    /// In authenticated mode the removed messages are also deleted on the
    /// server, one at a time, oldest first. System notices and messages the
    /// server never saw are skipped. The first failed delete stops the
    /// remaining ones; the local truncation stands regardless. No-op while
    /// streaming or when `index` is out of range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ChatError::Persistence`] encountered.
    pub async fn delete_messages_from_index(&self, index: usize) -> Result<()> {
        let inner = &self.inner;

        let (mode, conversation_id, removed) = {
            let mut state = inner.state.lock();
            if state.exchange == ExchangeState::Streaming || index >= state.window.len() {
                return Ok(());
            }
            let removed = state.window.truncate(index);
            (state.mode, state.conversation.id.clone(), removed)
        };
        inner.emit(StoreUpdate::MessagesChanged);

        let conversation_id = match (mode, conversation_id) {
            (Mode::Authenticated, Some(id)) => id,
            (Mode::Guest, _) => {
                self.save_guest_history().await;
                return Ok(());
            }
            (Mode::Authenticated, None) => return Ok(()),
        };

        let mut failure = None;
        for message in removed
            .iter()
            .filter(|m| m.sender != Sender::System && m.is_server_known())
        {
            if let Err(e) = inner
                .service
                .delete_message(&conversation_id, &message.id)
                .await
            {
                tracing::warn!(
                    conversation = %conversation_id,
                    message = %message.id,
                    error = %e,
                    "Failed to delete message, stopping"
                );
                failure = Some(e);
                break;
            }
        }

        self.refresh_conversation_metadata(&conversation_id).await;

        match failure {
            Some(e) => Err(ChatError::Persistence(e)),
            None => Ok(()),
        }
    }

    /// Drop all messages and cursors of the active conversation
    pub fn clear_messages(&self) {
        self.inner.state.lock().window.clear();
        self.inner.emit(StoreUpdate::MessagesChanged);
    }

    /// Load one page of the conversation index
    ///
    /// `reset` starts over from the first page. Authenticated mode only;
    /// re-entrant calls while a page is loading are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] if the fetch fails.
    pub async fn fetch_conversations(&self, reset: bool) -> Result<()> {
        let inner = &self.inner;

        let (skip, epoch) = {
            let mut state = inner.state.lock();
            if state.mode != Mode::Authenticated || state.index.loading {
                return Ok(());
            }
            if !reset && !state.index.has_more && !state.index.is_empty() {
                return Ok(());
            }
            state.index.loading = true;
            let skip = if reset { 0 } else { state.index.next_skip };
            (skip, state.session_epoch)
        };

        let result = inner
            .service
            .list_conversations(skip, inner.settings.conversation_page_size)
            .await;

        {
            let mut state = inner.state.lock();
            if state.session_epoch != epoch {
                tracing::debug!("Discarding stale conversation index page");
                return Ok(());
            }
            state.index.loading = false;
            let page = result.map_err(|e| {
                tracing::warn!(error = %e, "Failed to load conversations");
                ChatError::Persistence(e)
            })?;
            state.index.merge_page(page, reset);
        }

        inner.emit(StoreUpdate::ConversationsChanged);
        Ok(())
    }

    /// Refetch one conversation and update the index (and the active
    /// conversation, if it is the selected one)
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn refresh_conversation_metadata(&self, id: &ConversationId) {
        let inner = &self.inner;

        let epoch = {
            let state = inner.state.lock();
            if state.mode != Mode::Authenticated {
                return;
            }
            state.session_epoch
        };

        let detail = match inner.service.conversation(id).await {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(conversation = %id, error = %e, "Failed to refresh conversation");
                return;
            }
        };

        let is_active = {
            let mut state = inner.state.lock();
            if state.session_epoch != epoch {
                return;
            }
            state.index.upsert(detail.summary());
            let is_active = state.conversation.id.as_ref() == Some(id);
            if is_active {
                state.apply_detail(Conversation::from(detail), &inner.settings.default_personality);
            }
            is_active
        };

        inner.emit(StoreUpdate::ConversationsChanged);
        if is_active {
            inner.emit(StoreUpdate::ConversationChanged);
        }
    }

    /// Delete a conversation on the server and drop it from the index
    ///
    /// If it was selected, the Store switches to a new empty conversation.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::WrongMode`] in guest mode and
    /// [`ChatError::Persistence`] if the delete fails (nothing changes).
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let inner = &self.inner;

        let epoch = {
            let state = inner.state.lock();
            if state.mode != Mode::Authenticated {
                return Err(ChatError::WrongMode(Mode::Authenticated));
            }
            state.session_epoch
        };

        inner.service.delete_conversation(id).await.map_err(|e| {
            tracing::warn!(conversation = %id, error = %e, "Failed to delete conversation");
            ChatError::Persistence(e)
        })?;

        let was_selected = {
            let mut state = inner.state.lock();
            if state.session_epoch != epoch {
                tracing::debug!(conversation = %id, "Session changed during delete");
                return Ok(());
            }
            state.index.remove(id);
            state.conversation.id.as_ref() == Some(id)
        };
        inner.emit(StoreUpdate::ConversationsChanged);

        if was_selected {
            self.select_conversation(None).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Conversation settings
    // ========================================================================

    /// Choose the personality for new and guest conversations
    pub fn set_personality(&self, slug: impl Into<String>) {
        self.inner.state.lock().personality = slug.into();
        self.inner.emit(StoreUpdate::ConversationChanged);
    }

    /// Change the active conversation's personality
    ///
    /// In guest mode, or before the conversation exists, only the local
    /// selector changes.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] if the update fails.
    pub async fn update_conversation_personality(&self, slug: &str) -> Result<()> {
        let (id, epochs) = {
            let mut state = self.inner.state.lock();
            match (state.mode, state.conversation.id.clone()) {
                (Mode::Authenticated, Some(id)) => (id, state.epochs()),
                _ => {
                    state.personality = slug.to_string();
                    drop(state);
                    self.inner.emit(StoreUpdate::ConversationChanged);
                    return Ok(());
                }
            }
        };

        let result = self.inner.service.update_personality(&id, slug).await;
        self.apply_conversation_update(&id, epochs, result)
    }

    /// Replace the active conversation's context override
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::WrongMode`] in guest mode,
    /// [`ChatError::NoConversation`] before the conversation exists and
    /// [`ChatError::Persistence`] if the update fails.
    pub async fn update_context_override(&self, context: &str) -> Result<()> {
        let (id, epochs) = {
            let state = self.inner.state.lock();
            if state.mode != Mode::Authenticated {
                return Err(ChatError::WrongMode(Mode::Authenticated));
            }
            let id = state.conversation.id.clone().ok_or(ChatError::NoConversation)?;
            (id, state.epochs())
        };

        let result = self.inner.service.update_context(&id, context).await;
        self.apply_conversation_update(&id, epochs, result)
    }

    /// Fold an updated record into the index and, if still shown, the
    /// active conversation. Dropped entirely once the session has changed.
    fn apply_conversation_update(
        &self,
        id: &ConversationId,
        (session, selection): (u64, u64),
        result: std::result::Result<ConversationDetail, ApiError>,
    ) -> Result<()> {
        let detail = result.map_err(|e| {
            tracing::warn!(conversation = %id, error = %e, "Failed to update conversation");
            ChatError::Persistence(e)
        })?;

        {
            let mut state = self.inner.state.lock();
            if state.session_epoch != session {
                tracing::debug!(conversation = %id, "Session changed during update");
                return Ok(());
            }
            state.index.upsert(detail.summary());
            if state.selection_epoch == selection && state.conversation.id.as_ref() == Some(id) {
                state.apply_detail(
                    Conversation::from(detail),
                    &self.inner.settings.default_personality,
                );
            }
        }

        self.inner.emit(StoreUpdate::ConversationChanged);
        self.inner.emit(StoreUpdate::ConversationsChanged);
        Ok(())
    }

    // ========================================================================
    // Mode and guest history
    // ========================================================================

    /// Switch session mode
    ///
    /// Cancels any in-flight exchange and clears the conversation, messages,
    /// cursors, index and streaming buffer. Switching to the current mode is
    /// a no-op. Returns whether the mode changed.
    pub fn switch_mode(&self, mode: Mode) -> bool {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.mode == mode {
                return false;
            }
            state.abort_exchange();
            state.finish_exchange();
            state.session_epoch += 1;
            state.selection_epoch += 1;
            state.mode = mode;
            state.index.clear();
            state.reset_conversation(&inner.settings.default_personality);
        }

        tracing::info!(mode = %mode, "Session mode switched");
        inner.emit(StoreUpdate::ModeChanged(mode));
        inner.emit(StoreUpdate::ExchangeState(ExchangeState::Idle));
        inner.emit(StoreUpdate::ConversationChanged);
        inner.emit(StoreUpdate::ConversationsChanged);
        inner.emit(StoreUpdate::MessagesChanged);
        true
    }

    /// Load the persisted guest conversation into an empty guest Store
    ///
    /// Returns the number of messages restored.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::History`] if the history cannot be read.
    pub async fn restore_guest_history(&self) -> Result<usize> {
        let epoch = {
            let state = self.inner.state.lock();
            if state.mode != Mode::Guest || !state.window.is_empty() {
                return Ok(0);
            }
            state.session_epoch
        };

        let messages = self.inner.guest_history.load().await?;

        let count = {
            let mut state = self.inner.state.lock();
            if state.session_epoch != epoch
                || !state.window.is_empty()
                || state.exchange == ExchangeState::Streaming
            {
                return Ok(0);
            }
            let count = messages.len();
            state.window.replace(MessagePage {
                messages,
                has_more: false,
                next_cursor: None,
            });
            count
        };

        if count > 0 {
            tracing::debug!(count, "Restored guest history");
            self.inner.emit(StoreUpdate::MessagesChanged);
        }
        Ok(count)
    }

    async fn save_guest_history(&self) {
        let messages = {
            let state = self.inner.state.lock();
            if state.mode != Mode::Guest {
                return;
            }
            state.window.messages().to_vec()
        };
        if let Err(e) = self.inner.guest_history.save(&messages).await {
            tracing::warn!(error = %e, "Failed to save guest history");
        }
    }

    /// Forget the persisted guest conversation
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::History`] if the history cannot be removed.
    pub async fn clear_guest_history(&self) -> Result<()> {
        self.inner.guest_history.clear().await?;
        tracing::debug!("Cleared guest history");
        Ok(())
    }
}

// ============================================================================
// Exchange callbacks
// ============================================================================

/// Applies one exchange's callbacks to the Store
struct StoreSink<'a> {
    inner: &'a Inner,
    id: ExchangeId,
    provisional_id: MessageId,
    conversation_id: Option<ConversationId>,
    /// A terminal callback was applied
    settled: bool,
}

impl StoreSink<'_> {
    fn note_conversation(&mut self, conversation_id: Option<ConversationId>) {
        if conversation_id.is_some() {
            self.conversation_id = conversation_id;
        }
    }
}

impl ExchangeCallbacks for StoreSink<'_> {
    fn on_start(
        &mut self,
        conversation_id: Option<ConversationId>,
        user_message_id: Option<MessageId>,
    ) {
        let mut conversation_changed = false;
        {
            let mut state = self.inner.state.lock();
            if !state.is_active(self.id) {
                tracing::debug!(exchange = %self.id, "Discarding stale start");
                return;
            }
            if let Some(server_id) = user_message_id {
                if !state.window.reconcile(&self.provisional_id, server_id) {
                    tracing::debug!(exchange = %self.id, "Provisional message no longer present");
                }
            }
            if let Some(ref id) = conversation_id {
                if state.mode == Mode::Authenticated && state.conversation.id.is_none() {
                    tracing::debug!(exchange = %self.id, conversation = %id, "Conversation created");
                    state.conversation.id = Some(id.clone());
                    conversation_changed = true;
                }
            }
        }
        self.note_conversation(conversation_id);

        self.inner.emit(StoreUpdate::MessagesChanged);
        if conversation_changed {
            self.inner.emit(StoreUpdate::ConversationChanged);
        }
    }

    fn on_chunk(&mut self, text: &str) {
        let buffer = {
            let mut state = self.inner.state.lock();
            if !state.is_active(self.id) {
                return;
            }
            state.streaming_text.push_str(text);
            state.streaming_text.clone()
        };
        self.inner.emit(StoreUpdate::StreamingText(buffer));
    }

    fn on_end(
        &mut self,
        full_text: String,
        assistant_message_id: Option<MessageId>,
        conversation_id: Option<ConversationId>,
    ) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_active(self.id) {
                tracing::debug!(exchange = %self.id, "Discarding stale end");
                return;
            }

            let content = if state.streaming_text.is_empty() {
                full_text
            } else {
                std::mem::take(&mut state.streaming_text)
            };
            let mut message = match assistant_message_id {
                Some(id) => Message::new(id, Sender::Assistant, content, Utc::now()),
                None => {
                    let mut message =
                        Message::new(MessageId::local("ai"), Sender::Assistant, content, Utc::now());
                    message.origin = MessageOrigin::Local;
                    message
                }
            };
            // A clock running behind the server must not break ordering
            if let Some(last) = state.window.messages().last() {
                if message.created_at < last.created_at {
                    message.created_at = last.created_at;
                }
            }
            state.window.push(message);
            state.finish_exchange();
        }
        self.settled = true;
        self.note_conversation(conversation_id);

        self.inner.emit(StoreUpdate::MessagesChanged);
        self.inner.emit(StoreUpdate::StreamingText(String::new()));
        self.inner
            .emit(StoreUpdate::ExchangeState(ExchangeState::Idle));
    }

    fn on_error(&mut self, message: String) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_active(self.id) {
                tracing::debug!(exchange = %self.id, "Discarding stale error");
                return;
            }
            tracing::warn!(exchange = %self.id, error = %message, "Exchange failed");
            let mut notice = Message::system_notice(format!("Error: {message}"));
            if let Some(last) = state.window.messages().last() {
                if notice.created_at < last.created_at {
                    notice.created_at = last.created_at;
                }
            }
            state.window.push(notice);
            state.finish_exchange();
        }
        self.settled = true;

        self.inner.emit(StoreUpdate::MessagesChanged);
        self.inner.emit(StoreUpdate::StreamingText(String::new()));
        self.inner
            .emit(StoreUpdate::ExchangeState(ExchangeState::Idle));
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::conversation::ConversationPage;
    use crate::history::NoHistory;
    use crate::transport::{ExchangeRequest, TransportError, TransportItem};

    /// Transport that refuses every connection
    struct Refusing;

    #[async_trait]
    impl StreamTransport for Refusing {
        fn name(&self) -> &str {
            "Refusing"
        }

        async fn open(
            &self,
            _request: &ExchangeRequest,
            _cancel: CancellationToken,
        ) -> std::result::Result<mpsc::Receiver<TransportItem>, TransportError> {
            Err(TransportError::ConnectionFailed("refused".to_string()))
        }
    }

    /// Persistence that is always down
    struct Offline;

    fn down<T>() -> std::result::Result<T, ApiError> {
        Err(ApiError::Network("offline".to_string()))
    }

    #[async_trait]
    impl ConversationService for Offline {
        async fn list_conversations(
            &self,
            _: usize,
            _: usize,
        ) -> std::result::Result<ConversationPage, ApiError> {
            down()
        }
        async fn conversation(
            &self,
            _: &ConversationId,
        ) -> std::result::Result<ConversationDetail, ApiError> {
            down()
        }
        async fn messages(
            &self,
            _: &ConversationId,
            _: usize,
            _: Option<&str>,
        ) -> std::result::Result<MessagePage, ApiError> {
            down()
        }
        async fn update_personality(
            &self,
            _: &ConversationId,
            _: &str,
        ) -> std::result::Result<ConversationDetail, ApiError> {
            down()
        }
        async fn update_context(
            &self,
            _: &ConversationId,
            _: &str,
        ) -> std::result::Result<ConversationDetail, ApiError> {
            down()
        }
        async fn delete_message(
            &self,
            _: &ConversationId,
            _: &MessageId,
        ) -> std::result::Result<(), ApiError> {
            down()
        }
        async fn delete_conversation(
            &self,
            _: &ConversationId,
        ) -> std::result::Result<(), ApiError> {
            down()
        }
    }

    fn store() -> ChatStore {
        ChatStore::new(
            &ClientConfig::default(),
            Arc::new(Refusing),
            Arc::new(Offline),
            Arc::new(NoHistory),
        )
    }

    #[test]
    fn test_initial_state() {
        let snapshot = store().snapshot();
        assert_eq!(snapshot.mode, Mode::Guest);
        assert!(snapshot.messages.is_empty());
        assert!(!snapshot.is_streaming());
        assert_eq!(snapshot.personality, "markiai");
        assert!(snapshot.conversation.id.is_none());
    }

    #[tokio::test]
    async fn test_blank_message_rejected_without_mutation() {
        let store = store();
        let result = store.send_message("   ").await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert!(store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_becomes_system_message() {
        let store = store();
        let outcome = store.send_message("hello").await.unwrap();
        assert_eq!(outcome, SendOutcome::Failed);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].sender, Sender::User);
        assert_eq!(snapshot.messages[1].sender, Sender::System);
        assert_eq!(
            snapshot.messages[1].content,
            "Error: connection failed: refused"
        );
        assert!(!snapshot.is_streaming());
    }

    #[tokio::test]
    async fn test_switch_mode_is_idempotent() {
        let store = store();
        let mut updates = store.subscribe();

        assert!(!store.switch_mode(Mode::Guest));
        assert!(store.switch_mode(Mode::Authenticated));
        assert!(!store.switch_mode(Mode::Authenticated));
        assert_eq!(
            updates.try_recv().unwrap(),
            StoreUpdate::ModeChanged(Mode::Authenticated)
        );
    }

    #[tokio::test]
    async fn test_selection_failure_keeps_store_usable() {
        let store = store();
        store.switch_mode(Mode::Authenticated);

        let result = store
            .select_conversation(Some(ConversationId::from("c1")))
            .await;
        assert!(matches!(result, Err(ChatError::Persistence(_))));

        let snapshot = store.snapshot();
        assert!(!snapshot.loading_conversation);
        assert!(snapshot.conversation.id.is_none());
    }

    #[tokio::test]
    async fn test_guest_cannot_select_or_edit_context() {
        let store = store();
        assert!(matches!(
            store
                .select_conversation(Some(ConversationId::from("c1")))
                .await,
            Err(ChatError::WrongMode(Mode::Authenticated))
        ));
        assert!(matches!(
            store.update_context_override("be brief").await,
            Err(ChatError::WrongMode(Mode::Authenticated))
        ));
    }

    #[tokio::test]
    async fn test_personality_is_local_without_conversation() {
        let store = store();
        store.update_conversation_personality("vinhyet").await.unwrap();
        assert_eq!(store.snapshot().personality, "vinhyet");
    }

    #[test]
    fn test_cancel_without_exchange() {
        assert!(!store().cancel_exchange());
    }

    #[test]
    fn test_set_personality_notifies() {
        let store = store();
        let mut updates = store.subscribe();

        store.set_personality("vinhyet");

        assert_eq!(store.snapshot().personality, "vinhyet");
        assert_eq!(updates.try_recv().unwrap(), StoreUpdate::ConversationChanged);
    }

    #[test]
    fn test_clear_messages_resets_cursors() {
        let store = store();
        store.inner.state.lock().window.replace(MessagePage {
            messages: vec![
                Message::provisional_user("one"),
                Message::provisional_user("two"),
            ],
            has_more: true,
            next_cursor: Some("older".to_string()),
        });
        let mut updates = store.subscribe();

        store.clear_messages();

        let snapshot = store.snapshot();
        assert!(snapshot.messages.is_empty());
        assert!(!snapshot.has_more_messages);
        assert!(!snapshot.loading_older_messages);
        assert!(store.inner.state.lock().window.next_cursor.is_none());
        assert_eq!(updates.try_recv().unwrap(), StoreUpdate::MessagesChanged);
    }
}
