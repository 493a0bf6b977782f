//! Exchange Coordinator Implementation
//!
//! Drives one user-turn-to-assistant-turn exchange on top of the
//! [`StreamAdapter`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::messages::{ConversationId, Message, MessageId, Mode, Sender};
use crate::transport::{
    ExchangeRequest, Frame, FrameHandle, HistoryEntry, StreamAdapter, StreamTransport,
    TransportError,
};

/// Default cap on the guest history payload
pub const DEFAULT_HISTORY_LIMIT: usize = 40;

// ============================================================================
// Request construction
// ============================================================================

/// Input rejected before any network call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Message is empty after trimming
    #[error("message is empty")]
    EmptyMessage,
    /// Guest exchanges need an explicit personality
    #[error("please choose a personality for this conversation")]
    MissingPersonality,
}

/// Options for one exchange
#[derive(Clone, Debug, Default)]
pub struct ExchangeOptions {
    /// Session mode the exchange runs in
    pub mode: Mode,
    /// Target conversation (absent = create new)
    pub conversation_id: Option<ConversationId>,
    /// Personality selector
    pub personality: Option<String>,
    /// Prior messages; sent only in guest mode
    pub history: Vec<HistoryEntry>,
}

/// Build the guest history payload: the last `limit` non-system messages
#[must_use]
pub fn history_payload(messages: &[Message], limit: usize) -> Vec<HistoryEntry> {
    let eligible: Vec<&Message> = messages
        .iter()
        .filter(|m| m.sender != Sender::System)
        .collect();
    let start = eligible.len().saturating_sub(limit);

    eligible[start..]
        .iter()
        .map(|m| HistoryEntry {
            sender: m.sender,
            content: m.content.clone(),
        })
        .collect()
}

// ============================================================================
// Exchange events
// ============================================================================

/// Identifier of one exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange_{}", self.0)
    }
}

/// Sealed event type of an exchange
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// Backend accepted the exchange
    Started {
        /// Conversation the exchange belongs to
        conversation_id: Option<ConversationId>,
        /// Server id for the user's message
        user_message_id: Option<MessageId>,
    },
    /// Incremental response text
    Chunk {
        /// Text to append
        text: String,
    },
    /// Response complete (terminal)
    Ended {
        /// Complete response text as reported by the backend
        full_text: String,
        /// Server id for the assistant message
        assistant_message_id: Option<MessageId>,
        /// Conversation the exchange belongs to
        conversation_id: Option<ConversationId>,
    },
    /// Exchange failed (terminal)
    Failed {
        /// Error description
        message: String,
    },
}

impl ExchangeEvent {
    /// Whether no event may follow this one
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Failed { .. })
    }
}

impl From<Frame> for ExchangeEvent {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Start {
                conversation_id,
                user_message_id,
            } => Self::Started {
                conversation_id,
                user_message_id,
            },
            Frame::Chunk { text, .. } => Self::Chunk { text },
            Frame::End {
                full_text,
                assistant_message_id,
                conversation_id,
            } => Self::Ended {
                full_text,
                assistant_message_id,
                conversation_id,
            },
            Frame::Error { message } => Self::Failed { message },
        }
    }
}

/// How an exchange finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// `on_end` was invoked
    Completed,
    /// `on_error` was invoked
    Failed,
    /// Cancelled; no terminal callback was invoked
    Cancelled,
}

/// Callback slots an exchange dispatches to, in frame arrival order
pub trait ExchangeCallbacks {
    /// Backend accepted the exchange
    fn on_start(
        &mut self,
        conversation_id: Option<ConversationId>,
        user_message_id: Option<MessageId>,
    );

    /// Incremental text arrived
    fn on_chunk(&mut self, text: &str);

    /// Response complete; terminal
    fn on_end(
        &mut self,
        full_text: String,
        assistant_message_id: Option<MessageId>,
        conversation_id: Option<ConversationId>,
    );

    /// Exchange failed; terminal
    fn on_error(&mut self, message: String);
}

// ============================================================================
// Exchange
// ============================================================================

/// Cancels one exchange from anywhere
#[derive(Clone, Debug)]
pub struct ExchangeCanceller {
    id: ExchangeId,
    token: CancellationToken,
}

impl ExchangeCanceller {
    /// Exchange this canceller belongs to
    #[must_use]
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Cancel the exchange; no further event is delivered
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum Stage {
    /// Not opened yet; opens on first poll
    Pending(ExchangeRequest),
    /// Frames flowing
    Open(FrameHandle),
    /// Terminal, cancelled or failed to open
    Done,
}

/// One in-flight exchange, consumed as a lazy sequence of events
pub struct Exchange {
    id: ExchangeId,
    adapter: Arc<StreamAdapter>,
    cancel: CancellationToken,
    stage: Stage,
}

impl Exchange {
    /// Exchange id
    #[must_use]
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Handle for cancelling this exchange
    #[must_use]
    pub fn canceller(&self) -> ExchangeCanceller {
        ExchangeCanceller {
            id: self.id,
            token: self.cancel.clone(),
        }
    }

    /// Next event; `None` after the terminal event or after cancellation
    pub async fn next_event(&mut self) -> Option<ExchangeEvent> {
        if self.cancel.is_cancelled() {
            self.finish();
            return None;
        }

        let mut handle = match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Pending(request) => match self.adapter.open(&request, self.cancel.clone()).await
            {
                Ok(handle) => handle,
                Err(TransportError::Cancelled | TransportError::Superseded) => {
                    tracing::debug!(exchange = %self.id, "Exchange cancelled while connecting");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(exchange = %self.id, error = %e, "Failed to open exchange");
                    return Some(ExchangeEvent::Failed {
                        message: e.to_string(),
                    });
                }
            },
            Stage::Open(handle) => handle,
            Stage::Done => return None,
        };

        let Some(frame) = handle.next_frame().await else {
            self.adapter.release(handle.id());
            return None;
        };

        let event = ExchangeEvent::from(frame);
        if event.is_terminal() {
            self.adapter.release(handle.id());
        } else {
            self.stage = Stage::Open(handle);
        }
        Some(event)
    }

    /// Dispatch events to `callbacks` until the exchange terminates
    ///
    /// Exactly one of `on_end`/`on_error` is invoked unless the exchange is
    /// cancelled first, in which case neither is.
    pub async fn drive<C: ExchangeCallbacks + ?Sized>(
        mut self,
        callbacks: &mut C,
    ) -> ExchangeOutcome {
        while let Some(event) = self.next_event().await {
            if self.cancel.is_cancelled() {
                break;
            }
            match event {
                ExchangeEvent::Started {
                    conversation_id,
                    user_message_id,
                } => callbacks.on_start(conversation_id, user_message_id),
                ExchangeEvent::Chunk { text } => callbacks.on_chunk(&text),
                ExchangeEvent::Ended {
                    full_text,
                    assistant_message_id,
                    conversation_id,
                } => {
                    callbacks.on_end(full_text, assistant_message_id, conversation_id);
                    return ExchangeOutcome::Completed;
                }
                ExchangeEvent::Failed { message } => {
                    callbacks.on_error(message);
                    return ExchangeOutcome::Failed;
                }
            }
        }

        tracing::debug!(exchange = %self.id, "Exchange ended without terminal callback");
        ExchangeOutcome::Cancelled
    }

    fn finish(&mut self) {
        if let Stage::Open(handle) = std::mem::replace(&mut self.stage, Stage::Done) {
            handle.cancel();
            self.adapter.release(handle.id());
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Builds exchange requests and starts exchanges
pub struct ExchangeCoordinator {
    adapter: Arc<StreamAdapter>,
    history_limit: usize,
    next_id: AtomicU64,
}

impl ExchangeCoordinator {
    /// Create a coordinator over a transport
    pub fn new(transport: Arc<dyn StreamTransport>, history_limit: usize) -> Self {
        Self {
            adapter: Arc::new(StreamAdapter::new(transport)),
            history_limit,
            next_id: AtomicU64::new(1),
        }
    }

    /// Maximum number of history entries sent with a guest exchange
    #[must_use]
    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Validate input and build the outbound request
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyMessage`] for blank input and
    /// [`ValidationError::MissingPersonality`] for a guest exchange without
    /// a selector.
    pub fn prepare(
        &self,
        text: &str,
        options: ExchangeOptions,
    ) -> Result<ExchangeRequest, ValidationError> {
        let message = text.trim();
        if message.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }

        let personality = options
            .personality
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let message_history = match options.mode {
            Mode::Guest => {
                if personality.is_none() {
                    return Err(ValidationError::MissingPersonality);
                }
                let mut history = options.history;
                let excess = history.len().saturating_sub(self.history_limit);
                history.drain(..excess);
                (!history.is_empty()).then_some(history)
            }
            Mode::Authenticated => None,
        };

        Ok(ExchangeRequest {
            message: message.to_string(),
            personality_slug: personality,
            conversation_id: options.conversation_id,
            message_history,
        })
    }

    /// Start an exchange
    ///
    /// The transport is opened lazily on the first [`Exchange::next_event`];
    /// an open failure is reported as a single `Failed` event. Any exchange
    /// still open on this coordinator is cancelled when the new one opens.
    pub fn start_exchange(&self, request: ExchangeRequest) -> Exchange {
        let id = ExchangeId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(exchange = %id, conversation = ?request.conversation_id, "Starting exchange");

        Exchange {
            id,
            adapter: Arc::clone(&self.adapter),
            cancel: CancellationToken::new(),
            stage: Stage::Pending(request),
        }
    }

    /// Cancel an exchange
    pub fn cancel_exchange(&self, canceller: &ExchangeCanceller) {
        tracing::debug!(exchange = %canceller.id(), "Cancelling exchange");
        canceller.cancel();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{RawEvent, TransportItem};

    /// Transport that replays one fixed script per open
    struct ScriptTransport {
        script: Vec<TransportItem>,
        fail: bool,
        opened: Mutex<Vec<ExchangeRequest>>,
    }

    impl ScriptTransport {
        fn new(script: Vec<TransportItem>) -> Arc<Self> {
            Arc::new(Self {
                script,
                fail: false,
                opened: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptTransport {
        fn name(&self) -> &str {
            "Script"
        }

        async fn open(
            &self,
            request: &ExchangeRequest,
            _cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<TransportItem>, TransportError> {
            self.opened.lock().push(request.clone());
            if self.fail {
                return Err(TransportError::ConnectionFailed("refused".to_string()));
            }
            let (tx, rx) = mpsc::channel(self.script.len().max(1));
            for item in &self.script {
                tx.try_send(item.clone()).unwrap();
            }
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl ExchangeCallbacks for Recorder {
        fn on_start(&mut self, _: Option<ConversationId>, user_message_id: Option<MessageId>) {
            self.calls
                .push(format!("start:{}", user_message_id.map(|id| id.0).unwrap_or_default()));
        }

        fn on_chunk(&mut self, text: &str) {
            self.calls.push(format!("chunk:{text}"));
        }

        fn on_end(&mut self, full_text: String, _: Option<MessageId>, _: Option<ConversationId>) {
            self.calls.push(format!("end:{full_text}"));
        }

        fn on_error(&mut self, message: String) {
            self.calls.push(format!("error:{message}"));
        }
    }

    fn event(name: &str, data: &str) -> TransportItem {
        TransportItem::Event(RawEvent::new(name, data))
    }

    fn guest_options(history: Vec<HistoryEntry>) -> ExchangeOptions {
        ExchangeOptions {
            mode: Mode::Guest,
            personality: Some("markiai".to_string()),
            history,
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_rejects_empty() {
        let coordinator = ExchangeCoordinator::new(ScriptTransport::new(vec![]), 40);
        assert_eq!(
            coordinator.prepare("   ", guest_options(vec![])),
            Err(ValidationError::EmptyMessage)
        );
    }

    #[test]
    fn test_prepare_requires_personality_in_guest_mode() {
        let coordinator = ExchangeCoordinator::new(ScriptTransport::new(vec![]), 40);
        let options = ExchangeOptions {
            mode: Mode::Guest,
            personality: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            coordinator.prepare("hi", options),
            Err(ValidationError::MissingPersonality)
        );

        let authenticated = ExchangeOptions {
            mode: Mode::Authenticated,
            ..Default::default()
        };
        assert!(coordinator.prepare("hi", authenticated).is_ok());
    }

    #[test]
    fn test_prepare_caps_history_and_drops_it_when_authenticated() {
        let coordinator = ExchangeCoordinator::new(ScriptTransport::new(vec![]), 2);
        let history: Vec<HistoryEntry> = (0..5)
            .map(|i| HistoryEntry {
                sender: Sender::User,
                content: format!("m{i}"),
            })
            .collect();

        let request = coordinator
            .prepare(" hello ", guest_options(history.clone()))
            .unwrap();
        assert_eq!(request.message, "hello");
        let sent: Vec<_> = request
            .message_history
            .unwrap()
            .into_iter()
            .map(|h| h.content)
            .collect();
        assert_eq!(sent, vec!["m3", "m4"]);

        let options = ExchangeOptions {
            mode: Mode::Authenticated,
            history,
            conversation_id: Some(ConversationId::from("c1")),
            ..Default::default()
        };
        let request = coordinator.prepare("hello", options).unwrap();
        assert!(request.message_history.is_none());
        assert_eq!(request.conversation_id, Some(ConversationId::from("c1")));
    }

    #[test]
    fn test_history_payload_skips_system_messages() {
        let messages = vec![
            Message::provisional_user("one"),
            Message::system_notice("Error: boom"),
            Message::new(
                MessageId::from("a1"),
                Sender::Assistant,
                "two",
                chrono::Utc::now(),
            ),
        ];
        let payload = history_payload(&messages, 40);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[1].sender, Sender::Assistant);

        assert_eq!(history_payload(&messages, 1).len(), 1);
    }

    #[tokio::test]
    async fn test_drive_dispatches_in_order() {
        let transport = ScriptTransport::new(vec![
            event("start", r#"{"user_message_id":"u1"}"#),
            event("chunk", r#"{"content":"Hel"}"#),
            event("chunk", r#"{"content":"lo"}"#),
            event("end", r#"{"content":"Hello"}"#),
        ]);
        let coordinator = ExchangeCoordinator::new(transport, 40);
        let exchange = coordinator.start_exchange(ExchangeRequest::default());

        let mut recorder = Recorder::default();
        let outcome = exchange.drive(&mut recorder).await;

        assert_eq!(outcome, ExchangeOutcome::Completed);
        assert_eq!(
            recorder.calls,
            vec!["start:u1", "chunk:Hel", "chunk:lo", "end:Hello"]
        );
    }

    #[tokio::test]
    async fn test_open_failure_is_single_error() {
        let transport = Arc::new(ScriptTransport {
            script: vec![],
            fail: true,
            opened: Mutex::new(Vec::new()),
        });
        let coordinator = ExchangeCoordinator::new(transport, 40);
        let exchange = coordinator.start_exchange(ExchangeRequest::default());

        let mut recorder = Recorder::default();
        let outcome = exchange.drive(&mut recorder).await;

        assert_eq!(outcome, ExchangeOutcome::Failed);
        assert_eq!(recorder.calls, vec!["error:connection failed: refused"]);
    }

    #[tokio::test]
    async fn test_cancel_before_terminal_suppresses_callbacks() {
        let transport = ScriptTransport::new(vec![
            event("start", "{}"),
            event("chunk", r#"{"content":"a"}"#),
            event("end", r#"{"content":"a"}"#),
        ]);
        let coordinator = ExchangeCoordinator::new(transport, 40);
        let mut exchange = coordinator.start_exchange(ExchangeRequest::default());
        let canceller = exchange.canceller();

        assert!(matches!(
            exchange.next_event().await,
            Some(ExchangeEvent::Started { .. })
        ));
        coordinator.cancel_exchange(&canceller);
        assert!(exchange.next_event().await.is_none());

        let mut recorder = Recorder::default();
        assert_eq!(exchange.drive(&mut recorder).await, ExchangeOutcome::Cancelled);
        assert!(recorder.calls.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_open_never_connects() {
        let transport = ScriptTransport::new(vec![event("start", "{}")]);
        let coordinator = ExchangeCoordinator::new(Arc::clone(&transport) as Arc<dyn StreamTransport>, 40);
        let mut exchange = coordinator.start_exchange(ExchangeRequest::default());
        exchange.canceller().cancel();

        assert!(exchange.next_event().await.is_none());
        assert!(transport.opened.lock().is_empty());
    }
}
