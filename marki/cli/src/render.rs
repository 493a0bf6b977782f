//! Terminal rendering of Store updates
//!
//! Streaming text is printed as it grows. Finished assistant replies and
//! error notices are printed when they land in the message list; user
//! messages are not echoed.

use std::io::Write;

use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use marki_core::{ChatStore, Message, MessageId, Sender, StoreUpdate};

/// Messages appended after `last`
///
/// Returns `None` when `last` is no longer in the list (truncated, replaced
/// or reconciled); the caller should resync without printing.
pub fn appended<'a>(messages: &'a [Message], last: Option<&MessageId>) -> Option<&'a [Message]> {
    match last {
        None => Some(messages),
        Some(last) => messages
            .iter()
            .position(|m| &m.id == last)
            .map(|pos| &messages[pos + 1..]),
    }
}

/// Label for a sender
pub fn label(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "you",
        Sender::Assistant => "marki",
        Sender::System => "system",
    }
}

/// Follows one Store and writes to stdout
pub struct Transcript {
    store: ChatStore,
    last: Option<MessageId>,
    streamed: usize,
    resync: bool,
}

impl Transcript {
    pub fn new(store: ChatStore) -> Self {
        let last = store.snapshot().messages.last().map(|m| m.id.clone());
        Self {
            store,
            last,
            streamed: 0,
            resync: false,
        }
    }

    /// Print updates until the Store is dropped
    pub async fn run(mut self, updates: broadcast::Receiver<StoreUpdate>) {
        let mut updates = BroadcastStream::new(updates);
        while let Some(update) = updates.next().await {
            match update {
                Ok(update) => self.apply(update),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Renderer fell behind");
                    self.resync = true;
                }
            }
        }
    }

    fn apply(&mut self, update: StoreUpdate) {
        let mut out = std::io::stdout().lock();
        match update {
            StoreUpdate::StreamingText(text) => {
                if text.len() > self.streamed && text.is_char_boundary(self.streamed) {
                    let _ = write!(out, "{}", &text[self.streamed..]);
                    let _ = out.flush();
                }
                if !text.is_empty() {
                    self.streamed = text.len();
                }
            }
            // A new conversation id while streaming is the reply's own
            StoreUpdate::ConversationChanged => {
                if !self.store.snapshot().is_streaming() {
                    self.resync = true;
                }
            }
            StoreUpdate::MessagesChanged => {
                let snapshot = self.store.snapshot();
                let messages = &snapshot.messages;
                let fresh = if self.resync {
                    None
                } else {
                    appended(messages, self.last.as_ref())
                };
                for message in fresh.unwrap_or_default() {
                    match message.sender {
                        Sender::User => {}
                        Sender::Assistant if self.streamed > 0 => {
                            let _ = writeln!(out);
                        }
                        Sender::Assistant => {
                            let _ = writeln!(out, "{}", message.content);
                        }
                        Sender::System => {
                            if self.streamed > 0 {
                                let _ = writeln!(out);
                            }
                            let _ = writeln!(out, "! {}", message.content);
                        }
                    }
                    if message.sender != Sender::User {
                        self.streamed = 0;
                    }
                }
                self.last = messages.last().map(|m| m.id.clone());
                self.resync = false;
            }
            StoreUpdate::ModeChanged(mode) => {
                let _ = writeln!(out, "-- {mode} mode --");
                self.streamed = 0;
            }
            StoreUpdate::ExchangeState(_) | StoreUpdate::ConversationsChanged => {}
        }
    }
}
