//! Frame Protocol
//!
//! Wire format of one streaming exchange. The backend answers the exchange
//! request with a server-sent event stream:
//!
//! ```text
//! event: start
//! data: {"conversation_id":"c1","user_message_id":"u1"}
//!
//! event: chunk
//! data: {"conversation_id":"c1","content":"Hel"}
//!
//! event: end
//! data: {"conversation_id":"c1","content":"Hello","ai_message_id":"a1"}
//! ```
//!
//! Events are separated by a blank line. [`SseDecoder`] turns bytes into
//! [`RawEvent`]s; [`Frame::decode`] turns a raw event into a typed [`Frame`].
//! Chunks are incremental: each `chunk.content` is appended to what came before.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{ConversationId, MessageId, Sender};

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Event separator after carriage returns are stripped
const EVENT_SEPARATOR: &[u8] = b"\n\n";

/// One prior message sent along with a guest exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// `user` or `ai`
    pub sender: Sender,
    /// Message content
    pub content: String,
}

/// Body of the streaming exchange request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    /// The user's message
    pub message: String,
    /// Personality selector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personality_slug: Option<String>,
    /// Target conversation (absent = create new)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Bounded history, guest mode only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_history: Option<Vec<HistoryEntry>>,
}

/// One undecoded server-sent event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    /// Event name (`start`, `chunk`, `end`, `error`)
    pub event: String,
    /// Data field (multi-line data joined with `\n`)
    pub data: String,
}

impl RawEvent {
    /// Create a raw event
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// A typed protocol frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Exchange accepted
    Start {
        /// Conversation the exchange belongs to (new or existing)
        conversation_id: Option<ConversationId>,
        /// Server id of the user message
        user_message_id: Option<MessageId>,
    },
    /// Incremental text
    Chunk {
        /// Conversation the exchange belongs to
        conversation_id: Option<ConversationId>,
        /// Text to append
        text: String,
    },
    /// Response complete
    End {
        /// Complete response text
        full_text: String,
        /// Server id of the assistant message
        assistant_message_id: Option<MessageId>,
        /// Conversation the exchange belongs to
        conversation_id: Option<ConversationId>,
    },
    /// Backend reported a failure
    Error {
        /// Error description
        message: String,
    },
}

impl Frame {
    /// Whether no frame may follow this one
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }

    /// Frame name as it appears on the wire
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Chunk { .. } => "chunk",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
        }
    }

    /// Decode a raw event into a typed frame
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for unknown event names, empty data or a
    /// payload that does not match the event's schema.
    pub fn decode(raw: &RawEvent) -> Result<Self, DecodeError> {
        if raw.data.trim().is_empty() {
            return Err(DecodeError::MissingData(raw.event.clone()));
        }

        let frame = match raw.event.as_str() {
            "start" => {
                let p: StartPayload = parse(raw)?;
                Self::Start {
                    conversation_id: p.conversation_id,
                    user_message_id: p.user_message_id,
                }
            }
            "chunk" => {
                let p: ChunkPayload = parse(raw)?;
                Self::Chunk {
                    conversation_id: p.conversation_id,
                    text: p.content,
                }
            }
            "end" => {
                let p: EndPayload = parse(raw)?;
                Self::End {
                    full_text: p.content,
                    assistant_message_id: p.ai_message_id,
                    conversation_id: p.conversation_id,
                }
            }
            "error" => {
                let p: ErrorPayload = parse(raw)?;
                Self::Error { message: p.message }
            }
            other => return Err(DecodeError::UnknownEvent(other.to_string())),
        };

        Ok(frame)
    }
}

/// A single wire unit could not be decoded
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Event name is not part of the protocol
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    /// Event carried no data
    #[error("event {0} has no data")]
    MissingData(String),
    /// Payload is not valid JSON for this event
    #[error("malformed {event} payload: {reason}")]
    Malformed {
        /// Event name
        event: String,
        /// Parser message
        reason: String,
    },
}

#[derive(Deserialize)]
struct StartPayload {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    user_message_id: Option<MessageId>,
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    content: String,
}

#[derive(Deserialize)]
struct EndPayload {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    ai_message_id: Option<MessageId>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
}

fn parse<T: serde::de::DeserializeOwned>(raw: &RawEvent) -> Result<T, DecodeError> {
    serde_json::from_str(&raw.data).map_err(|e| DecodeError::Malformed {
        event: raw.event.clone(),
        reason: e.to_string(),
    })
}

/// Decoder state machine for server-sent events
///
/// Buffers incoming bytes and yields complete events. A trailing partial
/// event stays buffered until more bytes arrive.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend(data.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Get the number of bytes not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next complete event
    ///
    /// Blocks consisting only of comments or blank lines are skipped.
    pub fn next_event(&mut self) -> Option<RawEvent> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let end = pending
                .windows(EVENT_SEPARATOR.len())
                .position(|w| w == EVENT_SEPARATOR)?;

            let block = String::from_utf8_lossy(&pending[..end]).into_owned();
            self.read_pos += end + EVENT_SEPARATOR.len();

            if let Some(event) = parse_block(&block) {
                return Some(event);
            }
        }
    }

    /// Flush a final event that was not followed by a blank line
    pub fn finish(&mut self) -> Option<RawEvent> {
        let rest = String::from_utf8_lossy(&self.buffer[self.read_pos..]).into_owned();
        self.clear();
        parse_block(rest.trim_end_matches('\n'))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

fn parse_block(block: &str) -> Option<RawEvent> {
    let mut event: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(RawEvent {
        event: event.unwrap_or("message").to_string(),
        data: data.join("\n"),
    })
}
