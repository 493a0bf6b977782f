//! Conversations, the conversation index and the message window
//!
//! # Design Philosophy
//!
//! These are plain data structures with their invariants enforced by
//! construction: the index never holds two summaries with the same id and is
//! kept most-recently-updated-first; the window keeps messages in
//! non-decreasing creation order and refuses to page once the cursor is
//! exhausted. All I/O happens in the Store.

use serde::{Deserialize, Serialize};

use crate::messages::{ConversationId, Message, MessageId};

// ============================================================================
// Wire records
// ============================================================================

/// One entry of the conversation index, as the backend lists it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation id
    pub id: ConversationId,
    /// Title
    #[serde(default)]
    pub title: String,
    /// Personality the conversation runs with
    #[serde(default)]
    pub personality_slug: String,
    /// Display name of that personality
    #[serde(default)]
    pub personality_name: String,
    /// Preview of the newest message
    #[serde(default)]
    pub last_message_preview: Option<String>,
    /// Number of stored messages
    #[serde(default)]
    pub message_count: u64,
    /// Last update, fixed-format ISO timestamp
    #[serde(default)]
    pub updated_at: String,
    /// Creation, fixed-format ISO timestamp
    #[serde(default)]
    pub created_at: String,
}

/// Full conversation record returned by detail and patch calls
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDetail {
    /// Conversation id
    pub id: ConversationId,
    /// Title
    #[serde(default)]
    pub title: String,
    /// Personality the conversation runs with
    #[serde(default)]
    pub personality_slug: String,
    /// Display name of that personality
    #[serde(default)]
    pub personality_name: String,
    /// Preview of the newest message
    #[serde(default)]
    pub last_message_preview: Option<String>,
    /// Personality prompt
    #[serde(default)]
    pub prompt: String,
    /// Personality greeting
    #[serde(default)]
    pub greeting: String,
    /// User-supplied context replacing the default one
    #[serde(default)]
    pub context_override: Option<String>,
    /// Prompt actually used by the backend
    #[serde(default)]
    pub effective_prompt: String,
    /// Number of stored messages
    #[serde(default)]
    pub message_count: u64,
    /// Creation, fixed-format ISO timestamp
    #[serde(default)]
    pub created_at: String,
    /// Last update, fixed-format ISO timestamp
    #[serde(default)]
    pub updated_at: String,
}

impl ConversationDetail {
    /// Index entry for this conversation
    #[must_use]
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            personality_slug: self.personality_slug.clone(),
            personality_name: self.personality_name.clone(),
            last_message_preview: self.last_message_preview.clone(),
            message_count: self.message_count,
            updated_at: self.updated_at.clone(),
            created_at: self.created_at.clone(),
        }
    }
}

/// One page of the conversation index
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPage {
    /// Summaries on this page
    pub items: Vec<ConversationSummary>,
    /// Whether another page exists
    #[serde(default)]
    pub has_more: bool,
    /// Offset of the next page
    #[serde(default)]
    pub next_skip: usize,
}

/// One page of message history, oldest first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessagePage {
    /// Messages on this page
    pub messages: Vec<Message>,
    /// Whether older messages exist
    pub has_more: bool,
    /// Cursor for the next older page
    pub next_cursor: Option<String>,
}

// ============================================================================
// Active conversation
// ============================================================================

/// The conversation the Store is showing
///
/// `id == None` means "not created yet": a guest conversation, or an
/// authenticated one before its first exchange assigned an id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conversation {
    /// Server id, if created
    pub id: Option<ConversationId>,
    /// Title
    pub title: String,
    /// Personality selector
    pub personality_slug: String,
    /// Context override
    pub context_override: Option<String>,
    /// Number of stored messages
    pub message_count: u64,
    /// Last update, if known
    pub updated_at: Option<String>,
}

impl Conversation {
    /// An empty, not yet created conversation
    #[must_use]
    pub fn draft(personality_slug: impl Into<String>) -> Self {
        Self {
            personality_slug: personality_slug.into(),
            ..Self::default()
        }
    }

    /// Whether the backend knows this conversation
    #[must_use]
    pub fn is_created(&self) -> bool {
        self.id.is_some()
    }
}

impl From<ConversationDetail> for Conversation {
    fn from(detail: ConversationDetail) -> Self {
        Self {
            id: Some(detail.id),
            title: detail.title,
            personality_slug: detail.personality_slug,
            context_override: detail.context_override,
            message_count: detail.message_count,
            updated_at: Some(detail.updated_at),
        }
    }
}

// ============================================================================
// Conversation index
// ============================================================================

/// Paginated, most-recently-updated-first list of conversation summaries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationIndex {
    items: Vec<ConversationSummary>,
    /// Whether another page exists
    pub has_more: bool,
    /// Offset of the next page
    pub next_skip: usize,
    /// A page request is outstanding
    pub loading: bool,
}

impl ConversationIndex {
    /// Summaries, most recently updated first
    #[must_use]
    pub fn items(&self) -> &[ConversationSummary] {
        &self.items
    }

    /// Number of summaries
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert or replace a summary, keeping the sort order
    pub fn upsert(&mut self, summary: ConversationSummary) {
        self.items.retain(|item| item.id != summary.id);
        self.items.push(summary);
        self.sort();
    }

    /// Merge a fetched page; `reset` replaces everything
    pub fn merge_page(&mut self, page: ConversationPage, reset: bool) {
        if reset {
            self.items.clear();
        }
        for summary in page.items {
            self.items.retain(|item| item.id != summary.id);
            self.items.push(summary);
        }
        self.sort();
        self.has_more = page.has_more;
        self.next_skip = page.next_skip;
    }

    /// Remove a summary; returns whether it was present
    pub fn remove(&mut self, id: &ConversationId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| &item.id != id);
        let removed = self.items.len() != before;
        if removed {
            self.next_skip = self.next_skip.saturating_sub(1);
        }
        removed
    }

    /// Drop everything
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn sort(&mut self) {
        // ISO timestamps of one fixed format order lexicographically
        self.items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}

// ============================================================================
// Message window
// ============================================================================

/// Messages of the active conversation, loaded backward by cursor
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageWindow {
    messages: Vec<Message>,
    /// Whether older messages exist
    pub has_more: bool,
    /// Cursor for the next older page
    pub next_cursor: Option<String>,
    /// An older page request is outstanding
    pub loading_older: bool,
}

impl MessageWindow {
    /// Messages, oldest first
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether an older page may be requested now
    #[must_use]
    pub fn can_load_older(&self) -> bool {
        self.has_more && self.next_cursor.is_some() && !self.loading_older
    }

    /// Replace the window with the newest page
    pub fn replace(&mut self, page: MessagePage) {
        let MessagePage {
            mut messages,
            has_more,
            next_cursor,
        } = page;
        messages.sort_by_key(|m| m.created_at);
        self.messages = messages;
        self.set_cursor(has_more, next_cursor);
        self.loading_older = false;
    }

    /// Put an older page in front of the window
    ///
    /// Messages already present (by id) are not inserted twice.
    pub fn prepend(&mut self, page: MessagePage) {
        let MessagePage {
            messages,
            has_more,
            next_cursor,
        } = page;
        let mut older: Vec<Message> = messages
            .into_iter()
            .filter(|m| !self.messages.iter().any(|existing| existing.id == m.id))
            .collect();
        older.sort_by_key(|m| m.created_at);
        older.append(&mut self.messages);
        self.messages = older;
        self.set_cursor(has_more, next_cursor);
    }

    /// Append a message at the end
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Swap a provisional id for the server one, in place
    ///
    /// Returns `false` if no message carries `provisional`.
    pub fn reconcile(&mut self, provisional: &MessageId, confirmed: MessageId) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == provisional) {
            Some(message) => {
                message.confirm(confirmed);
                true
            }
            None => false,
        }
    }

    /// Keep `[0, index)`; returns the removed tail
    pub fn truncate(&mut self, index: usize) -> Vec<Message> {
        if index >= self.messages.len() {
            return Vec::new();
        }
        self.messages.split_off(index)
    }

    /// Drop all messages and cursors
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn set_cursor(&mut self, has_more: bool, next_cursor: Option<String>) {
        // An exhausted window never hands out a cursor again
        self.has_more = has_more && next_cursor.is_some();
        self.next_cursor = if self.has_more { next_cursor } else { None };
    }
}
