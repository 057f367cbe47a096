//! # Transcript Store
//!
//! ## Responsibility
//! Ordered container of the messages shown to the user. Entries are appended
//! at the end and mutated in place; nothing is ever addressed by position.
//!
//! ## Guarantees
//! - Every message carries a [`Handle`] assigned when the message is created;
//!   the handle stays valid across unrelated appends and removals
//! - [`Transcript::replace_body`] on a dead handle is a silent no-op
//! - [`Transcript::snapshot`] returns an owned copy, so rendering never holds
//!   a borrow across the next mutation
//! - Observers receive a [`TranscriptEvent`] for every change
//!
//! ## NOT Responsible For
//! - Deciding what goes into a body (that is the reconciler and dispatcher)
//! - Persistence (history lives on the backend)

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::mission::Mission;

/// Rendered form of the thinking placeholder.
pub const THINKING_TEXT: &str = "正在思考...";
/// Rendered form of an empty retrieval result.
pub const NO_RESULTS_TEXT: &str = "无检索结果";
/// Marker appended to an answer cut off by a lost channel.
pub const INTERRUPTED_MARKER: &str = "[回答已中断]";

/// Observer channel capacity.
pub const EVENT_CHANNEL_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Opaque, stable reference to one transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Handle(uuid::Uuid);

impl Handle {
    fn new() -> Self {
        Handle(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Assistant,
}

/// What a message currently displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    /// Ordered retrieval results.
    Results(Vec<String>),
    /// A request is outstanding.
    Thinking,
    /// A retrieval came back empty.
    NoResults,
    /// The request failed; carries a short reason.
    Failed(String),
    /// The channel dropped mid-stream; carries whatever text had arrived.
    Interrupted(String),
}

impl MessageBody {
    /// Search results, with an empty list mapped to [`MessageBody::NoResults`].
    pub fn from_results(results: Vec<String>) -> Self {
        if results.is_empty() {
            MessageBody::NoResults
        } else {
            MessageBody::Results(results)
        }
    }

    /// Plain-text rendering for terminals and logs.
    pub fn render(&self) -> String {
        match self {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Results(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}. {}", i + 1, item))
                .collect::<Vec<_>>()
                .join("\n"),
            MessageBody::Thinking => THINKING_TEXT.to_string(),
            MessageBody::NoResults => NO_RESULTS_TEXT.to_string(),
            MessageBody::Failed(reason) => format!("请求失败：{}", reason),
            MessageBody::Interrupted(partial) if partial.is_empty() => INTERRUPTED_MARKER.to_string(),
            MessageBody::Interrupted(partial) => format!("{}\n{}", partial, INTERRUPTED_MARKER),
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: Handle,
    pub author: Author,
    pub body: MessageBody,
    /// Which backend capability produced it. Always `None` for user messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission: Option<Mission>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message {
            id: Handle::new(),
            author: Author::User,
            body: MessageBody::Text(text.into()),
            mission: None,
        }
    }

    pub fn assistant(body: MessageBody, mission: Option<Mission>) -> Self {
        Message {
            id: Handle::new(),
            author: Author::Assistant,
            body,
            mission,
        }
    }

    /// A thinking placeholder for a request on `mission`.
    pub fn placeholder(mission: Mission) -> Self {
        Message::assistant(MessageBody::Thinking, Some(mission))
    }
}

/// Change notification for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptEvent {
    Appended(Handle),
    Updated(Handle),
    Removed(Handle),
    /// The whole transcript was replaced (history seeding).
    Reset,
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

pub struct Transcript {
    order: Vec<Handle>,
    entries: HashMap<Handle, Message>,
    events: broadcast::Sender<TranscriptEvent>,
}

impl Default for Transcript {
    fn default() -> Self {
        Transcript::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAP);
        Transcript {
            order: Vec::new(),
            entries: HashMap::new(),
            events,
        }
    }

    /// Build a transcript already holding `messages`, in order.
    pub fn seeded(messages: Vec<Message>) -> Self {
        let mut transcript = Transcript::new();
        transcript.reset(messages);
        transcript
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    /// Add `message` at the end and return its handle.
    ///
    /// A message whose handle is already live (e.g. a clone out of
    /// [`snapshot`](Self::snapshot)) is appended as a new entry under a fresh
    /// handle; the live entry is left alone.
    pub fn append(&mut self, mut message: Message) -> Handle {
        if self.contains(message.id) {
            debug!(handle = %message.id, "append of a live handle; minting a new one");
            message.id = Handle::new();
        }
        let id = message.id;
        self.entries.insert(id, message);
        self.order.push(id);
        self.notify(TranscriptEvent::Appended(id));
        id
    }

    /// Swap the body of a live message, keeping its position.
    ///
    /// Returns `false` and changes nothing when `handle` is dead.
    pub fn replace_body(&mut self, handle: Handle, body: MessageBody) -> bool {
        match self.entries.get_mut(&handle) {
            Some(message) => {
                message.body = body;
                self.notify(TranscriptEvent::Updated(handle));
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<Message> {
        let removed = self.entries.remove(&handle)?;
        self.order.retain(|h| *h != handle);
        self.notify(TranscriptEvent::Removed(handle));
        Some(removed)
    }

    /// Replace the whole contents.
    pub fn reset(&mut self, messages: Vec<Message>) {
        self.order = messages.iter().map(|m| m.id).collect();
        self.entries = messages.into_iter().map(|m| (m.id, m)).collect();
        self.notify(TranscriptEvent::Reset);
    }

    pub fn get(&self, handle: Handle) -> Option<&Message> {
        self.entries.get(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn last(&self) -> Option<&Message> {
        self.order.last().and_then(|h| self.entries.get(h))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Owned, ordered copy of every message.
    pub fn snapshot(&self) -> Vec<Message> {
        self.order
            .iter()
            .filter_map(|h| self.entries.get(h).cloned())
            .collect()
    }

    fn notify(&self, event: TranscriptEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
