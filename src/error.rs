//! Crate-level error type.
//!
//! Faults split into two families. Transport and decode faults
//! ([`ChatError::MalformedChunk`], [`ChatError::StaleChunk`]) are absorbed
//! where they happen and only logged. Request-level faults
//! ([`ChatError::AuthRejected`], [`ChatError::RequestFailed`],
//! [`ChatError::ChannelLost`]) always end up visible in the transcript,
//! because the user is waiting on exactly one open placeholder.

use thiserror::Error;

/// Everything that can go wrong between the client and the chat backend.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The backend answered 401 on a request or on the channel handshake.
    #[error("unauthorized: the backend rejected the session token")]
    AuthRejected,

    /// A chunk payload could not be decoded.
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// A chunk whose sequence was already applied, or which arrived after
    /// its stream finished.
    #[error("stale chunk: sequence {sequence} <= last applied {highest_applied}")]
    StaleChunk { sequence: u64, highest_applied: u64 },

    /// Network or backend failure on a REST call.
    #[error("request to {url} failed: {detail}")]
    RequestFailed { url: String, detail: String },

    /// The channel dropped; an open stream is cut off and no new one can
    /// start.
    #[error("channel lost: {0}")]
    ChannelLost(String),

    /// A request is already open on this conversation.
    #[error("a request is already in flight for this conversation")]
    Busy,

    /// The channel could not be established.
    #[error("could not connect to {url}: {detail}")]
    Connect { url: String, detail: String },

    #[error("config error: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether this fault must be shown in the transcript rather than only
    /// logged.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            ChatError::AuthRejected | ChatError::RequestFailed { .. } | ChatError::ChannelLost(_)
        )
    }

    pub(crate) fn request(url: impl Into<String>, detail: impl ToString) -> Self {
        ChatError::RequestFailed {
            url: url.into(),
            detail: detail.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
