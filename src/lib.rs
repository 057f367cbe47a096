//! Client core for the QingWang legal assistant chat.
//!
//! One [`Conversation`] per mounted room: it owns an ordered [`Transcript`],
//! a persistent chunk [`channel`] and at most one open stream. User turns are
//! dispatched by [`Mission`]; consultation and verdict prediction stream their
//! answer over the channel, statute and case search return whole.
//!
//! ```text
//! submit ─▶ dispatcher ─▶ placeholder ─┬─▶ ApiClient (HTTP trigger / search)
//!                                      └─◀ reconciler ◀─ channel ◀─ backend
//! ```

pub mod api;
pub mod channel;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod mission;
pub mod reconciler;
pub mod transcript;

pub use api::{ApiClient, ChatBackend, Room};
pub use channel::{ChannelEvent, ChannelFeed, ChannelHandle, ChannelManager};
pub use chunk::Chunk;
pub use config::ClientConfig;
pub use conversation::{Conversation, SignInRedirect, Update};
pub use dispatcher::SubmitOptions;
pub use error::{ChatError, Result};
pub use mission::Mission;
pub use transcript::{Author, Handle, Message, MessageBody, Transcript, TranscriptEvent};
