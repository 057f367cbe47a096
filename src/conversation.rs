//! One mounted chat room.
//!
//! A [`Conversation`] exclusively owns its transcript, its channel and the
//! state of its (at most one) open stream. Nothing here is shared between
//! rooms: opening another room means building another `Conversation`, and
//! dropping one tears its channel down so no late chunk can reach a
//! transcript that is gone.
//!
//! All work is cooperative on the caller's task. While a trigger or search
//! request is in flight, channel events keep being reconciled, since the
//! backend may start pushing chunks before it acknowledges the trigger.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{ChatBackend, HistoryMessage};
use crate::channel::{ChannelEvent, ChannelHandle, ChannelManager};
use crate::config::ClientConfig;
use crate::dispatcher::{self, Dispatch, PlannedRequest, SubmitOptions};
use crate::error::{ChatError, Result};
use crate::mission::{Mission, RequestShape};
use crate::reconciler::{self, Applied, StreamState};
use crate::transcript::{Handle, Message, Transcript, TranscriptEvent};

/// Sends the user back to sign-in. Invoked once per rejection.
pub trait SignInRedirect: Send + Sync {
    fn redirect_to_sign_in(&self);
}

impl<F> SignInRedirect for F
where
    F: Fn() + Send + Sync,
{
    fn redirect_to_sign_in(&self) {
        self()
    }
}

/// What one channel event did to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    Chunk { target: Handle, applied: Applied },
    /// Dropped: malformed, stale, or no stream open.
    Ignored,
    /// The channel dropped; `interrupted` is the placeholder that was cut off.
    ChannelLost { interrupted: Option<Handle> },
    AuthRejected,
}

pub struct Conversation<B> {
    id: String,
    config: ClientConfig,
    backend: B,
    transcript: Transcript,
    stream: Option<StreamState>,
    channel: ChannelHandle,
    /// Set once the channel has dropped; streaming missions are refused after.
    channel_lost: bool,
    redirect: Arc<dyn SignInRedirect>,
}

impl<B: ChatBackend> Conversation<B> {
    /// Mount `conversation_id`: seed the transcript from history, then open
    /// the channel.
    ///
    /// A 401 on either step redirects to sign-in exactly once and returns
    /// [`ChatError::AuthRejected`]; no transcript is built in that case.
    pub async fn open(
        config: ClientConfig,
        conversation_id: impl Into<String>,
        backend: B,
        redirect: Arc<dyn SignInRedirect>,
    ) -> Result<Self> {
        let id = conversation_id.into();
        let history = load_history(&backend, &id, &*redirect).await?;

        let token = config.token.clone().unwrap_or_default();
        let channel = match ChannelManager::new(&config).connect(&id, &token).await {
            Ok(channel) => channel,
            Err(ChatError::AuthRejected) => {
                info!(conversation = %id, "channel rejected session; redirecting to sign-in");
                redirect.redirect_to_sign_in();
                return Err(ChatError::AuthRejected);
            }
            Err(e) => return Err(e),
        };
        Ok(Self::assemble(id, config, backend, history, channel, redirect))
    }

    /// Mount over an already-open channel.
    pub async fn with_channel(
        config: ClientConfig,
        backend: B,
        channel: ChannelHandle,
        redirect: Arc<dyn SignInRedirect>,
    ) -> Result<Self> {
        let id = channel.conversation_id().to_string();
        let history = load_history(&backend, &id, &*redirect).await?;
        Ok(Self::assemble(id, config, backend, history, channel, redirect))
    }

    fn assemble(
        id: String,
        config: ClientConfig,
        backend: B,
        history: Vec<Message>,
        channel: ChannelHandle,
        redirect: Arc<dyn SignInRedirect>,
    ) -> Self {
        info!(conversation = %id, messages = history.len(), "conversation mounted");
        Conversation {
            id,
            config,
            backend,
            transcript: Transcript::seeded(history),
            stream: None,
            channel,
            channel_lost: false,
            redirect,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript.subscribe()
    }

    /// True while a streamed answer is still open.
    pub fn is_busy(&self) -> bool {
        self.stream.as_ref().is_some_and(StreamState::is_active)
    }

    /// Send `input` on `mission` and return the placeholder's handle.
    ///
    /// For streaming missions this returns once the backend acknowledged the
    /// trigger; the answer keeps arriving through [`next_update`](Self::next_update)
    /// or [`settle`](Self::settle). Search missions return with the result
    /// already merged.
    ///
    /// # Errors
    /// - [`ChatError::Busy`] while a stream is open; nothing is appended
    /// - [`ChatError::ChannelLost`] for a streaming mission once the channel
    ///   has dropped; nothing is appended
    /// - [`ChatError::AuthRejected`] / [`ChatError::RequestFailed`]; the
    ///   placeholder shows the failure
    pub async fn submit(&mut self, input: &str, mission: Mission, options: SubmitOptions) -> Result<Handle> {
        if self.channel_lost && mission.request_shape() == RequestShape::Streaming {
            return Err(ChatError::ChannelLost(format!(
                "cannot stream {} on a closed channel",
                mission
            )));
        }
        let Dispatch { placeholder, request } = dispatcher::begin(
            &mut self.transcript,
            &mut self.stream,
            &self.config,
            input,
            mission,
            options,
        )?;
        debug!(conversation = %self.id, %mission, placeholder = %placeholder, "dispatching");

        let Conversation {
            id,
            backend,
            transcript,
            stream,
            channel,
            channel_lost,
            redirect,
            ..
        } = self;
        let id: &str = id;
        let redirect: &dyn SignInRedirect = &**redirect;

        let (outcome, seen) = match request {
            PlannedRequest::Stream(req) => {
                let (result, seen) =
                    pump_while(backend.trigger_stream(id, &req), channel, transcript, stream, redirect).await;
                (dispatcher::finish_trigger(transcript, stream, placeholder, result), seen)
            }
            PlannedRequest::Search(req) => {
                let (result, seen) = pump_while(backend.search(id, &req), channel, transcript, stream, redirect).await;
                (dispatcher::finish_search(transcript, placeholder, result), seen)
            }
        };
        *channel_lost |= seen.lost;

        match outcome {
            Ok(()) => Ok(placeholder),
            Err(ChatError::AuthRejected) => {
                if seen.redirected {
                    debug!(conversation = %id, "request rejected; sign-in redirect already issued");
                } else {
                    info!(conversation = %id, "request rejected; redirecting to sign-in");
                    redirect.redirect_to_sign_in();
                }
                Err(ChatError::AuthRejected)
            }
            Err(e) if e.is_surfaced() => {
                warn!(conversation = %id, error = %e, "request failed");
                Err(e)
            }
            Err(e) => {
                debug!(conversation = %id, error = %e, "request failed");
                Err(e)
            }
        }
    }

    /// Wait for and apply the next channel event. `None` once the channel
    /// has closed.
    ///
    /// If the queue ends while a stream is still open, the open placeholder
    /// is marked interrupted and reported as one final
    /// [`Update::ChannelLost`].
    pub async fn next_update(&mut self) -> Option<Update> {
        let Some(event) = self.channel.next_event().await else {
            self.channel_lost = true;
            let state = self.stream.as_mut().filter(|s| s.is_active())?;
            let target = state.target();
            warn!(conversation = %self.id, "channel closed with a stream still open");
            let interrupted = reconciler::interrupt(state, &mut self.transcript).then_some(target);
            return Some(Update::ChannelLost { interrupted });
        };
        let update = apply_event(&mut self.transcript, &mut self.stream, event);
        match update {
            Update::ChannelLost { .. } => self.channel_lost = true,
            Update::AuthRejected => redirect_for_channel(&*self.redirect),
            _ => {}
        }
        Some(update)
    }

    /// Apply channel events until no stream is open. If the channel closes
    /// first, the open placeholder is marked interrupted.
    pub async fn settle(&mut self) {
        while self.is_busy() {
            if self.next_update().await.is_none() {
                break;
            }
        }
    }

    /// Re-seed the transcript from the backend. Skipped (returns `false`)
    /// while a stream is open.
    pub async fn refresh_history(&mut self) -> Result<bool> {
        if self.is_busy() {
            debug!(conversation = %self.id, "skipping history refresh while streaming");
            return Ok(false);
        }
        let history = load_history(&self.backend, &self.id, &*self.redirect).await?;
        self.transcript.reset(history);
        self.stream = None;
        Ok(true)
    }

    /// Tear down: close the channel and drop all state.
    pub fn close(mut self) {
        self.channel.close();
        info!(conversation = %self.id, "conversation closed");
    }
}

async fn load_history<B: ChatBackend>(
    backend: &B,
    id: &str,
    redirect: &dyn SignInRedirect,
) -> Result<Vec<Message>> {
    match backend.fetch_history(id).await {
        Ok(history) => Ok(history.into_iter().map(HistoryMessage::into_message).collect()),
        Err(ChatError::AuthRejected) => {
            info!(conversation = %id, "history rejected; redirecting to sign-in");
            redirect.redirect_to_sign_in();
            Err(ChatError::AuthRejected)
        }
        Err(e) => Err(e),
    }
}

/// Channel conditions observed while a request was in flight.
#[derive(Debug, Default, Clone, Copy)]
struct Seen {
    lost: bool,
    redirected: bool,
}

/// Drive `request` to completion while reconciling channel events.
async fn pump_while<T>(
    request: impl Future<Output = Result<T>>,
    channel: &mut ChannelHandle,
    transcript: &mut Transcript,
    stream: &mut Option<StreamState>,
    redirect: &dyn SignInRedirect,
) -> (Result<T>, Seen) {
    let mut seen = Seen::default();
    tokio::pin!(request);
    loop {
        tokio::select! {
            result = &mut request => return (result, seen),
            Some(event) = channel.next_event() => match apply_event(transcript, stream, event) {
                Update::ChannelLost { .. } => seen.lost = true,
                Update::AuthRejected if !seen.redirected => {
                    redirect_for_channel(redirect);
                    seen.redirected = true;
                }
                _ => {}
            },
        }
    }
}

fn redirect_for_channel(redirect: &dyn SignInRedirect) {
    info!("channel rejected session; redirecting to sign-in");
    redirect.redirect_to_sign_in();
}

fn apply_event(transcript: &mut Transcript, stream: &mut Option<StreamState>, event: ChannelEvent) -> Update {
    match event {
        ChannelEvent::Chunk(payload) => {
            let Some(state) = stream.as_mut() else {
                debug!("dropping chunk: no stream open");
                return Update::Ignored;
            };
            let target = state.target();
            match reconciler::ingest_logged(state, transcript, &payload) {
                Some(applied) => Update::Chunk { target, applied },
                None => Update::Ignored,
            }
        }
        ChannelEvent::Lost(reason) => {
            warn!(reason = %reason, "channel lost");
            let interrupted = stream.as_mut().and_then(|state| {
                let target = state.target();
                reconciler::interrupt(state, transcript).then_some(target)
            });
            Update::ChannelLost { interrupted }
        }
        ChannelEvent::AuthRejected => {
            if let Some(state) = stream.as_mut().filter(|s| s.is_active()) {
                let target = state.target();
                reconciler::fail(Some(state), transcript, target, &ChatError::AuthRejected);
            }
            Update::AuthRejected
        }
    }
}
