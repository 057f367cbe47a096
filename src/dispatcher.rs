//! Mission dispatch.
//!
//! Turns one user submission into a placeholder plus the request that will
//! fill it. Consultation and verdict prediction stream over the channel;
//! statute and case search come back whole in the HTTP response.
//!
//! The placeholder is always appended before any request exists, so the UI
//! has a stable target from the first frame on.

use tracing::warn;

use crate::api::{SearchRequest, StreamRequest};
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::mission::{Mission, RequestShape};
use crate::reconciler::{self, StreamState};
use crate::transcript::{Handle, Message, Transcript};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Let the backend refine retrieval queries with the model.
    pub model_enhanced: bool,
}

#[derive(Debug, Clone)]
pub enum PlannedRequest {
    Stream(StreamRequest),
    Search(SearchRequest),
}

/// Outcome of [`begin`]: the placeholder to fill and the request to send.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub placeholder: Handle,
    pub request: PlannedRequest,
}

/// Append the user turn and its placeholder, and plan the request.
///
/// Fails with [`ChatError::Busy`] without touching the transcript while a
/// stream is still open.
pub fn begin(
    transcript: &mut Transcript,
    stream: &mut Option<StreamState>,
    config: &ClientConfig,
    input: &str,
    mission: Mission,
    options: SubmitOptions,
) -> Result<Dispatch> {
    if stream.as_ref().is_some_and(StreamState::is_active) {
        return Err(ChatError::Busy);
    }

    transcript.append(Message::user(input));
    let placeholder = transcript.append(Message::placeholder(mission));

    let request = match (mission.request_shape(), config.top_k(mission)) {
        (RequestShape::SingleShot, Some(top_k)) => PlannedRequest::Search(SearchRequest {
            inputs: input.to_string(),
            mission,
            is_model: options.model_enhanced,
            top_k,
        }),
        _ => {
            *stream = Some(StreamState::new(placeholder));
            PlannedRequest::Stream(StreamRequest {
                inputs: input.to_string(),
                mission,
            })
        }
    };

    Ok(Dispatch { placeholder, request })
}

/// Settle a streaming trigger. On failure the placeholder shows the error and
/// the stream closes, unless the answer already finished over the channel.
pub fn finish_trigger(
    transcript: &mut Transcript,
    stream: &mut Option<StreamState>,
    placeholder: Handle,
    result: Result<()>,
) -> Result<()> {
    let error = match result {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    match stream.as_mut().filter(|s| s.target() == placeholder) {
        Some(state) if !state.is_active() => {
            warn!(error = %error, "trigger failed after the answer had already finished");
        }
        state => reconciler::fail(state, transcript, placeholder, &error),
    }
    Err(error)
}

/// Settle a single-shot search: results (or no-results) on success, a
/// failure body otherwise.
pub fn finish_search(transcript: &mut Transcript, placeholder: Handle, result: Result<Vec<String>>) -> Result<()> {
    match result {
        Ok(results) => {
            reconciler::merge_results(transcript, placeholder, results);
            Ok(())
        }
        Err(error) => {
            reconciler::fail(None, transcript, placeholder, &error);
            Err(error)
        }
    }
}
