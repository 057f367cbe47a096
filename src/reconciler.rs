//! # Stage: Reconciler
//!
//! ## Responsibility
//! Merge streamed chunks and single-shot results into the [`Transcript`],
//! always through the placeholder handle opened for the request.
//!
//! ## Guarantees
//! - Order-independent: a chunk is applied only if its sequence is above the
//!   highest one applied so far, so any delivery order ends on the text of
//!   the highest sequence
//! - Idempotent under redelivery: duplicates are stale and change nothing
//! - Final: once a finished chunk lands, nothing else touches the target
//! - Stateless: all per-stream state lives in a [`StreamState`] owned by the
//!   conversation
//!
//! ## NOT Responsible For
//! - Choosing request shapes (dispatcher)
//! - Receiving frames (channel)

use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::error::{ChatError, Result};
use crate::transcript::{Handle, MessageBody, Transcript};

/// Bookkeeping for one streaming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    target: Handle,
    highest_applied: u64,
    active: bool,
}

impl StreamState {
    pub fn new(target: Handle) -> Self {
        StreamState {
            target,
            highest_applied: 0,
            active: true,
        }
    }

    pub fn target(&self) -> Handle {
        self.target
    }

    pub fn highest_applied(&self) -> u64 {
        self.highest_applied
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn close(&mut self) {
        self.active = false;
    }
}

/// What an accepted chunk did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Partial,
    Finished,
}

/// Decode and apply one raw channel payload.
///
/// Malformed payloads and stale chunks are reported as errors but never
/// touch the transcript.
pub fn ingest(
    stream: &mut StreamState,
    transcript: &mut Transcript,
    payload: &serde_json::Value,
) -> Result<Applied> {
    let chunk = Chunk::decode(payload)?;
    apply_chunk(stream, transcript, &chunk)
}

/// Apply a decoded chunk. The chunk text is the whole answer so far.
pub fn apply_chunk(stream: &mut StreamState, transcript: &mut Transcript, chunk: &Chunk) -> Result<Applied> {
    let sequence = chunk.sequence();
    if !stream.active || sequence <= stream.highest_applied {
        return Err(ChatError::StaleChunk {
            sequence,
            highest_applied: stream.highest_applied,
        });
    }
    stream.highest_applied = sequence;

    if !transcript.replace_body(stream.target, MessageBody::Text(chunk.text.clone())) {
        // Target is gone; nothing left to stream into.
        debug!(target_handle = %stream.target, sequence, "stream target no longer in transcript");
        stream.close();
        return Ok(Applied::Finished);
    }

    if chunk.finished {
        stream.close();
        debug!(target_handle = %stream.target, sequence, "stream finished");
        Ok(Applied::Finished)
    } else {
        Ok(Applied::Partial)
    }
}

/// Like [`ingest`], but absorbs chunk-level faults: malformed payloads are
/// logged at `warn`, stale ones at `debug`. Returns what was applied, if
/// anything.
pub fn ingest_logged(
    stream: &mut StreamState,
    transcript: &mut Transcript,
    payload: &serde_json::Value,
) -> Option<Applied> {
    match ingest(stream, transcript, payload) {
        Ok(applied) => Some(applied),
        Err(e @ ChatError::MalformedChunk(_)) => {
            warn!(error = %e, "dropping malformed chunk");
            None
        }
        Err(e) => {
            debug!(error = %e, "dropping chunk");
            None
        }
    }
}

/// Merge a finished retrieval result into its placeholder.
pub fn merge_results(transcript: &mut Transcript, target: Handle, results: Vec<String>) -> bool {
    transcript.replace_body(target, MessageBody::from_results(results))
}

/// Replace the open placeholder with a visible failure and close the stream,
/// so a retry opens a fresh placeholder.
pub fn fail(stream: Option<&mut StreamState>, transcript: &mut Transcript, target: Handle, error: &ChatError) {
    if let Some(stream) = stream {
        stream.close();
    }
    transcript.replace_body(target, MessageBody::Failed(failure_reason(error)));
}

/// Mark an unfinished stream as interrupted, keeping whatever text had
/// already arrived. No-op for a stream that already finished.
pub fn interrupt(stream: &mut StreamState, transcript: &mut Transcript) -> bool {
    if !stream.active {
        return false;
    }
    stream.close();
    let partial = match transcript.get(stream.target).map(|m| &m.body) {
        Some(MessageBody::Text(text)) => text.clone(),
        Some(_) => String::new(),
        None => return false,
    };
    transcript.replace_body(stream.target, MessageBody::Interrupted(partial))
}

fn failure_reason(error: &ChatError) -> String {
    match error {
        ChatError::AuthRejected => "登录已失效，请重新登录".to_string(),
        ChatError::RequestFailed { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}
