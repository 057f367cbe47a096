//! Wire shape of one streaming update.
//!
//! The channel delivers `{ "sequence": n, "text": "...", "finished": 0 | 1 }`.
//! The payload may arrive as an inline JSON object or as a JSON-encoded
//! string (the backend's socket emits the latter). Older backends name the
//! fields `num` and `isfinished`; both spellings decode.
//!
//! `text` is the cumulative answer so far, never a delta.

use std::num::NonZeroU64;

use serde::{Deserialize, Deserializer};

use crate::error::{ChatError, Result};

/// One decoded unit of a streaming answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Chunk {
    /// Starts at 1 and increases monotonically within a stream.
    #[serde(alias = "num")]
    pub sequence: NonZeroU64,
    #[serde(default, deserialize_with = "text_or_empty")]
    pub text: String,
    #[serde(alias = "isfinished", deserialize_with = "finished_flag")]
    pub finished: bool,
}

impl Chunk {
    pub fn new(sequence: u64, text: impl Into<String>, finished: bool) -> Result<Self> {
        let sequence = NonZeroU64::new(sequence)
            .ok_or_else(|| ChatError::MalformedChunk("sequence must be >= 1".into()))?;
        Ok(Chunk {
            sequence,
            text: text.into(),
            finished,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.get()
    }

    /// Decode a raw channel payload.
    ///
    /// Fails with [`ChatError::MalformedChunk`] when `sequence` or `finished`
    /// is missing or has the wrong type. No side effects.
    pub fn decode(payload: &serde_json::Value) -> Result<Self> {
        match payload {
            serde_json::Value::String(encoded) => Chunk::parse(encoded),
            serde_json::Value::Object(_) => {
                Chunk::deserialize(payload).map_err(|e| ChatError::MalformedChunk(e.to_string()))
            }
            other => Err(ChatError::MalformedChunk(format!("expected an object, got {other}"))),
        }
    }

    /// Decode a JSON-encoded chunk.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ChatError::MalformedChunk(e.to_string()))?;
        if !value.is_object() {
            return Err(ChatError::MalformedChunk(format!("expected an object, got {value}")));
        }
        Chunk::deserialize(&value).map_err(|e| ChatError::MalformedChunk(e.to_string()))
    }
}

fn text_or_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn finished_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(D::Error::custom(format!("finished must be 0 or 1, got {n}"))),
        },
        other => Err(D::Error::custom(format!("finished must be 0, 1 or a boolean, got {other}"))),
    }
}
