//! Envelope Codec
//!
//! Decodes inbound WebSocket frames into [`Envelope`]s and encodes outbound
//! ones. Frames are JSON objects; binary frames are accepted when they hold
//! UTF-8 JSON.

use serde::de::DeserializeOwned;

use super::messages::Envelope;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame was not valid UTF-8.
    #[error("binary frame is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for feed envelopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object with a string `type`.
    pub fn decode(&self, text: &str) -> Result<Envelope, CodecError> {
        let trimmed = text.trim();

        if !trimmed.starts_with('{') {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                preview(trimmed)
            )));
        }

        Ok(serde_json::from_str(trimmed)?)
    }

    /// Decode a binary frame holding UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not UTF-8 or not a valid envelope.
    pub fn decode_binary(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        self.decode(std::str::from_utf8(data)?)
    }

    /// Decode an envelope payload into a typed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn decode_payload<T: DeserializeOwned>(
        &self,
        data: &serde_json::Value,
    ) -> Result<T, CodecError> {
        Ok(T::deserialize(data)?)
    }

    /// Encode an envelope to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        Ok(serde_json::to_string(envelope)?)
    }
}

/// First characters of a frame, for log and error messages.
fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(idx, _)| idx);
    &text[..end]
}
