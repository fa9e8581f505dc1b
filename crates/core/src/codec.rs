//! Frame classification for both legs.
//!
//! A frame is either opaque audio or a JSON control envelope. Classification
//! probes for a JSON object with a string `type` field and falls back to audio
//! for anything else, including malformed JSON. Audio bytes are never
//! re-encoded.

use crate::envelope::ControlEnvelope;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode control envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A parsed control message together with the exact text it will be sent as.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    envelope: ControlEnvelope,
    text: String,
}

impl ControlMessage {
    /// Serializes an envelope created by the relay itself.
    pub fn from_envelope(envelope: ControlEnvelope) -> Result<Self, CodecError> {
        let text = serde_json::to_string(&envelope)?;
        Ok(Self { envelope, text })
    }

    pub fn envelope(&self) -> &ControlEnvelope {
        &self.envelope
    }

    pub fn kind(&self) -> &str {
        self.envelope.kind()
    }

    /// The wire text, unmodified when the message was received from a peer.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_parts(self) -> (ControlEnvelope, String) {
        (self.envelope, self.text)
    }
}

/// One discrete message on a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio(Bytes),
    Control(ControlMessage),
}

impl Frame {
    /// Classifies a text payload. Text that is not a control object is
    /// treated as audio bytes.
    pub fn from_text(text: &str) -> Self {
        match probe(text) {
            Some(message) => Frame::Control(message),
            None => Frame::Audio(Bytes::copy_from_slice(text.as_bytes())),
        }
    }

    /// Classifies a binary payload.
    ///
    /// Binary payloads go through the same JSON probe as text, so a PCM
    /// frame whose bytes happen to form a JSON object with a `type` field is
    /// taken for a control message.
    pub fn from_binary(data: Bytes) -> Self {
        let probed = std::str::from_utf8(&data).ok().and_then(probe);
        match probed {
            Some(message) => {
                debug!(kind = message.kind(), "Binary frame classified as control");
                Frame::Control(message)
            }
            None => Frame::Audio(data),
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Frame::Audio(_))
    }
}

fn probe(text: &str) -> Option<ControlMessage> {
    // Anything that is not an object cannot carry a discriminator.
    if !text.trim_start().starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?.to_string();
    let envelope = match serde_json::from_value::<ControlEnvelope>(value) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(%kind, error = %e, "Control message not recognised; keeping it opaque");
            ControlEnvelope::Other { kind }
        }
    };
    Some(ControlMessage {
        envelope,
        text: text.to_string(),
    })
}
