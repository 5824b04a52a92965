//! # Envelope Codec
//!
//! `decode` only establishes framing: the frame is within the size limit, is
//! a JSON object, and names a known envelope type. Field-level checks belong to
//! the [`SchemaValidator`](crate::schema::SchemaValidator); `decode_envelope`
//! runs both.

use crate::envelope::{Envelope, EnvelopeKind};
use crate::errors::{DecodeError, Rejection};
use crate::schema::SchemaValidator;
use serde_json::{Map, Value};

/// Default maximum frame size (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Longest raw excerpt kept as evidence for frames that are not JSON.
const EVIDENCE_EXCERPT_CHARS: usize = 512;

/// A framed but not yet validated envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: EnvelopeKind,
    pub body: Map<String, Value>,
}

impl Frame {
    /// Channel string as sent, if present.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.body.get("channel").and_then(Value::as_str)
    }

    /// Origin string as sent, if present.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.body.get("origin").and_then(Value::as_str)
    }

    /// The whole frame as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// Size-limited JSON envelope codec.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_payload_bytes: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl EnvelopeCodec {
    #[must_use]
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    #[must_use]
    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Frame `bytes` into a typed-but-unvalidated [`Frame`].
    ///
    /// # Errors
    ///
    /// Size is checked before parsing, so oversized frames are never parsed.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        if bytes.len() > self.max_payload_bytes {
            return Err(DecodeError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.max_payload_bytes,
            });
        }

        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let tag = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let kind =
            EnvelopeKind::from_tag(tag).ok_or_else(|| DecodeError::UnknownType(tag.to_string()))?;

        Ok(Frame { kind, body })
    }

    /// Decode and validate in one step.
    ///
    /// # Errors
    ///
    /// [`Rejection::Decode`] for framing problems, [`Rejection::Schema`] for
    /// structural ones.
    pub fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, Rejection> {
        let frame = self.decode(bytes)?;
        Ok(SchemaValidator::validate(&frame)?)
    }

    /// Encode to compact JSON.
    #[must_use]
    pub fn encode(&self, envelope: &Envelope) -> Vec<u8> {
        encode(envelope)
    }
}

/// Encode an envelope to compact JSON bytes.
#[must_use]
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    // String-keyed JSON data: serialization cannot fail.
    serde_json::to_vec(envelope).unwrap_or_default()
}

/// Best-effort evidence for a frame that failed to decode: the parsed JSON if
/// there is any, otherwise a truncated excerpt of the raw text.
#[must_use]
pub fn evidence(bytes: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return value;
    }
    let text = String::from_utf8_lossy(bytes);
    Value::String(text.chars().take(EVIDENCE_EXCERPT_CHARS).collect())
}
