//! # Membrane Envelope
//!
//! The unit of transport for everything that crosses the membrane.
//!
//! ## Invariants
//!
//! - **Kind/Payload agreement**: the envelope `type` tag is derived from the
//!   payload variant, so the two can never disagree.
//! - **Immutability**: fields are private and there is no mutating API. The
//!   only way to attach a signature is [`Envelope::sealed`], which consumes the
//!   unsigned envelope and returns a new one.
//! - **Canonical form**: signatures are computed over [`Envelope::canonical_bytes`],
//!   which is the envelope minus its signature with object keys sorted. For a
//!   decoded envelope that is the body exactly as received, so timestamps,
//!   number spellings and type aliases chosen by the signer are preserved.

use crate::rejection::RejectionRecord;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// =============================================================================
// ENVELOPE KIND
// =============================================================================

/// Discriminated tag selecting the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Request for a work view. State-changing: must carry a quote.
    #[serde(rename = "docs.view.request")]
    WorkViewRequest,
    /// Resolver result for a work view.
    #[serde(rename = "docs.view.result")]
    WorkViewResult,
    /// Targeted cache invalidation notice.
    #[serde(rename = "docs.view.invalidated")]
    WorkViewInvalidated,
    /// Request for an economic quote.
    #[serde(rename = "quote.request")]
    QuoteRequest,
    /// Quote issued by the economy service.
    #[serde(rename = "quote.response")]
    QuoteResponse,
    /// Settlement of a consumed quote.
    #[serde(rename = "debit")]
    Debit,
    /// Fail-loud failure report.
    #[serde(rename = "failure", alias = "failure.emit")]
    Failure,
}

impl EnvelopeKind {
    /// Every kind the hub understands.
    pub const ALL: [EnvelopeKind; 7] = [
        EnvelopeKind::WorkViewRequest,
        EnvelopeKind::WorkViewResult,
        EnvelopeKind::WorkViewInvalidated,
        EnvelopeKind::QuoteRequest,
        EnvelopeKind::QuoteResponse,
        EnvelopeKind::Debit,
        EnvelopeKind::Failure,
    ];

    /// Wire tag for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkViewRequest => "docs.view.request",
            Self::WorkViewResult => "docs.view.result",
            Self::WorkViewInvalidated => "docs.view.invalidated",
            Self::QuoteRequest => "quote.request",
            Self::QuoteResponse => "quote.response",
            Self::Debit => "debit",
            Self::Failure => "failure",
        }
    }

    /// Parse a wire tag. Accepts the legacy `failure.emit` alias.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag == "failure.emit" {
            return Some(Self::Failure);
        }
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Whether envelopes of this kind are state-changing requests that must
    /// present an unconsumed quote before admission.
    #[must_use]
    pub fn requires_quote(&self) -> bool {
        matches!(self, Self::WorkViewRequest)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PAYLOAD VARIANTS
// =============================================================================

/// Work-View Request: `{request_id, quote_id, view_type, format, scope, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkViewRequest {
    pub request_id: String,
    pub quote_id: String,
    pub view_type: String,
    pub format: String,
    /// e.g. `{org: "acme", root: "repo://", path: "/"}`
    pub scope: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

/// Outcome of a work view resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewStatus {
    Ok,
    Error,
}

/// Work-View Result: `{request_id, status, view_model?, provenance?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkViewResult {
    pub request_id: String,
    pub status: ViewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_model: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Map<String, Value>>,
}

/// Work-View Invalidated: `{reasons[], affects[]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkViewInvalidated {
    /// e.g. `["graph.delta.node.upsert"]`
    pub reasons: Vec<String>,
    /// e.g. `["architecture:/", "coverage:*"]`
    pub affects: Vec<String>,
}

/// Quote Request: `{work, format, estimate, request_id, org}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuoteRequest {
    pub work: String,
    pub format: String,
    /// e.g. `{rows: 800, render_pages: 1}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<Map<String, Value>>,
    pub request_id: String,
    pub org: String,
}

/// Amount in a named currency (`{currency: "$MIND", amount: 0.05}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Price {
    pub currency: String,
    pub amount: f64,
}

impl Price {
    /// Currency used by the CPS-1 tariff.
    pub const MIND: &'static str = "$MIND";

    /// A price denominated in $MIND.
    #[must_use]
    pub fn mind(amount: f64) -> Self {
        Self {
            currency: Self::MIND.to_string(),
            amount,
        }
    }
}

/// Quote Response: `{request_id, quote_id, price, expires_at, budget_ok, org}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuoteResponse {
    pub request_id: String,
    pub quote_id: String,
    pub price: Price,
    pub expires_at: DateTime<Utc>,
    pub budget_ok: bool,
    pub org: String,
}

/// Debit: `{quote_id, actual_cost, work_completed, org}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Debit {
    pub quote_id: String,
    pub actual_cost: f64,
    pub work_completed: bool,
    pub org: String,
}

/// Typed body of an envelope, one variant per [`EnvelopeKind`].
///
/// Serialized untagged; the tag travels in the envelope's `type` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    WorkViewRequest(WorkViewRequest),
    WorkViewResult(WorkViewResult),
    WorkViewInvalidated(WorkViewInvalidated),
    QuoteRequest(QuoteRequest),
    QuoteResponse(QuoteResponse),
    Debit(Debit),
    Failure(RejectionRecord),
}

impl Payload {
    /// The kind this payload belongs to.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::WorkViewRequest(_) => EnvelopeKind::WorkViewRequest,
            Self::WorkViewResult(_) => EnvelopeKind::WorkViewResult,
            Self::WorkViewInvalidated(_) => EnvelopeKind::WorkViewInvalidated,
            Self::QuoteRequest(_) => EnvelopeKind::QuoteRequest,
            Self::QuoteResponse(_) => EnvelopeKind::QuoteResponse,
            Self::Debit(_) => EnvelopeKind::Debit,
            Self::Failure(_) => EnvelopeKind::Failure,
        }
    }

    /// Deserialize a payload body for a known kind.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the body does not match the variant.
    pub fn from_value(kind: EnvelopeKind, body: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EnvelopeKind::WorkViewRequest => Self::WorkViewRequest(serde_json::from_value(body)?),
            EnvelopeKind::WorkViewResult => Self::WorkViewResult(serde_json::from_value(body)?),
            EnvelopeKind::WorkViewInvalidated => {
                Self::WorkViewInvalidated(serde_json::from_value(body)?)
            }
            EnvelopeKind::QuoteRequest => Self::QuoteRequest(serde_json::from_value(body)?),
            EnvelopeKind::QuoteResponse => Self::QuoteResponse(serde_json::from_value(body)?),
            EnvelopeKind::Debit => Self::Debit(serde_json::from_value(body)?),
            EnvelopeKind::Failure => Self::Failure(serde_json::from_value(body)?),
        })
    }

    /// Quote referenced by this payload, if the variant carries one.
    #[must_use]
    pub fn quote_id(&self) -> Option<&str> {
        match self {
            Self::WorkViewRequest(p) => Some(&p.quote_id),
            Self::QuoteResponse(p) => Some(&p.quote_id),
            Self::Debit(p) => Some(&p.quote_id),
            _ => None,
        }
    }

    /// Organization named inside the payload, if any.
    #[must_use]
    pub fn org(&self) -> Option<&str> {
        match self {
            Self::QuoteRequest(p) => Some(&p.org),
            Self::QuoteResponse(p) => Some(&p.org),
            Self::Debit(p) => Some(&p.org),
            Self::WorkViewRequest(p) => p.scope.get("org").and_then(Value::as_str),
            _ => None,
        }
    }
}

// =============================================================================
// SIGNATURE BLOCK
// =============================================================================

/// Detached signature `{algorithm, key_id, value}`; `value` is lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureBlock {
    pub algorithm: String,
    pub key_id: String,
    pub value: String,
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// A typed, optionally signed envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    channel: String,
    origin: String,
    timestamp: DateTime<Utc>,
    payload: Payload,
    signature: Option<SignatureBlock>,
    /// Header and payload as received, without `signature`. `None` for
    /// envelopes built in-process.
    received: Option<Map<String, Value>>,
}

/// Typed content and signature are compared; the received form is not.
impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel
            && self.origin == other.origin
            && self.timestamp == other.timestamp
            && self.payload == other.payload
            && self.signature == other.signature
    }
}

/// Borrowed wire shape used for both encoding and canonicalization.
#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    channel: &'a str,
    origin: &'a str,
    timestamp: &'a DateTime<Utc>,
    payload: &'a Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<&'a SignatureBlock>,
}

impl Envelope {
    /// Build an unsigned envelope.
    pub fn new(
        channel: impl Into<String>,
        origin: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Payload,
    ) -> Self {
        Self {
            channel: channel.into(),
            origin: origin.into(),
            timestamp,
            payload,
            signature: None,
            received: None,
        }
    }

    /// Attach the body this envelope was decoded from.
    pub(crate) fn with_received(self, mut body: Map<String, Value>) -> Self {
        body.remove("signature");
        Self {
            received: Some(body),
            ..self
        }
    }

    /// Consume this envelope and return it sealed with `signature`.
    #[must_use]
    pub fn sealed(self, signature: SignatureBlock) -> Self {
        Self {
            signature: Some(signature),
            ..self
        }
    }

    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn signature(&self) -> Option<&SignatureBlock> {
        self.signature.as_ref()
    }

    fn wire(&self, with_signature: bool) -> WireEnvelope<'_> {
        WireEnvelope {
            kind: self.kind(),
            channel: &self.channel,
            origin: &self.origin,
            timestamp: &self.timestamp,
            payload: &self.payload,
            signature: if with_signature {
                self.signature.as_ref()
            } else {
                None
            },
        }
    }

    /// Bytes covered by the signature: the envelope minus `signature`, as
    /// compact JSON with every object's keys in lexicographic order.
    ///
    /// # Errors
    ///
    /// The serializer error if the envelope cannot be represented as JSON.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(256);
        match &self.received {
            Some(body) => write_object(body, &mut out)?,
            None => write_canonical(&serde_json::to_value(self.wire(false))?, &mut out)?,
        }
        Ok(out)
    }

    /// Full wire representation as a JSON value.
    ///
    /// # Errors
    ///
    /// The serializer error if the envelope cannot be represented as JSON.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Some(body) = &self.received else {
            return self.wire(true).serialize(serializer);
        };
        // Forward exactly what the publisher signed.
        let len = body.len() + usize::from(self.signature.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        for (key, value) in body {
            map.serialize_entry(key, value)?;
        }
        if let Some(signature) = &self.signature {
            map.serialize_entry("signature", signature)?;
        }
        map.end()
    }
}

/// Sorted-key compact JSON writer. Independent of whether `serde_json` was
/// built with `preserve_order`.
fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => write_object(map, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    out.push(b'{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut *out, key)?;
        out.push(b':');
        write_canonical(value, out)?;
    }
    out.push(b'}');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quote_request() -> Envelope {
        Envelope::new(
            "ecosystem/mind/org/acme/economy.quote.request",
            "l3.docs",
            Utc.with_ymd_and_hms(2025, 11, 4, 14, 0, 0).unwrap(),
            Payload::QuoteRequest(QuoteRequest {
                work: "docs.view".into(),
                format: "json".into(),
                estimate: Some(serde_json::json!({"rows": 800}).as_object().unwrap().clone()),
                request_id: "r1".into(),
                org: "acme".into(),
            }),
        )
    }

    #[test]
    fn test_kind_follows_payload() {
        let env = quote_request();
        assert_eq!(env.kind(), EnvelopeKind::QuoteRequest);
        assert_eq!(env.to_value().unwrap()["type"], "quote.request");
    }

    #[test]
    fn test_kind_tags() {
        for kind in EnvelopeKind::ALL {
            assert_eq!(EnvelopeKind::from_tag(kind.as_str()), Some(kind));
        }
        assert_eq!(
            EnvelopeKind::from_tag("failure.emit"),
            Some(EnvelopeKind::Failure)
        );
        assert_eq!(EnvelopeKind::from_tag("membrane.inject"), None);
    }

    #[test]
    fn test_only_view_requests_need_quotes() {
        let gated: Vec<_> = EnvelopeKind::ALL
            .into_iter()
            .filter(EnvelopeKind::requires_quote)
            .collect();
        assert_eq!(gated, vec![EnvelopeKind::WorkViewRequest]);
    }

    #[test]
    fn test_canonical_bytes_sorted_and_unsigned() {
        let env = quote_request().sealed(SignatureBlock {
            algorithm: "hmac-sha256".into(),
            key_id: "k1".into(),
            value: "00".into(),
        });
        let canonical = String::from_utf8(env.canonical_bytes().unwrap()).unwrap();

        assert!(!canonical.contains("signature"));
        assert!(canonical.starts_with(r#"{"channel":"#));
        let payload_at = canonical.find(r#""payload""#).unwrap();
        let type_at = canonical.find(r#""type""#).unwrap();
        assert!(payload_at < type_at);
    }

    #[test]
    fn test_sealing_does_not_change_canonical_bytes() {
        let unsigned = quote_request();
        let before = unsigned.canonical_bytes().unwrap();
        let sealed = unsigned.sealed(SignatureBlock {
            algorithm: "ed25519".into(),
            key_id: "k".into(),
            value: "ab".into(),
        });
        assert_eq!(before, sealed.canonical_bytes().unwrap());
        assert!(sealed.signature().is_some());
    }

    #[test]
    fn test_payload_org_lookup() {
        let env = quote_request();
        assert_eq!(env.payload().org(), Some("acme"));
        assert_eq!(env.payload().quote_id(), None);
    }
}
