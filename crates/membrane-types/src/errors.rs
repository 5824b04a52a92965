//! # Error Types
//!
//! One error enum per pipeline stage, plus the [`Rejection`] umbrella that
//! the reporter turns into a [`RejectionRecord`](crate::RejectionRecord).

use crate::rejection::Severity;
use std::fmt;
use thiserror::Error;

/// Errors raised by the envelope codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame larger than the configured maximum.
    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Not valid JSON.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Valid JSON, but not an object.
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// Object without a string `type` field.
    #[error("Missing envelope type")]
    MissingType,

    /// `type` not in the closed set of envelope kinds.
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),
}

/// Why a field failed structural validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationReason {
    Missing,
    WrongType,
    Unknown,
    Invalid,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Missing => "missing required field",
            Self::WrongType => "wrong type",
            Self::Unknown => "unknown field",
            Self::Invalid => "invalid value",
        })
    }
}

/// A structural violation, pointing at the offending key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Schema violation at `{path}`: {reason}{}", detail_suffix(.detail))]
pub struct SchemaViolation {
    /// Dotted path such as `payload.quote_id` or `signature.key_id`.
    pub path: String,
    pub reason: ViolationReason,
    pub detail: Option<String>,
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

impl SchemaViolation {
    pub fn missing(path: impl Into<String>) -> Self {
        Self::new(path, ViolationReason::Missing)
    }

    pub fn wrong_type(path: impl Into<String>, expected: &str) -> Self {
        Self::new(path, ViolationReason::WrongType).detailed(format!("expected {expected}"))
    }

    pub fn unknown(path: impl Into<String>) -> Self {
        Self::new(path, ViolationReason::Unknown)
    }

    pub fn invalid(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(path, ViolationReason::Invalid).detailed(detail)
    }

    fn new(path: impl Into<String>, reason: ViolationReason) -> Self {
        Self {
            path: path.into(),
            reason,
            detail: None,
        }
    }

    fn detailed(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Signature verification failures. All of them fail closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("Missing signature")]
    MissingSignature,

    #[error("Signature suite not allowed: {0}")]
    SuiteNotAllowed(String),

    #[error("No key bound to origin {0}")]
    UnknownOrigin(String),

    /// Declared algorithm differs from the suite bound to the origin.
    #[error("Suite mismatch for origin {origin}: declared {declared}, bound {bound}")]
    SuiteMismatch {
        origin: String,
        declared: String,
        bound: String,
    },

    #[error("Key id mismatch for origin {origin}: declared {declared}")]
    KeyMismatch { origin: String, declared: String },

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Envelope could not be canonicalized: {0}")]
    Canonicalization(String),

    /// `quote.response` from an origin outside the economy allow-list.
    #[error("Origin {0} is not allowed to issue quotes")]
    UntrustedQuoteIssuer(String),
}

/// The hub could not sign one of its own envelopes.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Envelope could not be canonicalized: {0}")]
    Canonicalization(#[from] serde_json::Error),
}

/// Quota gate denials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaDenied {
    #[error("Missing quote_id")]
    MissingQuoteId,

    #[error("Unknown quote: {0}")]
    UnknownQuote(String),

    #[error("Quote expired: {0}")]
    Expired(String),

    #[error("Quote already consumed: {0}")]
    AlreadyConsumed(String),

    #[error("Quote {quote_id} was issued to another tenant than {tenant}")]
    TenantMismatch { quote_id: String, tenant: String },
}

/// Token bucket empty for `(tenant, channel)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rate limited: tenant {tenant} on channel {channel}")]
pub struct RateLimited {
    pub tenant: String,
    pub channel: String,
}

/// Any reason an envelope was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error(transparent)]
    Auth(#[from] AuthFailure),

    #[error(transparent)]
    Quota(#[from] QuotaDenied),

    #[error(transparent)]
    RateLimited(#[from] RateLimited),
}

impl Rejection {
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Decode(_) | Self::RateLimited(_) => Severity::Warning,
            Self::Schema(_) | Self::Quota(_) => Severity::Error,
            Self::Auth(_) => Severity::Critical,
        }
    }

    /// Stage that raised the rejection, for the record's `code_location`.
    #[must_use]
    pub fn code_location(&self) -> &'static str {
        match self {
            Self::Decode(_) => "protocol.hub.codec:decode",
            Self::Schema(_) => "protocol.hub.schema:validate",
            Self::Auth(_) => "protocol.hub.auth:verify",
            Self::Quota(_) => "protocol.hub.quota:admit",
            Self::RateLimited(_) => "protocol.hub.rate_limit:allow",
        }
    }

    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Decode(DecodeError::PayloadTooLarge { .. }) => {
                "Reduce the envelope size below the configured maximum"
            }
            Self::Decode(DecodeError::UnknownType(_)) => "Use a supported envelope type",
            Self::Decode(_) => "Send a single JSON envelope object per frame",
            Self::Schema(_) => "Check envelope schema against the declared type",
            Self::Auth(_) => "Check the origin's signing key and signature suite",
            Self::Quota(_) => "Request a fresh quote before retrying",
            Self::RateLimited(_) => "Back off and retry after the rate-limit window refills",
        }
    }

    /// Decode, schema and auth failures keep the original envelope as evidence.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Schema(_) | Self::Auth(_))
    }

    /// Short label for metrics.
    #[must_use]
    pub fn reason_label(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Schema(_) => "schema",
            Self::Auth(_) => "auth",
            Self::Quota(_) => "quota",
            Self::RateLimited(_) => "rate_limited",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            Rejection::from(DecodeError::NotAnObject).severity(),
            Severity::Warning
        );
        assert_eq!(
            Rejection::from(SchemaViolation::missing("payload.org")).severity(),
            Severity::Error
        );
        assert_eq!(
            Rejection::from(AuthFailure::SignatureMismatch).severity(),
            Severity::Critical
        );
        assert_eq!(
            Rejection::from(QuotaDenied::MissingQuoteId).severity(),
            Severity::Error
        );
        let limited = RateLimited {
            tenant: "acme".into(),
            channel: "c".into(),
        };
        assert_eq!(Rejection::from(limited).severity(), Severity::Warning);
    }

    #[test]
    fn test_protocol_violations_keep_evidence() {
        assert!(Rejection::from(AuthFailure::MissingSignature).is_protocol_violation());
        assert!(!Rejection::from(QuotaDenied::Expired("q-1".into())).is_protocol_violation());
    }

    #[test]
    fn test_schema_violation_message_names_path() {
        let err = SchemaViolation::wrong_type("payload.rows", "number");
        let text = err.to_string();
        assert!(text.contains("payload.rows"));
        assert!(text.contains("expected number"));
    }
}
