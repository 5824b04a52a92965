//! # Schema Validator
//!
//! Purely structural validation: presence and JSON type of every field, per
//! declared envelope kind. Values are not interpreted beyond that, except
//! that `channel` must follow the naming convention and timestamps must be
//! RFC 3339.
//!
//! Unknown keys are violations. Nothing is ever defaulted.

use crate::channel::ChannelRoute;
use crate::codec::Frame;
use crate::envelope::{Envelope, EnvelopeKind, Payload, SignatureBlock};
use crate::errors::SchemaViolation;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// JSON type a field must carry.
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    Str,
    Number,
    Bool,
    Object,
    StringArray,
    /// RFC 3339 string.
    Timestamp,
    /// Any non-null value.
    Any,
    /// String from a closed set.
    Enum(&'static [&'static str]),
    /// Nested object with its own field list.
    Shape(&'static [FieldSpec]),
}

impl FieldType {
    fn describe(&self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Object | Self::Shape(_) => "object",
            Self::StringArray => "array of strings",
            Self::Timestamp => "RFC 3339 timestamp string",
            Self::Any => "non-null value",
            Self::Enum(_) => "enumerated string",
        }
    }
}

/// One field of a payload shape.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

// =============================================================================
// PAYLOAD SHAPES
// =============================================================================

use FieldType::{Any, Bool, Enum, Number, Object, Shape, Str, StringArray, Timestamp};

const WORK_VIEW_REQUEST: &[FieldSpec] = &[
    FieldSpec::required("request_id", Str),
    FieldSpec::required("quote_id", Str),
    FieldSpec::required("view_type", Str),
    FieldSpec::required("format", Str),
    FieldSpec::required("scope", Object),
    FieldSpec::optional("params", Object),
];

const WORK_VIEW_RESULT: &[FieldSpec] = &[
    FieldSpec::required("request_id", Str),
    FieldSpec::required("status", Enum(&["ok", "error"])),
    FieldSpec::optional("format", Str),
    FieldSpec::optional("view_type", Str),
    FieldSpec::optional("view_model", Any),
    FieldSpec::optional("provenance", Object),
    FieldSpec::optional("cache", Object),
    FieldSpec::optional("error", Object),
];

const WORK_VIEW_INVALIDATED: &[FieldSpec] = &[
    FieldSpec::required("reasons", StringArray),
    FieldSpec::required("affects", StringArray),
];

const QUOTE_REQUEST: &[FieldSpec] = &[
    FieldSpec::required("work", Str),
    FieldSpec::required("format", Str),
    FieldSpec::optional("estimate", Object),
    FieldSpec::required("request_id", Str),
    FieldSpec::required("org", Str),
];

const PRICE: &[FieldSpec] = &[
    FieldSpec::required("currency", Str),
    FieldSpec::required("amount", Number),
];

const QUOTE_RESPONSE: &[FieldSpec] = &[
    FieldSpec::required("request_id", Str),
    FieldSpec::required("quote_id", Str),
    FieldSpec::required("price", Shape(PRICE)),
    FieldSpec::required("expires_at", Timestamp),
    FieldSpec::required("budget_ok", Bool),
    FieldSpec::required("org", Str),
];

const DEBIT: &[FieldSpec] = &[
    FieldSpec::required("quote_id", Str),
    FieldSpec::required("actual_cost", Number),
    FieldSpec::required("work_completed", Bool),
    FieldSpec::required("org", Str),
];

const FAILURE: &[FieldSpec] = &[
    FieldSpec::required("code_location", Str),
    FieldSpec::required("exception", Str),
    FieldSpec::required("severity", Enum(&["warning", "error", "critical"])),
    FieldSpec::required("suggestion", Str),
    FieldSpec::optional("trace_id", Str),
    FieldSpec::optional("original_envelope", Any),
];

const SIGNATURE: &[FieldSpec] = &[
    FieldSpec::required("algorithm", Str),
    FieldSpec::required("key_id", Str),
    FieldSpec::required("value", Str),
];

const HEADER_KEYS: &[&str] = &["type", "channel", "origin", "timestamp", "payload", "signature"];

/// Field list for a payload kind.
#[must_use]
pub fn payload_shape(kind: EnvelopeKind) -> &'static [FieldSpec] {
    match kind {
        EnvelopeKind::WorkViewRequest => WORK_VIEW_REQUEST,
        EnvelopeKind::WorkViewResult => WORK_VIEW_RESULT,
        EnvelopeKind::WorkViewInvalidated => WORK_VIEW_INVALIDATED,
        EnvelopeKind::QuoteRequest => QUOTE_REQUEST,
        EnvelopeKind::QuoteResponse => QUOTE_RESPONSE,
        EnvelopeKind::Debit => DEBIT,
        EnvelopeKind::Failure => FAILURE,
    }
}

// =============================================================================
// VALIDATOR
// =============================================================================

/// Stateless validator over the static shape registry.
pub struct SchemaValidator;

impl SchemaValidator {
    /// Validate a frame and build the typed envelope.
    ///
    /// # Errors
    ///
    /// The first [`SchemaViolation`] found, with the path of the offending key.
    pub fn validate(frame: &Frame) -> Result<Envelope, SchemaViolation> {
        let body = &frame.body;

        if let Some(unknown) = body.keys().find(|k| !HEADER_KEYS.contains(&k.as_str())) {
            return Err(SchemaViolation::unknown(unknown.clone()));
        }

        let channel = non_empty_str(body, "channel")?;
        let Some(route) = ChannelRoute::parse(channel) else {
            return Err(SchemaViolation::invalid(
                "channel",
                "expected ecosystem/{eco}/org/{org}/<domain>.<action>, \
                 ecosystem/{eco}/protocol/<domain>.<action> or <domain>.<action>",
            ));
        };
        let origin = non_empty_str(body, "origin")?;
        let timestamp = parse_timestamp(
            "timestamp",
            body.get("timestamp")
                .ok_or_else(|| SchemaViolation::missing("timestamp"))?,
        )?;

        let payload_value = body
            .get("payload")
            .ok_or_else(|| SchemaViolation::missing("payload"))?;
        check_object("payload", payload_value, payload_shape(frame.kind))?;
        let payload = Payload::from_value(frame.kind, payload_value.clone())
            .map_err(|e| SchemaViolation::invalid("payload", e.to_string()))?;

        let signature = match body.get("signature") {
            None => None,
            Some(value) => {
                check_object("signature", value, SIGNATURE)?;
                Some(
                    serde_json::from_value::<SignatureBlock>(value.clone())
                        .map_err(|e| SchemaViolation::invalid("signature", e.to_string()))?,
                )
            }
        };

        if let (Some(tenant), Some((path, org))) = (route.tenant(), payload_org(&payload)) {
            if org != tenant {
                return Err(SchemaViolation::invalid(
                    path,
                    format!("{org} does not match channel org {tenant}"),
                ));
            }
        }

        let envelope =
            Envelope::new(channel, origin, timestamp, payload).with_received(body.clone());
        Ok(match signature {
            Some(sig) => envelope.sealed(sig),
            None => envelope,
        })
    }
}

/// Organization named in the payload, with its path.
fn payload_org(payload: &Payload) -> Option<(&'static str, &str)> {
    let path = match payload {
        Payload::WorkViewRequest(_) => "payload.scope.org",
        _ => "payload.org",
    };
    payload.org().map(|org| (path, org))
}

fn non_empty_str<'a>(body: &'a Map<String, Value>, key: &str) -> Result<&'a str, SchemaViolation> {
    match body.get(key) {
        None => Err(SchemaViolation::missing(key)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) => Err(SchemaViolation::invalid(key, "must not be empty")),
        Some(_) => Err(SchemaViolation::wrong_type(key, "string")),
    }
}

fn parse_timestamp(path: &str, value: &Value) -> Result<DateTime<Utc>, SchemaViolation> {
    let text = value
        .as_str()
        .ok_or_else(|| SchemaViolation::wrong_type(path, FieldType::Timestamp.describe()))?;
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchemaViolation::invalid(path, e.to_string()))
}

fn check_object(path: &str, value: &Value, fields: &[FieldSpec]) -> Result<(), SchemaViolation> {
    let Value::Object(map) = value else {
        return Err(SchemaViolation::wrong_type(path, "object"));
    };

    if let Some(unknown) = map.keys().find(|k| !fields.iter().any(|f| f.name == k.as_str())) {
        return Err(SchemaViolation::unknown(format!("{path}.{unknown}")));
    }

    for field in fields {
        let field_path = format!("{path}.{}", field.name);
        match map.get(field.name) {
            None if field.required => return Err(SchemaViolation::missing(field_path)),
            None => {}
            Some(v) => check_field(&field_path, v, field.ty)?,
        }
    }
    Ok(())
}

fn check_field(path: &str, value: &Value, ty: FieldType) -> Result<(), SchemaViolation> {
    let ok = match (ty, value) {
        (_, Value::Null) => false,
        (FieldType::Str, Value::String(_)) => true,
        (FieldType::Number, Value::Number(_)) => true,
        (FieldType::Bool, Value::Bool(_)) => true,
        (FieldType::Object, Value::Object(_)) => true,
        (FieldType::Any, _) => true,
        (FieldType::StringArray, Value::Array(items)) => {
            if let Some(i) = items.iter().position(|v| !v.is_string()) {
                return Err(SchemaViolation::wrong_type(format!("{path}[{i}]"), "string"));
            }
            true
        }
        (FieldType::Timestamp, v) => {
            parse_timestamp(path, v)?;
            true
        }
        (FieldType::Enum(allowed), Value::String(s)) => {
            if !allowed.contains(&s.as_str()) {
                return Err(SchemaViolation::invalid(
                    path,
                    format!("expected one of {}", allowed.join(", ")),
                ));
            }
            true
        }
        (FieldType::Shape(fields), v) => {
            check_object(path, v, fields)?;
            true
        }
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(SchemaViolation::wrong_type(path, ty.describe()))
    }
}
