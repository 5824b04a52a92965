//! Rejection records: the fail-loud report emitted whenever an envelope does
//! not reach dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Severity of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure payload.
///
/// `original_envelope` is only populated for protocol-level violations
/// (decode, schema, auth) so the evidence is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RejectionRecord {
    pub code_location: String,
    pub exception: String,
    pub severity: Severity,
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_envelope: Option<Value>,
}

impl RejectionRecord {
    pub fn new(
        code_location: impl Into<String>,
        exception: impl Into<String>,
        severity: Severity,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code_location: code_location.into(),
            exception: exception.into(),
            severity,
            suggestion: suggestion.into(),
            trace_id: None,
            original_envelope: None,
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn with_original_envelope(mut self, original: Value) -> Self {
        self.original_envelope = Some(original);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let record = RejectionRecord::new("hub:x", "boom", Severity::Error, "retry");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["severity"], "error");
        assert!(value.get("trace_id").is_none());
        assert!(value.get("original_envelope").is_none());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = r#"{"code_location":"a","exception":"b","severity":"warning","suggestion":"c","extra":1}"#;
        assert!(serde_json::from_str::<RejectionRecord>(raw).is_err());
    }
}
