//! # Rejection Reporter
//!
//! Converts every rejection into exactly one signed `failure` envelope,
//! publishes it on the failure channel of the rejected envelope's scope, and
//! hands it back to the caller so the publishing connection can be told too.

use crate::dispatcher::{DispatchReport, Dispatcher};
use chrono::Utc;
use membrane_types::{
    failure_channel_for, Envelope, EnvelopeSigner, Payload, Rejection, RejectionRecord, Severity,
    SigningError, HUB_ORIGIN,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// What the reporter knows about the refused envelope.
#[derive(Debug, Clone, Default)]
pub struct RejectionContext {
    pub trace_id: Option<Uuid>,
    /// Channel as sent, if it could be read.
    pub channel: Option<String>,
    /// Origin as sent, if it could be read.
    pub origin: Option<String>,
    /// Evidence, kept only for protocol violations.
    pub evidence: Option<Value>,
}

/// A published rejection.
#[derive(Debug, Clone)]
pub struct RejectionReport {
    pub record: RejectionRecord,
    /// Signed failure envelope, as dispatched.
    pub envelope: Envelope,
    pub dispatch: DispatchReport,
}

/// Publishes rejection records.
pub struct RejectionReporter {
    signer: EnvelopeSigner,
    dispatcher: Arc<Dispatcher>,
}

impl RejectionReporter {
    #[must_use]
    pub fn new(signer: EnvelopeSigner, dispatcher: Arc<Dispatcher>) -> Self {
        Self { signer, dispatcher }
    }

    /// Build the record for `rejection`.
    #[must_use]
    pub fn record(rejection: &Rejection, ctx: &RejectionContext) -> RejectionRecord {
        let mut record = RejectionRecord::new(
            rejection.code_location(),
            rejection.to_string(),
            rejection.severity(),
            rejection.suggestion(),
        );
        if let Some(trace_id) = ctx.trace_id {
            record = record.with_trace_id(trace_id.to_string());
        }
        if rejection.is_protocol_violation() {
            if let Some(evidence) = &ctx.evidence {
                record = record.with_original_envelope(evidence.clone());
            }
        }
        record
    }

    /// Publish one rejection.
    ///
    /// # Errors
    ///
    /// [`SigningError`] if the failure envelope cannot be signed; nothing is
    /// published then.
    pub fn report(
        &self,
        rejection: &Rejection,
        ctx: &RejectionContext,
    ) -> Result<RejectionReport, SigningError> {
        let record = Self::record(rejection, ctx);
        let failure_channel = failure_channel_for(ctx.channel.as_deref());
        let trace_id = ctx.trace_id.map(|t| t.to_string()).unwrap_or_default();
        let channel = ctx.channel.as_deref().unwrap_or("<unknown>");
        let origin = ctx.origin.as_deref().unwrap_or("<unknown>");

        match record.severity {
            Severity::Warning => warn!(
                trace_id = %trace_id,
                channel = %channel,
                origin = %origin,
                reason = rejection.reason_label(),
                severity = %record.severity,
                error = %rejection,
                "Envelope rejected"
            ),
            Severity::Error | Severity::Critical => error!(
                trace_id = %trace_id,
                channel = %channel,
                origin = %origin,
                reason = rejection.reason_label(),
                severity = %record.severity,
                error = %rejection,
                "Envelope rejected"
            ),
        }

        let envelope = self.signer.sign(Envelope::new(
            failure_channel,
            HUB_ORIGIN,
            Utc::now(),
            Payload::Failure(record.clone()),
        ))?;
        let dispatch = self.dispatcher.dispatch(&envelope);

        Ok(RejectionReport {
            record,
            envelope,
            dispatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelSubscriber, ConnectionId, SubscriptionRegistry};
    use membrane_types::{AuthFailure, QuotaDenied, GLOBAL_FAILURE_CHANNEL};
    use serde_json::json;

    fn reporter() -> (RejectionReporter, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        let signer = EnvelopeSigner::hmac("hub", b"hub-secret".to_vec());
        (RejectionReporter::new(signer, dispatcher), registry)
    }

    #[test]
    fn test_auth_rejection_keeps_evidence_and_is_critical() {
        let (reporter, registry) = reporter();
        let (sub, mut rx) = ChannelSubscriber::new(ConnectionId::next(), 4);
        registry.subscribe(
            Arc::new(sub),
            &["ecosystem/mind/org/acme/failure.emit".to_string()],
        );

        let trace = Uuid::new_v4();
        let ctx = RejectionContext {
            trace_id: Some(trace),
            channel: Some("ecosystem/mind/org/acme/docs.view.request".into()),
            origin: Some("l9.rogue".into()),
            evidence: Some(json!({"type": "docs.view.request"})),
        };
        let report = reporter
            .report(&Rejection::from(AuthFailure::SignatureMismatch), &ctx)
            .unwrap();

        assert_eq!(report.record.severity, Severity::Critical);
        assert_eq!(report.record.trace_id, Some(trace.to_string()));
        assert!(report.record.original_envelope.is_some());
        assert_eq!(report.envelope.origin(), HUB_ORIGIN);
        assert!(report.envelope.signature().is_some());
        assert_eq!(report.dispatch.delivered, 1);

        let frame = rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "failure");
        assert_eq!(value["payload"]["severity"], "critical");
    }

    #[test]
    fn test_quota_rejection_drops_evidence() {
        let (reporter, _) = reporter();
        let ctx = RejectionContext {
            channel: Some("ecosystem/mind/org/acme/docs.view.request".into()),
            evidence: Some(json!({"anything": true})),
            ..RejectionContext::default()
        };
        let report = reporter
            .report(
                &Rejection::from(QuotaDenied::AlreadyConsumed("q-1".into())),
                &ctx,
            )
            .unwrap();
        assert_eq!(report.record.severity, Severity::Error);
        assert!(report.record.original_envelope.is_none());
        assert_eq!(
            report.envelope.channel(),
            "ecosystem/mind/org/acme/failure.emit"
        );
    }

    #[test]
    fn test_unreadable_channel_goes_global() {
        let (reporter, _) = reporter();
        let report = reporter
            .report(
                &Rejection::from(membrane_types::DecodeError::NotAnObject),
                &RejectionContext::default(),
            )
            .unwrap();
        assert_eq!(report.envelope.channel(), GLOBAL_FAILURE_CHANNEL);
    }
}
