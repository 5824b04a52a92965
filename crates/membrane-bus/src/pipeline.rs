//! # Admission Pipeline
//!
//! ```text
//! RECEIVED -> DECODED -> SCHEMA_OK -> AUTH_OK -> [QUOTA_OK] -> RATE_OK -> DISPATCHED
//!     \__________\___________\___________\____________\___________\_____> REJECTED
//! ```
//!
//! Gate order is Auth, then Quota, then Rate-limit. `DISPATCHED` and
//! `REJECTED` are terminal. Every rejection produces exactly one record via
//! the [`RejectionReporter`].

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::economy::QuoteDesk;
use crate::quote_registry::{Quote, QuoteRegistry};
use crate::rate_limiter::RateLimiter;
use crate::reporter::{RejectionContext, RejectionReport, RejectionReporter};
use chrono::Utc;
use membrane_types::codec::evidence;
use membrane_types::{
    AuthFailure, AuthenticityVerifier, ChannelRoute, Envelope, EnvelopeCodec, EnvelopeKind,
    KeyProvider, KeyRing, Payload, QuotaDenied, Rejection, SchemaValidator,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Channel actions that always require a quote, whatever the envelope kind.
pub const DEFAULT_PAID_ACTIONS: [&str; 3] = [
    "docs.view.request",
    "docs.generate.request",
    "validation.assessment.request",
];

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Per-envelope pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Received,
    Decoded,
    SchemaOk,
    AuthOk,
    QuotaOk,
    RateOk,
    Dispatched,
    Rejected,
}

impl Stage {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Rejected)
    }

    #[must_use]
    pub fn can_advance_to(&self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Rejected) => !from.is_terminal(),
            (Received, Decoded)
            | (Decoded, SchemaOk)
            | (SchemaOk, AuthOk)
            | (AuthOk, QuotaOk)
            | (AuthOk, RateOk)
            | (QuotaOk, RateOk)
            | (RateOk, Dispatched) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Decoded => "decoded",
            Self::SchemaOk => "schema_ok",
            Self::AuthOk => "auth_ok",
            Self::QuotaOk => "quota_ok",
            Self::RateOk => "rate_ok",
            Self::Dispatched => "dispatched",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broken pipeline invariant. Fatal for the connection that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("Illegal stage transition {from} -> {to} (trace {trace_id})")]
    IllegalTransition {
        trace_id: Uuid,
        from: Stage,
        to: Stage,
    },

    #[error("Failed to sign hub envelope (trace {trace_id}): {reason}")]
    Signing { trace_id: Uuid, reason: String },
}

/// Trace of one envelope through the pipeline.
#[derive(Debug, Clone)]
pub struct EnvelopeTrace {
    trace_id: Uuid,
    stage: Stage,
}

impl EnvelopeTrace {
    #[must_use]
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            stage: Stage::Received,
        }
    }

    #[must_use]
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// [`StageError::IllegalTransition`] for anything the state machine does
    /// not allow, including leaving a terminal stage.
    pub fn advance(&mut self, next: Stage) -> Result<(), StageError> {
        if !self.stage.can_advance_to(next) {
            return Err(StageError::IllegalTransition {
                trace_id: self.trace_id,
                from: self.stage,
                to: next,
            });
        }
        debug!(trace_id = %self.trace_id, from = %self.stage, stage = %next, "Stage advanced");
        self.stage = next;
        Ok(())
    }
}

impl Default for EnvelopeTrace {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Terminal result of one inbound frame.
#[derive(Debug, Clone)]
pub enum Outcome {
    Dispatched {
        trace_id: Uuid,
        kind: EnvelopeKind,
        report: DispatchReport,
        /// Whether the envelope went through the quota gate.
        metered: bool,
        /// Envelopes the hub produced in response (quote desk replies).
        replies: Vec<(Envelope, DispatchReport)>,
    },
    Rejected {
        trace_id: Uuid,
        rejection: Rejection,
        report: RejectionReport,
    },
}

impl Outcome {
    #[must_use]
    pub fn trace_id(&self) -> Uuid {
        match self {
            Self::Dispatched { trace_id, .. } | Self::Rejected { trace_id, .. } => *trace_id,
        }
    }

    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected { rejection, .. } => Some(rejection),
            Self::Dispatched { .. } => None,
        }
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Everything the pipeline needs, shared with the rest of the service.
pub struct PipelineParts<K: KeyProvider = KeyRing> {
    pub codec: EnvelopeCodec,
    pub verifier: AuthenticityVerifier<K>,
    pub quotes: Arc<QuoteRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<Dispatcher>,
    pub reporter: RejectionReporter,
    pub desk: Option<QuoteDesk>,
    pub paid_actions: Vec<String>,
    /// Origins allowed to publish `quote.response`.
    pub quote_issuers: Vec<String>,
}

/// Runs inbound frames through every gate and dispatches survivors.
pub struct AdmissionPipeline<K: KeyProvider = KeyRing> {
    codec: EnvelopeCodec,
    verifier: AuthenticityVerifier<K>,
    quotes: Arc<QuoteRegistry>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<Dispatcher>,
    reporter: RejectionReporter,
    desk: Option<QuoteDesk>,
    paid_actions: Vec<String>,
    quote_issuers: Vec<String>,
}

impl<K: KeyProvider> AdmissionPipeline<K> {
    #[must_use]
    pub fn new(parts: PipelineParts<K>) -> Self {
        Self {
            codec: parts.codec,
            verifier: parts.verifier,
            quotes: parts.quotes,
            limiter: parts.limiter,
            dispatcher: parts.dispatcher,
            reporter: parts.reporter,
            desk: parts.desk,
            paid_actions: parts.paid_actions,
            quote_issuers: parts.quote_issuers,
        }
    }

    #[must_use]
    pub fn quotes(&self) -> &Arc<QuoteRegistry> {
        &self.quotes
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Run one inbound frame to a terminal stage.
    ///
    /// # Errors
    ///
    /// Only for a broken state machine ([`StageError`]). Every ordinary
    /// refusal is an [`Outcome::Rejected`].
    pub fn process(&self, bytes: &[u8]) -> Result<Outcome, StageError> {
        let mut trace = EnvelopeTrace::new();

        let frame = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                let evidence = evidence(bytes);
                let channel = evidence
                    .get("channel")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let origin = evidence
                    .get("origin")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let ctx = RejectionContext {
                    trace_id: Some(trace.trace_id()),
                    channel,
                    origin,
                    evidence: Some(evidence),
                };
                return self.reject(trace, e.into(), ctx);
            }
        };
        trace.advance(Stage::Decoded)?;

        let envelope = match SchemaValidator::validate(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                let ctx = RejectionContext {
                    trace_id: Some(trace.trace_id()),
                    channel: frame.channel().map(str::to_string),
                    origin: frame.origin().map(str::to_string),
                    evidence: Some(frame.to_value()),
                };
                return self.reject(trace, e.into(), ctx);
            }
        };
        trace.advance(Stage::SchemaOk)?;

        let ctx = RejectionContext {
            trace_id: Some(trace.trace_id()),
            channel: Some(envelope.channel().to_string()),
            origin: Some(envelope.origin().to_string()),
            evidence: Some(frame.to_value()),
        };
        let metered = match self.gate(&mut trace, &envelope)? {
            Ok(metered) => metered,
            Err(rejection) => return self.reject(trace, rejection, ctx),
        };

        self.admit(trace, envelope, metered)
    }

    /// Auth, quota and rate-limit gates. The inner `bool` is true when the
    /// quota gate applied.
    fn gate(
        &self,
        trace: &mut EnvelopeTrace,
        envelope: &Envelope,
    ) -> Result<Result<bool, Rejection>, StageError> {
        if let Err(e) = self
            .verifier
            .verify(envelope)
            .and_then(|()| self.check_issuer(envelope))
        {
            return Ok(Err(e.into()));
        }
        trace.advance(Stage::AuthOk)?;

        let tenant = tenant_of(envelope);
        let quota = match envelope.payload() {
            Payload::Debit(debit) => Some(
                self.quotes
                    .consume(&debit.quote_id, &tenant)
                    .map(|settlement| debug!(quote_id = %debit.quote_id, ?settlement, "Debit settled")),
            ),
            payload if self.requires_quote(envelope) => Some(match payload.quote_id() {
                Some(quote_id) => self.quotes.admit(quote_id, &tenant),
                None => Err(QuotaDenied::MissingQuoteId),
            }),
            _ => None,
        };
        let metered = match quota {
            Some(Err(e)) => return Ok(Err(e.into())),
            Some(Ok(())) => {
                trace.advance(Stage::QuotaOk)?;
                true
            }
            None => false,
        };

        if let Err(e) = self.limiter.allow(&tenant, envelope.channel()) {
            return Ok(Err(e.into()));
        }
        trace.advance(Stage::RateOk)?;
        Ok(Ok(metered))
    }

    /// Quotes may only be minted by the economy service or the hub itself.
    fn check_issuer(&self, envelope: &Envelope) -> Result<(), AuthFailure> {
        if envelope.kind() != EnvelopeKind::QuoteResponse
            || self.quote_issuers.iter().any(|o| o == envelope.origin())
        {
            return Ok(());
        }
        Err(AuthFailure::UntrustedQuoteIssuer(
            envelope.origin().to_string(),
        ))
    }

    fn admit(
        &self,
        mut trace: EnvelopeTrace,
        envelope: Envelope,
        metered: bool,
    ) -> Result<Outcome, StageError> {
        if let Payload::QuoteResponse(response) = envelope.payload() {
            self.quotes.insert(Quote::from_response(response));
        }

        let report = self.dispatcher.dispatch(&envelope);
        trace.advance(Stage::Dispatched)?;
        info!(
            trace_id = %trace.trace_id(),
            channel = %envelope.channel(),
            origin = %envelope.origin(),
            kind = %envelope.kind(),
            stage = %trace.stage(),
            delivered = report.delivered,
            "Envelope admitted"
        );

        let mut replies = Vec::new();
        if let (Some(desk), Payload::QuoteRequest(request)) = (&self.desk, envelope.payload()) {
            let reply = desk
                .respond(envelope.channel(), &tenant_of(&envelope), request)
                .map_err(|e| StageError::Signing {
                    trace_id: trace.trace_id(),
                    reason: e.to_string(),
                })?;
            let reply_report = self.dispatcher.dispatch(&reply);
            replies.push((reply, reply_report));
        }

        Ok(Outcome::Dispatched {
            trace_id: trace.trace_id(),
            kind: envelope.kind(),
            report,
            metered,
            replies,
        })
    }

    fn reject(
        &self,
        mut trace: EnvelopeTrace,
        rejection: Rejection,
        ctx: RejectionContext,
    ) -> Result<Outcome, StageError> {
        trace.advance(Stage::Rejected)?;
        let report =
            self.reporter
                .report(&rejection, &ctx)
                .map_err(|e| StageError::Signing {
                    trace_id: trace.trace_id(),
                    reason: e.to_string(),
                })?;
        Ok(Outcome::Rejected {
            trace_id: trace.trace_id(),
            rejection,
            report,
        })
    }

    /// Quota-required: state-changing kinds, plus anything but failures and
    /// debits sent on a paid channel action.
    #[must_use]
    pub fn requires_quote(&self, envelope: &Envelope) -> bool {
        let kind = envelope.kind();
        if kind.requires_quote() {
            return true;
        }
        if matches!(kind, EnvelopeKind::Failure | EnvelopeKind::Debit) {
            return false;
        }
        ChannelRoute::parse(envelope.channel())
            .is_some_and(|route| self.paid_actions.iter().any(|a| a == route.topic()))
    }

    /// Purge expired quotes, idle rate-limit buckets and idle ordering locks.
    pub fn sweep(&self) {
        let quotes = self.quotes.purge_expired(Utc::now());
        let buckets = self.limiter.cleanup(self.limiter.config().window);
        let channels = self.dispatcher.prune_idle();
        debug!(quotes, buckets, channels, "Sweep complete");
    }
}

/// Periodically run [`AdmissionPipeline::sweep`].
pub async fn sweep_task<K: KeyProvider>(pipeline: Arc<AdmissionPipeline<K>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        pipeline.sweep();
    }
}

/// Tenant for quota and rate-limit purposes: the channel's org, else the
/// payload's org, else the origin.
#[must_use]
pub fn tenant_of(envelope: &Envelope) -> String {
    ChannelRoute::parse(envelope.channel())
        .and_then(|route| route.tenant().map(str::to_string))
        .or_else(|| envelope.payload().org().map(str::to_string))
        .unwrap_or_else(|| envelope.origin().to_string())
}
