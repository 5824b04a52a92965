//! # Quote Desk
//!
//! In-process responder for `quote.request`. Prices come from the flat CPS-1
//! tariff; there is no price model here. Issued quotes are registered with
//! the [`QuoteRegistry`] before the response is published, so a client can
//! spend the quote as soon as it sees the response.

use crate::quote_registry::{Quote, QuoteRegistry};
use chrono::{DateTime, Duration, Utc};
use membrane_types::{
    ChannelRoute, Envelope, EnvelopeSigner, Payload, Price, QuoteRequest, QuoteResponse,
    SigningError, HUB_ORIGIN,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Price of a `json` view (a "tool request").
pub const JSON_VIEW_PRICE: f64 = 0.05;

/// Price per rendered page of an `mdx` or `html` document.
pub const DOC_PAGE_PRICE: f64 = 5.0;

/// Default quote lifetime.
pub const DEFAULT_QUOTE_TTL_SECS: i64 = 300;

/// Default per-tenant budget ceiling, in $MIND.
pub const DEFAULT_TENANT_BUDGET: f64 = 100.0;

/// Topic used for replies when the request channel has no `.request` suffix.
const FALLBACK_REPLY_TOPIC: &str = "economy.quote.response";

/// Tariff lookup: `json` (and anything unknown) is a flat 0.05 $MIND,
/// `mdx`/`html` cost 5.0 per page from `estimate.render_pages` (default 1).
#[must_use]
pub fn price_for(format: &str, estimate: Option<&Map<String, Value>>) -> Price {
    match format {
        "mdx" | "html" => {
            let pages = estimate
                .and_then(|e| e.get("render_pages"))
                .and_then(Value::as_f64)
                .filter(|p| p.is_finite() && *p >= 1.0)
                .unwrap_or(1.0);
            Price::mind(DOC_PAGE_PRICE * pages)
        }
        _ => Price::mind(JSON_VIEW_PRICE),
    }
}

/// Desk settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteDeskConfig {
    pub ttl: Duration,
    pub tenant_budget: f64,
}

impl Default for QuoteDeskConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_QUOTE_TTL_SECS),
            tenant_budget: DEFAULT_TENANT_BUDGET,
        }
    }
}

/// Issues quotes on behalf of the hub.
pub struct QuoteDesk {
    config: QuoteDeskConfig,
    quotes: Arc<QuoteRegistry>,
    signer: EnvelopeSigner,
}

impl QuoteDesk {
    #[must_use]
    pub fn new(config: QuoteDeskConfig, quotes: Arc<QuoteRegistry>, signer: EnvelopeSigner) -> Self {
        Self {
            config,
            quotes,
            signer,
        }
    }

    /// Answer an admitted quote request on behalf of `tenant`, the tenant the
    /// quota gate will later check. The returned envelope is signed and
    /// addressed to the sibling reply channel; the quote is already registered.
    ///
    /// # Errors
    ///
    /// [`SigningError`] if the response cannot be signed. No quote is
    /// registered in that case.
    pub fn respond(
        &self,
        request_channel: &str,
        tenant: &str,
        request: &QuoteRequest,
    ) -> Result<Envelope, SigningError> {
        self.respond_at(request_channel, tenant, request, Utc::now())
    }

    pub fn respond_at(
        &self,
        request_channel: &str,
        tenant: &str,
        request: &QuoteRequest,
        now: DateTime<Utc>,
    ) -> Result<Envelope, SigningError> {
        let price = price_for(&request.format, request.estimate.as_ref());
        let response = QuoteResponse {
            request_id: request.request_id.clone(),
            quote_id: format!("q-{}", Uuid::new_v4()),
            budget_ok: price.amount <= self.config.tenant_budget,
            price,
            expires_at: now
                .checked_add_signed(self.config.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            org: tenant.to_string(),
        };
        let quote = Quote::from_response(&response);
        let budget_ok = response.budget_ok;

        let envelope = self.signer.sign(Envelope::new(
            reply_channel(request_channel),
            HUB_ORIGIN,
            now,
            Payload::QuoteResponse(response),
        ))?;
        info!(
            request_id = %request.request_id,
            quote_id = %quote.quote_id,
            tenant = %quote.tenant,
            amount = quote.price.amount,
            budget_ok,
            "Quote issued"
        );
        self.quotes.insert(quote);
        Ok(envelope)
    }
}

fn reply_channel(request_channel: &str) -> String {
    match ChannelRoute::parse(request_channel) {
        Some(route) => route
            .reply()
            .unwrap_or_else(|| route.sibling(FALLBACK_REPLY_TOPIC))
            .to_string(),
        None => FALLBACK_REPLY_TOPIC.to_string(),
    }
}
