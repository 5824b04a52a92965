//! Hub service: wires the admission pipeline to the WebSocket endpoints.
//!
//! ```text
//!   GET /inject   ── WebSocket ──► AdmissionPipeline ──► Dispatcher
//!   GET /observe  ── WebSocket ◄── ChannelSubscriber ◄──┘
//!   GET /health   ── JSON status
//!   GET /metrics  ── Prometheus text
//! ```

use crate::config::HubConfig;
use crate::error::HubError;
use crate::ws::{self, InjectSession, ObserveSession};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use membrane_bus::{
    sweep_task, AdmissionPipeline, Dispatcher, PipelineParts, QuoteDesk, QuoteDeskConfig,
    QuoteRegistry, RateLimiter, RejectionReporter, SubscriptionRegistry,
};
use membrane_types::{
    AuthenticityVerifier, EnvelopeCodec, EnvelopeSigner, HUB_KEY_ID, HUB_ORIGIN,
};
use rand::RngCore;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Length of a generated hub signing secret.
const GENERATED_HUB_KEY_LEN: usize = 32;

/// State shared by every connection.
#[derive(Clone)]
pub struct HubState {
    pub pipeline: Arc<AdmissionPipeline>,
    pub registry: Arc<SubscriptionRegistry>,
    /// Outbound queue length per observe connection.
    pub subscriber_queue: usize,
}

/// The membrane hub.
pub struct HubService {
    config: HubConfig,
    state: HubState,
}

impl HubService {
    /// Build the pipeline and shared state from `config`.
    ///
    /// # Errors
    ///
    /// [`HubError::Config`] if the configuration does not validate.
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;

        let hub_secret = config.hub_key.clone().unwrap_or_else(|| {
            warn!("MEMBRANE_HUB_KEY not set, hub envelopes are signed with an ephemeral key");
            let mut secret = vec![0u8; GENERATED_HUB_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        });
        let signer = EnvelopeSigner::hmac(HUB_KEY_ID, hub_secret);

        let mut keys = config.keys.clone();
        keys.insert(HUB_ORIGIN, signer.key_id(), signer.verification_material());

        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        let quotes = Arc::new(QuoteRegistry::new());
        let desk = config.quote_desk.then(|| {
            QuoteDesk::new(
                QuoteDeskConfig {
                    ttl: config.quote_ttl,
                    tenant_budget: config.tenant_budget,
                },
                Arc::clone(&quotes),
                signer.clone(),
            )
        });

        let pipeline = Arc::new(AdmissionPipeline::new(PipelineParts {
            codec: EnvelopeCodec::new(config.max_payload_bytes),
            verifier: AuthenticityVerifier::new(config.signature_suites.clone(), keys),
            quotes,
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            dispatcher: Arc::clone(&dispatcher),
            reporter: RejectionReporter::new(signer, dispatcher),
            desk,
            paid_actions: config.paid_actions.clone(),
            quote_issuers: std::iter::once(HUB_ORIGIN.to_string())
                .chain(config.economy_origins.iter().cloned())
                .collect(),
        }));

        let state = HubState {
            pipeline,
            registry,
            subscriber_queue: config.subscriber_queue,
        };
        Ok(Self { config, state })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn state(&self) -> &HubState {
        &self.state
    }

    /// HTTP router with every endpoint mounted. Unknown paths get 404.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/inject", get(inject_upgrade))
            .route("/observe", get(observe_upgrade))
            .route("/health", get(health_check))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// [`HubError::Bind`] if the address is unavailable, [`HubError::Serve`]
    /// if the server fails.
    pub async fn run<F>(self, shutdown: F) -> Result<(), HubError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HubError::Bind { addr, source })?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// [`HubError::Serve`] if the server fails.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), HubError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper = tokio::spawn(sweep_task(
            Arc::clone(&self.state.pipeline),
            self.config.sweep_interval,
        ));

        let addr = listener.local_addr().map_err(HubError::Serve)?;
        info!(
            addr = %addr,
            suites = ?self.config.signature_suites,
            keys = self.config.keys.len(),
            quote_desk = self.config.quote_desk,
            economy_origins = ?self.config.economy_origins,
            "Membrane hub listening"
        );

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(HubError::Serve);

        sweeper.abort();
        info!("Membrane hub stopped");
        result
    }
}

async fn inject_upgrade(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    let limit = ws::transport_limit(state.pipeline.codec().max_payload_bytes());
    ws.max_message_size(limit)
        .on_upgrade(move |socket| InjectSession::new(state).run(socket))
}

async fn observe_upgrade(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ObserveSession::new(state).run(socket))
}

async fn health_check(State(state): State<HubState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.connection_count(),
        "channels": state.registry.channel_count(),
        "subscriptions": state.registry.subscription_count(),
        "open_quotes": state.pipeline.quotes().len(),
        "rate_buckets": state.pipeline.limiter().bucket_count(),
    }))
}

async fn metrics() -> impl IntoResponse {
    match membrane_telemetry::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_rejects_invalid_config() {
        let config = HubConfig {
            quote_backend: "redis://cache".into(),
            ..HubConfig::default()
        };
        assert!(matches!(
            HubService::new(config),
            Err(HubError::Config(ConfigError::UnsupportedBackend(_)))
        ));
    }

    #[test]
    fn test_builds_from_defaults() {
        let service = HubService::new(HubConfig::default()).unwrap();
        assert_eq!(service.state().subscriber_queue, 1024);
        assert!(service.config().keys.is_empty());
        assert!(service.state().pipeline.quotes().is_empty());
    }
}
