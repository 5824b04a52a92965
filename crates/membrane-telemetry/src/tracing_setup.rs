//! `tracing` subscriber setup with optional OpenTelemetry export.
//!
//! Console output is always on (pretty or JSON). Spans additionally go to an
//! OTLP collector when `MEMBRANE_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{self, RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Guard that shuts down the tracer provider on drop.
pub struct TracingGuard {
    provider: Option<TracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Error shutting down tracer provider: {e:?}");
            }
        }
    }
}

fn otlp_provider(config: &TelemetryConfig, endpoint: &str) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", config.service_name.clone()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("deployment.environment", config.environment.clone()),
                ])),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))
}

/// Install the global subscriber.
pub async fn init_tracing(config: &TelemetryConfig) -> Result<TracingGuard, TelemetryError> {
    let provider = match &config.otlp_endpoint {
        Some(endpoint) => Some(otlp_provider(config, endpoint)?),
        None => None,
    };
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    // JSON output for containers, pretty output for development.
    let json_layer = config.json_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });
    let pretty_layer = (!config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("disabled"),
        json_logs = config.json_logs,
        "Tracing initialized"
    );

    Ok(TracingGuard { provider })
}
