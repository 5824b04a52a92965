//! # Membrane Telemetry
//!
//! Logging, tracing and metrics for the membrane hub.
//!
//! - **Logs:** `tracing-subscriber` with an `EnvFilter`, pretty or JSON output
//! - **Traces:** OpenTelemetry OTLP export, enabled by `MEMBRANE_OTLP_ENDPOINT`
//! - **Metrics:** Prometheus counters and gauges, served by the hub at `/metrics`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use membrane_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).await.expect("telemetry");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `membrane-hub` | Service name in traces |
//! | `MEMBRANE_OTLP_ENDPOINT` | unset | OTLP gRPC endpoint; export is off when unset |
//! | `MEMBRANE_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `MEMBRANE_JSON_LOGS` | `false` | JSON log lines (defaults on inside containers) |
//! | `MEMBRANE_ENVIRONMENT` | `development` | `deployment.environment` resource attribute |

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
pub mod metrics;
mod tracing_setup;

pub use config::{TelemetryConfig, DEFAULT_SERVICE_NAME};
pub use metrics::{
    encode_metrics, register_metrics, ACTIVE_CONNECTIONS, ACTIVE_SUBSCRIPTIONS,
    ADMISSION_DURATION, DELIVERY_FAILURES, ENVELOPES_DISPATCHED, ENVELOPES_RECEIVED,
    ENVELOPES_REJECTED, QUOTES_ADMITTED, QUOTES_ISSUED,
};
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize tracing: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize metrics and the global tracing subscriber.
///
/// Returns a guard that must be held for the lifetime of the application.
/// Dropping it flushes pending spans.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    register_metrics()?;
    let tracing_guard = tracing_setup::init_tracing(&config).await?;
    Ok(TelemetryGuard {
        _tracing: tracing_guard,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry");
    }
}

/// Increment a counter, optionally with label values.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
