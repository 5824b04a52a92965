//! Membrane hub binary.
//!
//! ## Startup Sequence
//!
//! 1. Initialize telemetry (logs, optional OTLP traces, Prometheus registry)
//! 2. Load and validate `MEMBRANE_*` configuration
//! 3. Bind the bus address and serve until Ctrl+C

use anyhow::{Context, Result};
use membrane_hub::{HubConfig, HubService};
use membrane_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::from_env())
        .await
        .context("failed to initialize telemetry")?;

    let config = HubConfig::from_env().context("invalid hub configuration")?;
    info!(
        addr = %config.listen_addr(),
        capacity = config.rate_limit.capacity,
        window_secs = config.rate_limit.window.as_secs(),
        "Starting membrane hub"
    );

    let service = HubService::new(config)?;
    service.run(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
