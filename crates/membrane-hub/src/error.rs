//! Service-level errors.

use crate::config::ConfigError;
use std::net::SocketAddr;
use thiserror::Error;

/// Failures that stop the hub from starting or serving.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}
