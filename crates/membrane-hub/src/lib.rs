//! # Membrane Hub
//!
//! WebSocket service in front of the admission pipeline.
//!
//! ## Endpoints
//!
//! | Path | Kind | Purpose |
//! |------|------|---------|
//! | `/inject` | WebSocket | publish envelopes; rejections are answered with a signed `failure` |
//! | `/observe` | WebSocket | `subscribe` / `unsubscribe` control frames, then channel fan-out |
//! | `/health` | HTTP GET | JSON status |
//! | `/metrics` | HTTP GET | Prometheus text |
//!
//! Configuration comes from `MEMBRANE_*` environment variables, see
//! [`HubConfig::from_env`].

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod service;
pub mod ws;

pub use config::{ConfigError, HubConfig};
pub use error::HubError;
pub use service::{HubService, HubState};
pub use ws::{InjectSession, ObserveSession};
