//! # Membrane Bus
//!
//! The hub's in-memory boundary state and the admission pipeline that
//! guards it.
//!
//! ```text
//!  inject ──► Codec ─► Schema ─► Auth ─► Quota ─► Rate ─► Dispatcher ──► observe
//!               │        │        │       │        │
//!               └────────┴────────┴───────┴────────┴──► Rejection Reporter ──► failure.emit
//! ```
//!
//! ## Shared State
//!
//! - **Quote Registry:** single-use quotes, atomic test-and-set per `quote_id`
//! - **Rate Limiter:** one token bucket per `(tenant, channel)`
//! - **Subscription Registry:** `channel -> connections`, cleaned on disconnect
//!
//! All three are sharded maps behind a narrow API; nothing is a global.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod dispatcher;
pub mod economy;
pub mod pipeline;
pub mod quote_registry;
pub mod rate_limiter;
pub mod registry;
pub mod reporter;

// Re-export main types
pub use dispatcher::{DispatchReport, Dispatcher, FailedDelivery};
pub use economy::{price_for, QuoteDesk, QuoteDeskConfig};
pub use pipeline::{
    sweep_task, tenant_of, AdmissionPipeline, EnvelopeTrace, Outcome, PipelineParts, Stage,
    StageError, DEFAULT_PAID_ACTIONS,
};
pub use quote_registry::{Quote, QuoteRegistry, Settlement};
pub use rate_limiter::{BucketKey, RateLimitConfig, RateLimiter};
pub use registry::{
    ChannelSubscriber, ConnectionId, DeliveryError, Subscriber, SubscriptionRegistry,
};
pub use reporter::{RejectionContext, RejectionReport, RejectionReporter};

/// Frames buffered per subscriber before it counts as a slow consumer.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;
