//! # Membrane Types Crate
//!
//! Domain types shared by every part of the Membrane Protocol Hub: the
//! envelope and its payload variants, the envelope codec, the schema
//! validator, signature verification, channel naming and the rejection
//! taxonomy.
//!
//! ## Design Principles
//!
//! - **Closed envelope set**: `EnvelopeKind` and `Payload` are matched
//!   exhaustively, so a new envelope type is a compile-time change.
//! - **Immutable envelopes**: the hub never mutates a payload, it only wraps
//!   it with a verdict.
//! - **Fail loud**: every refusal is a typed [`Rejection`].

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod channel;
pub mod codec;
pub mod control;
pub mod envelope;
pub mod errors;
pub mod rejection;
pub mod schema;
pub mod security;

pub use channel::{failure_channel_for, ChannelRoute, ChannelScope, GLOBAL_FAILURE_CHANNEL};
pub use codec::{encode, EnvelopeCodec, Frame, DEFAULT_MAX_PAYLOAD_BYTES};
pub use control::{ControlMessage, ControlReply};
pub use envelope::*;
pub use errors::*;
pub use rejection::{RejectionRecord, Severity};
pub use schema::SchemaValidator;
pub use security::{
    AuthenticityVerifier, BoundKey, EnvelopeSigner, KeyMaterial, KeyProvider, KeyRing,
    KeyRingError, SignatureSuite, HUB_KEY_ID, HUB_ORIGIN,
};
