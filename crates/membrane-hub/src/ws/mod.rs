//! WebSocket sessions.
//!
//! - `/inject`: one envelope per frame, answered only on rejection
//! - `/observe`: subscribe/unsubscribe control frames, then fan-out delivery

mod inject;
mod observe;

pub use inject::InjectSession;
pub use observe::ObserveSession;

/// Transport-level frame cap for `/inject`.
///
/// Set above the codec limit so that a moderately oversized envelope still
/// reaches the codec and is answered with a `PayloadTooLarge` failure rather
/// than a dropped connection.
pub fn transport_limit(max_payload_bytes: usize) -> usize {
    max_payload_bytes.saturating_mul(2)
}
