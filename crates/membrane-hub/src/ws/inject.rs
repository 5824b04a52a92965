//! Publisher connections.

use crate::service::HubState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use membrane_bus::{ConnectionId, Outcome, StageError};
use membrane_telemetry::{
    metric_inc, time_histogram, ADMISSION_DURATION, DELIVERY_FAILURES, ENVELOPES_DISPATCHED,
    ENVELOPES_RECEIVED, ENVELOPES_REJECTED, QUOTES_ADMITTED, QUOTES_ISSUED,
};
use membrane_types::encode;
use tracing::{debug, error, info, warn};

/// One `/inject` connection.
pub struct InjectSession {
    state: HubState,
    connection: ConnectionId,
}

impl InjectSession {
    pub fn new(state: HubState) -> Self {
        Self {
            state,
            connection: ConnectionId::next(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Read frames until the peer goes away. A rejection is reported back on
    /// the same socket and the connection stays open; a broken pipeline
    /// invariant closes it.
    pub async fn run(self, mut socket: WebSocket) {
        membrane_telemetry::ACTIVE_CONNECTIONS
            .with_label_values(&["inject"])
            .inc();
        info!(connection = %self.connection, "Inject connection opened");

        while let Some(message) = socket.recv().await {
            let bytes = match message {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(data)) => data,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => {
                    debug!(connection = %self.connection, "Close received");
                    break;
                }
                Err(e) => {
                    warn!(connection = %self.connection, error = %e, "WebSocket error");
                    break;
                }
            };

            match self.process_frame(&bytes) {
                Ok(Some(reply)) => {
                    if let Err(e) = socket.send(Message::Text(reply)).await {
                        warn!(connection = %self.connection, error = %e, "Failed to send rejection");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(connection = %self.connection, error = %e, "Pipeline invariant broken");
                    let close = CloseFrame {
                        code: close_code::ERROR,
                        reason: "internal error".into(),
                    };
                    let _ = socket.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }

        membrane_telemetry::ACTIVE_CONNECTIONS
            .with_label_values(&["inject"])
            .dec();
        info!(connection = %self.connection, "Inject connection closed");
    }

    /// Run one frame through the pipeline and record metrics. Returns the
    /// encoded failure envelope when the frame was rejected.
    ///
    /// # Errors
    ///
    /// [`StageError`] if the pipeline state machine was violated.
    pub fn process_frame(&self, bytes: &[u8]) -> Result<Option<String>, StageError> {
        let _timer = time_histogram!(ADMISSION_DURATION);
        metric_inc!(ENVELOPES_RECEIVED);

        match self.state.pipeline.process(bytes)? {
            Outcome::Dispatched {
                kind,
                report,
                metered,
                replies,
                ..
            } => {
                metric_inc!(ENVELOPES_DISPATCHED, &[kind.as_str()]);
                if metered {
                    metric_inc!(QUOTES_ADMITTED);
                }
                QUOTES_ISSUED.inc_by(replies.len() as f64);

                let failed = report.failed.len()
                    + replies.iter().map(|(_, r)| r.failed.len()).sum::<usize>();
                if failed > 0 {
                    DELIVERY_FAILURES.inc_by(failed as f64);
                    refresh_subscription_gauge(&self.state);
                }
                Ok(None)
            }
            Outcome::Rejected {
                rejection, report, ..
            } => {
                metric_inc!(ENVELOPES_REJECTED, &[rejection.reason_label()]);
                if !report.dispatch.failed.is_empty() {
                    DELIVERY_FAILURES.inc_by(report.dispatch.failed.len() as f64);
                    refresh_subscription_gauge(&self.state);
                }
                Ok(Some(
                    String::from_utf8_lossy(&encode(&report.envelope)).into_owned(),
                ))
            }
        }
    }
}

pub(crate) fn refresh_subscription_gauge(state: &HubState) {
    membrane_telemetry::ACTIVE_SUBSCRIPTIONS.set(state.registry.subscription_count() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::service::HubService;
    use serde_json::Value;

    fn session() -> InjectSession {
        let service = HubService::new(HubConfig::default()).unwrap();
        InjectSession::new(service.state().clone())
    }

    #[test]
    fn test_garbage_frame_gets_failure_reply() {
        let session = session();
        let reply = session.process_frame(b"not json").unwrap().unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "failure");
        assert_eq!(value["channel"], "failure.emit");
        assert_eq!(value["origin"], "protocol.hub");
        assert_eq!(value["payload"]["severity"], "warning");
        assert!(value["signature"].is_object());
    }

    #[test]
    fn test_rejection_counted_by_reason() {
        let session = session();
        let before = ENVELOPES_REJECTED.with_label_values(&["decode"]).get();
        session.process_frame(b"[]").unwrap();
        assert!(ENVELOPES_REJECTED.with_label_values(&["decode"]).get() > before);
    }

    #[test]
    fn test_every_frame_is_timed() {
        let session = session();
        let before = ADMISSION_DURATION.get_sample_count();
        session.process_frame(b"{").unwrap();
        assert!(ADMISSION_DURATION.get_sample_count() > before);
    }
}
