//! Subscriber connections.
//!
//! The socket is split: a writer task drains the subscriber queue and the
//! control replies, the reader loop handles control frames. On close the
//! writer is aborted and every subscription of the connection is dropped.

use super::inject::refresh_subscription_gauge;
use crate::service::HubState;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use membrane_bus::{ChannelSubscriber, ConnectionId, Subscriber};
use membrane_types::{ControlMessage, ControlReply};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Control replies buffered ahead of the writer.
const CONTROL_QUEUE: usize = 16;

/// One `/observe` connection.
pub struct ObserveSession {
    state: HubState,
    subscriber: Arc<ChannelSubscriber>,
    outbound: mpsc::Receiver<Arc<str>>,
}

impl ObserveSession {
    pub fn new(state: HubState) -> Self {
        let (subscriber, outbound) =
            ChannelSubscriber::new(ConnectionId::next(), state.subscriber_queue);
        Self {
            state,
            subscriber: Arc::new(subscriber),
            outbound,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.subscriber.id()
    }

    pub async fn run(self, socket: WebSocket) {
        let Self {
            state,
            subscriber,
            mut outbound,
        } = self;
        let connection = subscriber.id();
        membrane_telemetry::ACTIVE_CONNECTIONS
            .with_label_values(&["observe"])
            .inc();
        info!(%connection, "Observe connection opened");

        let (mut sink, mut stream) = socket.split();
        let (control_tx, mut control_rx) = mpsc::channel::<String>(CONTROL_QUEUE);

        let writer = tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    biased;
                    reply = control_rx.recv() => match reply {
                        Some(reply) => reply,
                        None => break,
                    },
                    frame = outbound.recv() => match frame {
                        Some(frame) => frame.to_string(),
                        None => break,
                    },
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(%connection, error = %e, "Observer went away");
                    break;
                }
            }
        });

        while let Some(message) = stream.next().await {
            let bytes = match message {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(data)) => data,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!(%connection, error = %e, "WebSocket error");
                    break;
                }
            };

            let reply = handle_control(&state, &subscriber, &bytes);
            if control_tx.send(reply.to_json()).await.is_err() {
                break;
            }
        }

        writer.abort();
        let removed = state.registry.unsubscribe_all(connection);
        refresh_subscription_gauge(&state);
        membrane_telemetry::ACTIVE_CONNECTIONS
            .with_label_values(&["observe"])
            .dec();
        info!(%connection, removed, "Observe connection closed");
    }
}

/// Apply one control frame for `subscriber`.
pub fn handle_control(
    state: &HubState,
    subscriber: &Arc<ChannelSubscriber>,
    bytes: &[u8],
) -> ControlReply {
    let message = match ControlMessage::parse(bytes) {
        Ok(message) => message,
        Err(e) => {
            return ControlReply::Error {
                message: format!("invalid control frame: {e}"),
            }
        }
    };

    let connection = subscriber.id();
    match message {
        ControlMessage::Subscribe { channels } => {
            if let Some(message) = invalid_channels(&channels) {
                return ControlReply::Error { message };
            }
            let handle: Arc<dyn Subscriber> = subscriber.clone();
            let channels = state.registry.subscribe(handle, &channels);
            refresh_subscription_gauge(state);
            info!(%connection, ?channels, "Subscribed");
            ControlReply::SubscribeAck { channels }
        }
        ControlMessage::Unsubscribe { channels } => {
            if let Some(message) = invalid_channels(&channels) {
                return ControlReply::Error { message };
            }
            let held = state.registry.unsubscribe(connection, &channels);
            refresh_subscription_gauge(state);
            info!(%connection, channels = ?held, "Unsubscribed");
            ControlReply::UnsubscribeAck { channels }
        }
    }
}

fn invalid_channels(channels: &[String]) -> Option<String> {
    if channels.is_empty() {
        return Some("channels must not be empty".to_string());
    }
    channels
        .iter()
        .any(|c| c.trim().is_empty())
        .then(|| "channel names must not be blank".to_string())
}
