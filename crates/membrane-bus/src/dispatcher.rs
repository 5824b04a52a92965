//! # Dispatcher
//!
//! Fans admitted envelopes out to every subscriber of their channel.
//!
//! A per-channel ordering lock is held across sequence assignment and
//! fan-out, so concurrent producers on one channel are delivered to each
//! subscriber in admission order. Different channels never contend.
//! Delivery is non-blocking, so the lock is never held across an await.

use crate::registry::{ConnectionId, DeliveryError, SubscriptionRegistry};
use dashmap::DashMap;
use membrane_types::{encode, Envelope};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// One failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedDelivery {
    pub connection: ConnectionId,
    pub error: DeliveryError,
}

/// Result of one fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub channel: String,
    /// Position of this envelope in its channel's admission order (1-based).
    pub sequence: u64,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<FailedDelivery>,
}

impl DispatchReport {
    /// Some, but not all, subscribers were unreachable.
    #[must_use]
    pub fn is_partial_failure(&self) -> bool {
        !self.failed.is_empty() && self.delivered > 0
    }

    /// Connections that were found closed and have been removed.
    #[must_use]
    pub fn closed(&self) -> Vec<ConnectionId> {
        self.failed
            .iter()
            .filter(|f| f.error == DeliveryError::Closed)
            .map(|f| f.connection)
            .collect()
    }
}

/// Channel fan-out over a shared [`SubscriptionRegistry`].
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    ordering: DashMap<String, Arc<Mutex<u64>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            ordering: DashMap::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Deliver `envelope` to every subscriber of its channel.
    ///
    /// One subscriber's failure never prevents delivery to the others.
    /// Closed subscribers are removed from the registry after the fan-out;
    /// full ones are reported and kept. Nothing is retried.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        let channel = envelope.channel();
        let frame: Arc<str> = Arc::from(String::from_utf8_lossy(&encode(envelope)).as_ref());

        let lock = Arc::clone(
            self.ordering
                .entry(channel.to_string())
                .or_default()
                .value(),
        );

        let report = {
            let mut sequence = lock.lock();
            *sequence += 1;

            let subscribers = self.registry.subscribers(channel);
            let mut failed = Vec::new();
            let mut delivered = 0;
            for subscriber in &subscribers {
                match subscriber.deliver(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(error) => failed.push(FailedDelivery {
                        connection: subscriber.id(),
                        error,
                    }),
                }
            }

            DispatchReport {
                channel: channel.to_string(),
                sequence: *sequence,
                attempted: subscribers.len(),
                delivered,
                failed,
            }
        };

        for failure in &report.failed {
            match failure.error {
                DeliveryError::Closed => {
                    self.registry.unsubscribe_all(failure.connection);
                }
                DeliveryError::Full => warn!(
                    channel = %channel,
                    connection = %failure.connection,
                    "Subscriber queue full, frame dropped for this subscriber"
                ),
            }
        }

        debug!(
            channel = %channel,
            sequence = report.sequence,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed.len(),
            "Envelope dispatched"
        );
        report
    }

    /// Forget ordering state for channels that currently have no subscribers
    /// and no dispatch in flight.
    pub fn prune_idle(&self) -> usize {
        let before = self.ordering.len();
        self.ordering.retain(|channel, lock| {
            Arc::strong_count(lock) > 1 || self.registry.subscriber_count(channel) > 0
        });
        before.saturating_sub(self.ordering.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelSubscriber, Subscriber};
    use chrono::Utc;
    use membrane_types::{Payload, WorkViewInvalidated};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHANNEL: &str = "ecosystem/mind/org/acme/docs.view.invalidated";

    fn envelope(reason: &str) -> Envelope {
        Envelope::new(
            CHANNEL,
            "l2.graph",
            Utc::now(),
            Payload::WorkViewInvalidated(WorkViewInvalidated {
                reasons: vec![reason.to_string()],
                affects: vec!["architecture:/".into()],
            }),
        )
    }

    /// Subscriber that counts attempts and can be told to fail.
    struct Recorder {
        id: ConnectionId,
        attempts: AtomicUsize,
        fail_with: Option<DeliveryError>,
    }

    impl Subscriber for Recorder {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn deliver(&self, _frame: Arc<str>) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn recorder(fail_with: Option<DeliveryError>) -> Arc<Recorder> {
        Arc::new(Recorder {
            id: ConnectionId::next(),
            attempts: AtomicUsize::new(0),
            fail_with,
        })
    }

    #[test]
    fn test_fan_out_with_one_unreachable_subscriber() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let channels = vec![CHANNEL.to_string()];

        let live: Vec<Arc<Recorder>> = (0..4).map(|_| recorder(None)).collect();
        let dead = recorder(Some(DeliveryError::Closed));
        for p in &live {
            registry.subscribe(Arc::clone(p) as Arc<dyn Subscriber>, &channels);
        }
        registry.subscribe(Arc::clone(&dead) as Arc<dyn Subscriber>, &channels);

        let report = dispatcher.dispatch(&envelope("r"));

        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 4);
        assert!(report.is_partial_failure());
        assert_eq!(report.closed(), vec![dead.id]);
        for p in &live {
            assert_eq!(p.attempts.load(Ordering::SeqCst), 1);
        }
        // Closed subscriber was cleaned up.
        assert_eq!(registry.subscriber_count(CHANNEL), 4);
        assert!(!registry.is_subscribed_anywhere(dead.id));
    }

    #[test]
    fn test_full_subscriber_is_kept() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let slow = recorder(Some(DeliveryError::Full));
        registry.subscribe(
            Arc::clone(&slow) as Arc<dyn Subscriber>,
            &[CHANNEL.to_string()],
        );

        let report = dispatcher.dispatch(&envelope("r"));
        assert_eq!(report.delivered, 0);
        assert_eq!(registry.subscriber_count(CHANNEL), 1);
    }

    #[test]
    fn test_no_subscribers() {
        let dispatcher = Dispatcher::new(Arc::new(SubscriptionRegistry::new()));
        let report = dispatcher.dispatch(&envelope("r"));
        assert_eq!(report.attempted, 0);
        assert_eq!(report.sequence, 1);
        assert_eq!(dispatcher.prune_idle(), 1);
    }

    #[tokio::test]
    async fn test_per_channel_order_under_concurrent_producers() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        let (sub, mut rx) = ChannelSubscriber::new(ConnectionId::next(), 1024);
        registry.subscribe(Arc::new(sub), &[CHANNEL.to_string()]);

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let dispatcher = Arc::clone(&dispatcher);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| dispatcher.dispatch(&envelope(&format!("p{p}-{i}"))).sequence)
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut sequence_of = std::collections::HashMap::new();
        for (p, handle) in producers.into_iter().enumerate() {
            for (i, seq) in handle.join().unwrap().into_iter().enumerate() {
                sequence_of.insert(format!("p{p}-{i}"), seq);
            }
        }

        // Frames arrive in exactly the order sequences were assigned.
        let mut last = 0;
        for _ in 0..200 {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            let reason = value["payload"]["reasons"][0].as_str().unwrap();
            let seq = sequence_of[reason];
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(last, 200);
    }
}
