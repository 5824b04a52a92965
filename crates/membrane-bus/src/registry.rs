//! # Subscription Registry
//!
//! `channel -> {connection -> subscriber}` plus the reverse index
//! `connection -> {channel}` used for cleanup on disconnect.
//!
//! Both maps are sharded, so mutations on one channel never block reads or
//! writes on another. No guard on one map is held while the other is locked.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh, process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a frame could not be handed to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection is gone. The subscriber should be removed.
    #[error("subscriber closed")]
    Closed,
    /// Outbound queue full (slow consumer). The frame is dropped for this
    /// subscriber only.
    #[error("subscriber queue full")]
    Full,
}

/// Receiving end of a dispatch. Delivery must not block.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Hand over an encoded frame.
    fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError>;
}

/// Subscriber backed by a bounded queue that the connection's writer drains.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSubscriber {
    /// Create a subscriber with an outbound queue of `capacity` frames.
    #[must_use]
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

type SubscriberSet = HashMap<ConnectionId, Arc<dyn Subscriber>>;

/// Shared subscription state.
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: DashMap<String, SubscriberSet>,
    by_connection: DashMap<ConnectionId, HashSet<String>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `channels`. Idempotent: channels already held are kept
    /// as they are. Returns the acknowledged channel list (deduplicated, in
    /// request order).
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>, channels: &[String]) -> Vec<String> {
        let id = subscriber.id();
        let mut acked = Vec::with_capacity(channels.len());

        for channel in channels {
            if acked.contains(channel) {
                continue;
            }
            self.channels
                .entry(channel.clone())
                .or_default()
                .entry(id)
                .or_insert_with(|| Arc::clone(&subscriber));
            self.by_connection
                .entry(id)
                .or_default()
                .insert(channel.clone());
            acked.push(channel.clone());
        }

        debug!(connection = %id, channels = ?acked, "Subscribed");
        acked
    }

    /// Remove `connection` from the given channels. Returns the channels it
    /// actually held.
    pub fn unsubscribe(&self, connection: ConnectionId, channels: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        for channel in channels {
            let held = self
                .by_connection
                .get_mut(&connection)
                .map(|mut set| set.remove(channel))
                .unwrap_or(false);
            if held {
                self.detach(connection, channel);
                removed.push(channel.clone());
            }
        }
        self.by_connection
            .remove_if(&connection, |_, set| set.is_empty());
        removed
    }

    /// Remove `connection` from every channel. Never fails, even for
    /// connections that never subscribed. Returns how many channels were
    /// released.
    pub fn unsubscribe_all(&self, connection: ConnectionId) -> usize {
        let Some((_, channels)) = self.by_connection.remove(&connection) else {
            return 0;
        };
        for channel in &channels {
            self.detach(connection, channel);
        }
        debug!(connection = %connection, released = channels.len(), "Subscriptions released");
        channels.len()
    }

    fn detach(&self, connection: ConnectionId, channel: &str) {
        if let Some(mut set) = self.channels.get_mut(channel) {
            set.remove(&connection);
        }
        // The guard above is dropped before this takes the same shard lock.
        self.channels.remove_if(channel, |_, set| set.is_empty());
    }

    /// Snapshot of the subscribers of `channel`.
    #[must_use]
    pub fn subscribers(&self, channel: &str) -> Vec<Arc<dyn Subscriber>> {
        self.channels
            .get(channel)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|set| set.len()).unwrap_or(0)
    }

    /// Channels currently held by `connection`.
    #[must_use]
    pub fn channels_of(&self, connection: ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .by_connection
            .get(&connection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    /// Total `(channel, connection)` pairs.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.by_connection.iter().map(|entry| entry.len()).sum()
    }

    /// Whether `connection` appears in any channel's subscriber set.
    #[must_use]
    pub fn is_subscribed_anywhere(&self, connection: ConnectionId) -> bool {
        self.channels
            .iter()
            .any(|entry| entry.contains_key(&connection))
    }
}
