//! Named broadcast channels used to relay signaling between the members of a match.
//!
//! Delivery contract every [`Bus`] implementation honours:
//! - at-most-once delivery per subscriber,
//! - FIFO per sender, no ordering across senders,
//! - a member never receives its own broadcast,
//! - [`Subscription::ready`] resolves once the subscription is active; messages published
//!   before that point may be missed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub sender: String,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscription {0} is not active")]
    UnknownSubscription(u64),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Identifies one subscription so it can be torn down independently of its receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub channel: String,
    pub member: String,
}

pub struct Subscription {
    handle: SubscriptionHandle,
    messages: mpsc::UnboundedReceiver<BusMessage>,
    ready: watch::Receiver<bool>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Waits until the subscription is active. Errors if the bus dropped it first.
    pub async fn ready(&mut self) -> BusResult<()> {
        self.ready
            .wait_for(|active| *active)
            .await
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.messages.recv().await
    }

    /// Splits into the teardown handle and the raw message receiver.
    pub fn into_parts(self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<BusMessage>) {
        (self.handle, self.messages)
    }
}

pub trait Bus: Send + Sync {
    fn subscribe(&self, channel: &str, member: &str) -> BusResult<Subscription>;
    fn publish(&self, channel: &str, member: &str, payload: Bytes) -> BusResult<()>;
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> BusResult<()>;
}

struct Subscriber {
    id: u64,
    member: String,
    sender: mpsc::UnboundedSender<BusMessage>,
    _ready: Arc<watch::Sender<bool>>,
}

/// In-process bus for tests, demos and single-host deployments.
#[derive(Default)]
pub struct LocalBus {
    channels: parking_lot::RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    ready_delay: parking_lot::Mutex<Option<Duration>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays the ready notification of every new subscription, mimicking a remote
    /// broker acknowledging the join. Requires a Tokio runtime when set.
    pub fn with_ready_delay(delay: Duration) -> Self {
        let bus = Self::default();
        *bus.ready_delay.lock() = Some(delay);
        bus
    }

    /// While offline, subscribe and publish fail with [`BusError::Transport`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drops every subscriber of `channel`; their receivers observe end-of-stream.
    pub fn drop_channel(&self, channel: &str) {
        let removed = self.channels.write().remove(channel);
        if let Some(subscribers) = removed {
            tracing::debug!(
                target = "signal_bus",
                channel,
                subscribers = subscribers.len(),
                "channel dropped"
            );
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> BusResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Transport("bus offline".into()));
        }
        Ok(())
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, channel: &str, member: &str) -> BusResult<Subscription> {
        self.ensure_online()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, messages) = mpsc::unbounded_channel();
        let delay = *self.ready_delay.lock();
        let (ready_tx, ready) = watch::channel(delay.is_none());
        let ready_tx = Arc::new(ready_tx);
        if let Some(delay) = delay {
            let ready_tx = Arc::clone(&ready_tx);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = ready_tx.send(true);
            });
        }
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                id,
                member: member.to_string(),
                sender,
                _ready: ready_tx,
            });

        tracing::trace!(target = "signal_bus", channel, member, id, "subscribed");
        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                channel: channel.to_string(),
                member: member.to_string(),
            },
            messages,
            ready,
        })
    }

    fn publish(&self, channel: &str, member: &str, payload: Bytes) -> BusResult<()> {
        self.ensure_online()?;
        let mut delivered = 0usize;
        let mut guard = self.channels.write();
        if let Some(subscribers) = guard.get_mut(channel) {
            subscribers.retain(|sub| !sub.sender.is_closed());
            for sub in subscribers.iter().filter(|sub| sub.member != member) {
                let message = BusMessage {
                    channel: channel.to_string(),
                    sender: member.to_string(),
                    payload: payload.clone(),
                };
                if sub.sender.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        tracing::trace!(target = "signal_bus", channel, member, delivered, "published");
        Ok(())
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> BusResult<()> {
        let mut guard = self.channels.write();
        let subscribers = guard
            .get_mut(&handle.channel)
            .ok_or(BusError::UnknownSubscription(handle.id))?;
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != handle.id);
        if subscribers.len() == before {
            return Err(BusError::UnknownSubscription(handle.id));
        }
        if subscribers.is_empty() {
            guard.remove(&handle.channel);
        }
        tracing::trace!(
            target = "signal_bus",
            channel = %handle.channel,
            id = handle.id,
            "unsubscribed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn local_bus_excludes_sender() {
        let bus = LocalBus::new();
        let mut alice = bus.subscribe("webrtc-m1", "alice").expect("subscribe alice");
        let mut bob = bus.subscribe("webrtc-m1", "bob").expect("subscribe bob");
        alice.ready().await.expect("alice ready");
        bob.ready().await.expect("bob ready");

        bus.publish("webrtc-m1", "alice", Bytes::from_static(b"hello"))
            .expect("publish ok");

        let msg = bob.recv().await.expect("bob receives");
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
        assert!(alice.messages.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn channels_are_isolated() {
        let bus = LocalBus::new();
        let mut other = bus.subscribe("webrtc-m2", "bob").expect("subscribe");
        bus.publish("webrtc-m1", "alice", Bytes::from_static(b"x"))
            .expect("publish ok");
        assert!(other.messages.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn fifo_per_sender() {
        let bus = LocalBus::new();
        let mut bob = bus.subscribe("c", "bob").expect("subscribe");
        for i in 0..5u8 {
            bus.publish("c", "alice", Bytes::from(vec![i])).expect("publish");
        }
        for i in 0..5u8 {
            let msg = bob.recv().await.expect("message");
            assert_eq!(msg.payload.as_ref(), &[i]);
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsubscribe_twice_reports_unknown() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("c", "alice").expect("subscribe");
        let handle = sub.handle().clone();
        bus.unsubscribe(&handle).expect("first unsubscribe");
        assert_eq!(bus.subscriber_count("c"), 0);
        assert_eq!(
            bus.unsubscribe(&handle),
            Err(BusError::UnknownSubscription(handle.id))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn offline_bus_rejects_operations() {
        let bus = LocalBus::new();
        bus.set_offline(true);
        assert!(matches!(
            bus.subscribe("c", "alice"),
            Err(BusError::Transport(_))
        ));
        bus.set_offline(false);
        assert!(bus.subscribe("c", "alice").is_ok());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn ready_waits_for_delay() {
        let bus = LocalBus::with_ready_delay(Duration::from_millis(250));
        let mut sub = bus.subscribe("c", "alice").expect("subscribe");
        let started = tokio::time::Instant::now();
        sub.ready().await.expect("ready");
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_channel_ends_stream() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("c", "alice").expect("subscribe");
        bus.drop_channel("c");
        assert!(sub.recv().await.is_none());
    }
}
