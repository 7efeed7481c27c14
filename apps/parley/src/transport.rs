//! Signaling over a [`signal_bus::Bus`] channel scoped to one match.

use std::sync::Arc;

use signal_bus::{Bus, BusError, Subscription, SubscriptionHandle};
use thiserror::Error;

use crate::negotiation::SignalSink;
use crate::signal::{ChannelKey, Participant, SignalMessage};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] BusError),
    #[error("publish failed: {0}")]
    Publish(#[source] BusError),
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(#[source] BusError),
    #[error("signal codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("signaling channel closed")]
    Closed,
}

/// One participant's view of a match channel.
#[derive(Clone)]
pub struct SignalChannel {
    bus: Arc<dyn Bus>,
    key: ChannelKey,
    member: Participant,
}

impl SignalChannel {
    pub fn new(bus: Arc<dyn Bus>, key: ChannelKey, member: Participant) -> Self {
        Self { bus, key, member }
    }

    pub fn subscribe(&self) -> Result<SignalSubscription, TransportError> {
        let inner = self
            .bus
            .subscribe(self.key.as_str(), self.member.as_str())
            .map_err(TransportError::Subscribe)?;
        tracing::debug!(
            target = "parley::transport",
            channel = %self.key,
            member = %self.member,
            subscription = inner.handle().id,
            "subscribed"
        );
        Ok(SignalSubscription { inner })
    }

    pub fn publish(&self, message: &SignalMessage) -> Result<(), TransportError> {
        let payload = message.encode()?;
        self.bus
            .publish(self.key.as_str(), self.member.as_str(), payload)
            .map_err(TransportError::Publish)?;
        tracing::trace!(
            target = "parley::transport",
            channel = %self.key,
            kind = message.kind(),
            "signal published"
        );
        Ok(())
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        self.bus
            .unsubscribe(handle)
            .map_err(TransportError::Unsubscribe)
    }
}

impl SignalSink for SignalChannel {
    fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        self.publish(&message)
    }
}

pub struct SignalSubscription {
    inner: Subscription,
}

impl SignalSubscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        self.inner.handle()
    }

    pub async fn ready(&mut self) -> Result<(), TransportError> {
        self.inner.ready().await.map_err(|_| TransportError::Closed)
    }

    /// Next decodable message; `None` once the bus ends the subscription.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            let message = self.inner.recv().await?;
            match SignalMessage::decode(&message.payload) {
                Ok(signal) => return Some(signal),
                Err(err) => {
                    tracing::warn!(
                        target = "parley::transport",
                        channel = %message.channel,
                        sender = %message.sender,
                        error = %err,
                        "undecodable signal dropped"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MatchId;
    use bytes::Bytes;
    use signal_bus::LocalBus;

    fn channel(bus: &Arc<LocalBus>, member: &str) -> SignalChannel {
        SignalChannel::new(
            bus.clone(),
            ChannelKey::new("webrtc", &MatchId::new("m1")),
            Participant::new(member),
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn messages_cross_the_channel() {
        let bus = Arc::new(LocalBus::new());
        let alice = channel(&bus, "alice");
        let bob = channel(&bus, "bob");
        let mut alice_sub = alice.subscribe().unwrap();
        let mut bob_sub = bob.subscribe().unwrap();
        alice_sub.ready().await.unwrap();
        bob_sub.ready().await.unwrap();

        alice
            .send(SignalMessage::join("alice"))
            .unwrap();
        assert_eq!(
            bob_sub.recv().await,
            Some(SignalMessage::join("alice"))
        );

        alice.unsubscribe(alice_sub.handle()).unwrap();
        assert!(matches!(
            alice.unsubscribe(alice_sub.handle()),
            Err(TransportError::Unsubscribe(BusError::UnknownSubscription(_)))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn garbage_payloads_are_skipped() {
        let bus = Arc::new(LocalBus::new());
        let bob = channel(&bus, "bob");
        let mut bob_sub = bob.subscribe().unwrap();
        bus.publish("webrtc-m1", "mallory", Bytes::from_static(b"{not json"))
            .unwrap();
        channel(&bus, "alice")
            .publish(&SignalMessage::join("alice"))
            .unwrap();
        assert_eq!(
            bob_sub.recv().await,
            Some(SignalMessage::join("alice"))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn offline_bus_surfaces_as_transport_error() {
        let bus = Arc::new(LocalBus::new());
        bus.set_offline(true);
        let alice = channel(&bus, "alice");
        assert!(matches!(
            alice.subscribe(),
            Err(TransportError::Subscribe(BusError::Transport(_)))
        ));
        assert!(matches!(
            alice.publish(&SignalMessage::join("alice")),
            Err(TransportError::Publish(_))
        ));
    }
}
