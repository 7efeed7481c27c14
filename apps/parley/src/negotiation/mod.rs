//! Offer/answer negotiation between exactly two participants.
//!
//! One [`NegotiationStateMachine`] exists per connection attempt. It is driven
//! sequentially by the session actor: inbound [`SignalMessage`]s, locally gathered
//! candidates and connectivity changes of the underlying peer connection.

pub mod candidates;

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::media::LocalMedia;
use crate::peer::{ConnectivityState, PeerConnection, PeerError};
use crate::signal::{CandidateDescriptor, Participant, SessionDescription, SignalMessage};
use crate::transport::TransportError;

pub use candidates::CandidateBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// The lexicographically smaller token offers. Identical tokens never pair.
pub fn elect_role(local: &Participant, remote: &Participant) -> Option<Role> {
    match local.cmp(remote) {
        Ordering::Less => Some(Role::Offerer),
        Ordering::Greater => Some(Role::Answerer),
        Ordering::Equal => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingPeer,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

impl NegotiationState {
    pub fn is_finished(self) -> bool {
        matches!(self, NegotiationState::Disconnected | NegotiationState::Failed)
    }
}

/// Out-of-order or duplicate description traffic. Logged and recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAnomaly {
    /// An offer arrived while our own offer was still unanswered.
    GlareOffer { from: Participant },
    /// An offer from the side that should be answering.
    OfferFromAnswerer { from: Participant },
    /// Another offer after we had already answered one.
    OfferAfterAnswer { from: Participant },
    /// An answer with no local offer outstanding.
    UnsolicitedAnswer { from: Participant },
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("negotiation already started")]
    AlreadyStarted,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outbound half of the signaling channel.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: SignalMessage) -> Result<(), TransportError>;
}

pub struct NegotiationStateMachine {
    local: Participant,
    instance: String,
    peer: Arc<dyn PeerConnection>,
    signals: Arc<dyn SignalSink>,
    state: NegotiationState,
    remote: Option<Participant>,
    role: Option<Role>,
    remote_instance: Option<String>,
    candidates: CandidateBuffer,
    remote_description_installed: bool,
    offer_pending: bool,
    answered: bool,
    reannounced: bool,
    restarts: u32,
    anomalies: Vec<NegotiationAnomaly>,
}

impl NegotiationStateMachine {
    pub fn new(
        local: Participant,
        peer: Arc<dyn PeerConnection>,
        signals: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            local,
            instance: uuid::Uuid::new_v4().to_string(),
            peer,
            signals,
            state: NegotiationState::Idle,
            remote: None,
            role: None,
            remote_instance: None,
            candidates: CandidateBuffer::new(),
            remote_description_installed: false,
            offer_pending: false,
            answered: false,
            reannounced: false,
            restarts: 0,
            anomalies: Vec::new(),
        }
    }

    pub fn with_candidate_buffer(mut self, candidates: CandidateBuffer) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn remote(&self) -> Option<&Participant> {
        self.remote.as_ref()
    }

    /// Identity of this attempt as carried in our joins.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// How many times the peer was seen starting over.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn anomalies(&self) -> &[NegotiationAnomaly] {
        &self.anomalies
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Attach local tracks and announce ourselves on the channel.
    pub async fn start(&mut self, media: &LocalMedia) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::AlreadyStarted);
        }
        if let Err(err) = self.peer.add_local_media(media).await {
            return Err(self.fail(err));
        }
        self.state = NegotiationState::AwaitingPeer;
        self.send(self.join())?;
        tracing::debug!(
            target = "parley::negotiation",
            participant = %self.local,
            tracks = media.tracks().len(),
            "join announced"
        );
        Ok(())
    }

    pub async fn handle_signal(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        if message.sender() == &self.local {
            tracing::trace!(
                target = "parley::negotiation",
                kind = message.kind(),
                "ignoring own message"
            );
            return Ok(());
        }
        if matches!(self.state, NegotiationState::Idle) || self.state.is_finished() {
            tracing::debug!(
                target = "parley::negotiation",
                kind = message.kind(),
                state = ?self.state,
                "message outside of an active negotiation dropped"
            );
            return Ok(());
        }
        if !self.accept_peer(message.sender()) {
            return Ok(());
        }

        match message {
            SignalMessage::Join { from, instance } => self.on_join(from, instance).await,
            SignalMessage::Offer { from, sdp } => self.on_offer(from, sdp).await,
            SignalMessage::Answer { from, sdp } => self.on_answer(from, sdp).await,
            SignalMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
        }
    }

    /// Trickle a locally gathered candidate to the peer.
    pub fn handle_local_candidate(
        &mut self,
        candidate: CandidateDescriptor,
    ) -> Result<(), NegotiationError> {
        self.send(SignalMessage::IceCandidate {
            from: self.local.clone(),
            candidate,
        })
    }

    pub fn handle_connectivity(&mut self, connectivity: ConnectivityState) -> NegotiationState {
        let next = match connectivity {
            ConnectivityState::Connected
                if matches!(
                    self.state,
                    NegotiationState::Negotiating | NegotiationState::Connected
                ) =>
            {
                NegotiationState::Connected
            }
            ConnectivityState::Disconnected | ConnectivityState::Closed => {
                NegotiationState::Disconnected
            }
            ConnectivityState::Failed => NegotiationState::Failed,
            _ => self.state,
        };
        if next != self.state {
            tracing::debug!(
                target = "parley::negotiation",
                from = ?self.state,
                to = ?next,
                connectivity = ?connectivity,
                "negotiation state changed"
            );
            self.state = next;
        }
        next
    }

    /// Release buffered candidates and close the peer connection.
    pub async fn close(&mut self) {
        self.candidates.clear();
        if let Err(err) = self.peer.close().await {
            tracing::debug!(target = "parley::negotiation", error = %err, "peer close failed");
        }
        self.state = NegotiationState::Disconnected;
    }

    fn accept_peer(&mut self, from: &Participant) -> bool {
        match &self.remote {
            Some(remote) if remote == from => true,
            Some(remote) => {
                tracing::debug!(
                    target = "parley::negotiation",
                    from = %from,
                    peer = %remote,
                    "message from a third participant ignored"
                );
                false
            }
            None => {
                self.role = elect_role(&self.local, from);
                self.remote = Some(from.clone());
                tracing::debug!(
                    target = "parley::negotiation",
                    local = %self.local,
                    remote = %from,
                    role = ?self.role,
                    "peer recorded"
                );
                true
            }
        }
    }

    async fn on_join(
        &mut self,
        from: Participant,
        instance: Option<String>,
    ) -> Result<(), NegotiationError> {
        let restarted = matches!(
            (&self.remote_instance, &instance),
            (Some(known), Some(fresh)) if known != fresh
        );
        if restarted {
            self.restart(&from).await?;
        }
        if instance.is_some() {
            self.remote_instance = instance;
        }

        match self.role {
            Some(Role::Offerer) => {
                if self.state != NegotiationState::AwaitingPeer || self.offer_pending {
                    tracing::trace!(
                        target = "parley::negotiation",
                        from = %from,
                        state = ?self.state,
                        "repeated join ignored"
                    );
                    return Ok(());
                }
                let offer = match self.peer.create_offer().await {
                    Ok(offer) => offer,
                    Err(err) => return Err(self.fail(err)),
                };
                if let Err(err) = self.peer.set_local_description(offer.clone()).await {
                    return Err(self.fail(err));
                }
                self.offer_pending = true;
                self.state = NegotiationState::Negotiating;
                self.send(SignalMessage::Offer {
                    from: self.local.clone(),
                    sdp: offer,
                })?;
                tracing::debug!(target = "parley::negotiation", to = %from, "offer sent");
                Ok(())
            }
            Some(Role::Answerer) => {
                // A peer that subscribed before us never saw our join.
                if !self.reannounced {
                    self.reannounced = true;
                    self.send(self.join())?;
                    tracing::debug!(target = "parley::negotiation", to = %from, "join re-announced");
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Forget everything negotiated with the previous incarnation of the peer.
    async fn restart(&mut self, from: &Participant) -> Result<(), NegotiationError> {
        let negotiated = self.offer_pending || self.remote_description_installed || self.answered;
        tracing::info!(
            target = "parley::negotiation",
            peer = %from,
            state = ?self.state,
            negotiated,
            "peer restarted; negotiating again"
        );
        if negotiated {
            if let Err(err) = self.peer.reset().await {
                return Err(self.fail(err));
            }
        }
        self.candidates.clear();
        self.remote_description_installed = false;
        self.offer_pending = false;
        self.answered = false;
        self.reannounced = false;
        self.state = NegotiationState::AwaitingPeer;
        self.restarts += 1;
        Ok(())
    }

    async fn on_offer(
        &mut self,
        from: Participant,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if let Some(anomaly) = self.classify_offer(&from) {
            tracing::warn!(
                target = "parley::negotiation",
                anomaly = ?anomaly,
                "unexpected offer accepted as authoritative"
            );
            self.anomalies.push(anomaly);
        }

        // Our unanswered offer is discarded with the connection that made it.
        if self.offer_pending {
            if let Err(err) = self.peer.reset().await {
                return Err(self.fail(err));
            }
            self.offer_pending = false;
        }

        if let Err(err) = self.peer.set_remote_description(offer).await {
            return Err(self.fail(err));
        }
        self.remote_description_installed = true;
        self.apply_buffered_candidates().await;

        let answer = match self.peer.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail(err)),
        };
        if let Err(err) = self.peer.set_local_description(answer.clone()).await {
            return Err(self.fail(err));
        }
        self.answered = true;
        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::Negotiating;
        }
        self.send(SignalMessage::Answer {
            from: self.local.clone(),
            sdp: answer,
        })?;
        tracing::debug!(target = "parley::negotiation", to = %from, "answer sent");
        Ok(())
    }

    async fn on_answer(
        &mut self,
        from: Participant,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if !self.offer_pending {
            let anomaly = NegotiationAnomaly::UnsolicitedAnswer { from };
            tracing::warn!(
                target = "parley::negotiation",
                anomaly = ?anomaly,
                "answer without a pending offer"
            );
            self.anomalies.push(anomaly);
            if let Err(err) = self.peer.set_remote_description(answer).await {
                tracing::debug!(
                    target = "parley::negotiation",
                    error = %err,
                    "unsolicited answer rejected by peer connection"
                );
                return Ok(());
            }
        } else if let Err(err) = self.peer.set_remote_description(answer).await {
            return Err(self.fail(err));
        }
        self.offer_pending = false;
        self.remote_description_installed = true;
        self.apply_buffered_candidates().await;
        tracing::debug!(target = "parley::negotiation", "answer installed");
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: CandidateDescriptor) {
        if !self.remote_description_installed {
            self.candidates.push(candidate);
            tracing::trace!(
                target = "parley::negotiation",
                buffered = self.candidates.len(),
                "candidate buffered until remote description"
            );
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn apply_buffered_candidates(&mut self) {
        let pending = self.candidates.drain();
        if !pending.is_empty() {
            tracing::debug!(
                target = "parley::negotiation",
                count = pending.len(),
                "applying buffered candidates"
            );
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: CandidateDescriptor) {
        if let Err(err) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!(target = "parley::negotiation", error = %err, "candidate not applied");
        }
    }

    fn classify_offer(&self, from: &Participant) -> Option<NegotiationAnomaly> {
        let from = from.clone();
        if self.answered {
            Some(NegotiationAnomaly::OfferAfterAnswer { from })
        } else if self.offer_pending {
            Some(NegotiationAnomaly::GlareOffer { from })
        } else if self.role == Some(Role::Offerer) {
            Some(NegotiationAnomaly::OfferFromAnswerer { from })
        } else {
            None
        }
    }

    fn join(&self) -> SignalMessage {
        SignalMessage::Join {
            from: self.local.clone(),
            instance: Some(self.instance.clone()),
        }
    }

    fn send(&self, message: SignalMessage) -> Result<(), NegotiationError> {
        self.signals.send(message).map_err(NegotiationError::from)
    }

    fn fail(&mut self, err: PeerError) -> NegotiationError {
        tracing::warn!(
            target = "parley::negotiation",
            error = %err,
            state = ?self.state,
            "negotiation failed"
        );
        self.state = NegotiationState::Failed;
        NegotiationError::Peer(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource, SyntheticMediaSource};
    use crate::peer::{MockPeerConnection, MockPeerConnector, PeerCall, PeerConnector, PeerEvent};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<SignalMessage>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<SignalMessage> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl SignalSink for RecordingSink {
        fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    struct Harness {
        machine: NegotiationStateMachine,
        peer: Arc<MockPeerConnection>,
        sink: Arc<RecordingSink>,
        _events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    async fn harness(local: &str) -> Harness {
        let connector = MockPeerConnector::manual();
        let (tx, rx) = mpsc::unbounded_channel();
        let peer_dyn = connector.connect(&[], tx).await.unwrap();
        let peer = connector.last().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut machine =
            NegotiationStateMachine::new(Participant::new(local), peer_dyn, sink.clone());
        let media = SyntheticMediaSource::new()
            .without_samples()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        machine.start(&media).await.unwrap();
        Harness {
            machine,
            peer,
            sink,
            _events: rx,
        }
    }

    fn candidate(n: u32) -> CandidateDescriptor {
        CandidateDescriptor::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn election_is_antisymmetric() {
        let a = Participant::new("alice");
        let b = Participant::new("bob");
        assert_eq!(elect_role(&a, &b), Some(Role::Offerer));
        assert_eq!(elect_role(&b, &a), Some(Role::Answerer));
        assert_eq!(elect_role(&a, &a), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn start_announces_join() {
        let mut h = harness("alice").await;
        assert_eq!(h.machine.state(), NegotiationState::AwaitingPeer);
        assert_eq!(
            h.sink.take(),
            vec![SignalMessage::Join {
                from: "alice".into(),
                instance: Some(h.machine.instance().to_owned()),
            }]
        );
        assert!(matches!(
            h.peer.calls()[0],
            PeerCall::AddLocalMedia { tracks: 2 }
        ));
        let media = SyntheticMediaSource::new()
            .without_samples()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        assert!(matches!(
            h.machine.start(&media).await,
            Err(NegotiationError::AlreadyStarted)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn offerer_sends_offer_once_on_join() {
        let mut h = harness("alice").await;
        h.sink.take();
        let join = SignalMessage::join("bob");
        h.machine.handle_signal(join.clone()).await.unwrap();
        h.machine.handle_signal(join).await.unwrap();

        let sent = h.sink.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalMessage::Offer { .. }));
        assert_eq!(h.machine.role(), Some(Role::Offerer));
        assert_eq!(h.machine.state(), NegotiationState::Negotiating);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answerer_reannounces_once() {
        let mut h = harness("bob").await;
        h.sink.take();
        for _ in 0..3 {
            h.machine
                .handle_signal(SignalMessage::join("alice"))
                .await
                .unwrap();
        }
        assert_eq!(
            h.sink.take(),
            vec![SignalMessage::Join {
                from: "bob".into(),
                instance: Some(h.machine.instance().to_owned()),
            }]
        );
        assert_eq!(h.machine.state(), NegotiationState::AwaitingPeer);
    }

    #[test_timeout::tokio_timeout_test]
    async fn own_messages_are_never_applied() {
        let mut h = harness("alice").await;
        h.sink.take();
        let own = Participant::new("alice");
        for message in [
            SignalMessage::join(own.clone()),
            SignalMessage::Offer {
                from: own.clone(),
                sdp: SessionDescription::offer("v=0"),
            },
            SignalMessage::Answer {
                from: own.clone(),
                sdp: SessionDescription::answer("v=0"),
            },
            SignalMessage::IceCandidate {
                from: own,
                candidate: candidate(1),
            },
        ] {
            h.machine.handle_signal(message).await.unwrap();
        }
        assert!(h.sink.take().is_empty());
        assert_eq!(h.machine.remote(), None);
        assert_eq!(h.machine.buffered_candidates(), 0);
        assert_eq!(h.peer.calls().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_apply_in_order_after_answer() {
        let mut h = harness("alice").await;
        h.machine
            .handle_signal(SignalMessage::join("bob"))
            .await
            .unwrap();
        for n in 1..=3 {
            h.machine
                .handle_signal(SignalMessage::IceCandidate {
                    from: "bob".into(),
                    candidate: candidate(n),
                })
                .await
                .unwrap();
        }
        assert_eq!(h.machine.buffered_candidates(), 3);
        assert!(h.peer.applied_candidates().is_empty());

        h.machine
            .handle_signal(SignalMessage::Answer {
                from: "bob".into(),
                sdp: SessionDescription::answer("v=0 bob"),
            })
            .await
            .unwrap();
        assert_eq!(h.machine.buffered_candidates(), 0);
        assert_eq!(
            h.peer.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );

        h.machine
            .handle_signal(SignalMessage::IceCandidate {
                from: "bob".into(),
                candidate: candidate(4),
            })
            .await
            .unwrap();
        assert_eq!(h.peer.applied_candidates().len(), 4);
        assert!(h.machine.anomalies().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn answerer_answers_offer() {
        let mut h = harness("bob").await;
        h.sink.take();
        h.machine
            .handle_signal(SignalMessage::IceCandidate {
                from: "alice".into(),
                candidate: candidate(7),
            })
            .await
            .unwrap();
        h.machine
            .handle_signal(SignalMessage::Offer {
                from: "alice".into(),
                sdp: SessionDescription::offer("v=0 alice"),
            })
            .await
            .unwrap();

        let sent = h.sink.take();
        assert!(matches!(sent.as_slice(), [SignalMessage::Answer { .. }]));
        assert_eq!(h.peer.applied_candidates(), vec![candidate(7)]);
        assert_eq!(h.machine.state(), NegotiationState::Negotiating);
        assert!(h.machine.anomalies().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_offer_gets_fresh_answer() {
        let mut h = harness("bob").await;
        for _ in 0..2 {
            h.machine
                .handle_signal(SignalMessage::Offer {
                    from: "alice".into(),
                    sdp: SessionDescription::offer("v=0 alice"),
                })
                .await
                .unwrap();
        }
        let answers = h
            .sink
            .take()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Answer { .. }))
            .count();
        assert_eq!(answers, 2);
        assert_eq!(
            h.machine.anomalies(),
            &[NegotiationAnomaly::OfferAfterAnswer {
                from: "alice".into()
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn glare_replaces_connection_before_answering() {
        let mut h = harness("alice").await;
        h.machine
            .handle_signal(SignalMessage::join("bob"))
            .await
            .unwrap();
        h.sink.take();
        h.machine
            .handle_signal(SignalMessage::Offer {
                from: "bob".into(),
                sdp: SessionDescription::offer("v=0 bob"),
            })
            .await
            .unwrap();

        assert!(matches!(
            h.sink.take().as_slice(),
            [SignalMessage::Answer { .. }]
        ));
        assert_eq!(
            h.machine.anomalies(),
            &[NegotiationAnomaly::GlareOffer { from: "bob".into() }]
        );
        assert_eq!(h.peer.count(|c| *c == PeerCall::Reset), 1);
        assert_eq!(
            h.peer.remote_description(),
            Some(SessionDescription::offer("v=0 bob"))
        );
        assert_eq!(h.machine.state(), NegotiationState::Negotiating);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsolicited_answer_is_not_fatal() {
        let mut h = harness("bob").await;
        h.machine
            .handle_signal(SignalMessage::Answer {
                from: "alice".into(),
                sdp: SessionDescription::answer("v=0"),
            })
            .await
            .unwrap();
        assert_eq!(h.machine.state(), NegotiationState::AwaitingPeer);
        assert_eq!(
            h.machine.anomalies(),
            &[NegotiationAnomaly::UnsolicitedAnswer {
                from: "alice".into()
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_offer_fails_negotiation() {
        let mut h = harness("bob").await;
        h.peer.reject_remote_descriptions();
        let result = h
            .machine
            .handle_signal(SignalMessage::Offer {
                from: "alice".into(),
                sdp: SessionDescription::offer("garbage"),
            })
            .await;
        assert!(matches!(result, Err(NegotiationError::Peer(_))));
        assert_eq!(h.machine.state(), NegotiationState::Failed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn third_participant_is_ignored() {
        let mut h = harness("bob").await;
        h.machine
            .handle_signal(SignalMessage::join("alice"))
            .await
            .unwrap();
        h.sink.take();
        h.machine
            .handle_signal(SignalMessage::Offer {
                from: "carol".into(),
                sdp: SessionDescription::offer("v=0 carol"),
            })
            .await
            .unwrap();
        assert!(h.sink.take().is_empty());
        assert_eq!(h.machine.remote(), Some(&Participant::new("alice")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn connectivity_drives_state() {
        let mut h = harness("alice").await;
        assert_eq!(
            h.machine.handle_connectivity(ConnectivityState::Connecting),
            NegotiationState::AwaitingPeer
        );
        // Nothing was negotiated yet, so this cannot be our connection.
        assert_eq!(
            h.machine.handle_connectivity(ConnectivityState::Connected),
            NegotiationState::AwaitingPeer
        );
        h.machine
            .handle_signal(SignalMessage::join("bob"))
            .await
            .unwrap();
        assert_eq!(
            h.machine.handle_connectivity(ConnectivityState::Connected),
            NegotiationState::Connected
        );
        assert_eq!(
            h.machine.handle_connectivity(ConnectivityState::Connected),
            NegotiationState::Connected
        );
        assert_eq!(
            h.machine.handle_connectivity(ConnectivityState::Failed),
            NegotiationState::Failed
        );
        assert_eq!(
            h.machine.handle_connectivity(ConnectivityState::Connected),
            NegotiationState::Failed
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_clears_buffer_and_peer() {
        let mut h = harness("alice").await;
        h.machine
            .handle_signal(SignalMessage::IceCandidate {
                from: "bob".into(),
                candidate: candidate(1),
            })
            .await
            .unwrap();
        h.machine.close().await;
        assert_eq!(h.machine.buffered_candidates(), 0);
        assert!(h.peer.is_closed());
        assert_eq!(h.machine.state(), NegotiationState::Disconnected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_candidates_are_trickled() {
        let mut h = harness("alice").await;
        h.sink.take();
        h.machine.handle_local_candidate(candidate(9)).unwrap();
        assert_eq!(
            h.sink.take(),
            vec![SignalMessage::IceCandidate {
                from: "alice".into(),
                candidate: candidate(9)
            }]
        );
    }

    fn join_as(from: &str, instance: &str) -> SignalMessage {
        SignalMessage::Join {
            from: from.into(),
            instance: Some(instance.into()),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn same_instance_join_is_a_duplicate() {
        let mut h = harness("alice").await;
        h.machine.handle_signal(join_as("bob", "b1")).await.unwrap();
        h.machine.handle_signal(join_as("bob", "b1")).await.unwrap();
        h.machine.handle_signal(SignalMessage::join("bob")).await.unwrap();

        let offers = h
            .sink
            .take()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
        assert_eq!(h.machine.restarts(), 0);
        assert_eq!(h.peer.count(|c| *c == PeerCall::Reset), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn restarted_peer_gets_a_fresh_offer() {
        let mut h = harness("alice").await;
        h.machine.handle_signal(join_as("bob", "b1")).await.unwrap();
        let first = h.peer.local_description().expect("first offer");
        h.machine
            .handle_signal(SignalMessage::IceCandidate {
                from: "bob".into(),
                candidate: candidate(1),
            })
            .await
            .unwrap();
        h.sink.take();

        // Bob went away before answering and came back with a new attempt.
        h.machine.handle_signal(join_as("bob", "b2")).await.unwrap();

        let sent = h.sink.take();
        let [SignalMessage::Offer { sdp, .. }] = sent.as_slice() else {
            panic!("expected a single offer, got {sent:?}");
        };
        assert_ne!(sdp, &first);
        assert_eq!(h.peer.local_description().as_ref(), Some(sdp));
        assert_eq!(h.peer.count(|c| *c == PeerCall::Reset), 1);
        assert_eq!(h.machine.restarts(), 1);
        assert_eq!(h.machine.buffered_candidates(), 0);
        assert_eq!(h.machine.state(), NegotiationState::Negotiating);

        h.machine
            .handle_signal(SignalMessage::Answer {
                from: "bob".into(),
                sdp: SessionDescription::answer("v=0 bob again"),
            })
            .await
            .unwrap();
        assert!(h.machine.anomalies().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn restart_after_connect_negotiates_again() {
        let mut h = harness("bob").await;
        h.machine.handle_signal(join_as("alice", "a1")).await.unwrap();
        h.machine
            .handle_signal(SignalMessage::Offer {
                from: "alice".into(),
                sdp: SessionDescription::offer("v=0 alice"),
            })
            .await
            .unwrap();
        h.machine.handle_connectivity(ConnectivityState::Connected);
        assert_eq!(h.machine.state(), NegotiationState::Connected);
        h.sink.take();

        h.machine.handle_signal(join_as("alice", "a2")).await.unwrap();
        assert_eq!(h.machine.state(), NegotiationState::AwaitingPeer);
        assert_eq!(h.peer.remote_description(), None);
        assert_eq!(
            h.sink.take(),
            vec![SignalMessage::Join {
                from: "bob".into(),
                instance: Some(h.machine.instance().to_owned()),
            }]
        );

        h.machine
            .handle_signal(SignalMessage::Offer {
                from: "alice".into(),
                sdp: SessionDescription::offer("v=0 alice again"),
            })
            .await
            .unwrap();
        assert!(matches!(
            h.sink.take().as_slice(),
            [SignalMessage::Answer { .. }]
        ));
        assert!(h.machine.anomalies().is_empty());
        assert_eq!(h.machine.restarts(), 1);
    }
}
