//! In-process peer connection that follows offer/answer signaling rules without any
//! network I/O. Used by tests and by anything that needs deterministic negotiation.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ConnectivityState, PeerConnection, PeerConnector, PeerError, PeerEvent, PeerEventSink};
use crate::config::IceServer;
use crate::media::{LocalMedia, RemoteTrackInfo, TrackKind};
use crate::signal::{CandidateDescriptor, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AddLocalMedia { tracks: usize },
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(CandidateDescriptor),
    Reset,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone)]
struct MockOptions {
    auto_connect: bool,
    trickle_candidates: usize,
    remote_tracks: Vec<TrackKind>,
}

#[derive(Debug)]
struct MockState {
    phase: SignalingPhase,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    descriptions_made: u32,
    candidates_made: usize,
    connected: bool,
    closed: bool,
    reject_remote: bool,
}

pub struct MockPeerConnection {
    label: String,
    events: PeerEventSink,
    options: MockOptions,
    calls: Mutex<Vec<PeerCall>>,
    state: Mutex<MockState>,
}

impl MockPeerConnection {
    fn new(label: String, events: PeerEventSink, options: MockOptions) -> Self {
        Self {
            label,
            events,
            options,
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(MockState {
                phase: SignalingPhase::Stable,
                local: None,
                remote: None,
                descriptions_made: 0,
                candidates_made: 0,
                connected: false,
                closed: false,
                reject_remote: false,
            }),
        }
    }

    /// Injects an event as if the underlying transport had raised it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<CandidateDescriptor> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&PeerCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| matches(call)).count()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Makes every later `set_remote_description` fail.
    pub fn reject_remote_descriptions(&self) {
        self.state.lock().reject_remote = true;
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }

    fn make_sdp(&self, state: &mut MockState, kind: &str) -> String {
        state.descriptions_made += 1;
        format!(
            "v=0\r\no=mock-{} {} 1 IN IP4 127.0.0.1\r\ns={kind}\r\n",
            self.label, state.descriptions_made
        )
    }

    fn trickle(&self, state: &mut MockState) -> Vec<PeerEvent> {
        (0..self.options.trickle_candidates)
            .map(|_| {
                state.candidates_made += 1;
                let mut candidate = CandidateDescriptor::new(format!(
                    "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                    state.candidates_made,
                    40000 + state.candidates_made
                ));
                candidate.sdp_mid = Some("0".into());
                candidate.sdp_mline_index = Some(0);
                candidate.username_fragment = Some(self.label.clone());
                PeerEvent::LocalCandidate(candidate)
            })
            .collect()
    }

    fn maybe_connect(&self, state: &mut MockState) -> Vec<PeerEvent> {
        let negotiated = state.phase == SignalingPhase::Stable
            && state.local.is_some()
            && state.remote.is_some();
        if !self.options.auto_connect || state.connected || !negotiated {
            return Vec::new();
        }
        state.connected = true;
        let mut events = vec![
            PeerEvent::Connectivity(ConnectivityState::Connecting),
            PeerEvent::Connectivity(ConnectivityState::Connected),
        ];
        events.extend(self.options.remote_tracks.iter().map(|kind| {
            PeerEvent::RemoteTrack(RemoteTrackInfo {
                kind: *kind,
                id: format!("{}-{kind:?}", self.label).to_lowercase(),
                stream_id: format!("{}-stream", self.label),
            })
        }));
        events
    }

    fn flush(&self, events: Vec<PeerEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), PeerError> {
        self.record(PeerCall::AddLocalMedia {
            tracks: media.tracks().len(),
        });
        if self.state.lock().closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateOffer);
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        let sdp = self.make_sdp(&mut state, "offer");
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateAnswer);
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if state.phase != SignalingPhase::HaveRemoteOffer {
            return Err(PeerError::Description("no remote offer to answer".into()));
        }
        let sdp = self.make_sdp(&mut state, "answer");
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.record(PeerCall::SetLocalDescription(description.clone()));
        let events = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PeerError::Closed);
            }
            match (description.kind, state.phase) {
                (SdpKind::Offer, SignalingPhase::Stable | SignalingPhase::HaveLocalOffer) => {
                    state.phase = SignalingPhase::HaveLocalOffer;
                }
                (SdpKind::Answer | SdpKind::Pranswer, SignalingPhase::HaveRemoteOffer) => {
                    state.phase = SignalingPhase::Stable;
                }
                (kind, phase) => {
                    return Err(PeerError::Description(format!(
                        "cannot apply local {kind:?} in {phase:?}"
                    )));
                }
            }
            state.local = Some(description);
            let mut events = self.trickle(&mut state);
            events.extend(self.maybe_connect(&mut state));
            events
        };
        self.flush(events);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.record(PeerCall::SetRemoteDescription(description.clone()));
        let events = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PeerError::Closed);
            }
            if state.reject_remote {
                return Err(PeerError::Description("remote description rejected".into()));
            }
            match (description.kind, state.phase) {
                (SdpKind::Offer, SignalingPhase::Stable | SignalingPhase::HaveRemoteOffer) => {
                    state.phase = SignalingPhase::HaveRemoteOffer;
                }
                (SdpKind::Answer | SdpKind::Pranswer, SignalingPhase::HaveLocalOffer) => {
                    state.phase = SignalingPhase::Stable;
                }
                (kind, phase) => {
                    return Err(PeerError::Description(format!(
                        "cannot apply remote {kind:?} in {phase:?}"
                    )));
                }
            }
            state.remote = Some(description);
            self.maybe_connect(&mut state)
        };
        self.flush(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<(), PeerError> {
        let state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerError::Candidate(
                "remote description not installed".into(),
            ));
        }
        drop(state);
        self.record(PeerCall::AddIceCandidate(candidate));
        Ok(())
    }

    async fn reset(&self) -> Result<(), PeerError> {
        self.record(PeerCall::Reset);
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state.phase = SignalingPhase::Stable;
        state.local = None;
        state.remote = None;
        state.connected = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(PeerCall::Close);
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        drop(state);
        self.emit(PeerEvent::Connectivity(ConnectivityState::Closed));
        Ok(())
    }
}

/// Hands out [`MockPeerConnection`]s and keeps them for inspection.
pub struct MockPeerConnector {
    options: MockOptions,
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    fail_next: Mutex<Option<PeerError>>,
}

impl Default for MockPeerConnector {
    fn default() -> Self {
        Self {
            options: MockOptions {
                auto_connect: true,
                trickle_candidates: 1,
                remote_tracks: vec![TrackKind::Audio, TrackKind::Video],
            },
            created: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }
}

impl MockPeerConnector {
    /// Connects on its own once both descriptions are applied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Never connects or gathers candidates unless a test emits the events.
    pub fn manual() -> Self {
        let mut connector = Self::default();
        connector.options.auto_connect = false;
        connector.options.trickle_candidates = 0;
        connector
    }

    pub fn with_remote_tracks(mut self, kinds: Vec<TrackKind>) -> Self {
        self.options.remote_tracks = kinds;
        self
    }

    pub fn with_trickle(mut self, candidates: usize) -> Self {
        self.options.trickle_candidates = candidates;
        self
    }

    pub fn fail_next_connect(&self, err: PeerError) {
        *self.fail_next.lock() = Some(err);
    }

    pub fn peers(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for MockPeerConnector {
    async fn connect(
        &self,
        _ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }
        let mut created = self.created.lock();
        let peer = Arc::new(MockPeerConnection::new(
            format!("peer{}", created.len() + 1),
            events,
            self.options.clone(),
        ));
        created.push(Arc::clone(&peer));
        Ok(peer as Arc<dyn PeerConnection>)
    }
}
