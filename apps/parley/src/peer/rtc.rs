use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use super::{ConnectivityState, PeerConnection, PeerConnector, PeerError, PeerEvent, PeerEventSink};
use crate::config::IceServer;
use crate::media::{LocalMedia, RemoteTrackInfo, TrackKind};
use crate::signal::{CandidateDescriptor, SdpKind, SessionDescription};

/// Builds peer connections on the `webrtc` crate.
#[derive(Clone)]
pub struct WebRtcConnector {
    disconnected_timeout: Duration,
    failed_timeout: Duration,
    keepalive_interval: Duration,
    vnet: Option<Arc<Net>>,
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self {
            disconnected_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(25),
            keepalive_interval: Duration::from_secs(2),
            vnet: None,
        }
    }
}

impl WebRtcConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorter ICE timeouts, for runs where every path is local.
    pub fn fast_fail() -> Self {
        Self {
            disconnected_timeout: Duration::from_secs(3),
            failed_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(500),
            vnet: None,
        }
    }

    fn build_api(&self) -> Result<API, PeerError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(self.disconnected_timeout),
            Some(self.failed_timeout),
            Some(self.keepalive_interval),
        );
        if let Some(vnet) = &self.vnet {
            setting.set_vnet(Some(Arc::clone(vnet)));
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_setup_error)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

        Ok(APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let api = self.build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let epoch = Arc::new(AtomicU64::new(0));
        let pc = open(&api, &config, Forward::new(events.clone(), &epoch, 0)).await?;
        Ok(Arc::new(WebRtcPeer {
            api,
            config,
            events,
            epoch,
            pc: Mutex::new(pc),
            tracks: Mutex::new(Vec::new()),
        }) as Arc<dyn PeerConnection>)
    }
}

/// Delivers callbacks of one underlying connection while it is the current one.
#[derive(Clone)]
struct Forward {
    events: PeerEventSink,
    epoch: Arc<AtomicU64>,
    generation: u64,
}

impl Forward {
    fn new(events: PeerEventSink, epoch: &Arc<AtomicU64>, generation: u64) -> Self {
        Self {
            events,
            epoch: Arc::clone(epoch),
            generation,
        }
    }

    fn send(&self, event: PeerEvent) {
        if self.epoch.load(Ordering::SeqCst) != self.generation {
            tracing::trace!(target = "parley::peer", generation = self.generation, "stale peer event dropped");
            return;
        }
        let _ = self.events.send(event);
    }
}

async fn open(
    api: &API,
    config: &RTCConfiguration,
    forward: Forward,
) -> Result<Arc<RTCPeerConnection>, PeerError> {
    let pc = Arc::new(
        api.new_peer_connection(config.clone())
            .await
            .map_err(to_setup_error)?,
    );

    let candidate_forward = forward.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let forward = candidate_forward.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tracing::trace!(target = "parley::peer", "ice gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => forward.send(PeerEvent::LocalCandidate(candidate_from_rtc(init))),
                Err(err) => {
                    tracing::warn!(
                        target = "parley::peer",
                        error = %err,
                        "failed to serialize local candidate"
                    );
                }
            }
        })
    }));

    let track_forward = forward.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let forward = track_forward.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Audio => TrackKind::Audio,
                    other => {
                        tracing::debug!(target = "parley::peer", kind = %other, "ignoring remote track");
                        return;
                    }
                };
                let info = RemoteTrackInfo {
                    kind,
                    id: track.id(),
                    stream_id: track.stream_id(),
                };
                tracing::debug!(
                    target = "parley::peer",
                    track_id = %info.id,
                    stream_id = %info.stream_id,
                    kind = ?info.kind,
                    "remote track"
                );
                forward.send(PeerEvent::RemoteTrack(info));
                // Drain RTP so the receive buffers never back up; nothing here renders it.
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            })
        },
    ));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let forward = forward.clone();
        Box::pin(async move {
            tracing::debug!(target = "parley::peer", state = %state, "peer connection state");
            if let Some(mapped) = connectivity_from_rtc(state) {
                forward.send(PeerEvent::Connectivity(mapped));
            }
        })
    }));

    Ok(pc)
}

async fn attach_track(
    pc: &RTCPeerConnection,
    track: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<(), PeerError> {
    let sender = pc.add_track(track).await.map_err(to_setup_error)?;
    // RTCP must be read for interceptors such as NACK to work.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
    Ok(())
}

/// Private network emulated in-process, so peers connect without OS networking.
pub struct VirtualLan {
    router: Arc<tokio::sync::Mutex<Router>>,
}

impl VirtualLan {
    /// One connector per host on `10.0.0.0/24`, all attached to a started router.
    pub async fn with_hosts(hosts: usize) -> Result<(Self, Vec<WebRtcConnector>), PeerError> {
        if hosts == 0 || hosts > 250 {
            return Err(PeerError::Setup(format!("unsupported host count {hosts}")));
        }
        let router = Arc::new(tokio::sync::Mutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .map_err(to_setup_error)?,
        ));

        let mut connectors = Vec::with_capacity(hosts);
        for host in 0..hosts {
            let net = Arc::new(Net::new(Some(NetConfig {
                static_ips: vec![format!("10.0.0.{}", host + 2)],
                ..Default::default()
            })));
            attach(&net, &router).await?;
            connectors.push(WebRtcConnector {
                vnet: Some(net),
                ..WebRtcConnector::fast_fail()
            });
        }
        router.lock().await.start().await.map_err(to_setup_error)?;
        Ok((Self { router }, connectors))
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.router.lock().await.stop().await {
            tracing::debug!(target = "parley::peer", error = %err, "virtual router stop failed");
        }
    }
}

async fn attach(net: &Arc<Net>, router: &Arc<tokio::sync::Mutex<Router>>) -> Result<(), PeerError> {
    let nic = net.get_nic().map_err(to_setup_error)?;
    router
        .lock()
        .await
        .add_net(Arc::clone(&nic))
        .await
        .map_err(to_setup_error)?;
    nic.lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .map_err(to_setup_error)?;
    Ok(())
}

struct WebRtcPeer {
    api: API,
    config: RTCConfiguration,
    events: PeerEventSink,
    epoch: Arc<AtomicU64>,
    pc: Mutex<Arc<RTCPeerConnection>>,
    tracks: Mutex<Vec<Arc<dyn TrackLocal + Send + Sync>>>,
}

impl WebRtcPeer {
    fn current(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.lock())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), PeerError> {
        let pc = self.current();
        for track in media.tracks() {
            let track = track.rtc_track();
            attach_track(&pc, Arc::clone(&track)).await?;
            self.tracks.lock().push(track);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .current()
            .create_offer(None)
            .await
            .map_err(|err| PeerError::Description(err.to_string()))?;
        description_from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .current()
            .create_answer(None)
            .await
            .map_err(|err| PeerError::Description(err.to_string()))?;
        description_from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let desc = description_to_rtc(description)?;
        self.current()
            .set_local_description(desc)
            .await
            .map_err(|err| PeerError::Description(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let desc = description_to_rtc(description)?;
        self.current()
            .set_remote_description(desc)
            .await
            .map_err(|err| PeerError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.current()
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::Candidate(err.to_string()))
    }

    async fn reset(&self) -> Result<(), PeerError> {
        let generation = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = open(
            &self.api,
            &self.config,
            Forward::new(self.events.clone(), &self.epoch, generation),
        )
        .await?;
        let tracks = self.tracks.lock().clone();
        for track in tracks {
            attach_track(&fresh, track).await?;
        }
        let stale = std::mem::replace(&mut *self.pc.lock(), fresh);
        tracing::debug!(target = "parley::peer", generation, "peer connection replaced");
        if let Err(err) = stale.close().await {
            tracing::debug!(target = "parley::peer", error = %err, "closing replaced peer connection failed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.current()
            .close()
            .await
            .map_err(|err| PeerError::Setup(err.to_string()))
    }
}

fn connectivity_from_rtc(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn description_from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::Description("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn description_to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rejected = |err: webrtc::Error| PeerError::Description(err.to_string());
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(rejected),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(rejected),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(rejected),
        SdpKind::Rollback => Err(PeerError::Description(
            "rollback is not supported; reset the connection instead".into(),
        )),
    }
}

fn candidate_from_rtc(init: RTCIceCandidateInit) -> CandidateDescriptor {
    CandidateDescriptor {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource, SyntheticMediaSource};

    #[test]
    fn peer_states_map_to_connectivity() {
        assert_eq!(
            connectivity_from_rtc(RTCPeerConnectionState::Connected),
            Some(ConnectivityState::Connected)
        );
        assert_eq!(
            connectivity_from_rtc(RTCPeerConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(connectivity_from_rtc(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn rollback_is_refused_before_reaching_the_stack() {
        let err = description_to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, PeerError::Description(_)));
    }

    #[test]
    fn candidate_fields_are_relayed_verbatim() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 127.0.0.1 4000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".into()),
        };
        let descriptor = candidate_from_rtc(init);
        assert_eq!(descriptor.sdp_mid.as_deref(), Some("0"));
        assert_eq!(descriptor.username_fragment.as_deref(), Some("frag"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_round_trips_through_peer() {
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = WebRtcConnector::fast_fail()
            .connect(&[], events)
            .await
            .expect("peer");
        let media = SyntheticMediaSource::new()
            .without_samples()
            .acquire(&MediaConstraints::default())
            .await
            .expect("media");
        peer.add_local_media(&media).await.expect("tracks");
        let offer = peer.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=audio"));
        peer.set_local_description(offer).await.expect("local");
        peer.close().await.expect("close");
    }

    #[test_timeout::tokio_timeout_test]
    async fn reset_drops_pending_offer_and_keeps_media() {
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let connector = WebRtcConnector::fast_fail();
        let peer = connector.connect(&[], events).await.expect("peer");
        let media = SyntheticMediaSource::new()
            .without_samples()
            .acquire(&MediaConstraints::default())
            .await
            .expect("media");
        peer.add_local_media(&media).await.expect("tracks");
        let offer = peer.create_offer().await.expect("offer");
        peer.set_local_description(offer).await.expect("local");

        let (other_events, _other_rx) = tokio::sync::mpsc::unbounded_channel();
        let other = connector.connect(&[], other_events).await.expect("other");
        other.add_local_media(&media).await.expect("other tracks");
        let remote_offer = other.create_offer().await.expect("remote offer");

        // A remote offer cannot land on top of our own pending one.
        assert!(
            peer.set_remote_description(remote_offer.clone())
                .await
                .is_err()
        );

        peer.reset().await.expect("reset");
        peer.set_remote_description(remote_offer)
            .await
            .expect("remote offer after reset");
        let answer = peer.create_answer().await.expect("answer");
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(answer.sdp.contains("m=video"));
        peer.set_local_description(answer).await.expect("local answer");

        peer.close().await.expect("close");
        other.close().await.expect("close other");
    }
}
