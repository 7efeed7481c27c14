//! Boundary to the media transport that owns the actual peer connection.

pub mod mock;
pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::media::{LocalMedia, RemoteTrackInfo};
use crate::signal::{CandidateDescriptor, SessionDescription};

pub use mock::{MockPeerConnection, MockPeerConnector, PeerCall};
pub use rtc::{VirtualLan, WebRtcConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered candidate, to be trickled to the remote side.
    LocalCandidate(CandidateDescriptor),
    RemoteTrack(RemoteTrackInfo),
    Connectivity(ConnectivityState),
}

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("peer connection closed")]
    Closed,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<(), PeerError>;
    /// Drops every negotiated description and candidate by replacing the
    /// underlying connection. Local media already added is carried over and
    /// events from the replaced connection are no longer delivered.
    async fn reset(&self) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections whose callbacks are delivered through `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
