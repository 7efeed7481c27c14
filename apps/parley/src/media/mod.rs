pub mod synthetic;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub use synthetic::SyntheticMediaSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaErrorReason {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    ConstraintsUnsupported,
    InsecureContext,
    Unknown,
}

impl MediaErrorReason {
    pub fn user_message(self) -> &'static str {
        match self {
            MediaErrorReason::PermissionDenied => {
                "Camera or microphone was blocked. Allow access for this app, then try again."
            }
            MediaErrorReason::DeviceNotFound => {
                "No camera or microphone found. Connect a device and try again."
            }
            MediaErrorReason::DeviceBusy => {
                "Camera or microphone is in use. Close other apps using the camera, then try again."
            }
            MediaErrorReason::ConstraintsUnsupported => {
                "Your device doesn't support the requested camera or microphone settings."
            }
            MediaErrorReason::InsecureContext => {
                "Camera and microphone require a secure context. They are not available here."
            }
            MediaErrorReason::Unknown => "Could not access camera or microphone.",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("media unavailable ({reason:?}): {detail}")]
pub struct MediaError {
    pub reason: MediaErrorReason,
    pub detail: String,
}

impl MediaError {
    pub fn new(reason: MediaErrorReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    /// Message shown to the user; unknown failures fall back to the device's own detail.
    pub fn user_message(&self) -> String {
        match self.reason {
            MediaErrorReason::Unknown if !self.detail.trim().is_empty() => self.detail.clone(),
            reason => reason.user_message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub facing_mode: FacingMode,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            facing_mode: FacingMode::User,
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            video: None,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Returns `true` only for the call that actually stopped the track.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Captured local stream. Owned by exactly one session attempt.
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
    feeder: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: tracks.into_iter().map(Arc::new).collect(),
            feeder: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn attach_feeder(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.feeder.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Stops every live track; returns how many were still running.
    pub fn stop(&self) -> usize {
        if let Some(feeder) = self.feeder.lock().take() {
            feeder.abort();
        }
        let stopped = self.tracks.iter().filter(|track| track.stop()).count();
        if stopped > 0 {
            tracing::debug!(
                target = "parley::media",
                stream_id = %self.stream_id,
                stopped,
                "local tracks stopped"
            );
        }
        stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.get_mut().take() {
            feeder.abort();
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub kind: TrackKind,
    pub id: String,
    pub stream_id: String,
}

/// What the peer is sending us, as observed through track events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMedia {
    tracks: Vec<RemoteTrackInfo>,
}

impl RemoteMedia {
    pub fn add_track(&mut self, track: RemoteTrackInfo) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn tracks(&self) -> &[RemoteTrackInfo] {
        &self.tracks
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.tracks.first().map(|t| t.stream_id.as_str())
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Audio)
    }
}
