use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    LocalMedia, LocalTrack, MediaConstraints, MediaError, MediaErrorReason, MediaSource,
    TrackKind,
};

const AUDIO_FRAME: Duration = Duration::from_millis(20);
// Opus TOC byte for a 20ms silence frame.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Generates audio/video tracks without touching capture hardware.
///
/// Used where no camera exists (CI, the loopback demo). Failures can be scripted to
/// exercise the device-error paths of a session.
pub struct SyntheticMediaSource {
    secure_context: bool,
    feed_samples: bool,
    acquire_delay: Option<Duration>,
    scripted_failures: parking_lot::Mutex<VecDeque<MediaErrorReason>>,
    acquisitions: AtomicUsize,
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self {
            secure_context: true,
            feed_samples: true,
            acquire_delay: None,
            scripted_failures: parking_lot::Mutex::new(VecDeque::new()),
            acquisitions: AtomicUsize::new(0),
        }
    }
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaves like a runtime without capture APIs.
    pub fn insecure() -> Self {
        Self {
            secure_context: false,
            ..Self::default()
        }
    }

    pub fn without_samples(mut self) -> Self {
        self.feed_samples = false;
        self
    }

    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    /// The next acquisition fails with `reason`; queued failures are consumed in order.
    pub fn fail_next(&self, reason: MediaErrorReason) {
        self.scripted_failures.lock().push_back(reason);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if !self.secure_context {
            return Err(MediaError::new(
                MediaErrorReason::InsecureContext,
                "capture APIs unavailable",
            ));
        }
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.scripted_failures.lock().pop_front() {
            return Err(MediaError::new(reason, "scripted failure"));
        }
        if constraints.video.is_none() && !constraints.audio {
            return Err(MediaError::new(
                MediaErrorReason::ConstraintsUnsupported,
                "at least one of audio or video must be requested",
            ));
        }

        let stream_id = format!("parley-{}", uuid::Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48_000,
                        channels: 2,
                        ..Default::default()
                    },
                    "audio".to_owned(),
                    stream_id.clone(),
                )),
            ));
        }
        let frame_interval = constraints.video.as_ref().map(|video| {
            Duration::from_millis(1000 / u64::from(video.frame_rate.max(1)))
        });
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(
                TrackKind::Video,
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90_000,
                        ..Default::default()
                    },
                    "video".to_owned(),
                    stream_id.clone(),
                )),
            ));
        }

        let media = LocalMedia::new(stream_id, tracks);
        if self.feed_samples {
            let audio = media
                .tracks()
                .iter()
                .find(|t| t.kind() == TrackKind::Audio)
                .map(|t| Arc::clone(t.sample_track()));
            let video = media
                .tracks()
                .iter()
                .find(|t| t.kind() == TrackKind::Video)
                .map(|t| Arc::clone(t.sample_track()));
            media.attach_feeder(tokio::spawn(feed_samples(
                audio,
                video,
                frame_interval.unwrap_or(Duration::from_millis(33)),
            )));
        }
        tracing::debug!(
            target = "parley::media",
            stream_id = %media.stream_id(),
            tracks = media.tracks().len(),
            "synthetic media acquired"
        );
        Ok(media)
    }
}

async fn feed_samples(
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    frame_interval: Duration,
) {
    let mut audio_tick = tokio::time::interval(AUDIO_FRAME);
    let mut video_tick = tokio::time::interval(frame_interval);
    let audio_frame = Bytes::from_static(&OPUS_SILENCE);
    let mut frame_no: u8 = 0;
    loop {
        tokio::select! {
            _ = audio_tick.tick(), if audio.is_some() => {
                if let Some(track) = audio.as_ref() {
                    let sample = Sample {
                        data: audio_frame.clone(),
                        duration: AUDIO_FRAME,
                        ..Default::default()
                    };
                    if let Err(err) = track.write_sample(&sample).await {
                        tracing::trace!(target = "parley::media", error = %err, "audio sample dropped");
                    }
                }
            }
            _ = video_tick.tick(), if video.is_some() => {
                if let Some(track) = video.as_ref() {
                    frame_no = frame_no.wrapping_add(1);
                    let sample = Sample {
                        data: Bytes::from(vec![frame_no; 64]),
                        duration: frame_interval,
                        ..Default::default()
                    };
                    if let Err(err) = track.write_sample(&sample).await {
                        tracing::trace!(target = "parley::media", error = %err, "video sample dropped");
                    }
                }
            }
            else => break,
        }
    }
}
