//! Local media capture binding
//!
//! Capture hardware is behind the [`MediaSource`] trait; the coordinator only
//! sees a [`MediaHandle`] holding the negotiated outbound tracks. Tracks are
//! `TrackLocalStaticSample`s so any capture backend (or test fixture) can
//! push encoded samples into the peer connection.
//!
//! Mute semantics: a disabled track stays negotiated and attached, it just
//! stops accepting samples. Re-enabling resumes the same track, no
//! renegotiation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::{Error, Result};

/// Audio capture constraints
#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Sample rate in Hz (default: 48000)
    pub sample_rate: u32,
    /// Channel count (default: 2)
    pub channels: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48000,
            channels: 2,
        }
    }
}

/// Video capture constraints
#[derive(Debug, Clone)]
pub struct VideoConstraints {
    /// Ideal capture width (default: 1280)
    pub width: u32,
    /// Ideal capture height (default: 720)
    pub height: u32,
    /// Ideal frame rate (default: 30)
    pub framerate: u32,
    /// Which camera to open first (default: front)
    pub facing: CameraFacing,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30,
            facing: CameraFacing::Front,
        }
    }
}

/// Camera selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
}

impl CameraFacing {
    pub fn toggled(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }
}

/// What to capture for a call
#[derive(Debug, Clone, Default)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio and video with default tuning
    pub fn audio_video() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }

    /// Audio only (voice call)
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: None,
        }
    }
}

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// An outbound media track with a mute flag.
#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl LocalTrack {
    /// Opus audio track
    pub fn audio(constraints: &AudioConstraints, user_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: constraints.sample_rate,
                channels: constraints.channels,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("audio-{user_id}"),
            format!("stream-{stream_id}"),
        ));
        Self {
            kind: TrackKind::Audio,
            track,
            enabled: AtomicBool::new(true),
        }
    }

    /// VP8 video track with the standard 90kHz clock
    pub fn video(user_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{user_id}"),
            format!("stream-{stream_id}"),
        ));
        Self {
            kind: TrackKind::Video,
            track,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Underlying sample track, for attaching to a peer connection
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the mute flag, returning the new enabled state
    pub fn toggle(&self) -> bool {
        // fetch_xor flips atomically and returns the previous value
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Push an encoded sample. Samples written while muted are dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| Error::MediaTrack(format!("write_sample failed: {e}")))
    }
}

/// Handle to acquired local media.
///
/// The peer connection holds the underlying tracks; this handle owns the
/// mute flags and camera selection.
#[derive(Debug)]
pub struct MediaHandle {
    audio: Option<Arc<LocalTrack>>,
    video: Option<Arc<LocalTrack>>,
    facing: parking_lot::Mutex<CameraFacing>,
    released: AtomicBool,
}

impl MediaHandle {
    pub fn new(audio: Option<Arc<LocalTrack>>, video: Option<Arc<LocalTrack>>) -> Self {
        Self {
            audio,
            video,
            facing: parking_lot::Mutex::new(CameraFacing::Front),
            released: AtomicBool::new(false),
        }
    }

    pub fn audio_track(&self) -> Option<Arc<LocalTrack>> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Option<Arc<LocalTrack>> {
        self.video.clone()
    }

    /// Flip the microphone mute flag.
    ///
    /// Returns the new enabled state, or `false` when no audio track exists.
    pub fn toggle_audio(&self) -> bool {
        match &self.audio {
            Some(track) => track.toggle(),
            None => false,
        }
    }

    /// Flip the camera mute flag.
    ///
    /// Returns the new enabled state, or `false` when no video track exists.
    pub fn toggle_video(&self) -> bool {
        match &self.video {
            Some(track) => track.toggle(),
            None => false,
        }
    }

    /// Switch between front and back camera. Best effort: with no video
    /// track this is a no-op returning `false`. Never interrupts the call.
    pub fn switch_camera(&self) -> bool {
        if self.video.is_none() {
            debug!("switch_camera ignored, no video track");
            return false;
        }
        let mut facing = self.facing.lock();
        *facing = facing.toggled();
        debug!(facing = ?*facing, "switched camera");
        true
    }

    pub fn camera_facing(&self) -> CameraFacing {
        *self.facing.lock()
    }

    /// Stop feeding all tracks. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(track) = &self.audio {
            track.set_enabled(false);
        }
        if let Some(track) = &self.video {
            track.set_enabled(false);
        }
        debug!("local media released");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Capture backend.
///
/// Acquisition failures map to permission-denied or hardware-unavailable
/// conditions and abort call setup before any signaling happens.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle>;
}

/// Capture backend producing sample-fed tracks with no device access.
///
/// The returned tracks negotiate normally; the application (or a test
/// fixture) pushes encoded samples through [`LocalTrack::write_sample`].
pub struct SampleMediaSource {
    user_id: String,
    stream_id: String,
    deny: bool,
}

impl SampleMediaSource {
    pub fn new(user_id: &str, stream_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            stream_id: stream_id.to_string(),
            deny: false,
        }
    }

    /// A source that refuses acquisition, mimicking denied permissions.
    pub fn denied(user_id: &str, stream_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            stream_id: stream_id.to_string(),
            deny: true,
        }
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle> {
        if self.deny {
            warn!("media acquisition denied");
            return Err(Error::MediaAccess("permission denied".to_string()));
        }

        let audio = constraints
            .audio
            .as_ref()
            .map(|a| Arc::new(LocalTrack::audio(a, &self.user_id, &self.stream_id)));
        let video = constraints
            .video
            .is_some()
            .then(|| Arc::new(LocalTrack::video(&self.user_id, &self.stream_id)));

        debug!(
            audio = audio.is_some(),
            video = video.is_some(),
            "local media acquired"
        );
        Ok(MediaHandle::new(audio, video))
    }
}
