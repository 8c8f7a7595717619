//! Media primitives
//!
//! Frames, tracks, and streams are lightweight shared handles: a
//! [`VideoTrack`] clone observes every frame its producer pushes, which is
//! what lets the compositor read remote feeds by reference and lets a call
//! swap its outgoing track without renegotiation. Each remote stream gets
//! exactly one decode handle in the [`TrackRouter`], independent of whether
//! it is currently visible.

use crate::types::PeerId;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Bytes per RGBA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Media errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Frame buffer length does not match its dimensions
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height}")]
    BadFrameBuffer {
        /// Declared width
        width: u32,
        /// Declared height
        height: u32,
        /// Required byte length
        expected: usize,
        /// Provided byte length
        actual: usize,
    },
}

/// Local capture failures
///
/// The only error class surfaced to the user as blocking: without local
/// media there is no session to start.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Access to the device was refused
    #[error("capture access denied: {0}")]
    Denied(String),

    /// No matching hardware present
    #[error("capture device missing: {0}")]
    NoDevice(String),
}

/// Unique identifier for a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub Uuid);

impl TrackId {
    /// Create a new random track ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Create a new random stream ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One RGBA8 video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    width: u32,
    height: u32,
    data: Bytes,
}

impl VideoFrame {
    /// Wrap an existing RGBA buffer
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::BadFrameBuffer`] when the buffer length does
    /// not equal `width * height * 4`.
    pub fn new(width: u32, height: u32, data: Bytes) -> Result<Self, MediaError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(MediaError::BadFrameBuffer {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A frame filled with a single color
    #[must_use]
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut buf = BytesMut::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
        for _ in 0..(width as usize * height as usize) {
            buf.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            data: buf.freeze(),
        }
    }

    /// An all-black frame
    #[must_use]
    pub fn black(width: u32, height: u32) -> Self {
        Self::solid(width, height, [0, 0, 0, 255])
    }

    /// Frame width in pixels
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA bytes
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Read one pixel; coordinates are clamped to the frame
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let x = x.min(self.width.saturating_sub(1)) as usize;
        let y = y.min(self.height.saturating_sub(1)) as usize;
        let off = (y * self.width as usize + x) * BYTES_PER_PIXEL;
        [
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]
    }
}

/// A live video track
///
/// Clones share one frame cell: a push on any handle is observed by every
/// other handle on its next read.
#[derive(Debug, Clone)]
pub struct VideoTrack {
    id: TrackId,
    label: String,
    frame: Arc<RwLock<VideoFrame>>,
    enabled: Arc<AtomicBool>,
}

impl VideoTrack {
    /// Create a track seeded with an initial frame
    pub fn new(label: impl Into<String>, initial: VideoFrame) -> Self {
        Self {
            id: TrackId::new(),
            label: label.into(),
            frame: Arc::new(RwLock::new(initial)),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> TrackId {
        self.id
    }

    /// Human-readable source label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Publish the next frame
    pub fn push_frame(&self, frame: VideoFrame) {
        *self.frame.write() = frame;
    }

    /// Latest published frame (cheap: pixel data is refcounted)
    #[must_use]
    pub fn current_frame(&self) -> VideoFrame {
        self.frame.read().clone()
    }

    /// Enable or disable the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// A live audio track holding the most recent sample window
///
/// A disabled audio track models a muted microphone; producers keep pushing
/// samples either way, which is what makes talking-while-muted detectable.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    id: TrackId,
    label: String,
    window: Arc<RwLock<Vec<f32>>>,
    enabled: Arc<AtomicBool>,
}

impl AudioTrack {
    /// Create a silent track
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: TrackId::new(),
            label: label.into(),
            window: Arc::new(RwLock::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> TrackId {
        self.id
    }

    /// Human-readable source label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Replace the rolling sample window
    pub fn push_samples(&self, samples: &[f32]) {
        let mut window = self.window.write();
        window.clear();
        window.extend_from_slice(samples);
    }

    /// Copy of the latest sample window
    #[must_use]
    pub fn latest_window(&self) -> Vec<f32> {
        self.window.read().clone()
    }

    /// Enable (unmute) or disable (mute) the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// A bundle of at most one video track plus any number of audio tracks
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: StreamId,
    video: Option<VideoTrack>,
    audio: Vec<AudioTrack>,
}

impl MediaStream {
    /// Assemble a stream from parts
    #[must_use]
    pub fn new(video: Option<VideoTrack>, audio: Vec<AudioTrack>) -> Self {
        Self {
            id: StreamId::new(),
            video,
            audio,
        }
    }

    /// The usual camera bundle: one video track, one microphone track
    #[must_use]
    pub fn camera(video: VideoTrack, mic: AudioTrack) -> Self {
        Self::new(Some(video), vec![mic])
    }

    /// Video-only stream (screen capture)
    #[must_use]
    pub fn video_only(video: VideoTrack) -> Self {
        Self::new(Some(video), Vec::new())
    }

    /// A stream whose picture is `video` and whose audio merges every track
    /// in `audio` — the shape of the host's composite-plus-microphone answer
    #[must_use]
    pub fn merged(video: VideoTrack, audio: Vec<AudioTrack>) -> Self {
        Self::new(Some(video), audio)
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The video track, if any
    #[must_use]
    pub fn video(&self) -> Option<&VideoTrack> {
        self.video.as_ref()
    }

    /// Swap the video track, leaving audio untouched
    pub fn set_video(&mut self, track: VideoTrack) {
        self.video = Some(track);
    }

    /// All audio tracks
    #[must_use]
    pub fn audio(&self) -> &[AudioTrack] {
        &self.audio
    }

    /// First audio track, if any
    #[must_use]
    pub fn first_audio(&self) -> Option<&AudioTrack> {
        self.audio.first()
    }
}

/// Local capture seam
///
/// Camera capture yields video plus microphone audio; screen capture yields
/// video only. Denial or missing hardware is fatal to session start and is
/// surfaced, never silently retried.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// Open camera and microphone
    async fn open_camera(&self) -> Result<MediaStream, CaptureError>;

    /// Open a screen capture stream
    async fn open_screen(&self) -> Result<MediaStream, CaptureError>;
}

/// Synthetic capture devices
///
/// Generates a test-pattern picture and a pure-tone microphone window, so
/// sessions can run without hardware. Construction flags simulate denial for
/// the capture-failure paths.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    width: u32,
    height: u32,
    deny_camera: bool,
    deny_screen: bool,
}

impl SyntheticDevices {
    /// Devices producing `width` x `height` test frames
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            deny_camera: false,
            deny_screen: false,
        }
    }

    /// Devices that refuse camera access
    #[must_use]
    pub fn camera_denied(mut self) -> Self {
        self.deny_camera = true;
        self
    }

    /// Devices that refuse screen access
    #[must_use]
    pub fn screen_denied(mut self) -> Self {
        self.deny_screen = true;
        self
    }

    /// A deterministic test-pattern frame: vertical color bands with a
    /// moving highlight column driven by `phase`
    #[must_use]
    pub fn test_pattern(width: u32, height: u32, phase: u32) -> VideoFrame {
        let bands: [[u8; 4]; 4] = [
            [235, 235, 235, 255],
            [190, 190, 60, 255],
            [60, 190, 190, 255],
            [60, 190, 60, 255],
        ];
        let highlight = (phase % width.max(1)) as usize;
        let mut buf =
            BytesMut::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
        for _y in 0..height {
            for x in 0..width as usize {
                let band = bands[(x * bands.len()) / width.max(1) as usize % bands.len()];
                if x == highlight {
                    buf.extend_from_slice(&[255, 80, 80, 255]);
                } else {
                    buf.extend_from_slice(&band);
                }
            }
        }
        VideoFrame {
            width,
            height,
            data: buf.freeze(),
        }
    }

    /// One window of a pure sine tone
    #[must_use]
    pub fn tone_window(freq_hz: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq_hz * i as f32 / sample_rate).sin())
            .collect()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_camera(&self) -> Result<MediaStream, CaptureError> {
        if self.deny_camera {
            return Err(CaptureError::Denied("camera".to_string()));
        }
        let video = VideoTrack::new(
            "synthetic-camera",
            Self::test_pattern(self.width, self.height, 0),
        );
        let mic = AudioTrack::new("synthetic-mic");
        Ok(MediaStream::camera(video, mic))
    }

    async fn open_screen(&self) -> Result<MediaStream, CaptureError> {
        if self.deny_screen {
            return Err(CaptureError::Denied("screen".to_string()));
        }
        let video = VideoTrack::new(
            "synthetic-screen",
            VideoFrame::solid(self.width, self.height, [24, 24, 32, 255]),
        );
        Ok(MediaStream::video_only(video))
    }
}

/// Per-peer remote stream registry
///
/// One decode handle per remote peer, created when the peer's call stream
/// arrives and dropped when the call or link closes. The compositor reads
/// these by reference every tick; handles are never re-created per render.
#[derive(Debug, Default)]
pub struct TrackRouter {
    streams: RwLock<HashMap<PeerId, MediaStream>>,
}

impl TrackRouter {
    /// Empty router
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the remote stream for a peer
    pub fn attach(&self, peer: PeerId, stream: MediaStream) {
        self.streams.write().insert(peer, stream);
    }

    /// Drop a peer's stream handle
    pub fn detach(&self, peer: &PeerId) {
        self.streams.write().remove(peer);
    }

    /// Clone of the stream handle for one peer
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<MediaStream> {
        self.streams.read().get(peer).cloned()
    }

    /// Peers with a live stream, in stable order
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.streams.read().keys().cloned().collect();
        peers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        peers
    }

    /// Number of registered streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    /// Whether no stream is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Drop every handle
    pub fn clear(&self) {
        self.streams.write().clear();
    }
}
