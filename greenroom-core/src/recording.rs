//! Recording and export
//!
//! Captures the composite stream plus the host microphone into a chunked
//! container held in memory, then flushes to two local files on stop: the
//! media container and a plain-text transcript rendered from the
//! conversation. Nothing is ever uploaded. A one-shot guard makes a second
//! stop yield nothing, so double-firing stop cannot double-export.

use crate::media::{AudioTrack, VideoTrack};
use crate::types::{ChatEntry, SpeakerRole};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Container magic
const CONTAINER_MAGIC: &[u8; 4] = b"GRMV";
/// Container format version
const CONTAINER_VERSION: u16 = 1;

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    /// Start requires both the composite stream and a microphone track
    #[error("recording requires a composite track and a microphone track")]
    MissingInputs,

    /// A capture is already running
    #[error("already recording")]
    AlreadyRecording,

    /// Export failed
    #[error("export error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Capture cadence
    pub sample_interval: Duration,
    /// Mime type stamped on the artifact
    pub mime_type: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            mime_type: "video/x-greenroom".to_string(),
        }
    }
}

/// The captured media, alive only between stop and export
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    chunks: Vec<Bytes>,
    mime_type: String,
}

impl RecordingArtifact {
    /// Number of captured chunks
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Mime type of the container
    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Assemble the container file image
    #[must_use]
    pub fn container_bytes(&self) -> Bytes {
        let body_len: usize = self.chunks.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(10 + body_len);
        buf.put_slice(CONTAINER_MAGIC);
        buf.put_u16(CONTAINER_VERSION);
        buf.put_u32(self.chunks.len() as u32);
        for chunk in &self.chunks {
            buf.put_slice(chunk);
        }
        buf.freeze()
    }
}

/// Paths of the two exported files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    /// The media container
    pub media: PathBuf,
    /// The plain-text transcript
    pub transcript: PathBuf,
}

enum RecorderState {
    Idle,
    Recording {
        shutdown: watch::Sender<bool>,
        chunks: Arc<Mutex<Vec<Bytes>>>,
    },
    Stopped,
}

/// Captures the composite stream into a [`RecordingArtifact`]
pub struct Recorder {
    config: RecorderConfig,
    state: Mutex<RecorderState>,
}

impl Recorder {
    /// Create an idle recorder
    #[must_use]
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RecorderState::Idle),
        }
    }

    /// Whether a capture is currently running
    #[must_use]
    pub fn is_recording(&self) -> bool {
        matches!(&*self.state.lock(), RecorderState::Recording { .. })
    }

    /// Begin capturing
    ///
    /// Only starts once both the composite track and a microphone track
    /// exist; callers pass whatever they have and get refused otherwise.
    ///
    /// # Errors
    ///
    /// [`RecordingError::MissingInputs`] when either input is absent,
    /// [`RecordingError::AlreadyRecording`] when a capture is running.
    #[tracing::instrument(skip_all)]
    pub fn start(
        &self,
        composite: Option<VideoTrack>,
        mic: Option<AudioTrack>,
    ) -> Result<(), RecordingError> {
        let (Some(composite), Some(mic)) = (composite, mic) else {
            return Err(RecordingError::MissingInputs);
        };

        let mut state = self.state.lock();
        if matches!(&*state, RecorderState::Recording { .. }) {
            return Err(RecordingError::AlreadyRecording);
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let chunks: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let interval = self.config.sample_interval;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let offset = started.elapsed();
                        let frame = composite.current_frame();
                        let window = mic.latest_window();
                        let mut chunk = BytesMut::new();
                        chunk.put_u64(offset.as_millis() as u64);
                        chunk.put_u32(frame.width());
                        chunk.put_u32(frame.height());
                        chunk.put_u32(frame.data().len() as u32);
                        chunk.put_slice(frame.data());
                        chunk.put_u32(window.len() as u32);
                        for sample in &window {
                            chunk.put_f32(*sample);
                        }
                        sink.lock().push(chunk.freeze());
                    }
                }
            }
        });

        *state = RecorderState::Recording {
            shutdown: shutdown_tx,
            chunks,
        };
        tracing::info!("recording started");
        Ok(())
    }

    /// Stop capturing and take the artifact
    ///
    /// One-shot: the first call yields the artifact, every later call
    /// yields `None`, even if stop fires twice in quick succession.
    #[tracing::instrument(skip(self))]
    pub fn stop(&self) -> Option<RecordingArtifact> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, RecorderState::Stopped) {
            RecorderState::Recording { shutdown, chunks } => {
                let _ = shutdown.send(true);
                let chunks = std::mem::take(&mut *chunks.lock());
                tracing::info!(chunks = chunks.len(), "recording stopped");
                Some(RecordingArtifact {
                    chunks,
                    mime_type: self.config.mime_type.clone(),
                })
            }
            RecorderState::Idle => {
                *state = RecorderState::Idle;
                None
            }
            RecorderState::Stopped => None,
        }
    }
}

/// Render the conversation as a plain-text transcript
#[must_use]
pub fn render_transcript(conversation: &[ChatEntry]) -> String {
    let mut out = String::new();
    for entry in conversation {
        let who = match entry.speaker {
            SpeakerRole::Interviewer => "Interviewer",
            SpeakerRole::Candidate => "Candidate",
        };
        out.push_str(&format!(
            "[{}] {}: {}\n",
            entry.timestamp.format("%H:%M:%S"),
            who,
            entry.text
        ));
    }
    out
}

/// Write the media container and transcript into `dir`
///
/// Both artifacts are local downloads; nothing leaves the machine.
///
/// # Errors
///
/// Any filesystem failure.
#[tracing::instrument(skip(artifact, conversation), fields(dir = %dir.display()))]
pub async fn export_artifacts(
    artifact: &RecordingArtifact,
    conversation: &[ChatEntry],
    dir: &Path,
) -> Result<ExportPaths, RecordingError> {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let media = dir.join(format!("interview-recording-{stamp}.grv"));
    let transcript = dir.join(format!("interview-feedback-{stamp}.txt"));

    tokio::fs::write(&media, artifact.container_bytes()).await?;
    tokio::fs::write(&transcript, render_transcript(conversation)).await?;

    tracing::info!(media = %media.display(), transcript = %transcript.display(), "artifacts exported");
    Ok(ExportPaths { media, transcript })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::VideoFrame;

    fn inputs() -> (VideoTrack, AudioTrack) {
        let composite = VideoTrack::new("composite", VideoFrame::black(8, 8));
        let mic = AudioTrack::new("mic");
        mic.push_samples(&[0.25, -0.25, 0.5]);
        (composite, mic)
    }

    fn fast_config() -> RecorderConfig {
        RecorderConfig {
            sample_interval: Duration::from_millis(5),
            ..RecorderConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_requires_both_inputs() {
        let recorder = Recorder::new(fast_config());
        let (composite, mic) = inputs();

        let err = recorder.start(None, Some(mic.clone()));
        assert!(matches!(err, Err(RecordingError::MissingInputs)));
        let err = recorder.start(Some(composite), None);
        assert!(matches!(err, Err(RecordingError::MissingInputs)));
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_capture_produces_chunks() {
        let recorder = Recorder::new(fast_config());
        let (composite, mic) = inputs();
        recorder.start(Some(composite), Some(mic)).unwrap();
        assert!(recorder.is_recording());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let artifact = recorder.stop().unwrap();

        assert!(artifact.chunk_count() > 0);
        assert_eq!(artifact.mime_type(), "video/x-greenroom");
        let container = artifact.container_bytes();
        assert_eq!(&container[..4], CONTAINER_MAGIC);
    }

    #[tokio::test]
    async fn test_stop_is_one_shot() {
        let recorder = Recorder::new(fast_config());
        let (composite, mic) = inputs();
        recorder.start(Some(composite), Some(mic)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(recorder.stop().is_some());
        assert!(recorder.stop().is_none());
        assert!(recorder.stop().is_none());
    }

    #[tokio::test]
    async fn test_stop_without_start_yields_nothing() {
        let recorder = Recorder::new(fast_config());
        assert!(recorder.stop().is_none());
    }

    #[tokio::test]
    async fn test_double_start_is_refused() {
        let recorder = Recorder::new(fast_config());
        let (composite, mic) = inputs();
        recorder
            .start(Some(composite.clone()), Some(mic.clone()))
            .unwrap();
        let second = recorder.start(Some(composite), Some(mic));
        assert!(matches!(second, Err(RecordingError::AlreadyRecording)));
        recorder.stop();
    }

    #[test]
    fn test_transcript_rendering() {
        let conversation = vec![
            ChatEntry::interviewer("Walk me through your last project."),
            ChatEntry::candidate("It was a streaming pipeline."),
        ];
        let text = render_transcript(&conversation);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Interviewer: Walk me through your last project."));
        assert!(lines[1].contains("Candidate: It was a streaming pipeline."));
    }

    #[tokio::test]
    async fn test_export_writes_both_artifacts() {
        let recorder = Recorder::new(fast_config());
        let (composite, mic) = inputs();
        recorder.start(Some(composite), Some(mic)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let artifact = recorder.stop().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let conversation = vec![ChatEntry::interviewer("Hello.")];
        let paths = export_artifacts(&artifact, &conversation, dir.path())
            .await
            .unwrap();

        let media_name = paths.media.file_name().unwrap().to_string_lossy();
        let transcript_name = paths.transcript.file_name().unwrap().to_string_lossy();
        assert!(media_name.starts_with("interview-recording-"));
        assert!(transcript_name.starts_with("interview-feedback-"));

        let media = tokio::fs::read(&paths.media).await.unwrap();
        assert_eq!(&media[..4], CONTAINER_MAGIC);
        let transcript = tokio::fs::read_to_string(&paths.transcript).await.unwrap();
        assert!(transcript.contains("Interviewer: Hello."));
    }
}
