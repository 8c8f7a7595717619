//! Media call management
//!
//! Calls come in two independent categories per peer link, tagged at setup:
//! `camera` (the default) and `screen`. Each established call owns a
//! replaceable outbound stream slot; the remote side reads through the slot,
//! so swapping the video track republishes the picture on a live call with
//! no renegotiation and no disturbance to its audio senders.

use crate::media::{AudioTrack, MediaStream, VideoTrack};
use crate::types::{CallId, CallKind, PeerId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, Instant};

/// Call errors
#[derive(Error, Debug)]
pub enum CallError {
    /// The call has been hung up on either side
    #[error("call closed")]
    Closed,

    /// The callee declined
    #[error("call rejected")]
    Rejected,

    /// This call sends no media, so there is no track to replace
    #[error("call has no outbound media")]
    NoOutboundMedia,

    /// The composite never became available within the answer timeout
    #[error("composite stream unavailable after {0:?}")]
    CompositeUnavailable(Duration),
}

/// Timing knobs for call handling
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Poll interval while waiting for the composite before answering
    pub composite_poll: Duration,
    /// Give-up bound for the composite wait
    pub composite_timeout: Duration,
    /// Guest heartbeat interval for link/call re-establishment
    pub heartbeat: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            composite_poll: Duration::from_millis(250),
            composite_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(2),
        }
    }
}

/// One established end of a media call
///
/// Cloneable handle; all clones observe the same slots and close signal.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    id: CallId,
    peer: PeerId,
    kind: CallKind,
    outbound: Arc<RwLock<Option<MediaStream>>>,
    inbound: Arc<RwLock<Option<MediaStream>>>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl ActiveCall {
    /// Call identifier, shared by both ends
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// The remote peer
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Call category
    #[must_use]
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// The stream the remote side is currently sending, if any
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inbound.read().clone()
    }

    /// The stream this side is currently sending, if any
    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.outbound.read().clone()
    }

    /// Swap the outgoing video track in place
    ///
    /// Audio senders are untouched; the remote side sees the new picture on
    /// its next frame read.
    ///
    /// # Errors
    ///
    /// [`CallError::Closed`] if the call is already down,
    /// [`CallError::NoOutboundMedia`] if this end sends nothing.
    pub fn replace_video(&self, track: VideoTrack) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        let mut outbound = self.outbound.write();
        match outbound.as_mut() {
            Some(stream) => {
                stream.set_video(track);
                Ok(())
            }
            None => Err(CallError::NoOutboundMedia),
        }
    }

    /// Number of audio tracks this end is sending
    #[must_use]
    pub fn audio_sender_count(&self) -> usize {
        self.outbound
            .read()
            .as_ref()
            .map_or(0, |s| s.audio().len())
    }

    /// Hang up; both ends observe the close
    pub fn hang_up(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Whether the call has been hung up
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// A receiver that resolves when the call closes
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

/// Caller's handle on a not-yet-answered call
#[derive(Debug)]
pub struct OutboundCall {
    call: ActiveCall,
    answered_rx: oneshot::Receiver<bool>,
}

impl OutboundCall {
    /// Wait for the callee's decision
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] on decline; [`CallError::Closed`] when the
    /// callee vanished without answering.
    pub async fn answered(self) -> Result<ActiveCall, CallError> {
        match self.answered_rx.await {
            Ok(true) => Ok(self.call),
            Ok(false) => Err(CallError::Rejected),
            Err(_) => Err(CallError::Closed),
        }
    }
}

/// Callee's handle on a ringing call
#[derive(Debug)]
pub struct IncomingCall {
    call: ActiveCall,
    answered_tx: oneshot::Sender<bool>,
}

impl IncomingCall {
    /// Who is calling
    #[must_use]
    pub fn from(&self) -> &PeerId {
        &self.call.peer
    }

    /// Call category from the setup metadata
    #[must_use]
    pub fn kind(&self) -> CallKind {
        self.call.kind
    }

    /// The caller's stream
    #[must_use]
    pub fn caller_stream(&self) -> Option<MediaStream> {
        self.call.remote_stream()
    }

    /// Answer, optionally sending media back
    pub fn answer(self, stream: Option<MediaStream>) -> ActiveCall {
        *self.call.outbound.write() = stream;
        let _ = self.answered_tx.send(true);
        tracing::debug!(peer = %self.call.peer, kind = self.call.kind.as_str(), "call answered");
        self.call
    }

    /// Decline and close
    pub fn reject(self) {
        let _ = self.answered_tx.send(false);
        self.call.hang_up();
        tracing::debug!(peer = %self.call.peer, kind = self.call.kind.as_str(), "call rejected");
    }
}

/// Wire up both ends of a call from `caller` to `callee`
///
/// The outbound handle goes to the caller, the incoming handle to the
/// callee's event stream.
#[must_use]
pub(crate) fn wire(
    caller: PeerId,
    callee: PeerId,
    kind: CallKind,
    caller_stream: MediaStream,
) -> (OutboundCall, IncomingCall) {
    let id = CallId::new();
    let caller_slot = Arc::new(RwLock::new(Some(caller_stream)));
    let callee_slot = Arc::new(RwLock::new(None));
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    let (answered_tx, answered_rx) = oneshot::channel();

    let caller_end = ActiveCall {
        id,
        peer: callee,
        kind,
        outbound: caller_slot.clone(),
        inbound: callee_slot.clone(),
        closed_tx: closed_tx.clone(),
        closed_rx: closed_rx.clone(),
    };
    let callee_end = ActiveCall {
        id,
        peer: caller,
        kind,
        outbound: callee_slot,
        inbound: caller_slot,
        closed_tx,
        closed_rx,
    };

    (
        OutboundCall {
            call: caller_end,
            answered_rx,
        },
        IncomingCall {
            call: callee_end,
            answered_tx,
        },
    )
}

/// Host answer policy for inbound camera calls
///
/// A camera call is always answered with the composite picture merged with
/// the host microphone — never the raw host camera. When the compositor has
/// not produced a track yet (a guest's call can race the host's own setup),
/// poll until one exists or the bound elapses, then reject.
///
/// # Errors
///
/// [`CallError::CompositeUnavailable`] when the timeout elapses first.
#[tracing::instrument(skip_all, fields(peer = %incoming.from()))]
pub async fn answer_camera_with_composite<F>(
    incoming: IncomingCall,
    composite: F,
    mic: AudioTrack,
    config: &CallConfig,
) -> Result<ActiveCall, CallError>
where
    F: Fn() -> Option<VideoTrack>,
{
    let deadline = Instant::now() + config.composite_timeout;
    loop {
        if let Some(track) = composite() {
            let stream = MediaStream::merged(track, vec![mic]);
            return Ok(incoming.answer(Some(stream)));
        }
        if Instant::now() >= deadline {
            tracing::warn!("composite never became available, rejecting camera call");
            incoming.reject();
            return Err(CallError::CompositeUnavailable(config.composite_timeout));
        }
        tracing::debug!("composite not live yet, retrying answer shortly");
        sleep(config.composite_poll).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::VideoFrame;

    fn camera_stream(label: &str) -> MediaStream {
        MediaStream::camera(
            VideoTrack::new(label, VideoFrame::black(4, 4)),
            AudioTrack::new(format!("{label}-mic")),
        )
    }

    #[tokio::test]
    async fn test_call_answer_flow() {
        let (outbound, incoming) = wire(
            PeerId::new("guest-1"),
            PeerId::new("host"),
            CallKind::Camera,
            camera_stream("guest-cam"),
        );

        assert_eq!(incoming.kind(), CallKind::Camera);
        assert_eq!(incoming.from(), &PeerId::new("guest-1"));
        assert!(incoming.caller_stream().is_some());

        let host_end = incoming.answer(Some(camera_stream("composite")));
        let guest_end = outbound.answered().await.unwrap();

        assert_eq!(guest_end.id(), host_end.id());
        assert!(guest_end.remote_stream().is_some());
        assert_eq!(host_end.audio_sender_count(), 1);
    }

    #[tokio::test]
    async fn test_call_reject_flow() {
        let (outbound, incoming) = wire(
            PeerId::new("guest-1"),
            PeerId::new("host"),
            CallKind::Screen,
            camera_stream("guest-screen"),
        );

        incoming.reject();
        assert!(matches!(
            outbound.answered().await,
            Err(CallError::Rejected)
        ));
    }

    #[tokio::test]
    async fn test_replace_video_reaches_remote_and_keeps_audio() {
        let (outbound, incoming) = wire(
            PeerId::new("guest-1"),
            PeerId::new("host"),
            CallKind::Camera,
            camera_stream("guest-cam"),
        );
        let host_end = incoming.answer(Some(camera_stream("composite")));
        let guest_end = outbound.answered().await.unwrap();

        let audio_before = host_end.audio_sender_count();
        let replacement = VideoTrack::new("composite-v2", VideoFrame::solid(4, 4, [9, 9, 9, 255]));
        host_end.replace_video(replacement.clone()).unwrap();

        let seen = guest_end.remote_stream().unwrap();
        assert_eq!(seen.video().unwrap().id(), replacement.id());
        assert_eq!(host_end.audio_sender_count(), audio_before);
    }

    #[tokio::test]
    async fn test_replace_video_after_hang_up_fails() {
        let (outbound, incoming) = wire(
            PeerId::new("guest-1"),
            PeerId::new("host"),
            CallKind::Camera,
            camera_stream("guest-cam"),
        );
        let host_end = incoming.answer(Some(camera_stream("composite")));
        let _guest_end = outbound.answered().await.unwrap();

        host_end.hang_up();
        let track = VideoTrack::new("late", VideoFrame::black(4, 4));
        assert!(matches!(
            host_end.replace_video(track),
            Err(CallError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_answer_with_composite_waits_for_track() {
        let (outbound, incoming) = wire(
            PeerId::new("guest-1"),
            PeerId::new("host"),
            CallKind::Camera,
            camera_stream("guest-cam"),
        );

        let slot: Arc<RwLock<Option<VideoTrack>>> = Arc::new(RwLock::new(None));
        let writer = slot.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            *writer.write() = Some(VideoTrack::new("composite", VideoFrame::black(4, 4)));
        });

        let config = CallConfig {
            composite_poll: Duration::from_millis(5),
            composite_timeout: Duration::from_millis(500),
            ..CallConfig::default()
        };
        let mic = AudioTrack::new("host-mic");
        let reader = slot.clone();
        let host_end =
            answer_camera_with_composite(incoming, move || reader.read().clone(), mic, &config)
                .await
                .unwrap();

        assert_eq!(host_end.audio_sender_count(), 1);
        let guest_end = outbound.answered().await.unwrap();
        assert_eq!(
            guest_end.remote_stream().unwrap().video().unwrap().label(),
            "composite"
        );
    }

    #[tokio::test]
    async fn test_answer_with_composite_times_out() {
        let (outbound, incoming) = wire(
            PeerId::new("guest-1"),
            PeerId::new("host"),
            CallKind::Camera,
            camera_stream("guest-cam"),
        );

        let config = CallConfig {
            composite_poll: Duration::from_millis(5),
            composite_timeout: Duration::from_millis(25),
            ..CallConfig::default()
        };
        let mic = AudioTrack::new("host-mic");
        let result =
            answer_camera_with_composite(incoming, || None, mic, &config).await;

        assert!(matches!(result, Err(CallError::CompositeUnavailable(_))));
        assert!(matches!(
            outbound.answered().await,
            Err(CallError::Rejected)
        ));
    }
}
