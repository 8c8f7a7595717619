//! Track broadcasting
//!
//! When the host's outgoing picture changes source (a share starting or
//! stopping, the grid re-partitioning after a join or leave), the video
//! track already flowing on every live camera call is replaced in place.
//! A full renegotiation would freeze every guest's view for a moment;
//! swapping the track does not, and leaves audio senders untouched.

use crate::call::ActiveCall;
use crate::media::VideoTrack;
use crate::types::CallKind;

/// Outcome of one rebroadcast pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastSummary {
    /// Calls whose video track was swapped
    pub replaced: usize,
    /// Calls skipped: already closed, not a camera call, or sending nothing
    pub skipped: usize,
}

/// Replace the outgoing video track on every live camera call
///
/// A replace refused by an already-closed call is logged and skipped; that
/// call's own close handler prunes it separately.
#[tracing::instrument(skip_all, fields(track = %track.label()))]
pub fn rebroadcast_video<'a, I>(calls: I, track: &VideoTrack) -> BroadcastSummary
where
    I: IntoIterator<Item = &'a ActiveCall>,
{
    let mut summary = BroadcastSummary::default();
    for call in calls {
        if call.kind() != CallKind::Camera {
            summary.skipped += 1;
            continue;
        }
        match call.replace_video(track.clone()) {
            Ok(()) => summary.replaced += 1,
            Err(e) => {
                tracing::warn!(peer = %call.peer(), error = %e, "track replace skipped");
                summary.skipped += 1;
            }
        }
    }
    tracing::debug!(replaced = summary.replaced, skipped = summary.skipped, "rebroadcast done");
    summary
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::call::wire;
    use crate::media::{AudioTrack, MediaStream, VideoFrame};
    use crate::types::PeerId;

    async fn answered_camera_call(n: u32) -> (ActiveCall, ActiveCall) {
        let (outbound, incoming) = wire(
            PeerId::new(format!("guest-{n}")),
            PeerId::new("host"),
            CallKind::Camera,
            MediaStream::camera(
                VideoTrack::new("guest-cam", VideoFrame::black(4, 4)),
                AudioTrack::new("guest-mic"),
            ),
        );
        let host_end = incoming.answer(Some(MediaStream::camera(
            VideoTrack::new("composite", VideoFrame::black(4, 4)),
            AudioTrack::new("host-mic"),
        )));
        let guest_end = outbound.answered().await.unwrap();
        (host_end, guest_end)
    }

    #[tokio::test]
    async fn test_rebroadcast_replaces_every_live_call() {
        let (h1, g1) = answered_camera_call(1).await;
        let (h2, g2) = answered_camera_call(2).await;

        let fresh = VideoTrack::new("composite-next", VideoFrame::solid(4, 4, [1, 2, 3, 255]));
        let summary = rebroadcast_video([&h1, &h2], &fresh);

        assert_eq!(summary, BroadcastSummary { replaced: 2, skipped: 0 });
        for guest_end in [&g1, &g2] {
            let seen = guest_end.remote_stream().unwrap();
            assert_eq!(seen.video().unwrap().label(), "composite-next");
            assert_eq!(seen.audio().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_rebroadcast_skips_closed_call_without_failing() {
        let (h1, _g1) = answered_camera_call(1).await;
        let (h2, _g2) = answered_camera_call(2).await;
        h1.hang_up();

        let fresh = VideoTrack::new("composite-next", VideoFrame::black(4, 4));
        let summary = rebroadcast_video([&h1, &h2], &fresh);

        assert_eq!(summary, BroadcastSummary { replaced: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn test_rebroadcast_ignores_screen_calls() {
        let (outbound, incoming) = wire(
            PeerId::new("guest-1"),
            PeerId::new("host"),
            CallKind::Screen,
            MediaStream::video_only(VideoTrack::new("screen", VideoFrame::black(4, 4))),
        );
        let host_end = incoming.answer(None);
        let _guest_end = outbound.answered().await.unwrap();

        let fresh = VideoTrack::new("composite-next", VideoFrame::black(4, 4));
        let summary = rebroadcast_video([&host_end], &fresh);
        assert_eq!(summary, BroadcastSummary { replaced: 0, skipped: 1 });
    }
}
