//! Data channel protocol
//!
//! One reliable, ordered channel per peer link carrying tagged JSON frames.
//! Delivery order is guaranteed within a link only; there is no cross-link
//! ordering, and none is needed because the host is the single source of
//! truth for conversation and session state.

use crate::types::{ChatEntry, PeerId, SessionStep};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The link is gone; the close handler will prune it
    #[error("data channel closed")]
    Closed,

    /// Message failed to serialize
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Messages exchanged over a peer link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomMessage {
    /// Full-state snapshot, host to guest, sent immediately on link open
    /// and on every session-step transition. Applying it twice is a no-op.
    Sync {
        /// Entire conversation at the moment of send
        conversation: Vec<ChatEntry>,
        /// Current session step
        step: SessionStep,
    },

    /// One conversation entry. Guests send these to the host only; the
    /// host relays each entry to every other guest.
    Chat {
        /// The entry
        entry: ChatEntry,
    },

    /// Short-lived emoji reaction, attributed to the sending link
    Emoji {
        /// The emoji itself
        emoji: String,
    },

    /// Sharer state announcement
    ScreenShareStatus {
        /// Whether the sender is now sharing
        sharing: bool,
    },

    /// Preempt order: stop sharing immediately
    ForceStopScreen,

    /// Graceful departure notice, sent before the link is torn down
    Leave,
}

impl RoomMessage {
    /// Static message name for tracing fields
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::Chat { .. } => "chat",
            Self::Emoji { .. } => "emoji",
            Self::ScreenShareStatus { .. } => "screen_share_status",
            Self::ForceStopScreen => "force_stop_screen",
            Self::Leave => "leave",
        }
    }
}

/// Sending half of a reliable, ordered peer link
///
/// Created in connected pairs; each side sends frames the other side's
/// [`DataChannelReceiver`] yields in send order. Closing either side is
/// observed by both.
#[derive(Debug)]
pub struct DataChannel {
    peer: PeerId,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl DataChannel {
    /// Build the two connected ends of a link between `a` and `b`
    ///
    /// The first element is held at `a` (remote peer `b`), the second at
    /// `b` (remote peer `a`).
    #[must_use]
    pub(crate) fn pair(a: PeerId, b: PeerId) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                peer: b,
                tx: Mutex::new(Some(a_tx)),
                rx: Mutex::new(Some(a_rx)),
            },
            Self {
                peer: a,
                tx: Mutex::new(Some(b_tx)),
                rx: Mutex::new(Some(b_rx)),
            },
        )
    }

    /// The remote peer this channel reaches
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Send one message
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] when either side has closed.
    #[tracing::instrument(skip(self, message), fields(peer = %self.peer, kind = message.kind()))]
    pub fn send(&self, message: &RoomMessage) -> Result<(), ChannelError> {
        let frame = Bytes::from(serde_json::to_vec(message)?);
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(frame).map_err(|_| ChannelError::Closed)?;
        tracing::trace!("message sent");
        Ok(())
    }

    /// Take the receiving half; yields `None` after the first call
    #[must_use]
    pub fn take_receiver(&self) -> Option<DataChannelReceiver> {
        self.rx.lock().take().map(|rx| DataChannelReceiver {
            peer: self.peer.clone(),
            rx,
        })
    }

    /// Close this side of the link
    pub fn close(&self) {
        self.tx.lock().take();
        self.rx.lock().take();
    }

    /// Whether the link can still carry messages
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

/// Receiving half of a peer link
#[derive(Debug)]
pub struct DataChannelReceiver {
    peer: PeerId,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl DataChannelReceiver {
    /// The remote peer this receiver listens to
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Next message in send order; `None` once the remote side is gone
    ///
    /// Undecodable frames are dropped with a warning rather than tearing
    /// the link down.
    pub async fn recv(&mut self) -> Option<RoomMessage> {
        loop {
            let frame = self.rx.recv().await?;
            match serde_json::from_slice::<RoomMessage>(&frame) {
                Ok(message) => {
                    tracing::trace!(peer = %self.peer, kind = message.kind(), "message received");
                    return Some(message);
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "dropping undecodable frame");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SpeakerRole;

    #[test]
    fn test_message_tagging() {
        let msg = RoomMessage::ScreenShareStatus { sharing: true };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"screen_share_status\""));
        assert!(json.contains("\"sharing\":true"));

        let back: RoomMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_sync_round_trip() {
        let msg = RoomMessage::Sync {
            conversation: vec![ChatEntry::interviewer("Welcome.")],
            step: SessionStep::Interview,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RoomMessage = serde_json::from_str(&json).unwrap();

        match back {
            RoomMessage::Sync { conversation, step } => {
                assert_eq!(conversation.len(), 1);
                assert_eq!(conversation[0].speaker, SpeakerRole::Interviewer);
                assert_eq!(step, SessionStep::Interview);
            }
            other => unreachable!("expected sync, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_channel_preserves_send_order() {
        let (host_side, guest_side) = DataChannel::pair(PeerId::new("host"), PeerId::new("g1"));
        let mut rx = guest_side.take_receiver().unwrap();

        for i in 0..5 {
            host_side
                .send(&RoomMessage::Chat {
                    entry: ChatEntry::candidate(format!("m{i}")),
                })
                .unwrap();
        }

        for i in 0..5 {
            match rx.recv().await.unwrap() {
                RoomMessage::Chat { entry } => assert_eq!(entry.text, format!("m{i}")),
                other => unreachable!("unexpected {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn test_close_is_visible_to_both_sides() {
        let (host_side, guest_side) = DataChannel::pair(PeerId::new("host"), PeerId::new("g1"));
        let mut rx = guest_side.take_receiver().unwrap();

        host_side.close();
        assert!(rx.recv().await.is_none());
        assert!(guest_side.send(&RoomMessage::Leave).is_err());
        assert!(guest_side.is_closed());
    }

    #[tokio::test]
    async fn test_undecodable_frames_are_skipped() {
        let (host_side, guest_side) = DataChannel::pair(PeerId::new("host"), PeerId::new("g1"));
        let mut rx = guest_side.take_receiver().unwrap();

        // Push a garbage frame directly, then a valid message behind it.
        host_side
            .tx
            .lock()
            .as_ref()
            .unwrap()
            .send(Bytes::from_static(b"not json"))
            .unwrap();
        host_side.send(&RoomMessage::ForceStopScreen).unwrap();

        assert_eq!(rx.recv().await.unwrap(), RoomMessage::ForceStopScreen);
    }

    #[test]
    fn test_receiver_taken_once() {
        let (host_side, _guest_side) = DataChannel::pair(PeerId::new("host"), PeerId::new("g1"));
        assert!(host_side.take_receiver().is_some());
        assert!(host_side.take_receiver().is_none());
    }
}
