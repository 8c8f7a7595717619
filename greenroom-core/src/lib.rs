//! Greenroom - live mock-interview rooms with host-side compositing
//!
//! This library implements the real-time core of a browser-hosted interview
//! room: a star-topology peer network between one host and N guests,
//! reliable data-channel state sync, camera and screen-share media calls,
//! renegotiation-free track swapping, and a host-side compositor that mixes
//! every participant (plus a synthetic AI interviewer avatar and floating
//! reactions) into the single frame all guests receive. It features:
//!
//! - **Star topology**: the host owns every link; guests talk to the host only
//! - **Snapshot sync**: late joiners reach parity with one `Sync` message
//! - **Composited broadcast**: guests always see the mixed picture, never raw feeds
//! - **Single-sharer screens**: preempt-before-open keeps at most one share live
//! - **Bounded recovery**: address collisions back off and stop after 3 attempts
//!
//! # Examples
//!
//! ```rust,no_run
//! use greenroom_core::{
//!     HostSession, MemoryRendezvous, RoleResolver, MemorySessionStore,
//!     RoomConfig, ScriptedBrain, SyntheticDevices,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = RoleResolver::new(MemorySessionStore::new());
//! let entry = resolver.resolve(None, "alice@example.com");
//!
//! let rendezvous = Arc::new(MemoryRendezvous::new());
//! let devices = SyntheticDevices::new(1280, 720);
//! let brain = Arc::new(ScriptedBrain::new(vec!["Tell me about yourself.".into()]));
//!
//! let host = HostSession::open(entry, &devices, rendezvous, brain, RoomConfig::default()).await?;
//! host.set_step(greenroom_core::SessionStep::Interview);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core room types and data structures
pub mod types;

/// Host/guest role resolution
pub mod identity;

/// Rendezvous transport and connection lifecycle
pub mod transport;

/// Media primitives: frames, tracks, streams, capture
pub mod media;

/// Data channel protocol
pub mod protocol;

/// Media call management
pub mod call;

/// In-place track rebroadcasting
pub mod broadcast;

/// Host-side canvas compositing
pub mod compositor;

/// Recording capture and export
pub mod recording;

/// Audio level monitoring
pub mod monitor;

/// Room session orchestration
pub mod room;

// Re-export main types at crate root
pub use broadcast::{rebroadcast_video, BroadcastSummary};
pub use call::{ActiveCall, CallConfig, CallError, IncomingCall, OutboundCall};
pub use compositor::{
    Compositor, CompositorConfig, CompositorHandle, LayoutMode, ReactionBuffer, Scene, Tile,
};
pub use identity::{
    personal_room_id, MemorySessionStore, RoleResolver, RoomEntry, SessionStore,
};
pub use media::{
    AudioTrack, CaptureError, MediaDevices, MediaError, MediaStream, SyntheticDevices,
    TrackRouter, VideoFrame, VideoTrack,
};
pub use monitor::{AudioLevelMonitor, MonitorConfig, MonitorEvent, MonitorHandle};
pub use protocol::{ChannelError, DataChannel, DataChannelReceiver, RoomMessage};
pub use recording::{
    export_artifacts, render_transcript, ExportPaths, Recorder, RecorderConfig, RecordingArtifact,
    RecordingError,
};
pub use room::{
    GuestSession, HostSession, InterviewBrain, PeerLink, RoomConfig, RoomError, ScriptedBrain,
};
pub use transport::{
    Endpoint, EndpointEvent, Rendezvous, RendezvousError, TransportConfig, TransportError,
    TransportManager,
};
#[cfg(feature = "memory-transport")]
pub use transport::MemoryRendezvous;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::{MemorySessionStore, RoleResolver, RoomEntry};
    pub use crate::media::{MediaDevices, MediaStream, SyntheticDevices};
    pub use crate::room::{GuestSession, HostSession, InterviewBrain, RoomConfig, ScriptedBrain};
    #[cfg(feature = "memory-transport")]
    pub use crate::transport::MemoryRendezvous;
    pub use crate::transport::{Rendezvous, TransportConfig, TransportManager};
    pub use crate::types::{
        CallKind, ChatEntry, ConnectionState, PeerId, Role, RoomEvent, RoomId, SessionStep,
        SpeakerRole,
    };
}
