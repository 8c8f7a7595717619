//! Room session orchestration
//!
//! Ties the role resolver, transport, protocol, calls, and compositor into
//! the star topology the room runs on: the host owns every guest link, the
//! conversation, the session step, and the composite render; a guest owns
//! exactly one link to the host and consumes the composite passively.
//!
//! All cross-callback state lives in one shared container per session
//! ([`HostShared`] / guest equivalent) so handlers registered at link setup
//! read current state, never values captured at registration time. Every
//! map keyed by a peer id is pruned by the closing callback that owns it.

use crate::broadcast::rebroadcast_video;
use crate::call::{answer_camera_with_composite, ActiveCall, CallConfig, CallError};
use crate::compositor::{
    avatar_frame, Compositor, CompositorConfig, CompositorHandle, ReactionBuffer, Scene,
    SceneReaction, Tile,
};
use crate::identity::RoomEntry;
use crate::media::{
    CaptureError, MediaDevices, MediaStream, TrackRouter, VideoFrame, VideoTrack,
};
use crate::monitor::{AudioLevelMonitor, MonitorConfig, MonitorEvent, MonitorHandle};
use crate::protocol::{ChannelError, DataChannel, DataChannelReceiver, RoomMessage};
use crate::recording::{
    export_artifacts, ExportPaths, Recorder, RecorderConfig, RecordingError,
};
use crate::transport::{
    Endpoint, EndpointEvent, Rendezvous, RendezvousError, TransportConfig, TransportError,
    TransportManager,
};
use crate::types::{
    AiTurn, ChatEntry, ConnectionState, InterviewProfile, PeerId, Role, RoomEvent, RoomIdentity,
    SessionStep,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Room errors
#[derive(Error, Debug)]
pub enum RoomError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Rendezvous failure
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    /// Local capture failure; fatal to session start
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Call failure
    #[error(transparent)]
    Call(#[from] CallError),

    /// Channel failure
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Recording failure
    #[error(transparent)]
    Recording(#[from] RecordingError),

    /// The operation requires the other role
    #[error("operation requires the {0:?} role")]
    WrongRole(Role),

    /// AI collaborator failure
    #[error("interview brain error: {0}")]
    Brain(String),
}

/// Room session configuration
#[derive(Debug, Clone, Default)]
pub struct RoomConfig {
    /// Transport manager knobs
    pub transport: TransportConfig,
    /// Call handling knobs
    pub call: CallConfig,
    /// Compositor knobs (host only)
    pub compositor: CompositorConfig,
    /// Recorder knobs (host only)
    pub recorder: RecorderConfig,
    /// Audio monitor knobs
    pub monitor: MonitorConfig,
    /// Interview profile fed to the AI collaborator
    pub profile: InterviewProfile,
    /// Local display name
    pub display_name: String,
}

/// AI turn collaborator seam
///
/// The core only consumes the returned utterance and optional audio URL;
/// transport to the actual endpoint is the implementer's business.
#[async_trait]
pub trait InterviewBrain: Send + Sync + 'static {
    /// Produce the interviewer's next turn
    async fn next_turn(
        &self,
        history: &[ChatEntry],
        utterance: &str,
        profile: &InterviewProfile,
        frame: Option<VideoFrame>,
    ) -> anyhow::Result<AiTurn>;
}

/// Canned-response brain for tests and the demo
pub struct ScriptedBrain {
    lines: Vec<String>,
    cursor: AtomicUsize,
}

impl ScriptedBrain {
    /// Cycle through `lines` forever
    #[must_use]
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl InterviewBrain for ScriptedBrain {
    async fn next_turn(
        &self,
        _history: &[ChatEntry],
        _utterance: &str,
        _profile: &InterviewProfile,
        _frame: Option<VideoFrame>,
    ) -> anyhow::Result<AiTurn> {
        if self.lines.is_empty() {
            anyhow::bail!("script exhausted");
        }
        let i = self.cursor.fetch_add(1, Ordering::SeqCst) % self.lines.len();
        Ok(AiTurn {
            response: self.lines[i].clone(),
            audio_url: None,
        })
    }
}

/// Host-side bundle for one remote participant
///
/// Owned exclusively by the host; mutated only from the callbacks that
/// deliver its channel and calls, destroyed on leave or link loss.
pub struct PeerLink {
    /// The remote peer address
    pub peer_id: PeerId,
    /// Data channel, once the link has arrived
    pub channel: Option<Arc<DataChannel>>,
    /// Display name shown on the participant tile
    pub display_name: String,
    /// Whether this peer announced an active screen share
    pub is_screen_sharing: bool,
    /// The answered camera call, if any
    pub camera_call: Option<ActiveCall>,
    /// The answered screen call, if any
    pub screen_call: Option<ActiveCall>,
}

impl PeerLink {
    fn new(peer_id: PeerId) -> Self {
        let display_name = short_name(&peer_id);
        Self {
            peer_id,
            channel: None,
            display_name,
            is_screen_sharing: false,
            camera_call: None,
            screen_call: None,
        }
    }
}

fn short_name(peer: &PeerId) -> String {
    let s = peer.as_str();
    if s.len() > 12 {
        s[..12].to_string()
    } else {
        s.to_string()
    }
}

struct ScreenSource {
    peer: PeerId,
    stream: MediaStream,
}

/// The host's cross-callback state container
struct HostShared {
    identity: RoomIdentity,
    host_name: String,
    camera: MediaStream,
    conversation: RwLock<Vec<ChatEntry>>,
    step: RwLock<SessionStep>,
    links: RwLock<HashMap<PeerId, PeerLink>>,
    router: TrackRouter,
    screen: RwLock<Option<ScreenSource>>,
    fullscreen: AtomicBool,
    reactions: Arc<ReactionBuffer>,
    composite_slot: Arc<RwLock<Option<VideoTrack>>>,
    events: broadcast::Sender<RoomEvent>,
    call_config: CallConfig,
}

impl HostShared {
    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn sync_message(&self) -> RoomMessage {
        RoomMessage::Sync {
            conversation: self.conversation.read().clone(),
            step: *self.step.read(),
        }
    }

    /// Send to every linked guest, except `skip`
    fn fanout(&self, message: &RoomMessage, skip: Option<&PeerId>) {
        let links = self.links.read();
        for link in links.values() {
            if Some(&link.peer_id) == skip {
                continue;
            }
            if let Some(channel) = &link.channel {
                if let Err(e) = channel.send(message) {
                    tracing::debug!(peer = %link.peer_id, error = %e, "fanout skipped dead link");
                }
            }
        }
    }

    fn append_and_fanout(&self, entry: ChatEntry, skip: Option<&PeerId>) {
        self.conversation.write().push(entry.clone());
        self.fanout(&RoomMessage::Chat { entry: entry.clone() }, skip);
        self.emit(RoomEvent::ChatAppended { entry });
    }

    fn camera_calls(&self) -> Vec<ActiveCall> {
        self.links
            .read()
            .values()
            .filter_map(|l| l.camera_call.clone())
            .collect()
    }

    /// Republish the composite on every live camera call
    fn rebroadcast_composite(&self) {
        if let Some(track) = self.composite_slot.read().clone() {
            let calls = self.camera_calls();
            rebroadcast_video(calls.iter(), &track);
        }
    }

    /// Remove every trace of a peer; the owning close callback calls this
    fn prune_link(&self, peer: &PeerId) {
        let removed = self.links.write().remove(peer);
        if let Some(link) = removed {
            if let Some(channel) = &link.channel {
                channel.close();
            }
            if let Some(call) = &link.camera_call {
                call.hang_up();
            }
            if let Some(call) = &link.screen_call {
                call.hang_up();
            }
            self.router.detach(peer);
            let mut screen = self.screen.write();
            if screen.as_ref().is_some_and(|s| &s.peer == peer) {
                *screen = None;
                drop(screen);
                self.emit(RoomEvent::ScreenShareStopped { peer: peer.clone() });
            }
            self.emit(RoomEvent::LinkClosed { peer: peer.clone() });
            self.rebroadcast_composite();
            tracing::info!(%peer, "peer pruned");
        }
    }

    fn local_share_active(&self) -> bool {
        self.screen
            .read()
            .as_ref()
            .is_some_and(|s| s.peer == self.identity.local_peer)
    }

    /// Stop the host's own share; used for local stops and preempts alike
    fn stop_local_share(&self) {
        let mut screen = self.screen.write();
        if screen
            .as_ref()
            .is_some_and(|s| s.peer == self.identity.local_peer)
        {
            *screen = None;
            drop(screen);
            self.fanout(&RoomMessage::ScreenShareStatus { sharing: false }, None);
            self.emit(RoomEvent::ScreenShareStopped {
                peer: self.identity.local_peer.clone(),
            });
            self.rebroadcast_composite();
        }
    }

    /// Rebuild the render input from current state; called every tick
    fn build_scene(&self, tick: u64, config: &CompositorConfig) -> Scene {
        let screen_frame = self
            .screen
            .read()
            .as_ref()
            .and_then(|s| s.stream.video().map(VideoTrack::current_frame));
        let mirror_host = screen_frame.is_some();

        let mut tiles = Vec::new();
        let mut order: Vec<String> = Vec::new();
        tiles.push(Tile {
            name: "AI".to_string(),
            frame: avatar_frame(config.width / 4, config.height / 4, tick),
            mirror: false,
        });
        order.push("ai".to_string());

        let host_frame = self
            .camera
            .video()
            .map_or_else(|| VideoFrame::black(2, 2), VideoTrack::current_frame);
        tiles.push(Tile {
            name: self.host_name.clone(),
            frame: host_frame,
            mirror: mirror_host,
        });
        order.push("host".to_string());

        let links = self.links.read();
        for peer in self.router.peers() {
            if let Some(stream) = self.router.get(&peer) {
                if let Some(video) = stream.video() {
                    let name = links
                        .get(&peer)
                        .map_or_else(|| short_name(&peer), |l| l.display_name.clone());
                    tiles.push(Tile {
                        name,
                        frame: video.current_frame(),
                        mirror: false,
                    });
                    order.push(peer.as_str().to_string());
                }
            }
        }
        drop(links);

        let reactions = self
            .reactions
            .live()
            .into_iter()
            .map(|(r, progress)| SceneReaction {
                tile: order.iter().position(|o| *o == r.sender).unwrap_or(1),
                emoji: r.emoji,
                progress,
            })
            .collect();

        Scene {
            tiles,
            screen: screen_frame,
            fullscreen: self.fullscreen.load(Ordering::SeqCst),
            reactions,
        }
    }
}

/// The host side of a room
///
/// Opens the room address, accepts guest links and calls, renders the
/// composite, and owns conversation and session step.
pub struct HostSession<R: Rendezvous> {
    shared: Arc<HostShared>,
    transport: Arc<TransportManager<R>>,
    endpoint: Arc<RwLock<Arc<dyn Endpoint>>>,
    compositor: Compositor,
    compositor_handle: CompositorHandle,
    recorder: Recorder,
    monitor_handle: MonitorHandle,
    brain: Arc<dyn InterviewBrain>,
    profile: InterviewProfile,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<R: Rendezvous> HostSession<R> {
    /// Open a room as host
    ///
    /// Role resolution must already have produced a host [`RoomEntry`];
    /// capture runs before the transport opens so a capture denial never
    /// leaves a half-claimed address behind.
    ///
    /// # Errors
    ///
    /// [`RoomError::WrongRole`] for a guest entry, [`RoomError::Capture`]
    /// on denial, transport errors per [`TransportManager::open_as_host`].
    pub async fn open(
        entry: RoomEntry,
        devices: &dyn MediaDevices,
        rendezvous: Arc<R>,
        brain: Arc<dyn InterviewBrain>,
        config: RoomConfig,
    ) -> Result<Self, RoomError> {
        if entry.role != Role::Host {
            return Err(RoomError::WrongRole(Role::Host));
        }

        let camera = devices.open_camera().await?;

        let transport = Arc::new(TransportManager::new(rendezvous, config.transport.clone()));
        let endpoint = transport.open_as_host(&entry.room_id).await?;
        let endpoint: Arc<dyn Endpoint> = Arc::from(endpoint);
        let identity = RoomIdentity {
            room_id: entry.room_id,
            local_peer: endpoint.id().clone(),
            role: Role::Host,
        };

        let compositor = Compositor::new(config.compositor.clone());
        let (events, _) = broadcast::channel(256);
        let host_name = if config.display_name.is_empty() {
            "HOST".to_string()
        } else {
            config.display_name.clone()
        };

        let shared = Arc::new(HostShared {
            identity,
            host_name,
            camera: camera.clone(),
            conversation: RwLock::new(Vec::new()),
            step: RwLock::new(SessionStep::default()),
            links: RwLock::new(HashMap::new()),
            router: TrackRouter::new(),
            screen: RwLock::new(None),
            fullscreen: AtomicBool::new(false),
            reactions: compositor.reactions(),
            composite_slot: Arc::new(RwLock::new(None)),
            events,
            call_config: config.call.clone(),
        });

        // Start rendering, then publish the composite for call answering.
        let scene_shared = shared.clone();
        let scene_config = config.compositor.clone();
        let compositor_handle =
            compositor.start(move |tick| scene_shared.build_scene(tick, &scene_config));
        *shared.composite_slot.write() = Some(compositor.output_track());

        let monitor = AudioLevelMonitor::new(config.monitor.clone());
        let mic = camera
            .first_audio()
            .cloned()
            .ok_or_else(|| CaptureError::NoDevice("microphone".to_string()))?;
        let (monitor_handle, monitor_events) = monitor.start(mic);

        let session = Self {
            shared: shared.clone(),
            transport: transport.clone(),
            endpoint: Arc::new(RwLock::new(endpoint.clone())),
            compositor,
            compositor_handle,
            recorder: Recorder::new(config.recorder),
            monitor_handle,
            brain,
            profile: config.profile,
            tasks: parking_lot::Mutex::new(Vec::new()),
        };

        session.spawn_monitor_forwarder(monitor_events);
        session.spawn_event_loop(endpoint);
        Ok(session)
    }

    fn spawn_monitor_forwarder(
        &self,
        mut monitor_events: tokio::sync::mpsc::UnboundedReceiver<MonitorEvent>,
    ) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            while let Some(MonitorEvent::TalkingWhileMuted { level }) = monitor_events.recv().await
            {
                shared.emit(RoomEvent::TalkingWhileMuted { level });
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_event_loop(&self, endpoint: Arc<dyn Endpoint>) {
        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let endpoint_slot = self.endpoint.clone();
        let Some(mut events) = endpoint.take_events() else {
            tracing::warn!("endpoint events already taken");
            return;
        };

        let handle = tokio::spawn(async move {
            loop {
                let Some(event) = events.recv().await else {
                    break;
                };
                match event {
                    EndpointEvent::Link(channel) => {
                        Self::handle_link(&shared, channel);
                    }
                    EndpointEvent::Call(incoming) => {
                        Self::handle_call(&shared, incoming);
                    }
                    EndpointEvent::Disconnected => {
                        transport.note_disconnected();
                        shared.emit(RoomEvent::ConnectionChanged {
                            state: ConnectionState::Disconnected,
                        });
                        let address = Some(shared.identity.room_id.host_address());
                        match transport.reconnect(address).await {
                            Ok(fresh) => {
                                let fresh: Arc<dyn Endpoint> = Arc::from(fresh);
                                let Some(next) = fresh.take_events() else { break };
                                *endpoint_slot.write() = fresh;
                                events = next;
                                shared.emit(RoomEvent::ConnectionChanged {
                                    state: ConnectionState::Open,
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "host reconnect failed");
                                shared.emit(RoomEvent::ConnectionChanged {
                                    state: transport.state(),
                                });
                                break;
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// A guest opened its data link: sync immediately, then start relaying
    fn handle_link(shared: &Arc<HostShared>, channel: DataChannel) {
        let peer = channel.peer().clone();
        let receiver = channel.take_receiver();
        let channel = Arc::new(channel);

        // SYNC first, so a mid-session joiner reaches parity without
        // replaying history message by message.
        if let Err(e) = channel.send(&shared.sync_message()) {
            tracing::warn!(%peer, error = %e, "sync send failed, dropping link");
            return;
        }

        {
            let mut links = shared.links.write();
            let link = links
                .entry(peer.clone())
                .or_insert_with(|| PeerLink::new(peer.clone()));
            link.channel = Some(channel);
        }
        shared.emit(RoomEvent::LinkOpened { peer: peer.clone() });

        if let Some(receiver) = receiver {
            let shared = shared.clone();
            tokio::spawn(async move {
                Self::link_recv_loop(shared, receiver).await;
            });
        }
    }

    async fn link_recv_loop(shared: Arc<HostShared>, mut receiver: DataChannelReceiver) {
        let peer = receiver.peer().clone();
        loop {
            let Some(message) = receiver.recv().await else {
                // Abrupt link loss: cleanup is identical to a Leave.
                shared.prune_link(&peer);
                break;
            };
            match message {
                RoomMessage::Chat { entry } => {
                    // Star relay: everyone except the sender gets the entry.
                    shared.append_and_fanout(entry, Some(&peer));
                }
                RoomMessage::Emoji { emoji } => {
                    shared.reactions.push(peer.as_str(), emoji.clone());
                    shared.emit(RoomEvent::Reaction {
                        sender: peer.as_str().to_string(),
                        emoji,
                    });
                }
                RoomMessage::ScreenShareStatus { sharing } => {
                    {
                        let mut links = shared.links.write();
                        if let Some(link) = links.get_mut(&peer) {
                            link.is_screen_sharing = sharing;
                        }
                    }
                    if !sharing {
                        let mut screen = shared.screen.write();
                        if screen.as_ref().is_some_and(|s| s.peer == peer) {
                            *screen = None;
                            drop(screen);
                            shared.emit(RoomEvent::ScreenShareStopped { peer: peer.clone() });
                            shared.rebroadcast_composite();
                        }
                    }
                }
                RoomMessage::ForceStopScreen => {
                    if shared.local_share_active() {
                        tracing::info!(%peer, "share preempted by remote participant");
                        shared.stop_local_share();
                    }
                }
                RoomMessage::Leave => {
                    shared.prune_link(&peer);
                    break;
                }
                RoomMessage::Sync { .. } => {
                    // Guests have no authority over room state.
                    tracing::warn!(%peer, "ignoring sync from a guest");
                }
            }
        }
    }

    /// A guest is calling: camera gets the composite, screen gets attached
    fn handle_call(shared: &Arc<HostShared>, incoming: crate::call::IncomingCall) {
        let peer = incoming.from().clone();
        match incoming.kind() {
            crate::types::CallKind::Camera => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let slot = shared.composite_slot.clone();
                    let mic = shared.camera.first_audio().cloned();
                    let Some(mic) = mic else {
                        tracing::warn!(%peer, "no host microphone, rejecting camera call");
                        incoming.reject();
                        return;
                    };
                    let caller_stream = incoming.caller_stream();
                    let config = shared.call_config.clone();
                    match answer_camera_with_composite(
                        incoming,
                        move || slot.read().clone(),
                        mic,
                        &config,
                    )
                    .await
                    {
                        Ok(call) => {
                            if let Some(stream) = caller_stream {
                                shared.router.attach(peer.clone(), stream);
                            }
                            let mut links = shared.links.write();
                            let link = links
                                .entry(peer.clone())
                                .or_insert_with(|| PeerLink::new(peer.clone()));
                            link.camera_call = Some(call.clone());
                            drop(links);
                            shared.emit(RoomEvent::RemoteStreamAttached {
                                peer: peer.clone(),
                                kind: crate::types::CallKind::Camera,
                            });
                            shared.rebroadcast_composite();
                            Self::watch_call_close(&shared, call);
                        }
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "camera call not answered");
                        }
                    }
                });
            }
            crate::types::CallKind::Screen => {
                // Preempt has already been broadcast by the sharer; the call
                // itself arrives second, so accepting it cannot race another
                // live share from the same protocol round.
                let Some(stream) = incoming.caller_stream() else {
                    tracing::warn!(%peer, "screen call without media, rejecting");
                    incoming.reject();
                    return;
                };
                let call = incoming.answer(None);
                *shared.screen.write() = Some(ScreenSource {
                    peer: peer.clone(),
                    stream,
                });
                {
                    let mut links = shared.links.write();
                    let link = links
                        .entry(peer.clone())
                        .or_insert_with(|| PeerLink::new(peer.clone()));
                    link.screen_call = Some(call.clone());
                    link.is_screen_sharing = true;
                }
                shared.emit(RoomEvent::ScreenShareStarted { peer: peer.clone() });
                shared.emit(RoomEvent::RemoteStreamAttached {
                    peer,
                    kind: crate::types::CallKind::Screen,
                });
                shared.rebroadcast_composite();
                Self::watch_screen_call_close(shared, call);
            }
        }
    }

    fn watch_call_close(shared: &Arc<HostShared>, call: ActiveCall) {
        let shared = shared.clone();
        let peer = call.peer().clone();
        let mut closed = call.closed_signal();
        tokio::spawn(async move {
            while closed.changed().await.is_ok() {
                if *closed.borrow() {
                    break;
                }
            }
            shared.router.detach(&peer);
            let mut links = shared.links.write();
            if let Some(link) = links.get_mut(&peer) {
                link.camera_call = None;
            }
            drop(links);
            shared.rebroadcast_composite();
            tracing::debug!(%peer, "camera call closed");
        });
    }

    fn watch_screen_call_close(shared: &Arc<HostShared>, call: ActiveCall) {
        let shared = shared.clone();
        let peer = call.peer().clone();
        let mut closed = call.closed_signal();
        tokio::spawn(async move {
            while closed.changed().await.is_ok() {
                if *closed.borrow() {
                    break;
                }
            }
            let mut screen = shared.screen.write();
            if screen.as_ref().is_some_and(|s| s.peer == peer) {
                *screen = None;
                drop(screen);
                shared.emit(RoomEvent::ScreenShareStopped { peer: peer.clone() });
                shared.rebroadcast_composite();
            }
            let mut links = shared.links.write();
            if let Some(link) = links.get_mut(&peer) {
                link.screen_call = None;
                link.is_screen_sharing = false;
            }
        });
    }

    /// This session's identity
    #[must_use]
    pub fn identity(&self) -> &RoomIdentity {
        &self.shared.identity
    }

    /// Subscribe to room events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the conversation
    #[must_use]
    pub fn conversation(&self) -> Vec<ChatEntry> {
        self.shared.conversation.read().clone()
    }

    /// Current session step
    #[must_use]
    pub fn step(&self) -> SessionStep {
        *self.shared.step.read()
    }

    /// Peers with a live link
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.links.read().keys().cloned().collect()
    }

    /// The composite output track
    #[must_use]
    pub fn composite_track(&self) -> VideoTrack {
        self.compositor.output_track()
    }

    /// Latest microphone level estimate
    #[must_use]
    pub fn mic_level(&self) -> u8 {
        self.monitor_handle.level()
    }

    /// Append a host-originated entry and relay it to every guest
    pub fn append_chat(&self, entry: ChatEntry) {
        self.shared.append_and_fanout(entry, None);
    }

    /// Run one AI interviewer turn
    ///
    /// Appends the candidate's utterance, asks the collaborator for the
    /// next interviewer utterance, appends and relays that too.
    ///
    /// # Errors
    ///
    /// [`RoomError::Brain`] when the collaborator fails.
    #[tracing::instrument(skip_all)]
    pub async fn ai_turn(
        &self,
        utterance: &str,
        frame: Option<VideoFrame>,
    ) -> Result<AiTurn, RoomError> {
        if !utterance.is_empty() {
            self.shared
                .append_and_fanout(ChatEntry::candidate(utterance), None);
        }
        let history = self.conversation();
        let turn = self
            .brain
            .next_turn(&history, utterance, &self.profile, frame)
            .await
            .map_err(|e| RoomError::Brain(e.to_string()))?;
        self.shared
            .append_and_fanout(ChatEntry::interviewer(&turn.response), None);
        // Speaking indicator on the avatar tile.
        self.shared.reactions.push("ai", "💬");
        self.shared.emit(RoomEvent::Reaction {
            sender: "ai".to_string(),
            emoji: "💬".to_string(),
        });
        Ok(turn)
    }

    /// Move the session to a new step and push a fresh snapshot to guests
    pub fn set_step(&self, step: SessionStep) {
        *self.shared.step.write() = step;
        self.shared.fanout(&self.shared.sync_message(), None);
        self.shared.emit(RoomEvent::StepChanged { step });
    }

    /// Emit a locally-originated reaction
    pub fn send_reaction(&self, emoji: &str) {
        self.shared.reactions.push("host", emoji);
        self.shared.emit(RoomEvent::Reaction {
            sender: "host".to_string(),
            emoji: emoji.to_string(),
        });
    }

    /// Start sharing the host screen
    ///
    /// The preempt goes out on every link before the capture is attached,
    /// so two shares can never briefly coexist.
    ///
    /// # Errors
    ///
    /// [`RoomError::Capture`] on screen-capture denial.
    pub async fn start_screen_share(&self, devices: &dyn MediaDevices) -> Result<(), RoomError> {
        self.shared
            .fanout(&RoomMessage::ScreenShareStatus { sharing: true }, None);
        self.shared.fanout(&RoomMessage::ForceStopScreen, None);

        let stream = devices.open_screen().await?;
        *self.shared.screen.write() = Some(ScreenSource {
            peer: self.shared.identity.local_peer.clone(),
            stream,
        });
        self.shared.emit(RoomEvent::ScreenShareStarted {
            peer: self.shared.identity.local_peer.clone(),
        });
        self.shared.rebroadcast_composite();
        Ok(())
    }

    /// Stop sharing the host screen
    ///
    /// Local stop and the platform's native stop affordance both land here.
    pub fn stop_screen_share(&self) {
        self.shared.stop_local_share();
    }

    /// Whether the host's own share is active
    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.shared.local_share_active()
    }

    /// Toggle fullscreen presentation of the active share
    pub fn set_fullscreen(&self, fullscreen: bool) {
        self.shared.fullscreen.store(fullscreen, Ordering::SeqCst);
    }

    /// Start recording the composite
    ///
    /// # Errors
    ///
    /// Per [`Recorder::start`].
    pub fn start_recording(&self) -> Result<(), RoomError> {
        let composite = self.shared.composite_slot.read().clone();
        let mic = self.shared.camera.first_audio().cloned();
        self.recorder.start(composite, mic)?;
        Ok(())
    }

    /// Stop recording and write both export artifacts
    ///
    /// Returns `None` when no recording was active (or stop already ran).
    ///
    /// # Errors
    ///
    /// Filesystem failures during export.
    pub async fn stop_recording_and_export(
        &self,
        dir: &Path,
    ) -> Result<Option<ExportPaths>, RoomError> {
        let Some(artifact) = self.recorder.stop() else {
            return Ok(None);
        };
        let conversation = self.conversation();
        let paths = export_artifacts(&artifact, &conversation, dir).await?;
        Ok(Some(paths))
    }

    /// Leave the room: notify every guest, then tear everything down
    pub async fn leave(&self) {
        self.shared.fanout(&RoomMessage::Leave, None);
        let peers: Vec<PeerId> = self.shared.links.read().keys().cloned().collect();
        for peer in peers {
            self.shared.prune_link(&peer);
        }
        self.compositor_handle.stop();
        self.monitor_handle.stop();
        self.transport.close();
        let endpoint = self.endpoint.read().clone();
        endpoint.close().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.emit(RoomEvent::ConnectionChanged {
            state: ConnectionState::Closed,
        });
        tracing::info!("host left the room");
    }
}

/// The guest's cross-callback state container
struct GuestShared {
    identity: RoomIdentity,
    host_peer: PeerId,
    camera: MediaStream,
    conversation: RwLock<Vec<ChatEntry>>,
    step: RwLock<SessionStep>,
    channel: RwLock<Option<Arc<DataChannel>>>,
    camera_call: RwLock<Option<ActiveCall>>,
    screen_call: RwLock<Option<ActiveCall>>,
    events: broadcast::Sender<RoomEvent>,
}

impl GuestShared {
    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn send_to_host(&self, message: &RoomMessage) -> Result<(), ChannelError> {
        let guard = self.channel.read();
        let channel = guard.as_ref().ok_or(ChannelError::Closed)?;
        channel.send(message)
    }

    /// Tear down the local share; local stops and preempts are identical
    fn stop_local_share(&self) {
        let call = self.screen_call.write().take();
        if let Some(call) = call {
            call.hang_up();
            let _ = self.send_to_host(&RoomMessage::ScreenShareStatus { sharing: false });
            self.emit(RoomEvent::ScreenShareStopped {
                peer: self.identity.local_peer.clone(),
            });
        }
    }
}

/// The guest side of a room
///
/// Connects to the host, applies sync snapshots, sends chat and reactions
/// through the host only, and renders the received composite directly —
/// a guest never runs a compositor.
pub struct GuestSession<R: Rendezvous> {
    shared: Arc<GuestShared>,
    transport: Arc<TransportManager<R>>,
    endpoint: Arc<RwLock<Arc<dyn Endpoint>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    monitor_handle: MonitorHandle,
}

impl<R: Rendezvous> GuestSession<R> {
    /// Join a room as guest
    ///
    /// # Errors
    ///
    /// [`RoomError::WrongRole`] for a host entry, [`RoomError::Capture`]
    /// on camera denial, transport errors otherwise.
    pub async fn open(
        entry: RoomEntry,
        devices: &dyn MediaDevices,
        rendezvous: Arc<R>,
        config: RoomConfig,
    ) -> Result<Self, RoomError> {
        if entry.role != Role::Guest {
            return Err(RoomError::WrongRole(Role::Guest));
        }

        let camera = devices.open_camera().await?;

        let transport = Arc::new(TransportManager::new(rendezvous, config.transport.clone()));
        let endpoint = transport.open_as_guest().await?;
        let endpoint: Arc<dyn Endpoint> = Arc::from(endpoint);
        let host_peer = entry.room_id.host_address();
        let identity = RoomIdentity {
            room_id: entry.room_id,
            local_peer: endpoint.id().clone(),
            role: Role::Guest,
        };

        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(GuestShared {
            identity,
            host_peer,
            camera: camera.clone(),
            conversation: RwLock::new(Vec::new()),
            step: RwLock::new(SessionStep::default()),
            channel: RwLock::new(None),
            camera_call: RwLock::new(None),
            screen_call: RwLock::new(None),
            events,
        });

        let monitor = AudioLevelMonitor::new(config.monitor.clone());
        let mic = camera
            .first_audio()
            .cloned()
            .ok_or_else(|| CaptureError::NoDevice("microphone".to_string()))?;
        let (monitor_handle, monitor_events) = monitor.start(mic);

        let session = Self {
            shared: shared.clone(),
            transport: transport.clone(),
            endpoint: Arc::new(RwLock::new(endpoint.clone())),
            tasks: parking_lot::Mutex::new(Vec::new()),
            monitor_handle,
        };

        {
            let shared = shared.clone();
            let handle = tokio::spawn(async move {
                let mut rx = monitor_events;
                while let Some(MonitorEvent::TalkingWhileMuted { level }) = rx.recv().await {
                    shared.emit(RoomEvent::TalkingWhileMuted { level });
                }
            });
            session.tasks.lock().push(handle);
        }

        session.spawn_event_loop(endpoint);
        session.spawn_heartbeat(config.call.heartbeat);
        Ok(session)
    }

    fn spawn_event_loop(&self, endpoint: Arc<dyn Endpoint>) {
        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let endpoint_slot = self.endpoint.clone();
        let Some(mut events) = endpoint.take_events() else {
            return;
        };

        let handle = tokio::spawn(async move {
            loop {
                let Some(event) = events.recv().await else { break };
                match event {
                    // Star topology: guests accept nothing inbound.
                    EndpointEvent::Link(channel) => {
                        tracing::warn!(peer = %channel.peer(), "guest refusing inbound link");
                        channel.close();
                    }
                    EndpointEvent::Call(incoming) => {
                        tracing::warn!(peer = %incoming.from(), "guest refusing inbound call");
                        incoming.reject();
                    }
                    EndpointEvent::Disconnected => {
                        transport.note_disconnected();
                        shared.emit(RoomEvent::ConnectionChanged {
                            state: ConnectionState::Disconnected,
                        });
                        match transport.reconnect(None).await {
                            Ok(fresh) => {
                                let fresh: Arc<dyn Endpoint> = Arc::from(fresh);
                                let Some(next) = fresh.take_events() else { break };
                                *endpoint_slot.write() = fresh;
                                events = next;
                                shared.emit(RoomEvent::ConnectionChanged {
                                    state: ConnectionState::Open,
                                });
                                // The heartbeat re-establishes link and call.
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "guest reconnect failed");
                                shared.emit(RoomEvent::ConnectionChanged {
                                    state: transport.state(),
                                });
                                break;
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// The guest's sole reconnection mechanism: a fixed-interval heartbeat
    /// that re-attempts the data link and the camera call when missing.
    fn spawn_heartbeat(&self, interval: std::time::Duration) {
        let shared = self.shared.clone();
        let endpoint_slot = self.endpoint.clone();
        let camera = self.shared.camera.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let endpoint = endpoint_slot.read().clone();

                let need_link = shared
                    .channel
                    .read()
                    .as_ref()
                    .map_or(true, |c| c.is_closed());
                if need_link {
                    match endpoint.connect(&shared.host_peer).await {
                        Ok(channel) => {
                            let receiver = channel.take_receiver();
                            *shared.channel.write() = Some(Arc::new(channel));
                            shared.emit(RoomEvent::LinkOpened {
                                peer: shared.host_peer.clone(),
                            });
                            if let Some(receiver) = receiver {
                                let shared = shared.clone();
                                tokio::spawn(async move {
                                    Self::host_recv_loop(shared, receiver).await;
                                });
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "host link attempt failed");
                        }
                    }
                }

                let need_call = shared
                    .camera_call
                    .read()
                    .as_ref()
                    .map_or(true, ActiveCall::is_closed);
                if need_call {
                    match endpoint
                        .call(
                            &shared.host_peer,
                            camera.clone(),
                            crate::types::CallKind::Camera,
                        )
                        .await
                    {
                        Ok(outbound) => match outbound.answered().await {
                            Ok(call) => {
                                *shared.camera_call.write() = Some(call);
                                shared.emit(RoomEvent::RemoteStreamAttached {
                                    peer: shared.host_peer.clone(),
                                    kind: crate::types::CallKind::Camera,
                                });
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "camera call not answered");
                            }
                        },
                        Err(e) => {
                            tracing::debug!(error = %e, "camera call attempt failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn host_recv_loop(shared: Arc<GuestShared>, mut receiver: DataChannelReceiver) {
        loop {
            let Some(message) = receiver.recv().await else {
                *shared.channel.write() = None;
                shared.emit(RoomEvent::LinkClosed {
                    peer: shared.host_peer.clone(),
                });
                break;
            };
            match message {
                RoomMessage::Sync { conversation, step } => {
                    *shared.conversation.write() = conversation;
                    let changed = {
                        let mut current = shared.step.write();
                        let changed = *current != step;
                        *current = step;
                        changed
                    };
                    if changed {
                        shared.emit(RoomEvent::StepChanged { step });
                    }
                }
                RoomMessage::Chat { entry } => {
                    shared.conversation.write().push(entry.clone());
                    shared.emit(RoomEvent::ChatAppended { entry });
                }
                RoomMessage::Emoji { emoji } => {
                    shared.emit(RoomEvent::Reaction {
                        sender: shared.host_peer.as_str().to_string(),
                        emoji,
                    });
                }
                RoomMessage::ScreenShareStatus { sharing } => {
                    let peer = shared.host_peer.clone();
                    if sharing {
                        shared.emit(RoomEvent::ScreenShareStarted { peer });
                    } else {
                        shared.emit(RoomEvent::ScreenShareStopped { peer });
                    }
                }
                RoomMessage::ForceStopScreen => {
                    tracing::info!("share preempted by another participant");
                    shared.stop_local_share();
                }
                RoomMessage::Leave => {
                    *shared.channel.write() = None;
                    shared.emit(RoomEvent::LinkClosed {
                        peer: shared.host_peer.clone(),
                    });
                    break;
                }
            }
        }
    }

    /// This session's identity
    #[must_use]
    pub fn identity(&self) -> &RoomIdentity {
        &self.shared.identity
    }

    /// Subscribe to room events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the replicated conversation
    #[must_use]
    pub fn conversation(&self) -> Vec<ChatEntry> {
        self.shared.conversation.read().clone()
    }

    /// Replicated session step
    #[must_use]
    pub fn step(&self) -> SessionStep {
        *self.shared.step.read()
    }

    /// The host's composite stream, once the camera call is answered
    ///
    /// Read through the live call, so a host-side track swap shows up here
    /// without any renegotiation.
    #[must_use]
    pub fn remote_view(&self) -> Option<MediaStream> {
        self.shared
            .camera_call
            .read()
            .as_ref()
            .and_then(ActiveCall::remote_stream)
    }

    /// Whether the data link to the host is live
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.shared
            .channel
            .read()
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// Whether this guest's screen share is active
    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.shared
            .screen_call
            .read()
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// Latest microphone level estimate
    #[must_use]
    pub fn mic_level(&self) -> u8 {
        self.monitor_handle.level()
    }

    /// Send a chat entry to the host (who relays it to everyone else)
    ///
    /// # Errors
    ///
    /// [`RoomError::Channel`] when the host link is down.
    pub fn send_chat(&self, text: &str) -> Result<(), RoomError> {
        let entry = ChatEntry::candidate(text);
        self.shared
            .send_to_host(&RoomMessage::Chat { entry: entry.clone() })?;
        self.shared.conversation.write().push(entry.clone());
        self.shared.emit(RoomEvent::ChatAppended { entry });
        Ok(())
    }

    /// Send an emoji reaction to the host
    ///
    /// # Errors
    ///
    /// [`RoomError::Channel`] when the host link is down.
    pub fn send_reaction(&self, emoji: &str) -> Result<(), RoomError> {
        self.shared.send_to_host(&RoomMessage::Emoji {
            emoji: emoji.to_string(),
        })?;
        Ok(())
    }

    /// Start sharing this guest's screen
    ///
    /// Status and preempt go to the host first; only then is the share
    /// call opened, so two shares can never briefly coexist.
    ///
    /// # Errors
    ///
    /// Capture denial, a dead host link, or an unanswered share call.
    pub async fn start_screen_share(&self, devices: &dyn MediaDevices) -> Result<(), RoomError> {
        self.shared
            .send_to_host(&RoomMessage::ScreenShareStatus { sharing: true })?;
        self.shared.send_to_host(&RoomMessage::ForceStopScreen)?;

        let stream = devices.open_screen().await?;
        let endpoint = self.endpoint.read().clone();
        let outbound = endpoint
            .call(
                &self.shared.host_peer,
                stream,
                crate::types::CallKind::Screen,
            )
            .await?;
        let call = outbound.answered().await?;
        *self.shared.screen_call.write() = Some(call);
        self.shared.emit(RoomEvent::ScreenShareStarted {
            peer: self.shared.identity.local_peer.clone(),
        });
        Ok(())
    }

    /// Stop sharing; the platform's native stop lands here too
    pub fn stop_screen_share(&self) {
        self.shared.stop_local_share();
    }

    /// Leave the room gracefully
    pub async fn leave(&self) {
        let _ = self.shared.send_to_host(&RoomMessage::Leave);
        if let Some(channel) = self.shared.channel.write().take() {
            channel.close();
        }
        if let Some(call) = self.shared.camera_call.write().take() {
            call.hang_up();
        }
        if let Some(call) = self.shared.screen_call.write().take() {
            call.hang_up();
        }
        self.monitor_handle.stop();
        self.transport.close();
        let endpoint = self.endpoint.read().clone();
        endpoint.close().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.emit(RoomEvent::ConnectionChanged {
            state: ConnectionState::Closed,
        });
        tracing::info!("guest left the room");
    }
}
