//! Transport layer
//!
//! The rendezvous service is an opaque external dependency: it resolves
//! peer addresses to direct links and that is all the core asks of it. The
//! [`Rendezvous`] trait captures that contract; [`MemoryRendezvous`] is the
//! in-process implementation used by the tests and the CLI demo.
//!
//! [`TransportManager`] owns the single peer identity per session: host
//! address collisions are retried with exponential pacing and a hard
//! attempt bound, and an unexpected server-side disconnect earns exactly
//! one automatic reconnect.

use crate::call::{self, IncomingCall, OutboundCall};
use crate::media::MediaStream;
use crate::protocol::DataChannel;
use crate::types::{CallKind, ConnectionState, PeerId, RoomId};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use uuid::Uuid;

/// Rendezvous errors
#[derive(Error, Debug)]
pub enum RendezvousError {
    /// The requested address is bound to another live session
    #[error("address already taken: {0}")]
    IdTaken(PeerId),

    /// The target address never answered
    #[error("peer unreachable: {0}")]
    Unreachable(PeerId),

    /// The local endpoint is not open
    #[error("endpoint not open")]
    NotOpen,

    /// Rendezvous service failure
    #[error("rendezvous failure: {0}")]
    Service(String),
}

/// Asynchronous arrivals on an open endpoint
///
/// Both link and call events can race the caller's own open confirmation,
/// so the event stream is wired before the address is announced.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A remote peer opened a data link to us
    Link(DataChannel),
    /// A remote peer is calling us
    Call(IncomingCall),
    /// The server link dropped; the endpoint object itself is still alive
    Disconnected,
}

/// One open peer identity
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// The address this endpoint answers on
    fn id(&self) -> &PeerId;

    /// Open a data link to a peer
    async fn connect(&self, peer: &PeerId) -> Result<DataChannel, RendezvousError>;

    /// Place a media call to a peer
    async fn call(
        &self,
        peer: &PeerId,
        stream: MediaStream,
        kind: CallKind,
    ) -> Result<OutboundCall, RendezvousError>;

    /// Take the inbound event stream; yields `None` after the first call
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>>;

    /// Release the address and stop answering
    async fn close(&self);
}

/// Rendezvous service seam
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Open an endpoint, claiming `requested` or minting an ephemeral address
    async fn open(&self, requested: Option<PeerId>)
        -> Result<Box<dyn Endpoint>, RendezvousError>;
}

fn ephemeral_peer_id() -> PeerId {
    PeerId::new(format!("peer-{}", Uuid::new_v4().simple()))
}

/// In-process rendezvous hub
///
/// Routes connects and calls between endpoints opened on the same hub.
/// A slot whose event receiver is gone counts as a stale session and is
/// evicted on the next claim of its address.
#[cfg(feature = "memory-transport")]
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    inner: Arc<HubInner>,
}

#[cfg(feature = "memory-transport")]
#[derive(Default)]
struct HubInner {
    peers: tokio::sync::RwLock<HashMap<PeerId, PeerSlot>>,
}

#[cfg(feature = "memory-transport")]
struct PeerSlot {
    events: mpsc::UnboundedSender<EndpointEvent>,
}

#[cfg(feature = "memory-transport")]
impl MemoryRendezvous {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an address is currently claimed
    pub async fn is_registered(&self, peer: &PeerId) -> bool {
        self.inner.peers.read().await.contains_key(peer)
    }

    /// Sever a peer's server link without destroying its endpoint
    ///
    /// The peer observes [`EndpointEvent::Disconnected`]; its address is
    /// released so a reconnect can claim it again.
    pub async fn interrupt(&self, peer: &PeerId) -> bool {
        let mut peers = self.inner.peers.write().await;
        if let Some(slot) = peers.remove(peer) {
            let _ = slot.events.send(EndpointEvent::Disconnected);
            tracing::debug!(%peer, "server link interrupted");
            true
        } else {
            false
        }
    }
}

#[cfg(feature = "memory-transport")]
#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn open(
        &self,
        requested: Option<PeerId>,
    ) -> Result<Box<dyn Endpoint>, RendezvousError> {
        let id = requested.unwrap_or_else(ephemeral_peer_id);
        let mut peers = self.inner.peers.write().await;

        if let Some(slot) = peers.get(&id) {
            if slot.events.is_closed() {
                tracing::info!(peer = %id, "evicting stale session holding the address");
                peers.remove(&id);
            } else {
                return Err(RendezvousError::IdTaken(id));
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        peers.insert(id.clone(), PeerSlot { events: events_tx });
        tracing::debug!(peer = %id, "endpoint open");

        Ok(Box::new(MemoryEndpoint {
            id,
            hub: self.inner.clone(),
            events: Mutex::new(Some(events_rx)),
            open: AtomicBool::new(true),
        }))
    }
}

#[cfg(feature = "memory-transport")]
struct MemoryEndpoint {
    id: PeerId,
    hub: Arc<HubInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EndpointEvent>>>,
    open: AtomicBool,
}

#[cfg(feature = "memory-transport")]
#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &PeerId {
        &self.id
    }

    async fn connect(&self, peer: &PeerId) -> Result<DataChannel, RendezvousError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RendezvousError::NotOpen);
        }
        let peers = self.hub.peers.read().await;
        let slot = peers
            .get(peer)
            .ok_or_else(|| RendezvousError::Unreachable(peer.clone()))?;

        let (local, remote) = DataChannel::pair(self.id.clone(), peer.clone());
        slot.events
            .send(EndpointEvent::Link(remote))
            .map_err(|_| RendezvousError::Unreachable(peer.clone()))?;
        tracing::debug!(from = %self.id, to = %peer, "data link opened");
        Ok(local)
    }

    async fn call(
        &self,
        peer: &PeerId,
        stream: MediaStream,
        kind: CallKind,
    ) -> Result<OutboundCall, RendezvousError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RendezvousError::NotOpen);
        }
        let peers = self.hub.peers.read().await;
        let slot = peers
            .get(peer)
            .ok_or_else(|| RendezvousError::Unreachable(peer.clone()))?;

        let (outbound, incoming) = call::wire(self.id.clone(), peer.clone(), kind, stream);
        slot.events
            .send(EndpointEvent::Call(incoming))
            .map_err(|_| RendezvousError::Unreachable(peer.clone()))?;
        tracing::debug!(from = %self.id, to = %peer, kind = kind.as_str(), "media call placed");
        Ok(outbound)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.hub.peers.write().await.remove(&self.id);
            tracing::debug!(peer = %self.id, "endpoint closed");
        }
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Bounded retries exhausted; only a manual restart can help
    #[error("identity recovery required after {attempts} failed open attempts")]
    RecoveryRequired {
        /// How many opens were tried
        attempts: u32,
    },

    /// Manager torn down locally
    #[error("transport closed")]
    Closed,

    /// Underlying rendezvous failure
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
}

/// Transport manager configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum host-address open attempts before giving up
    pub open_attempts: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// Owns the single peer identity and its lifecycle
pub struct TransportManager<R: Rendezvous> {
    rendezvous: Arc<R>,
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    // Held so the watch channel always has a live receiver; otherwise
    // `state_tx.send` fails and the stored state never advances.
    _state_rx: watch::Receiver<ConnectionState>,
    reconnect_used: AtomicBool,
    closed: AtomicBool,
}

impl<R: Rendezvous> TransportManager<R> {
    /// Create a manager over a rendezvous service
    #[must_use]
    pub fn new(rendezvous: Arc<R>, config: TransportConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Self {
            rendezvous,
            config,
            state_tx,
            _state_rx: state_rx,
            reconnect_used: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            tracing::info!(?state, "connection state");
            let _ = self.state_tx.send(state);
        }
    }

    /// Open the host identity, claiming the room id as its address
    ///
    /// An `IdTaken` collision (typically a zombie session from a previous
    /// tab still holding the address) is retried with exponential pacing,
    /// rebuilding the endpoint from scratch each attempt. After the bound
    /// is hit the manager parks in [`ConnectionState::RecoveryRequired`]
    /// and never issues another attempt.
    ///
    /// # Errors
    ///
    /// [`TransportError::RecoveryRequired`] once attempts are exhausted;
    /// any non-collision rendezvous failure is returned immediately.
    #[tracing::instrument(skip(self), fields(room = %room))]
    pub async fn open_as_host(&self, room: &RoomId) -> Result<Box<dyn Endpoint>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let attempts = self.config.open_attempts.max(1);
        for attempt in 1..=attempts {
            self.set_state(ConnectionState::Connecting);
            match self.rendezvous.open(Some(room.host_address())).await {
                Ok(endpoint) => {
                    self.set_state(ConnectionState::Open);
                    return Ok(endpoint);
                }
                Err(RendezvousError::IdTaken(id)) => {
                    tracing::warn!(attempt, %id, "host address collision");
                    if attempt < attempts {
                        sleep(self.collision_delay(attempt)).await;
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::RecoveryRequired);
                    return Err(e.into());
                }
            }
        }

        self.set_state(ConnectionState::RecoveryRequired);
        Err(TransportError::RecoveryRequired { attempts })
    }

    /// Open a guest identity on an ephemeral address
    ///
    /// # Errors
    ///
    /// Any rendezvous failure; guests do not retry opens (their heartbeat
    /// retries links and calls instead).
    #[tracing::instrument(skip(self))]
    pub async fn open_as_guest(&self) -> Result<Box<dyn Endpoint>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.set_state(ConnectionState::Connecting);
        match self.rendezvous.open(None).await {
            Ok(endpoint) => {
                self.set_state(ConnectionState::Open);
                Ok(endpoint)
            }
            Err(e) => {
                self.set_state(ConnectionState::RecoveryRequired);
                Err(e.into())
            }
        }
    }

    /// Record a server-side disconnect observed on the endpoint events
    pub fn note_disconnected(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// The single automatic reconnect after an unexpected disconnect
    ///
    /// Re-claims `address` (the host's room address, or `None` for a fresh
    /// guest address). A second reconnect, or one after [`Self::close`],
    /// is refused.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] after explicit teardown;
    /// [`TransportError::RecoveryRequired`] when the one reconnect is spent
    /// or the open fails.
    #[tracing::instrument(skip(self))]
    pub async fn reconnect(
        &self,
        address: Option<PeerId>,
    ) -> Result<Box<dyn Endpoint>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.reconnect_used.swap(true, Ordering::SeqCst) {
            self.set_state(ConnectionState::RecoveryRequired);
            return Err(TransportError::RecoveryRequired { attempts: 1 });
        }

        self.set_state(ConnectionState::Reconnecting);
        match self.rendezvous.open(address).await {
            Ok(endpoint) => {
                self.set_state(ConnectionState::Open);
                Ok(endpoint)
            }
            Err(e) => {
                tracing::warn!(error = %e, "reconnect failed");
                self.set_state(ConnectionState::RecoveryRequired);
                Err(e.into())
            }
        }
    }

    /// Explicit local teardown; no reconnect will follow
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
    }

    fn collision_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base * 2u32.saturating_pow(attempt - 1);
        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        base + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{AudioTrack, MediaStream, VideoFrame, VideoTrack};
    use std::sync::atomic::AtomicU32;

    fn test_config() -> TransportConfig {
        TransportConfig {
            open_attempts: 3,
            backoff_base: Duration::from_millis(1),
        }
    }

    fn camera_stream() -> MediaStream {
        MediaStream::camera(
            VideoTrack::new("cam", VideoFrame::black(4, 4)),
            AudioTrack::new("mic"),
        )
    }

    /// Rendezvous that always reports the address taken, counting opens
    struct CollidingRendezvous {
        opens: AtomicU32,
    }

    #[async_trait]
    impl Rendezvous for CollidingRendezvous {
        async fn open(
            &self,
            requested: Option<PeerId>,
        ) -> Result<Box<dyn Endpoint>, RendezvousError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(RendezvousError::IdTaken(
                requested.unwrap_or_else(|| PeerId::new("x")),
            ))
        }
    }

    #[tokio::test]
    async fn test_memory_open_assigns_distinct_ephemeral_ids() {
        let hub = MemoryRendezvous::new();
        let a = hub.open(None).await.unwrap();
        let b = hub.open(None).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_memory_collision_reports_id_taken() {
        let hub = MemoryRendezvous::new();
        let id = PeerId::new("room-1");
        let _first = hub.open(Some(id.clone())).await.unwrap();

        let second = hub.open(Some(id.clone())).await;
        assert!(matches!(second, Err(RendezvousError::IdTaken(taken)) if taken == id));
    }

    #[tokio::test]
    async fn test_memory_evicts_stale_session() {
        let hub = MemoryRendezvous::new();
        let id = PeerId::new("room-1");
        let first = hub.open(Some(id.clone())).await.unwrap();
        // Dropping the receiver makes the old slot a zombie.
        drop(first.take_events());

        let second = hub.open(Some(id.clone())).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_memory_connect_and_call_delivery() {
        let hub = MemoryRendezvous::new();
        let host = hub.open(Some(PeerId::new("room-1"))).await.unwrap();
        let guest = hub.open(None).await.unwrap();
        let mut host_events = host.take_events().unwrap();

        let link = guest.connect(host.id()).await.unwrap();
        match host_events.recv().await.unwrap() {
            EndpointEvent::Link(ch) => assert_eq!(ch.peer(), guest.id()),
            other => unreachable!("expected link, got {other:?}"),
        }
        assert_eq!(link.peer(), host.id());

        let outbound = guest
            .call(host.id(), camera_stream(), CallKind::Camera)
            .await
            .unwrap();
        match host_events.recv().await.unwrap() {
            EndpointEvent::Call(incoming) => {
                assert_eq!(incoming.from(), guest.id());
                incoming.answer(Some(camera_stream()));
            }
            other => unreachable!("expected call, got {other:?}"),
        }
        let active = outbound.answered().await.unwrap();
        assert!(active.remote_stream().is_some());
    }

    #[tokio::test]
    async fn test_memory_connect_unreachable() {
        let hub = MemoryRendezvous::new();
        let guest = hub.open(None).await.unwrap();
        let err = guest.connect(&PeerId::new("nobody")).await;
        assert!(matches!(err, Err(RendezvousError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_memory_interrupt_releases_address() {
        let hub = MemoryRendezvous::new();
        let host = hub.open(Some(PeerId::new("room-1"))).await.unwrap();
        let mut events = host.take_events().unwrap();

        assert!(hub.interrupt(host.id()).await);
        match events.recv().await.unwrap() {
            EndpointEvent::Disconnected => {}
            other => unreachable!("expected disconnect, got {other:?}"),
        }
        assert!(!hub.is_registered(host.id()).await);
    }

    #[tokio::test]
    async fn test_host_collision_stops_after_three_attempts() {
        let rendezvous = Arc::new(CollidingRendezvous {
            opens: AtomicU32::new(0),
        });
        let manager = TransportManager::new(rendezvous.clone(), test_config());

        let result = manager.open_as_host(&RoomId::new("room-1")).await;
        assert!(matches!(
            result,
            Err(TransportError::RecoveryRequired { attempts: 3 })
        ));
        assert_eq!(rendezvous.opens.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ConnectionState::RecoveryRequired);

        // No further attempt is issued from the terminal state by the
        // session layer; a direct re-open is a deliberate manual restart.
    }

    #[tokio::test]
    async fn test_host_open_succeeds_over_memory_hub() {
        let hub = Arc::new(MemoryRendezvous::new());
        let manager = TransportManager::new(hub, test_config());
        let endpoint = manager.open_as_host(&RoomId::new("room-1")).await.unwrap();
        assert_eq!(endpoint.id(), &PeerId::new("room-1"));
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_single_reconnect_then_recovery_required() {
        let hub = Arc::new(MemoryRendezvous::new());
        let manager = TransportManager::new(hub.clone(), test_config());
        let room = RoomId::new("room-1");
        let endpoint = manager.open_as_host(&room).await.unwrap();

        hub.interrupt(endpoint.id()).await;
        manager.note_disconnected();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let again = manager.reconnect(Some(room.host_address())).await.unwrap();
        assert_eq!(again.id(), &room.host_address());
        assert_eq!(manager.state(), ConnectionState::Open);

        hub.interrupt(again.id()).await;
        manager.note_disconnected();
        let third = manager.reconnect(Some(room.host_address())).await;
        assert!(matches!(
            third,
            Err(TransportError::RecoveryRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_reconnect_after_explicit_close() {
        let hub = Arc::new(MemoryRendezvous::new());
        let manager = TransportManager::new(hub, test_config());
        let _endpoint = manager.open_as_guest().await.unwrap();

        manager.close();
        assert_eq!(manager.state(), ConnectionState::Closed);
        let result = manager.reconnect(None).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
