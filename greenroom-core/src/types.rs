//! Room types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport-assigned peer address
///
/// A host's address equals the room id it owns; guest addresses are
/// ephemeral and minted by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a peer id from any string-like value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Room identifier
///
/// Every user has one stable personal room id derived from their account
/// key; see [`crate::identity::personal_room_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    /// Create a room id from any string-like value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The peer address a host must claim to own this room
    #[must_use]
    pub fn host_address(&self) -> PeerId {
        PeerId(self.0.clone())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant role within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Owns the room: sole writer of conversation and session step,
    /// renders the composite all guests see
    Host,
    /// Passive consumer of the host's composite; relays chat through the host
    Guest,
}

impl Role {
    /// Check whether this is the host role
    #[must_use]
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

/// Local identity for one room session
///
/// Created once at room entry and immutable for the life of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomIdentity {
    /// The room being joined
    pub room_id: RoomId,
    /// The local peer address
    pub local_peer: PeerId,
    /// Resolved role
    pub role: Role,
}

/// Interview session phase, host-authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStep {
    /// Devices and participants assembling
    Setup,
    /// Live interview
    Interview,
    /// Wrap-up and feedback
    Feedback,
}

impl SessionStep {
    /// The step that follows this one, if any
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Setup => Some(Self::Interview),
            Self::Interview => Some(Self::Feedback),
            Self::Feedback => None,
        }
    }
}

impl Default for SessionStep {
    fn default() -> Self {
        Self::Setup
    }
}

/// Who produced a conversation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    /// The AI interviewer
    Interviewer,
    /// The human candidate
    Candidate,
}

/// One conversation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// Who spoke
    pub speaker: SpeakerRole,
    /// What was said
    pub text: String,
    /// When the entry was appended on the host
    pub timestamp: DateTime<Utc>,
}

impl ChatEntry {
    /// New interviewer entry stamped now
    pub fn interviewer(text: impl Into<String>) -> Self {
        Self {
            speaker: SpeakerRole::Interviewer,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// New candidate entry stamped now
    pub fn candidate(text: impl Into<String>) -> Self {
        Self {
            speaker: SpeakerRole::Candidate,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Media call category, carried as metadata in call setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Camera plus microphone (the default call)
    Camera,
    /// Screen capture, never mixed into the camera call
    Screen,
}

impl CallKind {
    /// Static name for tracing fields
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

/// Unique identifier for a media call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-connection lifecycle as surfaced by the transport manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the peer identity
    Connecting,
    /// Identity confirmed, links may flow
    Open,
    /// Server link lost, peer object still alive
    Disconnected,
    /// Attempting the single automatic reconnect
    Reconnecting,
    /// Bounded retries exhausted; manual restart required
    RecoveryRequired,
    /// Explicit local teardown
    Closed,
}

impl ConnectionState {
    /// States from which no automatic progress is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RecoveryRequired | Self::Closed)
    }
}

/// Interview profile driving the AI interviewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewProfile {
    /// Target job role, e.g. "backend engineer"
    pub role: String,
    /// Seniority band, e.g. "senior"
    pub seniority: String,
    /// Topic areas to probe
    pub focus: Vec<String>,
}

impl Default for InterviewProfile {
    fn default() -> Self {
        Self {
            role: "software engineer".to_string(),
            seniority: "mid-level".to_string(),
            focus: Vec::new(),
        }
    }
}

/// One AI interviewer turn as returned by the collaborator endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiTurn {
    /// The interviewer's next utterance
    pub response: String,
    /// Optional spoken-audio URL for the utterance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

/// Room-level event for notifications
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Data link to a peer established
    LinkOpened {
        /// Remote peer
        peer: PeerId,
    },
    /// Data link to a peer gone (graceful leave or link loss)
    LinkClosed {
        /// Remote peer
        peer: PeerId,
    },
    /// Conversation grew by one entry
    ChatAppended {
        /// The new entry
        entry: ChatEntry,
    },
    /// Host moved the session to a new step
    StepChanged {
        /// The new step
        step: SessionStep,
    },
    /// An emoji reaction arrived
    Reaction {
        /// Attributed sender: a peer id, or "host" / "ai" for local origins
        sender: String,
        /// The emoji itself
        emoji: String,
    },
    /// A participant began sharing their screen
    ScreenShareStarted {
        /// Sharing peer, or the local host address
        peer: PeerId,
    },
    /// The active screen share ended
    ScreenShareStopped {
        /// Peer whose share ended
        peer: PeerId,
    },
    /// A remote media stream is available for a peer
    RemoteStreamAttached {
        /// Source peer
        peer: PeerId,
        /// Which call delivered it
        kind: CallKind,
    },
    /// Transport lifecycle transition
    ConnectionChanged {
        /// New state
        state: ConnectionState,
    },
    /// Energy detected on a muted microphone
    TalkingWhileMuted {
        /// Estimated level, 0-100
        level: u8,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_step_progression() {
        assert_eq!(SessionStep::Setup.next(), Some(SessionStep::Interview));
        assert_eq!(SessionStep::Interview.next(), Some(SessionStep::Feedback));
        assert_eq!(SessionStep::Feedback.next(), None);
        assert_eq!(SessionStep::default(), SessionStep::Setup);
    }

    #[test]
    fn test_room_id_host_address() {
        let room = RoomId::new("room-abc123");
        assert_eq!(room.host_address(), PeerId::new("room-abc123"));
    }

    #[test]
    fn test_chat_entry_serialization() {
        let entry = ChatEntry::interviewer("Tell me about yourself.");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"speaker\":\"interviewer\""));

        let back: ChatEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_call_kind_tags() {
        assert_eq!(CallKind::Camera.as_str(), "camera");
        assert_eq!(CallKind::Screen.as_str(), "screen");
        let json = serde_json::to_string(&CallKind::Screen).unwrap();
        assert_eq!(json, "\"screen\"");
    }

    #[test]
    fn test_connection_state_terminal() {
        assert!(ConnectionState::RecoveryRequired.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Reconnecting.is_terminal());
        assert!(!ConnectionState::Open.is_terminal());
    }

    #[test]
    fn test_call_id_unique() {
        assert_ne!(CallId::new(), CallId::new());
    }
}
