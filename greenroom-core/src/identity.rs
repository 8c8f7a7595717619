//! Role resolution
//!
//! Decides whether the local participant is host or guest for a room before
//! any transport activity happens. The decision is sticky: the "I created
//! this room" marker lives in session-scoped storage so a page reload does
//! not flip roles, and ambiguity always resolves to guest, since a guest
//! cannot destructively claim a host-only address.

use crate::types::{Role, RoomId};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Prefix for every derived room id
const ROOM_ID_PREFIX: &str = "gr";

/// Session-store key prefix for the room-creator marker
const CREATOR_MARKER_PREFIX: &str = "room.created.";

/// Derive the user's stable personal room id from their account key
///
/// The derivation is deterministic so the same account always lands in the
/// same room across devices and sessions.
#[must_use]
pub fn personal_room_id(account_key: &str) -> RoomId {
    let digest = blake3::hash(account_key.as_bytes());
    let hex = digest.to_hex();
    RoomId::new(format!("{}-{}", ROOM_ID_PREFIX, &hex.as_str()[..16]))
}

/// Session-scoped key/value storage
///
/// Abstracts whatever the embedding surface provides (browser session
/// storage, a per-process map in tests). Values do not outlive the session.
pub trait SessionStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Option<String>;
    /// Write a value
    fn set(&self, key: &str, value: &str);
    /// Delete a value
    fn remove(&self, key: &str);
}

/// In-process session store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

impl<S: SessionStore + ?Sized> SessionStore for &S {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) {
        (**self).set(key, value);
    }

    fn remove(&self, key: &str) {
        (**self).remove(key);
    }
}

/// Outcome of role resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEntry {
    /// The room to enter
    pub room_id: RoomId,
    /// The resolved local role
    pub role: Role,
    /// True when no room id was requested and the caller should land in
    /// their personal room instead
    pub redirected: bool,
}

/// Resolves host/guest for a requested room id
pub struct RoleResolver<S: SessionStore> {
    store: S,
}

impl<S: SessionStore> RoleResolver<S> {
    /// Create a resolver over the given session store
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Resolve role for `requested`, or redirect to the personal room
    ///
    /// Rules:
    /// - no id requested: the caller's personal room, role host, creator
    ///   marker persisted, `redirected` set;
    /// - requested id equals the personal id, or the creator marker exists:
    ///   host;
    /// - anything else: guest.
    #[tracing::instrument(skip(self, account_key))]
    pub fn resolve(&self, requested: Option<&RoomId>, account_key: &str) -> RoomEntry {
        let personal = personal_room_id(account_key);

        let Some(room_id) = requested else {
            self.mark_created(&personal);
            tracing::info!(room = %personal, "no room requested, redirecting to personal room");
            return RoomEntry {
                room_id: personal,
                role: Role::Host,
                redirected: true,
            };
        };

        let role = if *room_id == personal || self.created_here(room_id) {
            // Re-assert the marker so a reload keeps the host role.
            self.mark_created(room_id);
            Role::Host
        } else {
            Role::Guest
        };

        tracing::info!(room = %room_id, ?role, "room role resolved");
        RoomEntry {
            room_id: room_id.clone(),
            role,
            redirected: false,
        }
    }

    fn created_here(&self, room_id: &RoomId) -> bool {
        self.store
            .get(&format!("{CREATOR_MARKER_PREFIX}{room_id}"))
            .is_some()
    }

    fn mark_created(&self, room_id: &RoomId) {
        self.store
            .set(&format!("{CREATOR_MARKER_PREFIX}{room_id}"), "1");
    }

    /// Drop the creator marker, e.g. after an explicit room teardown
    pub fn forget(&self, room_id: &RoomId) {
        self.store
            .remove(&format!("{CREATOR_MARKER_PREFIX}{room_id}"));
    }
}
