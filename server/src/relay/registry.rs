//! Room Registry
//!
//! Creates rooms on first join and removes them when the last participant
//! leaves. Lookups from the forwarding path go through a `DashMap` and never
//! contend with membership changes of other rooms.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;
use vc_common::protocol::SUPPORTED_VERSIONS;
use vc_common::{MediaKind, ParticipantId, RoomId};

use super::bwe::ControllerFactory;
use super::error::RelayError;
use super::layers::CodecNegotiation;
use super::room::{Role, Room, RoomLimits, StreamKey};

/// All active rooms.
pub struct Registry {
    rooms: DashMap<RoomId, Arc<Room>>,
    /// Serializes room creation so the room limit holds.
    create_lock: Mutex<()>,
    max_rooms: usize,
    limits: RoomLimits,
    controllers: ControllerFactory,
    keyframe_interval: Duration,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(
        max_rooms: usize,
        limits: RoomLimits,
        controllers: ControllerFactory,
        keyframe_interval: Duration,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            create_lock: Mutex::new(()),
            max_rooms,
            limits,
            controllers,
            keyframe_interval,
        }
    }

    /// Look up a room.
    #[must_use]
    pub fn room(&self, room_id: RoomId) -> Option<Arc<Room>> {
        self.rooms.get(&room_id).map(|room| Arc::clone(room.value()))
    }

    /// Look up a room or fail with [`RelayError::RoomNotFound`].
    pub fn require(&self, room_id: RoomId) -> Result<Arc<Room>, RelayError> {
        self.room(room_id).ok_or(RelayError::RoomNotFound(room_id))
    }

    /// All active rooms.
    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|room| Arc::clone(room.value())).collect()
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Join a room, creating it if it does not exist.
    pub fn join(
        &self,
        room_id: RoomId,
        participant: ParticipantId,
        role: Role,
        protocol_version: u8,
        now: Instant,
    ) -> Result<(), RelayError> {
        if participant.is_relay() {
            return Err(RelayError::InvalidRequest(
                "participant id 0 is reserved for the relay".into(),
            ));
        }
        if !SUPPORTED_VERSIONS.contains(&protocol_version) {
            return Err(RelayError::UnsupportedVersion(protocol_version));
        }

        loop {
            let room = match self.room(room_id) {
                Some(room) => room,
                None => self.create(room_id, protocol_version)?,
            };
            match room.join(participant, role, protocol_version, now) {
                // Lost a race with the last leave; the room is on its way out.
                Err(RelayError::RoomClosed) => {
                    self.rooms.remove_if(&room_id, |_, r| Arc::ptr_eq(r, &room));
                }
                result => return result,
            }
        }
    }

    fn create(&self, room_id: RoomId, protocol_version: u8) -> Result<Arc<Room>, RelayError> {
        let _guard = self.create_lock.lock();
        if let Some(room) = self.room(room_id) {
            return Ok(room);
        }
        if self.rooms.len() >= self.max_rooms {
            return Err(RelayError::RoomLimitReached {
                max_rooms: self.max_rooms,
            });
        }

        let room = Arc::new(Room::new(
            room_id,
            protocol_version,
            self.limits,
            Arc::clone(&self.controllers),
            self.keyframe_interval,
        ));
        self.rooms.insert(room_id, Arc::clone(&room));
        info!(room_id = %room_id, protocol_version, "Room created");
        Ok(room)
    }

    /// Leave a room, destroying it if it becomes empty.
    pub fn leave(&self, room_id: RoomId, participant: ParticipantId) -> Result<(), RelayError> {
        let room = self.require(room_id)?;
        if room.leave(participant)? {
            self.rooms.remove_if(&room_id, |_, r| Arc::ptr_eq(r, &room));
            info!(room_id = %room_id, "Room closed");
        }
        Ok(())
    }

    /// Negotiate a sender's stream.
    pub fn negotiate_codec(
        &self,
        room_id: RoomId,
        sender: ParticipantId,
        kind: MediaKind,
        negotiation: CodecNegotiation,
        now: Instant,
    ) -> Result<u64, RelayError> {
        self.require(room_id)?
            .negotiate_codec(sender, kind, negotiation, now)
    }

    /// Subscribe a receiver to a sender's stream.
    pub fn subscribe(
        &self,
        room_id: RoomId,
        receiver: ParticipantId,
        stream: StreamKey,
        now: Instant,
    ) -> Result<(), RelayError> {
        self.require(room_id)?.subscribe(receiver, stream, now)
    }

    /// Remove a subscription.
    pub fn unsubscribe(
        &self,
        room_id: RoomId,
        receiver: ParticipantId,
        stream: StreamKey,
    ) -> Result<(), RelayError> {
        self.require(room_id)?.unsubscribe(receiver, stream)
    }

    /// Set per-sender mute state of a receiver.
    pub fn set_muted(
        &self,
        room_id: RoomId,
        receiver: ParticipantId,
        sender: ParticipantId,
        muted: bool,
    ) -> Result<(), RelayError> {
        self.require(room_id)?.set_muted(receiver, sender, muted)
    }

    /// Set deafen state of a participant.
    pub fn set_deafened(
        &self,
        room_id: RoomId,
        participant: ParticipantId,
        deafened: bool,
    ) -> Result<(), RelayError> {
        self.require(room_id)?.set_deafened(participant, deafened)
    }
}
