//! Signaling events consumed from the external signaling service.

use serde::{Deserialize, Serialize};
use vc_common::protocol::PROTOCOL_VERSION;
use vc_common::{MediaKind, ParticipantId, RoomId};

use super::layers::CodecNegotiation;
use super::room::Role;

const fn default_protocol_version() -> u8 {
    PROTOCOL_VERSION
}

/// Membership and negotiation events.
///
/// Authentication happens before an event reaches the relay; ids are trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEvent {
    /// Participant joins a room, creating it if needed.
    Join {
        room_id: RoomId,
        participant_id: ParticipantId,
        #[serde(default = "Role::all")]
        role: Role,
        #[serde(default = "default_protocol_version")]
        protocol_version: u8,
    },
    /// Participant leaves; the room closes with its last participant.
    Leave {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    /// Sender (re)negotiates the codec and layers of one of its streams.
    NegotiateCodec {
        room_id: RoomId,
        sender_id: ParticipantId,
        kind: MediaKind,
        #[serde(flatten)]
        negotiation: CodecNegotiation,
    },
    /// Receiver subscribes to a sender's stream.
    Subscribe {
        room_id: RoomId,
        receiver_id: ParticipantId,
        sender_id: ParticipantId,
        kind: MediaKind,
    },
    /// Receiver drops a subscription.
    Unsubscribe {
        room_id: RoomId,
        receiver_id: ParticipantId,
        sender_id: ParticipantId,
        kind: MediaKind,
    },
    /// Receiver mutes or unmutes one sender's audio.
    SetMuted {
        room_id: RoomId,
        receiver_id: ParticipantId,
        sender_id: ParticipantId,
        muted: bool,
    },
    /// Participant stops or resumes receiving all audio.
    SetDeafened {
        room_id: RoomId,
        participant_id: ParticipantId,
        deafened: bool,
    },
}

impl SignalingEvent {
    /// Room the event applies to.
    #[must_use]
    pub const fn room_id(&self) -> RoomId {
        match self {
            Self::Join { room_id, .. }
            | Self::Leave { room_id, .. }
            | Self::NegotiateCodec { room_id, .. }
            | Self::Subscribe { room_id, .. }
            | Self::Unsubscribe { room_id, .. }
            | Self::SetMuted { room_id, .. }
            | Self::SetDeafened { room_id, .. } => *room_id,
        }
    }
}
