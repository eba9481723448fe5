//! Relay Signaling Errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use vc_common::{MediaKind, ParticipantId, RoomId};

/// Errors surfaced to the signaling collaborator.
///
/// Hot-path datagram problems never become a `RelayError`; they are counted
/// as a [`DropReason`](crate::metrics::DropReason) instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The relay already hosts the maximum number of rooms.
    #[error("Room limit reached (max: {max_rooms})")]
    RoomLimitReached {
        /// Maximum allowed rooms.
        max_rooms: usize,
    },

    /// The room already holds the maximum number of participants.
    #[error("Room is full (max: {max_participants})")]
    RoomFull {
        /// Maximum allowed participants.
        max_participants: usize,
    },

    /// The room already holds the maximum number of streams.
    #[error("Stream limit reached (max: {max_streams})")]
    StreamLimitReached {
        /// Maximum allowed streams.
        max_streams: usize,
    },

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Participant not found.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    /// Stream not found.
    #[error("Stream not found: {sender}/{kind}")]
    StreamNotFound {
        /// Sending participant.
        sender: ParticipantId,
        /// Stream kind.
        kind: MediaKind,
    },

    /// Participant already joined the room.
    #[error("Participant already joined: {0}")]
    AlreadyJoined(ParticipantId),

    /// Join used a protocol version other than the room's.
    #[error("Protocol version {requested} does not match room version {room}")]
    VersionMismatch {
        /// Version the room was created with.
        room: u8,
        /// Version the joiner asked for.
        requested: u8,
    },

    /// The relay does not speak this protocol version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The room was torn down while the operation was in flight.
    #[error("Room closed")]
    RoomClosed,

    /// Participant role does not allow the operation.
    #[error("Role does not allow {0}")]
    RoleViolation(&'static str),

    /// Codec negotiation rejected.
    #[error("Invalid negotiation: {0}")]
    InvalidNegotiation(String),

    /// Malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::RoomLimitReached { .. } => (StatusCode::SERVICE_UNAVAILABLE, "ROOM_LIMIT"),
            Self::RoomFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "ROOM_FULL"),
            Self::StreamLimitReached { .. } => (StatusCode::SERVICE_UNAVAILABLE, "STREAM_LIMIT"),
            Self::RoomNotFound(_) => (StatusCode::NOT_FOUND, "ROOM_NOT_FOUND"),
            Self::ParticipantNotFound(_) => (StatusCode::NOT_FOUND, "PARTICIPANT_NOT_FOUND"),
            Self::StreamNotFound { .. } => (StatusCode::NOT_FOUND, "STREAM_NOT_FOUND"),
            Self::AlreadyJoined(_) => (StatusCode::CONFLICT, "ALREADY_JOINED"),
            Self::VersionMismatch { .. } => (StatusCode::CONFLICT, "VERSION_MISMATCH"),
            Self::RoomClosed => (StatusCode::CONFLICT, "ROOM_CLOSED"),
            Self::UnsupportedVersion(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED_VERSION"),
            Self::RoleViolation(_) => (StatusCode::BAD_REQUEST, "ROLE_VIOLATION"),
            Self::InvalidNegotiation(_) => (StatusCode::BAD_REQUEST, "INVALID_NEGOTIATION"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        };

        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "code": code,
        }));

        (status, body).into_response()
    }
}
