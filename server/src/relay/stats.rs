//! Relay statistics types.
//!
//! Snapshots served by the control API. Collecting them takes each stream
//! lock briefly; they are not meant for the hot path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use vc_common::{CodecId, LayerId, MediaKind, ParticipantId, RoomId};

use super::bwe::Bitrate;
use super::link::LinkState;
use super::room::{Room, StreamState};
use crate::metrics::MetricsSnapshot;

/// Relay-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    /// When the relay started.
    pub started_at: DateTime<Utc>,
    /// Seconds since start.
    pub uptime_secs: i64,
    /// Active rooms.
    pub rooms: usize,
    /// Joined participants across all rooms.
    pub participants: usize,
    /// Hot-path counters.
    pub metrics: MetricsSnapshot,
    /// One summary per room.
    pub room_summaries: Vec<RoomSummary>,
}

/// Short per-room summary.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    /// Room id.
    pub room_id: RoomId,
    /// Joined participants.
    pub participants: usize,
    /// Negotiated streams.
    pub streams: usize,
}

/// Detailed statistics of one room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    /// Room id.
    pub room_id: RoomId,
    /// Protocol version of the room.
    pub protocol_version: u8,
    /// When the room was created.
    pub created_at: DateTime<Utc>,
    /// Joined participants, sorted.
    pub participants: Vec<ParticipantId>,
    /// Negotiated streams, sorted by sender and kind.
    pub streams: Vec<StreamStats>,
}

/// Statistics of one negotiated stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    /// Sending participant.
    pub sender: ParticipantId,
    /// Stream kind.
    pub kind: MediaKind,
    /// Negotiated codec.
    pub codec: CodecId,
    /// Layer graph version.
    pub graph_version: u64,
    /// Media datagrams accepted.
    pub packets_received: u64,
    /// Estimated bandwidth of the sender's uplink.
    pub uplink_estimate_bps: Bitrate,
    /// One entry per subscribed receiver, sorted.
    pub links: Vec<LinkStats>,
}

/// Statistics of one downlink.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStats {
    /// Receiving participant.
    pub receiver: ParticipantId,
    /// Current bandwidth estimate.
    pub estimate_bps: Bitrate,
    /// Layer being forwarded.
    pub current_layer: Option<LayerId>,
    /// Spatial switch waiting for a switch point.
    pub pending_layer: Option<LayerId>,
    /// Copies forwarded.
    pub packets_forwarded: u64,
    /// Copies withheld by layer selection.
    pub packets_dropped: u64,
}

impl From<&LinkState> for LinkStats {
    fn from(link: &LinkState) -> Self {
        Self {
            receiver: link.receiver(),
            estimate_bps: link.estimate(),
            current_layer: link.current,
            pending_layer: link.pending,
            packets_forwarded: link.packets_forwarded,
            packets_dropped: link.packets_dropped,
        }
    }
}

impl From<&StreamState> for StreamStats {
    fn from(stream: &StreamState) -> Self {
        let key = stream.key();
        let mut links: Vec<LinkStats> = stream.links().values().map(LinkStats::from).collect();
        links.sort_by_key(|link| link.receiver);
        Self {
            sender: key.sender,
            kind: key.kind,
            codec: stream.graph().codec(),
            graph_version: stream.graph().version(),
            packets_received: stream.packets_received(),
            uplink_estimate_bps: stream.uplink().estimate(),
            links,
        }
    }
}

impl RoomSummary {
    /// Summarize a room.
    #[must_use]
    pub fn collect(room: &Room) -> Self {
        let routing = room.routing();
        Self {
            room_id: room.id(),
            participants: routing.participants.len(),
            streams: routing.streams.len(),
        }
    }
}

impl RoomStats {
    /// Collect detailed statistics of a room.
    #[must_use]
    pub fn collect(room: &Room) -> Self {
        let routing = room.routing();
        let mut participants: Vec<ParticipantId> = routing.participants.keys().copied().collect();
        participants.sort_unstable();

        let mut streams: Vec<StreamStats> = routing
            .streams
            .values()
            .map(|route| StreamStats::from(&*route.state.lock()))
            .collect();
        streams.sort_by_key(|stream| (stream.sender, stream.kind));

        Self {
            room_id: room.id(),
            protocol_version: room.protocol_version(),
            created_at: room.created_at(),
            participants,
            streams,
        }
    }
}
