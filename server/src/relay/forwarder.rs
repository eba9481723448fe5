//! Forwarding Engine
//!
//! The per-datagram hot path. Works on one routing snapshot and one stream
//! lock; never blocks and never touches the payload. Every emitted copy is
//! the received datagram, byte for byte.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};
use vc_common::protocol::{Datagram, PacketType};
use vc_common::{ParticipantId, RoomId};

use super::dependency::{DependencyTracker, PacketInfo};
use super::link::LinkState;
use super::room::{Room, RoutingTable, StreamKey, StreamRoute, StreamState};
use super::selector::LayerSelector;
use crate::metrics::DropReason;

/// A datagram to send to one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Egress {
    /// Room the receiver belongs to.
    pub room: RoomId,
    /// Receiving participant.
    pub to: ParticipantId,
    /// Encoded datagram.
    pub payload: Bytes,
}

/// Result of handling one inbound datagram.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Datagrams to send.
    pub egress: Vec<Egress>,
    /// Copies withheld because their layer exceeded the receiver's target.
    pub withheld: usize,
    /// Relay-originated keyframe requests among `egress`.
    pub keyframe_requests: usize,
}

/// Forward a media datagram to the stream's subscribers.
pub(crate) fn forward(
    room: &Room,
    datagram: &Datagram,
    raw: &Bytes,
    selector: &LayerSelector,
    now: Instant,
) -> Result<Outcome, DropReason> {
    let header = &datagram.header;
    let kind = header.media_kind().ok_or(DropReason::Malformed)?;

    let routing = room.routing();
    let sender = routing
        .participants
        .get(&header.sender_id)
        .ok_or(DropReason::UnknownSender)?;
    if !sender.role.send.allows(kind) {
        return Err(DropReason::RoleViolation);
    }
    let key = StreamKey::new(header.sender_id, kind);
    let route = routing.streams.get(&key).ok_or(DropReason::NotNegotiated)?;

    let mut stream = route.state.lock();
    if header.codec != stream.graph.codec() {
        return Err(DropReason::CodecMismatch);
    }

    let mut outcome = Outcome::default();
    match header.packet_type {
        PacketType::Audio => {
            stream.uplink.record(header, raw.len(), now);
            forward_audio(
                room.id(),
                &routing,
                route,
                &mut stream,
                header.sequence,
                raw,
                now,
                &mut outcome,
            );
        }
        PacketType::Video | PacketType::Screen => {
            let descriptor = datagram
                .descriptor
                .as_ref()
                .ok_or(DropReason::MissingDescriptor)?;
            let graph = Arc::clone(&stream.graph);
            let info = stream
                .tracker
                .observe(header.layer, descriptor, &graph)
                .map_err(|e| {
                    trace!(room_id = %room.id(), stream = %key, error = %e, "Descriptor rejected");
                    DropReason::DependencyMismatch
                })?;
            stream.uplink.record(header, raw.len(), now);
            forward_layered(
                room.id(),
                route,
                &mut stream,
                &info,
                selector,
                header.sequence,
                raw,
                now,
                &mut outcome,
            );
        }
        PacketType::Fec => {
            let layer = header.layer;
            let StreamState { links, .. } = &mut *stream;
            for receiver in route.subscribers.iter() {
                let Some(link) = links.get_mut(receiver) else {
                    continue;
                };
                if link.current.is_some_and(|current| layer.fits_within(current)) {
                    emit(room.id(), link, header.sequence, raw, now, &mut outcome);
                } else {
                    withhold(link, &mut outcome);
                }
            }
        }
        PacketType::Feedback => return Err(DropReason::Malformed),
    }
    stream.packets_received += 1;
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn forward_audio(
    room: RoomId,
    routing: &RoutingTable,
    route: &StreamRoute,
    stream: &mut StreamState,
    sequence: u32,
    raw: &Bytes,
    now: Instant,
    outcome: &mut Outcome,
) {
    let sender = stream.key.sender;
    for receiver in route.subscribers.iter() {
        let hears = routing
            .participants
            .get(receiver)
            .is_some_and(|view| view.hears(sender));
        if !hears {
            continue;
        }
        if let Some(link) = stream.links.get_mut(receiver) {
            emit(room, link, sequence, raw, now, outcome);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn forward_layered(
    room: RoomId,
    route: &StreamRoute,
    stream: &mut StreamState,
    info: &PacketInfo,
    selector: &LayerSelector,
    sequence: u32,
    raw: &Bytes,
    now: Instant,
    outcome: &mut Outcome,
) {
    let StreamState {
        key,
        graph,
        tracker,
        links,
        ..
    } = stream;
    for receiver in route.subscribers.iter() {
        let Some(link) = links.get_mut(receiver) else {
            continue;
        };
        if link.current.is_none() && link.pending.is_none() {
            selector.update(link, graph);
        }
        commit_at_switch_point(room, *key, tracker, info, link);

        if link.current.is_some_and(|current| info.layer.fits_within(current)) {
            emit(room, link, sequence, raw, now, outcome);
        } else {
            withhold(link, outcome);
        }
    }
}

fn commit_at_switch_point(
    room: RoomId,
    key: StreamKey,
    tracker: &DependencyTracker,
    info: &PacketInfo,
    link: &mut LinkState,
) {
    let Some(target) = link.pending else {
        return;
    };
    if !tracker.is_switch_point(info, link.current, target) {
        return;
    }
    debug!(
        room_id = %room,
        stream = %key,
        receiver = %link.receiver(),
        from = ?link.current,
        to = %target,
        frame = info.frame,
        "Layer switched"
    );
    link.current = Some(target);
    link.pending = None;
}

fn emit(
    room: RoomId,
    link: &mut LinkState,
    sequence: u32,
    raw: &Bytes,
    now: Instant,
    outcome: &mut Outcome,
) {
    link.record_sent(sequence, now, raw.len());
    outcome.egress.push(Egress {
        room,
        to: link.receiver(),
        payload: raw.clone(),
    });
}

fn withhold(link: &mut LinkState, outcome: &mut Outcome) {
    link.packets_dropped += 1;
    outcome.withheld += 1;
}

