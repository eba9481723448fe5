//! Selective Forwarding Unit
//!
//! Entry point of the relay core: applies signaling events, handles inbound
//! datagrams and runs the periodic feedback tick. Performs no I/O itself;
//! callers deliver the returned [`Egress`] datagrams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};
use vc_common::protocol::{Datagram, FeedbackMessage, PacketType};
use vc_common::{ParticipantId, RoomId};

use super::bwe::{gcc_factory, ControllerFactory};
use super::error::RelayError;
use super::feedback;
use super::forwarder::{self, Egress, Outcome};
use super::registry::Registry;
use super::room::{Room, RoomLimits, StreamKey};
use super::selector::LayerSelector;
use super::signaling::SignalingEvent;
use super::stats::{RelayStats, RoomStats, RoomSummary};
use crate::config::Config;
use crate::metrics::{DropReason, RelayMetrics};

/// The relay core.
pub struct SfuServer {
    config: Arc<Config>,
    registry: Registry,
    selector: LayerSelector,
    metrics: RelayMetrics,
    started_at: DateTime<Utc>,
}

impl SfuServer {
    /// Create a relay using the delay-gradient estimator.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let controllers = gcc_factory(config.estimator, config.feedback_timeout);
        Self::with_controller_factory(config, controllers)
    }

    /// Create a relay with a custom congestion controller per link.
    #[must_use]
    pub fn with_controller_factory(config: Arc<Config>, controllers: ControllerFactory) -> Self {
        let registry = Registry::new(
            config.max_rooms,
            RoomLimits {
                max_participants: config.max_participants_per_room,
                max_streams: config.max_streams_per_room,
            },
            controllers,
            config.keyframe_request_interval,
        );

        info!(
            max_rooms = config.max_rooms,
            feedback_timeout_ms = config.feedback_timeout.as_millis() as u64,
            "SFU server initialized"
        );

        Self {
            selector: LayerSelector::new(config.hysteresis),
            config,
            registry,
            metrics: RelayMetrics::new(),
            started_at: Utc::now(),
        }
    }

    /// Relay configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Room registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hot-path counters.
    #[must_use]
    pub const fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Apply a signaling event.
    pub fn apply(&self, event: SignalingEvent, now: Instant) -> Result<(), RelayError> {
        let room_id = event.room_id();
        let result = match event {
            SignalingEvent::Join {
                participant_id,
                role,
                protocol_version,
                ..
            } => self
                .registry
                .join(room_id, participant_id, role, protocol_version, now)
                .map(|()| {
                    info!(
                        room_id = %room_id,
                        participant_id = %participant_id,
                        "Participant joined"
                    );
                }),
            SignalingEvent::Leave { participant_id, .. } => self
                .registry
                .leave(room_id, participant_id)
                .map(|()| {
                    info!(room_id = %room_id, participant_id = %participant_id, "Participant left");
                }),
            SignalingEvent::NegotiateCodec {
                sender_id,
                kind,
                negotiation,
                ..
            } => self
                .registry
                .negotiate_codec(room_id, sender_id, kind, negotiation, now)
                .map(|version| {
                    info!(
                        room_id = %room_id,
                        sender_id = %sender_id,
                        %kind,
                        version,
                        "Codec negotiated"
                    );
                }),
            SignalingEvent::Subscribe {
                receiver_id,
                sender_id,
                kind,
                ..
            } => self
                .registry
                .subscribe(room_id, receiver_id, StreamKey::new(sender_id, kind), now)
                .map(|()| {
                    debug!(
                        room_id = %room_id,
                        receiver_id = %receiver_id,
                        sender_id = %sender_id,
                        %kind,
                        "Subscribed"
                    );
                }),
            SignalingEvent::Unsubscribe {
                receiver_id,
                sender_id,
                kind,
                ..
            } => self
                .registry
                .unsubscribe(room_id, receiver_id, StreamKey::new(sender_id, kind))
                .map(|()| {
                    debug!(
                        room_id = %room_id,
                        receiver_id = %receiver_id,
                        sender_id = %sender_id,
                        %kind,
                        "Unsubscribed"
                    );
                }),
            SignalingEvent::SetMuted {
                receiver_id,
                sender_id,
                muted,
                ..
            } => self
                .registry
                .set_muted(room_id, receiver_id, sender_id, muted),
            SignalingEvent::SetDeafened {
                participant_id,
                deafened,
                ..
            } => self
                .registry
                .set_deafened(room_id, participant_id, deafened),
        };

        if let Err(e) = &result {
            debug!(room_id = %room_id, error = %e, "Signaling event rejected");
        }
        result
    }

    /// Handle one inbound datagram from `from`.
    ///
    /// Never fails: anything that cannot be relayed is counted and dropped.
    pub fn handle_datagram(&self, bytes: Bytes, from: SocketAddr, now: Instant) -> Vec<Egress> {
        self.metrics.record_received(bytes.len());
        let raw = bytes.clone();

        let datagram = match Datagram::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                trace!(%from, error = %e, "Malformed datagram");
                let reason = match e {
                    vc_common::Error::UnsupportedVersion(_) => DropReason::VersionMismatch,
                    _ => DropReason::Malformed,
                };
                self.metrics.record_drop(reason);
                return Vec::new();
            }
        };
        let header = datagram.header;

        let result = self.dispatch(&datagram, &raw, from, now);
        match result {
            Ok(outcome) => {
                if header.packet_type == PacketType::Feedback {
                    self.metrics.record_feedback_received();
                }
                self.record_outcome(&outcome);
                outcome.egress
            }
            Err(reason) => {
                trace!(
                    room_id = %header.room_id,
                    sender_id = %header.sender_id,
                    ?reason,
                    "Datagram dropped"
                );
                self.metrics.record_drop(reason);
                Vec::new()
            }
        }
    }

    fn dispatch(
        &self,
        datagram: &Datagram,
        raw: &Bytes,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Outcome, DropReason> {
        let header = &datagram.header;
        if header.sender_id.is_relay() {
            return Err(DropReason::UnknownSender);
        }
        let room = self
            .registry
            .room(header.room_id)
            .ok_or(DropReason::UnknownRoom)?;
        if header.version != room.protocol_version() {
            return Err(DropReason::VersionMismatch);
        }
        if !room.touch(header.sender_id, from, now) {
            return Err(DropReason::UnknownSender);
        }

        match header.packet_type {
            PacketType::Feedback => feedback::route(&room, datagram, raw, &self.selector, now),
            PacketType::Audio | PacketType::Video | PacketType::Screen | PacketType::Fec => {
                forwarder::forward(&room, datagram, raw, &self.selector, now)
            }
        }
    }

    fn record_outcome(&self, outcome: &Outcome) {
        // Relay-originated requests are appended after the forwarded copies.
        let copies = outcome.egress.len() - outcome.keyframe_requests;
        let bytes = outcome.egress[..copies]
            .iter()
            .map(|e| e.payload.len())
            .sum();
        self.metrics.record_forwarded(copies, bytes);
        self.metrics.record_layer_drops(outcome.withheld);
        self.metrics.record_keyframe_requests(outcome.keyframe_requests);
        self.metrics.record_feedback_sent(outcome.keyframe_requests);
    }

    /// Periodic maintenance, run every feedback interval.
    ///
    /// Tears down silent participants, reports uplink arrivals to senders,
    /// decays links without feedback, re-runs layer selection and sends
    /// pending keyframe requests.
    pub fn on_tick(&self, now: Instant) -> Vec<Egress> {
        let mut egress = Vec::new();
        for room in self.registry.rooms() {
            self.expire_participants(&room, now);
            if room.is_closed() {
                continue;
            }
            self.tick_room(&room, now, &mut egress);
            room.keyframe_limiter().cleanup(now);
        }
        egress
    }

    fn expire_participants(&self, room: &Room, now: Instant) {
        for participant in room.inactive_participants(now, self.config.participant_timeout) {
            if self.registry.leave(room.id(), participant).is_ok() {
                self.metrics.record_timeout();
                info!(
                    room_id = %room.id(),
                    participant_id = %participant,
                    "Participant timed out"
                );
            }
        }
    }

    fn tick_room(&self, room: &Room, now: Instant, egress: &mut Vec<Egress>) {
        let mut reports = 0;
        let mut keyframes = 0;
        let routing = room.routing();
        for route in routing.streams.values() {
            let mut stream = route.state.lock();
            let key = stream.key;

            if let Some(report) = stream.uplink.take_report(now) {
                let message = FeedbackMessage::Congestion {
                    media_sender: key.sender,
                    kind: key.kind,
                    report,
                };
                if let Some(datagram) = feedback::relay_feedback(room, key.sender, &message) {
                    egress.push(datagram);
                    reports += 1;
                }
            }

            let graph = Arc::clone(&stream.graph);
            let mut wants_keyframe = false;
            for link in stream.links.values_mut() {
                let before = link.estimate();
                let after = link.on_tick(now);
                if after < before {
                    debug!(
                        room_id = %room.id(),
                        stream = %key,
                        receiver = %link.receiver(),
                        estimate = %after,
                        "Link estimate decayed"
                    );
                }
                wants_keyframe |= self.selector.update(link, &graph).request_keyframe;
            }
            stream.keyframe_wanted |= wants_keyframe;

            if let Some(request) = feedback::request_keyframe_if_wanted(room, &mut stream, now) {
                egress.push(request);
                keyframes += 1;
            }
        }

        self.metrics.record_feedback_sent(reports + keyframes);
        self.metrics.record_keyframe_requests(keyframes);
    }

    /// Latched address of a participant.
    #[must_use]
    pub fn resolve(&self, room_id: RoomId, participant: ParticipantId) -> Option<SocketAddr> {
        self.registry.room(room_id)?.address_of(participant)
    }

    /// Relay-wide statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let rooms = self.registry.rooms();
        let room_summaries: Vec<RoomSummary> =
            rooms.iter().map(|room| RoomSummary::collect(room)).collect();
        RelayStats {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            rooms: room_summaries.len(),
            participants: room_summaries.iter().map(|room| room.participants).sum(),
            metrics: self.metrics.snapshot(),
            room_summaries,
        }
    }

    /// Detailed statistics of one room.
    pub fn room_stats(&self, room_id: RoomId) -> Result<RoomStats, RelayError> {
        self.registry.require(room_id).map(|room| RoomStats::collect(&room))
    }
}
