//! Relay Rooms
//!
//! A [`Room`] owns its participants, their negotiated streams and every
//! downlink. Membership mutations are serialized by one mutex per room and
//! publish an immutable [`RoutingTable`] that the forwarding path loads
//! without locking. Each stream's forwarding state sits behind its own mutex,
//! so packets of one stream are processed in order while other streams
//! proceed in parallel.
//!
//! Lock order: membership, then stream.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, Guard};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vc_common::{MediaKind, MediaKinds, ParticipantId, RoomId};

use super::bwe::ControllerFactory;
use super::dependency::DependencyTracker;
use super::error::RelayError;
use super::feedback::UplinkState;
use super::layers::{CodecNegotiation, LayerGraph};
use super::link::LinkState;
use super::rate_limit::KeyframeRequestLimiter;

/// One sender's stream of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Sending participant.
    pub sender: ParticipantId,
    /// Stream kind.
    pub kind: MediaKind,
}

impl StreamKey {
    /// Create a stream key.
    #[must_use]
    pub const fn new(sender: ParticipantId, kind: MediaKind) -> Self {
        Self { sender, kind }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sender, self.kind)
    }
}

/// What a participant may send and receive.
///
/// Defaults to [`Role::all`]; signaling narrows it for listen-only seats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Kinds the participant may publish.
    #[serde(default)]
    pub send: MediaKinds,
    /// Kinds the participant may subscribe to.
    #[serde(default)]
    pub receive: MediaKinds,
}

impl Role {
    /// Role allowed to send and receive everything.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            send: MediaKinds::all(),
            receive: MediaKinds::all(),
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::all()
    }
}

/// Per-room capacity limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomLimits {
    /// Maximum participants.
    pub max_participants: usize,
    /// Maximum negotiated streams.
    pub max_streams: usize,
}

#[derive(Debug, Default)]
struct Participant {
    role: Role,
    deafened: bool,
    muted: HashSet<ParticipantId>,
}

#[derive(Default)]
struct Membership {
    closed: bool,
    participants: HashMap<ParticipantId, Participant>,
    /// Receivers per stream; may name streams that are not negotiated yet.
    subscriptions: HashMap<StreamKey, BTreeSet<ParticipantId>>,
    streams: HashMap<StreamKey, Arc<Mutex<StreamState>>>,
    graph_versions: u64,
}

/// Forwarding state of one negotiated stream.
pub struct StreamState {
    pub(super) key: StreamKey,
    pub(super) graph: Arc<LayerGraph>,
    pub(super) tracker: DependencyTracker,
    pub(super) uplink: UplinkState,
    pub(super) links: HashMap<ParticipantId, LinkState>,
    /// A receiver is waiting for a keyframe.
    pub(super) keyframe_wanted: bool,
    pub(super) packets_received: u64,
}

impl StreamState {
    fn new(
        key: StreamKey,
        graph: LayerGraph,
        controllers: &ControllerFactory,
        now: Instant,
    ) -> Self {
        Self {
            key,
            graph: Arc::new(graph),
            tracker: DependencyTracker::new(),
            uplink: UplinkState::new(controllers(now), now),
            links: HashMap::new(),
            keyframe_wanted: false,
            packets_received: 0,
        }
    }

    /// Stream identity.
    #[must_use]
    pub const fn key(&self) -> StreamKey {
        self.key
    }

    /// Current layer graph.
    #[must_use]
    pub fn graph(&self) -> &Arc<LayerGraph> {
        &self.graph
    }

    /// Downlinks by receiver.
    #[must_use]
    pub const fn links(&self) -> &HashMap<ParticipantId, LinkState> {
        &self.links
    }

    /// Uplink state of the sender.
    #[must_use]
    pub const fn uplink(&self) -> &UplinkState {
        &self.uplink
    }

    /// Media datagrams accepted on this stream.
    #[must_use]
    pub const fn packets_received(&self) -> u64 {
        self.packets_received
    }

    fn add_link(&mut self, receiver: ParticipantId, controllers: &ControllerFactory, now: Instant) {
        self.links.entry(receiver).or_insert_with(|| {
            LinkState::new(receiver, controllers(now), self.graph.version(), now)
        });
        if self.graph.is_layered() {
            self.keyframe_wanted = true;
        }
    }

    /// Swap in a renegotiated graph. Frame history and layer targets refer
    /// to the old graph and are discarded.
    fn renegotiate(&mut self, graph: LayerGraph) {
        let version = graph.version();
        self.graph = Arc::new(graph);
        self.tracker.reset();
        for link in self.links.values_mut() {
            link.reset_layers(version);
        }
        self.keyframe_wanted = self.graph.is_layered() && !self.links.is_empty();
    }
}

/// Routing view of one stream.
#[derive(Clone)]
pub struct StreamRoute {
    /// Forwarding state.
    pub state: Arc<Mutex<StreamState>>,
    /// Subscribed receivers, never including the sender.
    pub subscribers: Arc<[ParticipantId]>,
}

/// Routing view of one participant.
#[derive(Debug, Clone)]
pub struct ParticipantView {
    /// Send/receive permissions.
    pub role: Role,
    /// Receives no audio at all.
    pub deafened: bool,
    /// Senders whose audio this participant does not receive.
    pub muted: Arc<HashSet<ParticipantId>>,
}

impl ParticipantView {
    /// Whether audio from `sender` reaches this participant.
    #[must_use]
    pub fn hears(&self, sender: ParticipantId) -> bool {
        !self.deafened && !self.muted.contains(&sender)
    }
}

/// Immutable membership snapshot used by the forwarding path.
#[derive(Default)]
pub struct RoutingTable {
    /// Negotiated streams.
    pub streams: HashMap<StreamKey, StreamRoute>,
    /// Joined participants.
    pub participants: HashMap<ParticipantId, ParticipantView>,
}

#[derive(Debug, Clone, Copy)]
struct Presence {
    addr: Option<SocketAddr>,
    last_seen: Instant,
}

/// A relay room.
pub struct Room {
    id: RoomId,
    protocol_version: u8,
    limits: RoomLimits,
    created_at: DateTime<Utc>,
    controllers: ControllerFactory,
    membership: Mutex<Membership>,
    routing: ArcSwap<RoutingTable>,
    presence: DashMap<ParticipantId, Presence>,
    keyframes: KeyframeRequestLimiter,
    relay_sequence: AtomicU32,
}

impl Room {
    /// Create an empty room speaking `protocol_version`.
    #[must_use]
    pub fn new(
        id: RoomId,
        protocol_version: u8,
        limits: RoomLimits,
        controllers: ControllerFactory,
        keyframe_interval: Duration,
    ) -> Self {
        Self {
            id,
            protocol_version,
            limits,
            created_at: Utc::now(),
            controllers,
            membership: Mutex::new(Membership::default()),
            routing: ArcSwap::from_pointee(RoutingTable::default()),
            presence: DashMap::new(),
            keyframes: KeyframeRequestLimiter::new(keyframe_interval),
            relay_sequence: AtomicU32::new(0),
        }
    }

    /// Room id.
    #[must_use]
    pub const fn id(&self) -> RoomId {
        self.id
    }

    /// Protocol version fixed by the first join.
    #[must_use]
    pub const fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the last participant left.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.membership.lock().closed
    }

    /// Load the current routing snapshot.
    #[must_use]
    pub fn routing(&self) -> Guard<Arc<RoutingTable>> {
        self.routing.load()
    }

    /// Limiter for relay-originated keyframe requests.
    #[must_use]
    pub(crate) const fn keyframe_limiter(&self) -> &KeyframeRequestLimiter {
        &self.keyframes
    }

    /// Sequence number for the next relay-originated datagram.
    pub fn next_relay_sequence(&self) -> u32 {
        self.relay_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a participant.
    pub fn join(
        &self,
        participant: ParticipantId,
        role: Role,
        protocol_version: u8,
        now: Instant,
    ) -> Result<(), RelayError> {
        let mut membership = self.membership.lock();
        if membership.closed {
            return Err(RelayError::RoomClosed);
        }
        if protocol_version != self.protocol_version {
            return Err(RelayError::VersionMismatch {
                room: self.protocol_version,
                requested: protocol_version,
            });
        }
        if membership.participants.contains_key(&participant) {
            return Err(RelayError::AlreadyJoined(participant));
        }
        if membership.participants.len() >= self.limits.max_participants {
            return Err(RelayError::RoomFull {
                max_participants: self.limits.max_participants,
            });
        }

        membership.participants.insert(
            participant,
            Participant {
                role,
                ..Participant::default()
            },
        );
        self.presence.insert(
            participant,
            Presence {
                addr: None,
                last_seen: now,
            },
        );
        self.publish(&membership);
        Ok(())
    }

    /// Remove a participant with all its streams, subscriptions and links.
    ///
    /// Returns `true` when the room is now empty and closed.
    pub fn leave(&self, participant: ParticipantId) -> Result<bool, RelayError> {
        let mut membership = self.membership.lock();
        if membership.participants.remove(&participant).is_none() {
            return Err(RelayError::ParticipantNotFound(participant));
        }
        self.presence.remove(&participant);

        let own: Vec<StreamKey> = membership
            .streams
            .keys()
            .filter(|key| key.sender == participant)
            .copied()
            .collect();
        for key in &own {
            membership.streams.remove(key);
            self.keyframes.forget(key);
        }
        membership
            .subscriptions
            .retain(|key, receivers| {
                receivers.remove(&participant);
                key.sender != participant && !receivers.is_empty()
            });
        for other in membership.participants.values_mut() {
            other.muted.remove(&participant);
        }

        let empty = membership.participants.is_empty();
        membership.closed = empty;
        self.publish(&membership);

        // The snapshot no longer routes to the participant; drop its links.
        for stream in membership.streams.values() {
            stream.lock().links.remove(&participant);
        }
        Ok(empty)
    }

    /// Create or replace the layer graph of a sender's stream.
    ///
    /// Returns the new graph version.
    pub fn negotiate_codec(
        &self,
        sender: ParticipantId,
        kind: MediaKind,
        negotiation: CodecNegotiation,
        now: Instant,
    ) -> Result<u64, RelayError> {
        let mut membership = self.membership.lock();
        if membership.closed {
            return Err(RelayError::RoomClosed);
        }
        let participant = membership
            .participants
            .get(&sender)
            .ok_or(RelayError::ParticipantNotFound(sender))?;
        if !participant.role.send.allows(kind) {
            return Err(RelayError::RoleViolation("participant may not send this kind"));
        }

        let key = StreamKey::new(sender, kind);
        let existing = membership.streams.get(&key).cloned();
        if existing.is_none() && membership.streams.len() >= self.limits.max_streams {
            return Err(RelayError::StreamLimitReached {
                max_streams: self.limits.max_streams,
            });
        }

        let version = membership.graph_versions + 1;
        let graph = LayerGraph::new(kind, negotiation, version)?;
        membership.graph_versions = version;

        if let Some(stream) = existing {
            stream.lock().renegotiate(graph);
            debug!(room_id = %self.id, stream = %key, version, "Stream renegotiated");
            return Ok(version);
        }

        let mut state = StreamState::new(key, graph, &self.controllers, now);
        if let Some(receivers) = membership.subscriptions.get(&key) {
            for receiver in receivers {
                state.add_link(*receiver, &self.controllers, now);
            }
        }
        membership.streams.insert(key, Arc::new(Mutex::new(state)));
        self.publish(&membership);
        debug!(room_id = %self.id, stream = %key, version, "Stream negotiated");
        Ok(version)
    }

    /// Subscribe `receiver` to a sender's stream.
    ///
    /// The stream does not have to be negotiated yet. Subscribing twice is a
    /// no-op.
    pub fn subscribe(
        &self,
        receiver: ParticipantId,
        stream: StreamKey,
        now: Instant,
    ) -> Result<(), RelayError> {
        let mut membership = self.membership.lock();
        if membership.closed {
            return Err(RelayError::RoomClosed);
        }
        if receiver == stream.sender {
            return Err(RelayError::InvalidRequest(
                "participants cannot subscribe to their own streams".into(),
            ));
        }
        let receiver_role = membership
            .participants
            .get(&receiver)
            .ok_or(RelayError::ParticipantNotFound(receiver))?
            .role;
        let sender_role = membership
            .participants
            .get(&stream.sender)
            .ok_or(RelayError::ParticipantNotFound(stream.sender))?
            .role;
        if !receiver_role.receive.allows(stream.kind) {
            return Err(RelayError::RoleViolation("participant may not receive this kind"));
        }
        if !sender_role.send.allows(stream.kind) {
            return Err(RelayError::RoleViolation("sender may not send this kind"));
        }

        if !membership
            .subscriptions
            .entry(stream)
            .or_default()
            .insert(receiver)
        {
            return Ok(());
        }
        // Link first, then publish: a routed receiver always has a link.
        if let Some(state) = membership.streams.get(&stream) {
            state.lock().add_link(receiver, &self.controllers, now);
        }
        self.publish(&membership);
        Ok(())
    }

    /// Remove a subscription and its link.
    pub fn unsubscribe(
        &self,
        receiver: ParticipantId,
        stream: StreamKey,
    ) -> Result<(), RelayError> {
        let mut membership = self.membership.lock();
        if !membership.subscriptions.contains_key(&stream)
            && !membership.streams.contains_key(&stream)
        {
            return Err(RelayError::StreamNotFound {
                sender: stream.sender,
                kind: stream.kind,
            });
        }
        let removed = membership
            .subscriptions
            .get_mut(&stream)
            .is_some_and(|receivers| receivers.remove(&receiver));
        if !removed {
            return Err(RelayError::InvalidRequest(format!(
                "participant {receiver} is not subscribed to {stream}"
            )));
        }
        if membership
            .subscriptions
            .get(&stream)
            .is_some_and(BTreeSet::is_empty)
        {
            membership.subscriptions.remove(&stream);
        }
        self.publish(&membership);

        if let Some(state) = membership.streams.get(&stream) {
            state.lock().links.remove(&receiver);
        }
        Ok(())
    }

    /// Set whether `receiver` hears `sender`'s audio.
    pub fn set_muted(
        &self,
        receiver: ParticipantId,
        sender: ParticipantId,
        muted: bool,
    ) -> Result<(), RelayError> {
        let mut membership = self.membership.lock();
        if !membership.participants.contains_key(&sender) {
            return Err(RelayError::ParticipantNotFound(sender));
        }
        let participant = membership
            .participants
            .get_mut(&receiver)
            .ok_or(RelayError::ParticipantNotFound(receiver))?;
        if muted {
            participant.muted.insert(sender);
        } else {
            participant.muted.remove(&sender);
        }
        self.publish(&membership);
        Ok(())
    }

    /// Set whether `participant` receives any audio.
    pub fn set_deafened(
        &self,
        participant: ParticipantId,
        deafened: bool,
    ) -> Result<(), RelayError> {
        let mut membership = self.membership.lock();
        membership
            .participants
            .get_mut(&participant)
            .ok_or(RelayError::ParticipantNotFound(participant))?
            .deafened = deafened;
        self.publish(&membership);
        Ok(())
    }

    /// Note a datagram from `participant`, latching its return address.
    ///
    /// Returns `false` if the participant has not joined.
    pub fn touch(&self, participant: ParticipantId, addr: SocketAddr, now: Instant) -> bool {
        let Some(mut presence) = self.presence.get_mut(&participant) else {
            return false;
        };
        if presence.addr != Some(addr) {
            debug!(room_id = %self.id, participant_id = %participant, %addr, "Address latched");
            presence.addr = Some(addr);
        }
        presence.last_seen = now;
        true
    }

    /// Latched return address of a participant.
    #[must_use]
    pub fn address_of(&self, participant: ParticipantId) -> Option<SocketAddr> {
        self.presence.get(&participant).and_then(|presence| presence.addr)
    }

    /// Participants silent for longer than `timeout`.
    #[must_use]
    pub fn inactive_participants(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        self.presence
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of joined participants.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.routing.load().participants.len()
    }

    /// Number of negotiated streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.routing.load().streams.len()
    }

    fn publish(&self, membership: &Membership) {
        let streams = membership
            .streams
            .iter()
            .map(|(key, state)| {
                let subscribers: Arc<[ParticipantId]> = membership
                    .subscriptions
                    .get(key)
                    .map(|receivers| receivers.iter().copied().collect())
                    .unwrap_or_default();
                (
                    *key,
                    StreamRoute {
                        state: Arc::clone(state),
                        subscribers,
                    },
                )
            })
            .collect();
        let participants = membership
            .participants
            .iter()
            .map(|(id, participant)| {
                (
                    *id,
                    ParticipantView {
                        role: participant.role,
                        deafened: participant.deafened,
                        muted: Arc::new(participant.muted.clone()),
                    },
                )
            })
            .collect();
        self.routing.store(Arc::new(RoutingTable {
            streams,
            participants,
        }));
    }
}
