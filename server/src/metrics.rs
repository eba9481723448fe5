//! Hot-path relay counters.
//!
//! Plain atomics, bumped per datagram and read by `/stats`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Why a datagram (or one of its per-receiver copies) was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Header, descriptor or feedback failed to decode.
    Malformed,
    /// Room id is not active.
    UnknownRoom,
    /// Sender is not a participant of the room.
    UnknownSender,
    /// Header version differs from the room's protocol version.
    VersionMismatch,
    /// Sender's role does not allow sending this kind.
    RoleViolation,
    /// No codec has been negotiated for the stream.
    NotNegotiated,
    /// Header codec differs from the negotiated codec.
    CodecMismatch,
    /// Layered packet without a dependency descriptor.
    MissingDescriptor,
    /// Descriptor contradicts the negotiated layer graph.
    DependencyMismatch,
    /// Feedback about a stream the reporter is not subscribed to.
    NotSubscribed,
    /// Worker queue was full.
    QueueFull,
}

impl DropReason {
    const COUNT: usize = 11;

    const ALL: [Self; Self::COUNT] = [
        Self::Malformed,
        Self::UnknownRoom,
        Self::UnknownSender,
        Self::VersionMismatch,
        Self::RoleViolation,
        Self::NotNegotiated,
        Self::CodecMismatch,
        Self::MissingDescriptor,
        Self::DependencyMismatch,
        Self::NotSubscribed,
        Self::QueueFull,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Relay-wide counters.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    datagrams_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    layer_drops: AtomicU64,
    feedback_received: AtomicU64,
    feedback_sent: AtomicU64,
    keyframe_requests_sent: AtomicU64,
    participants_timed_out: AtomicU64,
    drops: [AtomicU64; DropReason::COUNT],
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Datagrams read from the socket.
    pub datagrams_received: u64,
    /// Bytes read from the socket.
    pub bytes_received: u64,
    /// Per-receiver copies emitted.
    pub packets_forwarded: u64,
    /// Bytes emitted in forwarded copies.
    pub bytes_forwarded: u64,
    /// Per-receiver copies withheld because the layer exceeded the target.
    pub layer_drops: u64,
    /// Feedback datagrams accepted.
    pub feedback_received: u64,
    /// Relay-originated feedback datagrams.
    pub feedback_sent: u64,
    /// Relay-originated keyframe requests.
    pub keyframe_requests_sent: u64,
    /// Participants torn down for inactivity.
    pub participants_timed_out: u64,
    /// Rejected datagrams by reason.
    pub drops: BTreeMap<DropReason, u64>,
}

impl RelayMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an inbound datagram.
    pub fn record_received(&self, len: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Count emitted copies.
    pub fn record_forwarded(&self, packets: usize, bytes: usize) {
        self.packets_forwarded
            .fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count copies withheld by layer selection.
    pub fn record_layer_drops(&self, count: usize) {
        self.layer_drops.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count an accepted feedback datagram.
    pub fn record_feedback_received(&self) {
        self.feedback_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count relay-originated feedback.
    pub fn record_feedback_sent(&self, count: usize) {
        self.feedback_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count relay-originated keyframe requests.
    pub fn record_keyframe_requests(&self, count: usize) {
        self.keyframe_requests_sent
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count a participant torn down for inactivity.
    pub fn record_timeout(&self) {
        self.participants_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejected datagram.
    pub fn record_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of datagrams rejected for `reason`.
    #[must_use]
    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            layer_drops: self.layer_drops.load(Ordering::Relaxed),
            feedback_received: self.feedback_received.load(Ordering::Relaxed),
            feedback_sent: self.feedback_sent.load(Ordering::Relaxed),
            keyframe_requests_sent: self.keyframe_requests_sent.load(Ordering::Relaxed),
            participants_timed_out: self.participants_timed_out.load(Ordering::Relaxed),
            drops: DropReason::ALL
                .iter()
                .map(|reason| (*reason, self.drops(*reason)))
                .filter(|(_, count)| *count > 0)
                .collect(),
        }
    }
}
