//! Downlink state: one per (receiver, stream) subscription.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use vc_common::protocol::CongestionReport;
use vc_common::{LayerId, ParticipantId};

use super::bwe::{Bitrate, CongestionController, PacketResult};

/// Forwarded packets remembered per link for matching congestion reports.
pub const SENT_HISTORY: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct SentPacket {
    sent_at: Instant,
    size: usize,
}

/// Send times of packets the relay actually forwarded on a link.
///
/// Congestion reports from the receiver are interpreted against this
/// history, so packets withheld by layer selection never count as loss.
#[derive(Debug)]
pub struct SentHistory {
    packets: HashMap<u32, SentPacket>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl SentHistory {
    /// Create a history holding at most `capacity` packets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember a forwarded packet, evicting the oldest when full.
    pub fn record(&mut self, sequence: u32, sent_at: Instant, size: usize) {
        if self
            .packets
            .insert(sequence, SentPacket { sent_at, size })
            .is_none()
        {
            self.order.push_back(sequence);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.packets.remove(&oldest);
            }
        }
    }

    /// Number of remembered packets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Match a report against forwarded packets.
    ///
    /// Sequence numbers the relay never sent on this link are skipped.
    /// Matched packets are consumed, so a repeated report is not counted twice.
    pub fn resolve(&mut self, report: &CongestionReport, epoch: Instant) -> Vec<PacketResult> {
        report
            .arrivals()
            .filter_map(|(sequence, arrival_us)| {
                let sent = self.packets.remove(&sequence)?;
                Some(PacketResult {
                    sequence,
                    send_time_us: sent.sent_at.saturating_duration_since(epoch).as_micros() as i64,
                    arrival_us,
                    size: sent.size,
                })
            })
            .collect()
    }
}

/// Estimator and layer target of one downlink.
pub struct LinkState {
    receiver: ParticipantId,
    controller: Box<dyn CongestionController>,
    sent: SentHistory,
    epoch: Instant,
    /// Layer currently forwarded; `None` until the first switch point.
    pub current: Option<LayerId>,
    /// Spatial switch waiting for a switch point.
    pub pending: Option<LayerId>,
    /// Layer graph version the layers above refer to.
    pub graph_version: u64,
    /// Copies forwarded on this link.
    pub packets_forwarded: u64,
    /// Copies withheld by layer selection.
    pub packets_dropped: u64,
    last_feedback: Option<Instant>,
}

impl std::fmt::Debug for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkState")
            .field("receiver", &self.receiver)
            .field("estimate", &self.controller.estimate())
            .field("current", &self.current)
            .field("pending", &self.pending)
            .field("graph_version", &self.graph_version)
            .finish_non_exhaustive()
    }
}

impl LinkState {
    /// Create a link with a fresh controller.
    #[must_use]
    pub fn new(
        receiver: ParticipantId,
        controller: Box<dyn CongestionController>,
        graph_version: u64,
        now: Instant,
    ) -> Self {
        Self {
            receiver,
            controller,
            sent: SentHistory::new(SENT_HISTORY),
            epoch: now,
            current: None,
            pending: None,
            graph_version,
            packets_forwarded: 0,
            packets_dropped: 0,
            last_feedback: None,
        }
    }

    /// Receiving participant.
    #[must_use]
    pub const fn receiver(&self) -> ParticipantId {
        self.receiver
    }

    /// Current bandwidth estimate.
    #[must_use]
    pub fn estimate(&self) -> Bitrate {
        self.controller.estimate()
    }

    /// When the receiver last sent usable feedback.
    #[must_use]
    pub const fn last_feedback(&self) -> Option<Instant> {
        self.last_feedback
    }

    /// Drop the layer state after the stream was renegotiated.
    pub fn reset_layers(&mut self, graph_version: u64) {
        self.current = None;
        self.pending = None;
        self.graph_version = graph_version;
    }

    /// Remember a forwarded copy.
    pub fn record_sent(&mut self, sequence: u32, now: Instant, size: usize) {
        self.sent.record(sequence, now, size);
        self.packets_forwarded += 1;
    }

    /// Feed a congestion report from the receiver.
    pub fn on_congestion_report(&mut self, report: &CongestionReport, now: Instant) -> Bitrate {
        let results = self.sent.resolve(report, self.epoch);
        self.last_feedback = Some(now);
        self.controller.ingest(&results, now)
    }

    /// Feed a receiver-computed maximum rate.
    pub fn on_receiver_estimate(&mut self, bitrate: Bitrate, now: Instant) -> Bitrate {
        self.last_feedback = Some(now);
        self.controller.ingest_receiver_estimate(bitrate, now)
    }

    /// Periodic estimator maintenance.
    pub fn on_tick(&mut self, now: Instant) -> Bitrate {
        self.controller.on_tick(now)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vc_common::protocol::PacketStatus;

    use super::*;
    use crate::config::EstimatorConfig;
    use crate::relay::bwe::GccEstimator;

    fn link(now: Instant) -> LinkState {
        LinkState::new(
            ParticipantId(2),
            Box::new(GccEstimator::new(
                EstimatorConfig::default(),
                Duration::from_millis(500),
                now,
            )),
            1,
            now,
        )
    }

    #[test]
    fn test_history_evicts_oldest() {
        let now = Instant::now();
        let mut history = SentHistory::new(2);
        history.record(1, now, 100);
        history.record(2, now, 100);
        history.record(3, now, 100);
        assert_eq!(history.len(), 2);

        let report = CongestionReport {
            base_sequence: 1,
            reference_time_ms: 0,
            statuses: vec![PacketStatus::Received { delta_us: 0 }; 3],
        };
        let resolved: Vec<_> = history
            .resolve(&report, now)
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(resolved, vec![2, 3]);
        assert!(history.is_empty());
    }

    #[test]
    fn test_withheld_layers_are_not_loss() {
        let now = Instant::now();
        let mut link = link(now);
        // Only even sequence numbers were forwarded; odd ones were withheld.
        for seq in (0..20).step_by(2) {
            link.record_sent(seq, now + Duration::from_millis(u64::from(seq) * 10), 1000);
        }
        let statuses = (0..20)
            .map(|seq| {
                if seq % 2 == 0 {
                    PacketStatus::Received {
                        delta_us: if seq == 0 { 0 } else { 20_000 },
                    }
                } else {
                    PacketStatus::NotReceived
                }
            })
            .collect();
        let report = CongestionReport {
            base_sequence: 0,
            reference_time_ms: 0,
            statuses,
        };

        let before = link.estimate();
        let after = link.on_congestion_report(&report, now);
        assert!(after > before, "clean report on forwarded packets must increase");
        assert_eq!(link.last_feedback(), Some(now));
    }

    #[test]
    fn test_reset_layers_clears_targets() {
        let now = Instant::now();
        let mut link = link(now);
        link.current = Some(LayerId::new(1, 0));
        link.pending = Some(LayerId::new(0, 0));
        link.reset_layers(2);
        assert_eq!(link.current, None);
        assert_eq!(link.pending, None);
        assert_eq!(link.graph_version, 2);
    }
}
