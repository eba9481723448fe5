//! Feedback Relay
//!
//! Builds the relay's own congestion reports for each sender's uplink,
//! feeds receiver reports into their downlinks, and passes retransmission
//! and keyframe requests through to the media sender untouched.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};
use vc_common::protocol::{
    CongestionReport, Datagram, FeedbackMessage, HeaderFlags, MediaHeader, PacketType,
    MAX_REPORT_PACKETS,
};
use vc_common::{CodecId, LayerId, ParticipantId};

use super::bwe::{Bitrate, CongestionController, PacketResult};
use super::forwarder::{Egress, Outcome};
use super::room::{Room, StreamKey, StreamState};
use super::selector::LayerSelector;
use crate::metrics::DropReason;

#[derive(Debug, Clone, Copy)]
struct Arrival {
    arrival_us: u64,
    send_us: i64,
    size: usize,
}

/// Arrivals of one sender's stream since the last report.
#[derive(Debug)]
pub struct ArrivalRecorder {
    epoch: Instant,
    highest: Option<u64>,
    last_timestamp: Option<(u32, i64)>,
    next_base: Option<u64>,
    pending: BTreeMap<u64, Arrival>,
}

impl ArrivalRecorder {
    /// Create a recorder measuring arrival times from `epoch`.
    #[must_use]
    pub const fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            highest: None,
            last_timestamp: None,
            next_base: None,
            pending: BTreeMap::new(),
        }
    }

    /// Record one received media datagram.
    ///
    /// Packets older than the last report are ignored; duplicates keep their
    /// first arrival.
    pub fn record(
        &mut self,
        sequence: u32,
        timestamp: u32,
        clock_rate: u32,
        size: usize,
        now: Instant,
    ) {
        let sequence = self.unwrap_sequence(sequence);
        if self.next_base.is_some_and(|base| sequence < base) {
            return;
        }
        let media_time = self.unwrap_timestamp(timestamp);
        let arrival = Arrival {
            arrival_us: now.saturating_duration_since(self.epoch).as_micros() as u64,
            send_us: media_time * 1_000_000 / i64::from(clock_rate.max(1)),
            size,
        };
        self.pending.entry(sequence).or_insert(arrival);
    }

    /// Number of packets waiting for the next report.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Build a report covering everything since the previous one.
    ///
    /// Returns the wire report and the per-packet results for the local
    /// estimator, or `None` if nothing arrived.
    pub fn take_report(&mut self) -> Option<(CongestionReport, Vec<PacketResult>)> {
        let first = *self.pending.first_key_value()?.0;
        let end = *self.pending.last_key_value()?.0;
        let mut base = self.next_base.unwrap_or(first).min(first);
        let max_span = MAX_REPORT_PACKETS as u64;
        if end - base + 1 > max_span {
            base = end + 1 - max_span;
            self.pending = self.pending.split_off(&base);
        }

        let span = (end - base + 1) as usize;
        let mut arrivals = Vec::with_capacity(span);
        let mut results = Vec::with_capacity(span);
        for sequence in base..=end {
            let arrival = self.pending.remove(&sequence);
            arrivals.push(arrival.map(|a| a.arrival_us));
            results.push(PacketResult {
                sequence: sequence as u32,
                send_time_us: arrival.map_or(0, |a| a.send_us),
                arrival_us: arrival.map(|a| a.arrival_us as i64),
                size: arrival.map_or(0, |a| a.size),
            });
        }
        self.next_base = Some(end + 1);

        Some((CongestionReport::from_arrivals(base as u32, &arrivals), results))
    }

    fn unwrap_sequence(&mut self, sequence: u32) -> u64 {
        let unwrapped = match self.highest {
            // Start one wrap in so reordering near zero never underflows.
            None => (1 << 32) + u64::from(sequence),
            Some(highest) => {
                let delta = i64::from(sequence.wrapping_sub(highest as u32) as i32);
                (highest as i64 + delta).max(0) as u64
            }
        };
        self.highest = Some(self.highest.map_or(unwrapped, |h| h.max(unwrapped)));
        unwrapped
    }

    fn unwrap_timestamp(&mut self, timestamp: u32) -> i64 {
        let unwrapped = match self.last_timestamp {
            None => i64::from(timestamp),
            Some((raw, unwrapped)) => {
                unwrapped + i64::from(timestamp.wrapping_sub(raw) as i32)
            }
        };
        self.last_timestamp = Some((timestamp, unwrapped));
        unwrapped
    }
}

/// The relay's side of a sender's uplink: what arrived, and what that says
/// about the sender's available bandwidth.
pub struct UplinkState {
    recorder: ArrivalRecorder,
    controller: Box<dyn CongestionController>,
}

impl UplinkState {
    /// Create uplink state with a fresh controller.
    #[must_use]
    pub fn new(controller: Box<dyn CongestionController>, now: Instant) -> Self {
        Self {
            recorder: ArrivalRecorder::new(now),
            controller,
        }
    }

    /// Record a media datagram from the sender.
    pub fn record(&mut self, header: &MediaHeader, size: usize, now: Instant) {
        self.recorder.record(
            header.sequence,
            header.timestamp,
            header.codec.clock_rate(),
            size,
            now,
        );
    }

    /// Build the next report for the sender and feed it to the local
    /// estimator.
    pub fn take_report(&mut self, now: Instant) -> Option<CongestionReport> {
        let Some((report, results)) = self.recorder.take_report() else {
            self.controller.on_tick(now);
            return None;
        };
        self.controller.ingest(&results, now);
        Some(report)
    }

    /// Estimated bandwidth of the sender's uplink.
    #[must_use]
    pub fn estimate(&self) -> Bitrate {
        self.controller.estimate()
    }
}

/// Encode a relay-originated feedback datagram addressed to `to`.
pub(crate) fn relay_feedback(
    room: &Room,
    to: ParticipantId,
    message: &FeedbackMessage,
) -> Option<Egress> {
    let header = MediaHeader {
        version: room.protocol_version(),
        packet_type: PacketType::Feedback,
        codec: CodecId::None,
        flags: HeaderFlags::empty(),
        room_id: room.id(),
        sender_id: ParticipantId::RELAY,
        sequence: room.next_relay_sequence(),
        timestamp: 0,
        layer: LayerId::BASE,
        dtx: false,
    };
    let encoded = Datagram::with_feedback(header, message).and_then(|datagram| datagram.encode());
    match encoded {
        Ok(payload) => Some(Egress {
            room: room.id(),
            to,
            payload,
        }),
        Err(e) => {
            warn!(room_id = %room.id(), error = %e, "Failed to encode relay feedback");
            None
        }
    }
}

/// Send a keyframe request for a stream if one is wanted and the rate limit
/// allows it.
pub(crate) fn request_keyframe_if_wanted(
    room: &Room,
    stream: &mut StreamState,
    now: Instant,
) -> Option<Egress> {
    if !stream.keyframe_wanted || !room.keyframe_limiter().check(stream.key, now) {
        return None;
    }
    stream.keyframe_wanted = false;
    debug!(room_id = %room.id(), stream = %stream.key, "Requesting keyframe");
    relay_feedback(
        room,
        stream.key.sender,
        &FeedbackMessage::KeyframeRequest {
            media_sender: stream.key.sender,
            kind: stream.key.kind,
        },
    )
}

/// Route a feedback datagram from a receiver.
pub(crate) fn route(
    room: &Room,
    datagram: &Datagram,
    raw: &Bytes,
    selector: &LayerSelector,
    now: Instant,
) -> Result<Outcome, DropReason> {
    let message = datagram.feedback().map_err(|_| DropReason::Malformed)?;
    let from = datagram.header.sender_id;
    let key = StreamKey::new(message.media_sender(), message.kind());

    let routing = room.routing();
    let route = routing.streams.get(&key).ok_or(DropReason::NotNegotiated)?;
    if !route.subscribers.contains(&from) {
        return Err(DropReason::NotSubscribed);
    }

    let mut outcome = Outcome::default();
    match message {
        FeedbackMessage::Nack { .. } | FeedbackMessage::KeyframeRequest { .. } => {
            outcome.egress.push(Egress {
                room: room.id(),
                to: key.sender,
                payload: raw.clone(),
            });
        }
        FeedbackMessage::Congestion { report, .. } => {
            let mut stream = route.state.lock();
            let link = stream.links.get_mut(&from).ok_or(DropReason::NotSubscribed)?;
            link.on_congestion_report(&report, now);
            reselect(room, &mut stream, from, selector, now, &mut outcome);
        }
        FeedbackMessage::ReceiverEstimate { bitrate_bps, .. } => {
            let mut stream = route.state.lock();
            let link = stream.links.get_mut(&from).ok_or(DropReason::NotSubscribed)?;
            link.on_receiver_estimate(Bitrate::bps(bitrate_bps), now);
            reselect(room, &mut stream, from, selector, now, &mut outcome);
        }
    }
    Ok(outcome)
}

fn reselect(
    room: &Room,
    stream: &mut StreamState,
    receiver: ParticipantId,
    selector: &LayerSelector,
    now: Instant,
    outcome: &mut Outcome,
) {
    let graph = std::sync::Arc::clone(&stream.graph);
    let Some(link) = stream.links.get_mut(&receiver) else {
        return;
    };
    let selection = selector.update(link, &graph);
    if selection.changed {
        debug!(
            room_id = %room.id(),
            stream = %stream.key,
            receiver = %receiver,
            estimate = %link.estimate(),
            current = ?link.current,
            pending = ?link.pending,
            "Layer target updated"
        );
    }
    if selection.request_keyframe {
        stream.keyframe_wanted = true;
    }
    if let Some(request) = request_keyframe_if_wanted(room, stream, now) {
        outcome.egress.push(request);
        outcome.keyframe_requests += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vc_common::protocol::PacketStatus;

    use super::*;

    #[test]
    fn test_report_marks_gaps_as_lost() {
        let epoch = Instant::now();
        let mut recorder = ArrivalRecorder::new(epoch);
        for (i, seq) in [10u32, 11, 13].iter().enumerate() {
            let at = epoch + Duration::from_millis(20 * i as u64);
            recorder.record(*seq, 3000 * *seq, 90_000, 1000, at);
        }

        let (report, results) = recorder.take_report().unwrap();
        assert_eq!(report.base_sequence, 10);
        assert_eq!(report.packet_count(), 4);
        assert_eq!(report.received_count(), 3);
        assert_eq!(report.statuses[2], PacketStatus::NotReceived);
        assert_eq!(results.len(), 4);
        assert_eq!(results[1].arrival_us, Some(20_000));
        assert_eq!(results[1].send_time_us - results[0].send_time_us, 33_333);
        assert!(recorder.take_report().is_none());
    }

    #[test]
    fn test_next_report_continues_where_last_ended() {
        let epoch = Instant::now();
        let mut recorder = ArrivalRecorder::new(epoch);
        recorder.record(1, 0, 48_000, 100, epoch);
        recorder.record(2, 960, 48_000, 100, epoch);
        recorder.take_report().unwrap();

        // A straggler from the previous range is ignored.
        recorder.record(0, 0, 48_000, 100, epoch);
        assert_eq!(recorder.pending(), 0);

        recorder.record(5, 3840, 48_000, 100, epoch);
        let (report, _) = recorder.take_report().unwrap();
        assert_eq!(report.base_sequence, 3);
        assert_eq!(report.packet_count(), 3);
        assert_eq!(report.received_count(), 1);
    }

    #[test]
    fn test_sequence_wraparound() {
        let epoch = Instant::now();
        let mut recorder = ArrivalRecorder::new(epoch);
        recorder.record(u32::MAX, 0, 90_000, 100, epoch);
        recorder.record(0, 0, 90_000, 100, epoch);

        let (report, _) = recorder.take_report().unwrap();
        assert_eq!(report.base_sequence, u32::MAX);
        assert_eq!(report.packet_count(), 2);
        let sequences: Vec<u32> = report.arrivals().map(|(seq, _)| seq).collect();
        assert_eq!(sequences, vec![u32::MAX, 0]);
    }

    #[test]
    fn test_oversized_range_keeps_newest_packets() {
        let epoch = Instant::now();
        let mut recorder = ArrivalRecorder::new(epoch);
        recorder.record(0, 0, 90_000, 100, epoch);
        recorder.record(MAX_REPORT_PACKETS as u32 + 10, 0, 90_000, 100, epoch);

        let (report, _) = recorder.take_report().unwrap();
        assert_eq!(report.packet_count(), MAX_REPORT_PACKETS);
        assert_eq!(report.base_sequence, 11);
        assert_eq!(report.received_count(), 1);
    }
}
