//! Feedback messages carried by `feedback`-type datagrams.

use bytes::{Buf, BufMut};

use super::ensure_remaining;
use crate::error::{Error, Result};
use crate::types::{MediaKind, ParticipantId};

/// Resolution of arrival deltas, in microseconds.
pub const DELTA_UNIT_US: i64 = 250;

/// Largest number of packets a single congestion report may cover.
pub const MAX_REPORT_PACKETS: usize = 8192;

const TAG_CONGESTION: u8 = 0;
const TAG_NACK: u8 = 1;
const TAG_KEYFRAME_REQUEST: u8 = 2;
const TAG_RECEIVER_ESTIMATE: u8 = 3;

const SYMBOL_NOT_RECEIVED: u8 = 0b00;
const SYMBOL_SMALL_DELTA: u8 = 0b01;
const SYMBOL_LARGE_DELTA: u8 = 0b10;

/// Arrival outcome of one packet in a congestion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketStatus {
    /// The packet never arrived.
    NotReceived,
    /// The packet arrived `delta_us` after the previous received packet
    /// (the first one is relative to the report's reference time).
    Received {
        /// Inter-arrival delta in microseconds, a multiple of [`DELTA_UNIT_US`].
        delta_us: i64,
    },
}

impl PacketStatus {
    /// Whether the packet arrived.
    #[must_use]
    pub const fn is_received(self) -> bool {
        matches!(self, Self::Received { .. })
    }
}

/// Per-packet arrival outcomes over a contiguous sequence range.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CongestionReport {
    /// Sequence number of the first packet covered.
    pub base_sequence: u32,
    /// Arrival clock reference, in milliseconds.
    pub reference_time_ms: u32,
    /// One entry per sequence number starting at `base_sequence`.
    pub statuses: Vec<PacketStatus>,
}

impl CongestionReport {
    /// Build a report from absolute arrival times (µs on the reporter's
    /// clock), one entry per sequence number starting at `base_sequence`.
    ///
    /// Deltas are quantized to [`DELTA_UNIT_US`] without accumulating
    /// rounding drift, and clamped to the large-delta range.
    #[must_use]
    pub fn from_arrivals(base_sequence: u32, arrivals: &[Option<u64>]) -> Self {
        let first = arrivals.iter().flatten().next().copied().unwrap_or(0);
        let reference_time_ms = first / 1000;
        let mut previous = (reference_time_ms * 1000) as i64;

        let statuses = arrivals
            .iter()
            .take(MAX_REPORT_PACKETS)
            .map(|arrival| match arrival {
                None => PacketStatus::NotReceived,
                Some(at) => {
                    let raw = *at as i64 - previous;
                    let units = (raw + DELTA_UNIT_US / 2)
                        .div_euclid(DELTA_UNIT_US)
                        .clamp(i64::from(i16::MIN), i64::from(i16::MAX));
                    let delta_us = units * DELTA_UNIT_US;
                    previous += delta_us;
                    PacketStatus::Received { delta_us }
                }
            })
            .collect();

        Self {
            base_sequence,
            reference_time_ms: reference_time_ms as u32,
            statuses,
        }
    }

    /// Number of packets covered.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.statuses.len()
    }

    /// Number of packets reported as received.
    #[must_use]
    pub fn received_count(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_received()).count()
    }

    /// Sequence numbers paired with reconstructed arrival times in µs on
    /// the reporter's clock (`None` for lost packets).
    pub fn arrivals(&self) -> impl Iterator<Item = (u32, Option<i64>)> + '_ {
        let mut at = i64::from(self.reference_time_ms) * 1000;
        self.statuses.iter().enumerate().map(move |(i, status)| {
            let sequence = self.base_sequence.wrapping_add(i as u32);
            match status {
                PacketStatus::NotReceived => (sequence, None),
                PacketStatus::Received { delta_us } => {
                    at += delta_us;
                    (sequence, Some(at))
                }
            }
        })
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, 12)?;
        let base_sequence = buf.get_u32();
        let count = buf.get_u32() as usize;
        let reference_time_ms = buf.get_u32();
        if count > MAX_REPORT_PACKETS {
            return Err(Error::ReportTooLarge(count));
        }

        let bitmap_len = (2 * count).div_ceil(8);
        ensure_remaining(buf, bitmap_len)?;
        let mut symbols = Vec::with_capacity(count);
        let mut byte = 0u8;
        for i in 0..count {
            if i % 4 == 0 {
                byte = buf.get_u8();
            }
            let symbol = (byte >> (6 - 2 * (i % 4))) & 0b11;
            symbols.push(symbol);
        }
        if count % 4 != 0 && byte & (0xFF >> (2 * (count % 4))) != 0 {
            return Err(Error::ReservedBits("status bitmap padding"));
        }

        let mut statuses = Vec::with_capacity(count);
        for symbol in symbols {
            let status = match symbol {
                SYMBOL_NOT_RECEIVED => PacketStatus::NotReceived,
                SYMBOL_SMALL_DELTA => {
                    ensure_remaining(buf, 1)?;
                    PacketStatus::Received {
                        delta_us: i64::from(buf.get_u8()) * DELTA_UNIT_US,
                    }
                }
                SYMBOL_LARGE_DELTA => {
                    ensure_remaining(buf, 2)?;
                    PacketStatus::Received {
                        delta_us: i64::from(buf.get_i16()) * DELTA_UNIT_US,
                    }
                }
                _ => return Err(Error::InvalidPacketStatus),
            };
            statuses.push(status);
        }

        Ok(Self {
            base_sequence,
            reference_time_ms,
            statuses,
        })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        let count = self.statuses.len();
        if count > MAX_REPORT_PACKETS {
            return Err(Error::ReportTooLarge(count));
        }

        let mut symbols = Vec::with_capacity(count);
        for status in &self.statuses {
            let symbol = match *status {
                PacketStatus::NotReceived => SYMBOL_NOT_RECEIVED,
                PacketStatus::Received { delta_us } => {
                    if delta_us % DELTA_UNIT_US != 0 {
                        return Err(Error::DeltaNotAligned(delta_us));
                    }
                    let units = delta_us / DELTA_UNIT_US;
                    if (0..=i64::from(u8::MAX)).contains(&units) {
                        SYMBOL_SMALL_DELTA
                    } else if i16::try_from(units).is_ok() {
                        SYMBOL_LARGE_DELTA
                    } else {
                        return Err(Error::DeltaOutOfRange(delta_us));
                    }
                }
            };
            symbols.push(symbol);
        }

        buf.put_u32(self.base_sequence);
        buf.put_u32(count as u32);
        buf.put_u32(self.reference_time_ms);
        for chunk in symbols.chunks(4) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, symbol)| acc | (symbol << (6 - 2 * i)));
            buf.put_u8(byte);
        }
        for (status, symbol) in self.statuses.iter().zip(&symbols) {
            if let PacketStatus::Received { delta_us } = *status {
                let units = delta_us / DELTA_UNIT_US;
                if *symbol == SYMBOL_SMALL_DELTA {
                    buf.put_u8(units as u8);
                } else {
                    buf.put_i16(units as i16);
                }
            }
        }
        Ok(())
    }
}

/// Payload of a `feedback`-type datagram.
///
/// Every message names the media stream it describes by its sender and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackMessage {
    /// Per-packet arrival report for the link carrying the stream.
    Congestion {
        /// Sender of the described stream.
        media_sender: ParticipantId,
        /// Kind of the described stream.
        kind: MediaKind,
        /// Arrival outcomes.
        report: CongestionReport,
    },
    /// Retransmission request.
    Nack {
        /// Sender of the described stream.
        media_sender: ParticipantId,
        /// Kind of the described stream.
        kind: MediaKind,
        /// Missing sequence numbers.
        sequences: Vec<u32>,
    },
    /// Request for a fresh keyframe.
    KeyframeRequest {
        /// Sender of the described stream.
        media_sender: ParticipantId,
        /// Kind of the described stream.
        kind: MediaKind,
    },
    /// Receiver-computed maximum rate.
    ReceiverEstimate {
        /// Sender of the described stream.
        media_sender: ParticipantId,
        /// Kind of the described stream.
        kind: MediaKind,
        /// Bitrate in bits per second.
        bitrate_bps: u64,
    },
}

impl FeedbackMessage {
    /// Sender of the stream this message describes.
    #[must_use]
    pub const fn media_sender(&self) -> ParticipantId {
        match self {
            Self::Congestion { media_sender, .. }
            | Self::Nack { media_sender, .. }
            | Self::KeyframeRequest { media_sender, .. }
            | Self::ReceiverEstimate { media_sender, .. } => *media_sender,
        }
    }

    /// Kind of the stream this message describes.
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Congestion { kind, .. }
            | Self::Nack { kind, .. }
            | Self::KeyframeRequest { kind, .. }
            | Self::ReceiverEstimate { kind, .. } => *kind,
        }
    }

    const fn tag(&self) -> u8 {
        match self {
            Self::Congestion { .. } => TAG_CONGESTION,
            Self::Nack { .. } => TAG_NACK,
            Self::KeyframeRequest { .. } => TAG_KEYFRAME_REQUEST,
            Self::ReceiverEstimate { .. } => TAG_RECEIVER_ESTIMATE,
        }
    }

    /// Decode a complete message; trailing bytes are an error.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, 6)?;
        let tag = buf.get_u8();
        let media_sender = ParticipantId(buf.get_u32());
        let kind = MediaKind::from_u8(buf.get_u8())?;

        let message = match tag {
            TAG_CONGESTION => Self::Congestion {
                media_sender,
                kind,
                report: CongestionReport::decode(buf)?,
            },
            TAG_NACK => {
                ensure_remaining(buf, 2)?;
                let count = usize::from(buf.get_u16());
                ensure_remaining(buf, 4 * count)?;
                let sequences = (0..count).map(|_| buf.get_u32()).collect();
                Self::Nack {
                    media_sender,
                    kind,
                    sequences,
                }
            }
            TAG_KEYFRAME_REQUEST => Self::KeyframeRequest { media_sender, kind },
            TAG_RECEIVER_ESTIMATE => {
                ensure_remaining(buf, 8)?;
                Self::ReceiverEstimate {
                    media_sender,
                    kind,
                    bitrate_bps: buf.get_u64(),
                }
            }
            other => return Err(Error::UnknownFeedbackTag(other)),
        };

        if buf.has_remaining() {
            return Err(Error::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }

    /// Write the message to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        if let Self::Nack { sequences, .. } = self {
            if sequences.len() > usize::from(u16::MAX) {
                return Err(Error::ReportTooLarge(sequences.len()));
            }
        }

        buf.put_u8(self.tag());
        buf.put_u32(self.media_sender().get());
        buf.put_u8(self.kind().to_u8());

        match self {
            Self::Congestion { report, .. } => report.encode(buf)?,
            Self::Nack { sequences, .. } => {
                buf.put_u16(sequences.len() as u16);
                for sequence in sequences {
                    buf.put_u32(*sequence);
                }
            }
            Self::KeyframeRequest { .. } => {}
            Self::ReceiverEstimate { bitrate_bps, .. } => buf.put_u64(*bitrate_bps),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn encode(message: &FeedbackMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        message.encode(&mut buf).unwrap();
        buf
    }

    fn congestion(report: CongestionReport) -> FeedbackMessage {
        FeedbackMessage::Congestion {
            media_sender: ParticipantId(3),
            kind: MediaKind::Video,
            report,
        }
    }

    #[test]
    fn congestion_report_layout() {
        let report = CongestionReport {
            base_sequence: 100,
            reference_time_ms: 5,
            statuses: vec![
                PacketStatus::Received { delta_us: 500 },
                PacketStatus::NotReceived,
                PacketStatus::Received { delta_us: -250 },
            ],
        };
        let buf = encode(&congestion(report.clone()));
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 0, 3, 1, // tag, sender, kind
                0, 0, 0, 100, 0, 0, 0, 3, 0, 0, 0, 5, // base, count, reference
                0b0100_1000, // 01 00 10 + padding
                2,    // small delta
                0xFF, 0xFF, // large delta -1
            ]
        );
        assert_eq!(
            FeedbackMessage::decode(&mut buf.freeze()).unwrap(),
            congestion(report)
        );
    }

    #[test]
    fn arrivals_accumulate_deltas() {
        let report = CongestionReport {
            base_sequence: u32::MAX,
            reference_time_ms: 1,
            statuses: vec![
                PacketStatus::Received { delta_us: 1000 },
                PacketStatus::NotReceived,
                PacketStatus::Received { delta_us: 2500 },
            ],
        };
        let arrivals: Vec<_> = report.arrivals().collect();
        assert_eq!(
            arrivals,
            vec![(u32::MAX, Some(2000)), (0, None), (1, Some(4500))]
        );
        assert_eq!(report.received_count(), 2);
    }

    #[test]
    fn from_arrivals_quantizes_without_drift() {
        let arrivals = [Some(10_100), None, Some(10_400), Some(10_700), Some(80_000)];
        let report = CongestionReport::from_arrivals(7, &arrivals);
        assert_eq!(report.reference_time_ms, 10);
        let rebuilt: Vec<_> = report.arrivals().map(|(_, at)| at).collect();
        assert_eq!(
            rebuilt,
            vec![Some(10_000), None, Some(10_500), Some(10_750), Some(80_000)]
        );
        // Large gaps take the i16 encoding and still round-trip.
        let buf = encode(&congestion(report.clone()));
        let FeedbackMessage::Congestion { report: decoded, .. } =
            FeedbackMessage::decode(&mut buf.freeze()).unwrap()
        else {
            panic!("expected congestion report");
        };
        assert_eq!(decoded, report);
    }

    #[test]
    fn rejects_invalid_status_symbol() {
        let raw = [0, 0, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0b1100_0000];
        assert_eq!(
            FeedbackMessage::decode(&mut &raw[..]),
            Err(Error::InvalidPacketStatus)
        );
    }

    #[test]
    fn rejects_oversized_report() {
        let raw = [0, 0, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0x20, 0x01, 0, 0, 0, 0];
        assert_eq!(
            FeedbackMessage::decode(&mut &raw[..]),
            Err(Error::ReportTooLarge(8193))
        );
    }

    #[test]
    fn encode_rejects_unaligned_and_huge_deltas() {
        let mut buf = BytesMut::new();
        let unaligned = congestion(CongestionReport {
            statuses: vec![PacketStatus::Received { delta_us: 100 }],
            ..Default::default()
        });
        assert_eq!(unaligned.encode(&mut buf), Err(Error::DeltaNotAligned(100)));

        let huge = congestion(CongestionReport {
            statuses: vec![PacketStatus::Received {
                delta_us: 40_000 * DELTA_UNIT_US,
            }],
            ..Default::default()
        });
        assert!(matches!(
            huge.encode(&mut buf),
            Err(Error::DeltaOutOfRange(_))
        ));
    }

    #[test]
    fn nack_and_estimate_messages() {
        let nack = FeedbackMessage::Nack {
            media_sender: ParticipantId(9),
            kind: MediaKind::Screen,
            sequences: vec![4, 5, 9],
        };
        let buf = encode(&nack);
        assert_eq!(buf.len(), 6 + 2 + 12);
        assert_eq!(FeedbackMessage::decode(&mut buf.freeze()).unwrap(), nack);

        let estimate = FeedbackMessage::ReceiverEstimate {
            media_sender: ParticipantId(9),
            kind: MediaKind::Video,
            bitrate_bps: 600_000,
        };
        assert_eq!(estimate.media_sender(), ParticipantId(9));
        assert_eq!(estimate.kind(), MediaKind::Video);
        let buf = encode(&estimate);
        assert_eq!(FeedbackMessage::decode(&mut buf.freeze()).unwrap(), estimate);
    }

    #[test]
    fn keyframe_request_is_header_only() {
        let pli = FeedbackMessage::KeyframeRequest {
            media_sender: ParticipantId(2),
            kind: MediaKind::Video,
        };
        assert_eq!(&encode(&pli)[..], &[2, 0, 0, 0, 2, 1]);
    }

    #[test]
    fn rejects_trailing_bytes_and_unknown_tag() {
        let mut buf = encode(&FeedbackMessage::KeyframeRequest {
            media_sender: ParticipantId(2),
            kind: MediaKind::Video,
        });
        buf.extend_from_slice(&[0xAA]);
        assert_eq!(
            FeedbackMessage::decode(&mut buf.freeze()),
            Err(Error::TrailingBytes(1))
        );

        let raw = [7, 0, 0, 0, 2, 1];
        assert_eq!(
            FeedbackMessage::decode(&mut &raw[..]),
            Err(Error::UnknownFeedbackTag(7))
        );
    }
}
