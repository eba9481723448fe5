//! Fixed media header.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::ensure_remaining;
use crate::error::{Error, Result};
use crate::types::{CodecId, LayerId, MediaKind, ParticipantId, RoomId};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Versions accepted by the decoder.
pub const SUPPORTED_VERSIONS: &[u8] = &[PROTOCOL_VERSION];

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 22;

const DTX_BIT: u8 = 0x80;

/// Datagram type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    /// Audio media.
    Audio,
    /// Camera video media.
    Video,
    /// Screen share media.
    Screen,
    /// Standalone forward error correction for the sender's video.
    Fec,
    /// Congestion feedback and control messages.
    Feedback,
}

impl PacketType {
    /// Wire value.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Audio => 0,
            Self::Video => 1,
            Self::Screen => 2,
            Self::Fec => 3,
            Self::Feedback => 4,
        }
    }

    /// Parse a wire value.
    pub const fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Audio),
            1 => Ok(Self::Video),
            2 => Ok(Self::Screen),
            3 => Ok(Self::Fec),
            4 => Ok(Self::Feedback),
            other => Err(Error::UnknownPacketType(other)),
        }
    }

    /// The stream a packet of this type belongs to.
    ///
    /// FEC protects the sender's camera video; feedback belongs to no stream.
    #[must_use]
    pub const fn media_kind(self) -> Option<MediaKind> {
        match self {
            Self::Audio => Some(MediaKind::Audio),
            Self::Video | Self::Fec => Some(MediaKind::Video),
            Self::Screen => Some(MediaKind::Screen),
            Self::Feedback => None,
        }
    }

    /// Whether packets of this type may carry a dependency descriptor.
    #[must_use]
    pub const fn allows_descriptor(self) -> bool {
        matches!(self, Self::Video | Self::Screen)
    }
}

impl From<MediaKind> for PacketType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Video,
            MediaKind::Screen => Self::Screen,
        }
    }
}

bitflags! {
    /// Header flag bits. The top three bits are reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HeaderFlags: u8 {
        /// Packet belongs to a keyframe.
        const KEYFRAME = 0x01;
        /// Last packet of a frame.
        const END_OF_FRAME = 0x02;
        /// Packet carries in-band redundancy.
        const FEC = 0x04;
        /// RTP-style marker bit.
        const MARKER = 0x08;
        /// A dependency descriptor follows the header.
        const HAS_DEP_DESC = 0x10;
    }
}

/// The fixed 22-byte datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaHeader {
    /// Protocol version.
    pub version: u8,
    /// Datagram type.
    pub packet_type: PacketType,
    /// Codec of the payload.
    pub codec: CodecId,
    /// Flag bits.
    pub flags: HeaderFlags,
    /// Room the datagram belongs to.
    pub room_id: RoomId,
    /// Originating participant.
    pub sender_id: ParticipantId,
    /// Per-stream sequence number.
    pub sequence: u32,
    /// RTP-style media timestamp.
    pub timestamp: u32,
    /// Spatial/temporal identity.
    pub layer: LayerId,
    /// Discontinuous transmission (audio silence) marker.
    pub dtx: bool,
}

impl MediaHeader {
    /// Read a header from the front of `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, HEADER_LEN)?;

        let version = buf.get_u8();
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
        let packet_type = PacketType::from_u8(buf.get_u8())?;
        let codec = CodecId::from_u8(buf.get_u8())?;
        let flags =
            HeaderFlags::from_bits(buf.get_u8()).ok_or(Error::ReservedBits("header flags"))?;
        let room_id = RoomId(buf.get_u32());
        let sender_id = ParticipantId(buf.get_u32());
        let sequence = buf.get_u32();
        let timestamp = buf.get_u32();
        let layer_byte = buf.get_u8();
        let layer = LayerId::new(layer_byte >> 4, layer_byte & 0x0F);
        let dtx_byte = buf.get_u8();
        if dtx_byte & !DTX_BIT != 0 {
            return Err(Error::ReservedBits("dtx byte"));
        }

        Ok(Self {
            version,
            packet_type,
            codec,
            flags,
            room_id,
            sender_id,
            sequence,
            timestamp,
            layer,
            dtx: dtx_byte & DTX_BIT != 0,
        })
    }

    /// Write the header to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(Error::UnsupportedVersion(self.version));
        }
        if !self.layer.is_valid() {
            return Err(Error::LayerOutOfRange {
                spatial: self.layer.spatial,
                temporal: self.layer.temporal,
            });
        }

        buf.put_u8(self.version);
        buf.put_u8(self.packet_type.to_u8());
        buf.put_u8(self.codec.to_u8());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.room_id.get());
        buf.put_u32(self.sender_id.get());
        buf.put_u32(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u8((self.layer.spatial << 4) | self.layer.temporal);
        buf.put_u8(if self.dtx { DTX_BIT } else { 0 });
        Ok(())
    }

    /// Read only the routing ids of a raw datagram, without validating it.
    ///
    /// Used to pick a worker before the full decode happens.
    #[must_use]
    pub fn peek_route(bytes: &[u8]) -> Option<(RoomId, ParticipantId)> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let room = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let sender = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        Some((RoomId(room), ParticipantId(sender)))
    }

    /// The media stream this datagram belongs to, if any.
    #[must_use]
    pub const fn media_kind(&self) -> Option<MediaKind> {
        self.packet_type.media_kind()
    }
}
