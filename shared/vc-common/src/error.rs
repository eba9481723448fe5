//! Protocol Errors

use thiserror::Error;

use crate::protocol::PacketType;

/// Errors raised while encoding or decoding relay datagrams.
///
/// Decoding fails closed: any of these means the whole datagram is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Input ended before a field could be read.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the field being read.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Protocol version is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Packet type byte is not a known type.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// Codec id byte is not a known codec.
    #[error("unknown codec id: {0}")]
    UnknownCodec(u8),

    /// Stream kind byte is not a known kind.
    #[error("unknown stream kind: {0}")]
    UnknownStreamKind(u8),

    /// A reserved bit was set.
    #[error("reserved bits set in {0}")]
    ReservedBits(&'static str),

    /// Spatial or temporal id does not fit in four bits.
    #[error("layer id out of range (spatial {spatial}, temporal {temporal})")]
    LayerOutOfRange {
        /// Spatial id.
        spatial: u8,
        /// Temporal id.
        temporal: u8,
    },

    /// Template id does not fit in six bits.
    #[error("template id out of range: {0}")]
    TemplateIdOutOfRange(u8),

    /// Descriptor lists more frame dependencies than the format allows.
    #[error("too many frame dependencies: {0}")]
    TooManyDependencies(usize),

    /// A frame dependency diff of zero (a frame cannot depend on itself).
    #[error("frame dependency diff of zero")]
    ZeroFrameDiff,

    /// Template-based descriptor carried an explicit dependency count.
    #[error("dependency count set without custom dependencies")]
    UnexpectedDependencyCount,

    /// `HAS_DEP_DESC` flag disagrees with descriptor presence.
    #[error("dependency descriptor flag does not match descriptor presence")]
    DescriptorMismatch,

    /// Descriptor attached to a packet type that cannot carry one.
    #[error("dependency descriptor not allowed on {0:?} packets")]
    DescriptorNotAllowed(PacketType),

    /// Payload was decoded as feedback but the packet is not a feedback packet.
    #[error("not a feedback packet: {0:?}")]
    NotFeedback(PacketType),

    /// Feedback tag byte is not a known message.
    #[error("unknown feedback message tag: {0}")]
    UnknownFeedbackTag(u8),

    /// Congestion report used the reserved `11` status symbol.
    #[error("invalid packet status symbol")]
    InvalidPacketStatus,

    /// Congestion report covers more packets than allowed.
    #[error("congestion report too large: {0} packets")]
    ReportTooLarge(usize),

    /// Arrival delta cannot be represented.
    #[error("arrival delta out of range: {0}us")]
    DeltaOutOfRange(i64),

    /// Arrival delta is not a multiple of the delta unit.
    #[error("arrival delta not aligned to 250us: {0}us")]
    DeltaNotAligned(i64),

    /// Bytes left over after a fully decoded feedback message.
    #[error("{0} trailing bytes after feedback message")]
    TrailingBytes(usize),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
