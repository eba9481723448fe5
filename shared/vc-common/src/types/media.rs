//! Media kinds, codecs and SVC layer identifiers.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The kind of a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone or system audio.
    Audio,
    /// Camera video.
    Video,
    /// Screen share video.
    Screen,
}

impl MediaKind {
    /// All kinds, in wire order.
    pub const ALL: [Self; 3] = [Self::Audio, Self::Video, Self::Screen];

    /// Wire value used in feedback messages.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Audio => 0,
            Self::Video => 1,
            Self::Screen => 2,
        }
    }

    /// Parse the wire value used in feedback messages.
    pub const fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Audio),
            1 => Ok(Self::Video),
            2 => Ok(Self::Screen),
            other => Err(Error::UnknownStreamKind(other)),
        }
    }

    /// Returns true for kinds that carry SVC layers (video and screen).
    #[must_use]
    pub const fn is_layered(self) -> bool {
        matches!(self, Self::Video | Self::Screen)
    }

    /// The flag representing this kind in a [`MediaKinds`] set.
    #[must_use]
    pub const fn as_flag(self) -> MediaKinds {
        match self {
            Self::Audio => MediaKinds::AUDIO,
            Self::Video => MediaKinds::VIDEO,
            Self::Screen => MediaKinds::SCREEN,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// A set of media kinds, used for participant roles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MediaKinds: u8 {
        /// Audio streams.
        const AUDIO = 0b001;
        /// Camera video streams.
        const VIDEO = 0b010;
        /// Screen share streams.
        const SCREEN = 0b100;
    }
}

impl MediaKinds {
    /// Whether the set contains the given kind.
    #[must_use]
    pub const fn allows(self, kind: MediaKind) -> bool {
        self.contains(kind.as_flag())
    }
}

/// Codec identifier carried in the datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// No codec (feedback datagrams).
    None,
    /// Opus audio.
    Opus,
    /// VP8 video.
    Vp8,
    /// VP9 video.
    Vp9,
    /// H.264 video.
    H264,
    /// AV1 video.
    Av1,
}

impl CodecId {
    /// Wire value.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Opus => 1,
            Self::Vp8 => 2,
            Self::Vp9 => 3,
            Self::H264 => 4,
            Self::Av1 => 5,
        }
    }

    /// Parse a wire value.
    pub const fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Opus),
            2 => Ok(Self::Vp8),
            3 => Ok(Self::Vp9),
            4 => Ok(Self::H264),
            5 => Ok(Self::Av1),
            other => Err(Error::UnknownCodec(other)),
        }
    }

    /// RTP clock rate of the header timestamp, in Hz.
    #[must_use]
    pub const fn clock_rate(self) -> u32 {
        match self {
            Self::Opus => 48_000,
            Self::None | Self::Vp8 | Self::Vp9 | Self::H264 | Self::Av1 => 90_000,
        }
    }

    /// Whether the codec can carry the given media kind.
    #[must_use]
    pub const fn supports(self, kind: MediaKind) -> bool {
        match self {
            Self::None => false,
            Self::Opus => matches!(kind, MediaKind::Audio),
            Self::Vp8 | Self::Vp9 | Self::H264 | Self::Av1 => kind.is_layered(),
        }
    }
}

/// Spatial/temporal layer identity of an SVC packet.
///
/// Ordering is lexicographic: spatial first, then temporal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct LayerId {
    /// Spatial (resolution) layer.
    pub spatial: u8,
    /// Temporal (frame rate) layer.
    pub temporal: u8,
}

impl LayerId {
    /// Largest id that fits the four-bit wire fields.
    pub const MAX_ID: u8 = 15;

    /// The base layer.
    pub const BASE: Self = Self::new(0, 0);

    /// Create a layer id.
    #[must_use]
    pub const fn new(spatial: u8, temporal: u8) -> Self {
        Self { spatial, temporal }
    }

    /// Whether both ids fit the wire format.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.spatial <= Self::MAX_ID && self.temporal <= Self::MAX_ID
    }

    /// Whether a packet with this identity may be sent to a receiver whose
    /// current target is `target`.
    #[must_use]
    pub const fn fits_within(self, target: Self) -> bool {
        self.spatial <= target.spatial && self.temporal <= target.temporal
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}T{}", self.spatial, self.temporal)
    }
}
