//! Room and participant identifiers as carried on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a relay room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u32);

impl RoomId {
    /// Raw wire value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RoomId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifier of a participant within a room.
///
/// The value `0` is reserved for datagrams originated by the relay itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    /// Sender id used on relay-originated datagrams.
    pub const RELAY: Self = Self(0);

    /// Raw wire value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the reserved relay id.
    #[must_use]
    pub const fn is_relay(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ParticipantId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
