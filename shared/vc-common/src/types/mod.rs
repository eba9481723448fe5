//! Shared Types

mod ids;
mod media;

pub use ids::{ParticipantId, RoomId};
pub use media::{CodecId, LayerId, MediaKind, MediaKinds};
