//! `VoiceChat` Common Library
//!
//! Wire protocol shared by the media relay and its clients: identifiers,
//! media kinds, the fixed datagram header, the dependency descriptor
//! extension and the congestion feedback messages.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
