//! Relay Wire Protocol
//!
//! Every datagram starts with a fixed 22-byte [`MediaHeader`]. Video and
//! screen packets may carry a [`DependencyDescriptor`] right after it
//! (signalled by [`HeaderFlags::HAS_DEP_DESC`]), followed by the opaque codec
//! payload. Feedback datagrams carry a [`FeedbackMessage`] as payload.
//!
//! All multi-byte fields are big-endian.

mod datagram;
mod descriptor;
mod feedback;
mod header;

pub use datagram::Datagram;
pub use descriptor::{DependencyDescriptor, MAX_DESCRIPTOR_LEN, MAX_FRAME_DEPENDENCIES};
pub use feedback::{
    CongestionReport, FeedbackMessage, PacketStatus, DELTA_UNIT_US, MAX_REPORT_PACKETS,
};
pub use header::{
    HeaderFlags, MediaHeader, PacketType, HEADER_LEN, PROTOCOL_VERSION, SUPPORTED_VERSIONS,
};

use bytes::Buf;

use crate::error::{Error, Result};

/// Fail with [`Error::Truncated`] unless `buf` holds at least `needed` bytes.
pub(crate) fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<()> {
    let available = buf.remaining();
    if available < needed {
        return Err(Error::Truncated { needed, available });
    }
    Ok(())
}
