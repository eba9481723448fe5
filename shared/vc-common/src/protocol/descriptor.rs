//! Dependency descriptor extension.
//!
//! A compact per-packet description of the frame a packet belongs to and the
//! frames it references, so the relay can make layer decisions without
//! touching the codec bitstream.

use bytes::{Buf, BufMut};

use super::ensure_remaining;
use crate::error::{Error, Result};

/// Largest number of explicit frame dependencies.
pub const MAX_FRAME_DEPENDENCIES: usize = 13;

/// Largest encoded descriptor.
pub const MAX_DESCRIPTOR_LEN: usize = FIXED_LEN + 2 * MAX_FRAME_DEPENDENCIES;

const FIXED_LEN: usize = 5;
const START_BIT: u8 = 0x80;
const END_BIT: u8 = 0x40;
const TEMPLATE_MASK: u8 = 0x3F;
const CUSTOM_BIT: u8 = 0x80;
const RESERVED_MASK: u8 = 0x60;
const COUNT_MASK: u8 = 0x1F;

/// Per-packet frame dependency metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DependencyDescriptor {
    /// First packet of the frame.
    pub start_of_frame: bool,
    /// Last packet of the frame.
    pub end_of_frame: bool,
    /// Negotiated template this frame follows (0..=63).
    pub template_id: u8,
    /// Monotonically increasing (wrapping) frame number.
    pub frame_number: u16,
    /// Bitmask of decode targets this frame contributes to.
    pub decode_targets: u8,
    /// Explicit frame dependencies as backwards diffs of frame numbers.
    ///
    /// `None` means the template's dependencies apply; `Some` with an empty
    /// list marks a frame without references.
    pub custom_dependencies: Option<Vec<u16>>,
}

impl DependencyDescriptor {
    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_LEN + 2 * self.custom_dependencies.as_ref().map_or(0, Vec::len)
    }

    /// Read a descriptor from the front of `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, FIXED_LEN)?;

        let first = buf.get_u8();
        let frame_number = buf.get_u16();
        let decode_targets = buf.get_u8();
        let deps = buf.get_u8();

        if deps & RESERVED_MASK != 0 {
            return Err(Error::ReservedBits("descriptor dependency byte"));
        }
        let count = usize::from(deps & COUNT_MASK);
        let custom_dependencies = if deps & CUSTOM_BIT == 0 {
            if count != 0 {
                return Err(Error::UnexpectedDependencyCount);
            }
            None
        } else {
            if count > MAX_FRAME_DEPENDENCIES {
                return Err(Error::TooManyDependencies(count));
            }
            ensure_remaining(buf, 2 * count)?;
            let mut diffs = Vec::with_capacity(count);
            for _ in 0..count {
                let diff = buf.get_u16();
                if diff == 0 {
                    return Err(Error::ZeroFrameDiff);
                }
                diffs.push(diff);
            }
            Some(diffs)
        };

        Ok(Self {
            start_of_frame: first & START_BIT != 0,
            end_of_frame: first & END_BIT != 0,
            template_id: first & TEMPLATE_MASK,
            frame_number,
            decode_targets,
            custom_dependencies,
        })
    }

    /// Write the descriptor to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        if self.template_id > TEMPLATE_MASK {
            return Err(Error::TemplateIdOutOfRange(self.template_id));
        }

        let mut first = self.template_id;
        if self.start_of_frame {
            first |= START_BIT;
        }
        if self.end_of_frame {
            first |= END_BIT;
        }

        let deps = match &self.custom_dependencies {
            None => 0,
            Some(diffs) => {
                if diffs.len() > MAX_FRAME_DEPENDENCIES {
                    return Err(Error::TooManyDependencies(diffs.len()));
                }
                if diffs.contains(&0) {
                    return Err(Error::ZeroFrameDiff);
                }
                CUSTOM_BIT | diffs.len() as u8
            }
        };

        buf.put_u8(first);
        buf.put_u16(self.frame_number);
        buf.put_u8(self.decode_targets);
        buf.put_u8(deps);
        if let Some(diffs) = &self.custom_dependencies {
            for diff in diffs {
                buf.put_u16(*diff);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn encode(desc: &DependencyDescriptor) -> BytesMut {
        let mut buf = BytesMut::new();
        desc.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn template_descriptor_is_five_bytes() {
        let desc = DependencyDescriptor {
            start_of_frame: true,
            end_of_frame: false,
            template_id: 3,
            frame_number: 0x0102,
            decode_targets: 0b0111,
            custom_dependencies: None,
        };
        let buf = encode(&desc);
        assert_eq!(&buf[..], &[0x83, 0x01, 0x02, 0x07, 0x00]);
        assert_eq!(desc.encoded_len(), 5);
        assert_eq!(DependencyDescriptor::decode(&mut buf.freeze()).unwrap(), desc);
    }

    #[test]
    fn custom_dependencies_are_listed() {
        let desc = DependencyDescriptor {
            start_of_frame: true,
            end_of_frame: true,
            template_id: 0,
            frame_number: 10,
            decode_targets: 1,
            custom_dependencies: Some(vec![1, 4]),
        };
        let buf = encode(&desc);
        assert_eq!(buf.len(), 9);
        assert_eq!(buf[4], 0x82);
        assert_eq!(DependencyDescriptor::decode(&mut buf.freeze()).unwrap(), desc);
    }

    #[test]
    fn empty_custom_list_means_no_references() {
        let desc = DependencyDescriptor {
            start_of_frame: true,
            custom_dependencies: Some(Vec::new()),
            ..Default::default()
        };
        let decoded = DependencyDescriptor::decode(&mut encode(&desc).freeze()).unwrap();
        assert_eq!(decoded.custom_dependencies, Some(Vec::new()));
    }

    #[test]
    fn rejects_count_without_custom_bit() {
        let raw = [0x80, 0, 1, 1, 0x02];
        assert_eq!(
            DependencyDescriptor::decode(&mut &raw[..]),
            Err(Error::UnexpectedDependencyCount)
        );
    }

    #[test]
    fn rejects_too_many_dependencies() {
        let raw = [0x80, 0, 1, 1, 0x80 | 14];
        assert_eq!(
            DependencyDescriptor::decode(&mut &raw[..]),
            Err(Error::TooManyDependencies(14))
        );
    }

    #[test]
    fn rejects_truncated_dependency_list() {
        let raw = [0x80, 0, 1, 1, 0x82, 0, 1];
        assert!(matches!(
            DependencyDescriptor::decode(&mut &raw[..]),
            Err(Error::Truncated { needed: 4, available: 2 })
        ));
    }

    #[test]
    fn rejects_zero_diff_and_reserved_bits() {
        let raw = [0x80, 0, 1, 1, 0x81, 0, 0];
        assert_eq!(
            DependencyDescriptor::decode(&mut &raw[..]),
            Err(Error::ZeroFrameDiff)
        );
        let raw = [0x80, 0, 1, 1, 0x20];
        assert_eq!(
            DependencyDescriptor::decode(&mut &raw[..]),
            Err(Error::ReservedBits("descriptor dependency byte"))
        );
    }

    #[test]
    fn max_descriptor_len_matches_limits() {
        let desc = DependencyDescriptor {
            custom_dependencies: Some((1..=13).collect()),
            ..Default::default()
        };
        assert_eq!(encode(&desc).len(), MAX_DESCRIPTOR_LEN);
        assert!(MAX_DESCRIPTOR_LEN <= 32);
    }
}
