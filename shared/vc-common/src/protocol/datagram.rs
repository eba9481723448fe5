//! Whole datagrams: header, optional descriptor and payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    DependencyDescriptor, FeedbackMessage, HeaderFlags, MediaHeader, PacketType, HEADER_LEN,
};
use crate::error::{Error, Result};

/// A decoded relay datagram.
///
/// The payload is a zero-copy slice of the received buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Fixed header.
    pub header: MediaHeader,
    /// Dependency descriptor, present iff the header flags say so.
    pub descriptor: Option<DependencyDescriptor>,
    /// Opaque codec payload, or an encoded [`FeedbackMessage`].
    pub payload: Bytes,
}

impl Datagram {
    /// Decode a datagram. Fails closed on any malformed field.
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let header = MediaHeader::decode(&mut bytes)?;

        let descriptor = if header.flags.contains(HeaderFlags::HAS_DEP_DESC) {
            if !header.packet_type.allows_descriptor() {
                return Err(Error::DescriptorNotAllowed(header.packet_type));
            }
            Some(DependencyDescriptor::decode(&mut bytes)?)
        } else {
            None
        };

        Ok(Self {
            header,
            descriptor,
            payload: bytes,
        })
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + self
                .descriptor
                .as_ref()
                .map_or(0, DependencyDescriptor::encoded_len)
            + self.payload.len()
    }

    /// Encode the datagram.
    pub fn encode(&self) -> Result<Bytes> {
        if self.header.flags.contains(HeaderFlags::HAS_DEP_DESC) != self.descriptor.is_some() {
            return Err(Error::DescriptorMismatch);
        }
        if self.descriptor.is_some() && !self.header.packet_type.allows_descriptor() {
            return Err(Error::DescriptorNotAllowed(self.header.packet_type));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf)?;
        if let Some(descriptor) = &self.descriptor {
            descriptor.encode(&mut buf)?;
        }
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode the payload of a feedback datagram.
    pub fn feedback(&self) -> Result<FeedbackMessage> {
        if self.header.packet_type != PacketType::Feedback {
            return Err(Error::NotFeedback(self.header.packet_type));
        }
        FeedbackMessage::decode(&mut self.payload.clone())
    }

    /// Build a feedback datagram around `message`.
    pub fn with_feedback(header: MediaHeader, message: &FeedbackMessage) -> Result<Self> {
        let mut payload = BytesMut::new();
        message.encode(&mut payload)?;
        Ok(Self {
            header: MediaHeader {
                packet_type: PacketType::Feedback,
                flags: HeaderFlags::empty(),
                ..header
            },
            descriptor: None,
            payload: payload.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use crate::types::{CodecId, LayerId, MediaKind, ParticipantId, RoomId};

    fn video_header(flags: HeaderFlags) -> MediaHeader {
        MediaHeader {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Video,
            codec: CodecId::Av1,
            flags,
            room_id: RoomId(1),
            sender_id: ParticipantId(2),
            sequence: 3,
            timestamp: 4,
            layer: LayerId::new(1, 0),
            dtx: false,
        }
    }

    #[test]
    fn video_datagram_with_descriptor() {
        let datagram = Datagram {
            header: video_header(HeaderFlags::HAS_DEP_DESC | HeaderFlags::END_OF_FRAME),
            descriptor: Some(DependencyDescriptor {
                start_of_frame: true,
                end_of_frame: true,
                template_id: 2,
                frame_number: 77,
                decode_targets: 0b11,
                custom_dependencies: Some(vec![1]),
            }),
            payload: Bytes::from_static(b"opaque-av1"),
        };
        let bytes = datagram.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 7 + 10);
        assert_eq!(bytes.len(), datagram.encoded_len());
        assert_eq!(Datagram::decode(bytes).unwrap(), datagram);
    }

    #[test]
    fn payload_is_untouched() {
        let datagram = Datagram {
            header: video_header(HeaderFlags::empty()),
            descriptor: None,
            payload: Bytes::from_static(&[0x10, 0xFF, 0x00]),
        };
        let decoded = Datagram::decode(datagram.encode().unwrap()).unwrap();
        assert_eq!(&decoded.payload[..], &[0x10, 0xFF, 0x00]);
        assert!(decoded.descriptor.is_none());
    }

    #[test]
    fn descriptor_flag_must_match_presence() {
        let datagram = Datagram {
            header: video_header(HeaderFlags::HAS_DEP_DESC),
            descriptor: None,
            payload: Bytes::new(),
        };
        assert_eq!(datagram.encode(), Err(Error::DescriptorMismatch));
    }

    #[test]
    fn audio_cannot_carry_descriptor() {
        let mut header = video_header(HeaderFlags::HAS_DEP_DESC);
        header.packet_type = PacketType::Audio;
        header.codec = CodecId::Opus;
        let mut raw = BytesMut::new();
        header.encode(&mut raw).unwrap();
        raw.extend_from_slice(&[0x80, 0, 1, 1, 0]);
        assert_eq!(
            Datagram::decode(raw.freeze()),
            Err(Error::DescriptorNotAllowed(PacketType::Audio))
        );
    }

    #[test]
    fn truncated_descriptor_fails_closed() {
        let mut raw = BytesMut::new();
        video_header(HeaderFlags::HAS_DEP_DESC)
            .encode(&mut raw)
            .unwrap();
        raw.extend_from_slice(&[0x80, 0]);
        assert!(matches!(
            Datagram::decode(raw.freeze()),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn feedback_round_trip() {
        let message = FeedbackMessage::KeyframeRequest {
            media_sender: ParticipantId(2),
            kind: MediaKind::Screen,
        };
        let datagram = Datagram::with_feedback(video_header(HeaderFlags::KEYFRAME), &message)
            .unwrap();
        assert_eq!(datagram.header.packet_type, PacketType::Feedback);
        assert!(datagram.header.flags.is_empty());

        let decoded = Datagram::decode(datagram.encode().unwrap()).unwrap();
        assert_eq!(decoded.feedback().unwrap(), message);
    }

    #[test]
    fn media_payload_is_not_feedback() {
        let datagram = Datagram {
            header: video_header(HeaderFlags::empty()),
            descriptor: None,
            payload: Bytes::new(),
        };
        assert_eq!(
            datagram.feedback(),
            Err(Error::NotFeedback(PacketType::Video))
        );
    }
}
