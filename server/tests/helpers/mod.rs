//! Reusable test helpers for relay integration tests.
//!
//! Provides `TestRelay` for driving an `SfuServer` with hand-built datagrams
//! and a simulated clock, `TestApp` for sending requests through the control
//! API router, plus builders for media and feedback packets.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{self, Method, Request, Response};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceExt;
use vc_common::protocol::{
    Datagram, DependencyDescriptor, FeedbackMessage, HeaderFlags, MediaHeader, PacketType,
    PROTOCOL_VERSION,
};
use vc_common::{CodecId, LayerId, MediaKind, ParticipantId, RoomId};
use vc_relay::config::Config;
use vc_relay::relay::{
    router, CodecNegotiation, DependencyTemplate, Egress, LayerSpec, Role, SfuServer,
    SignalingEvent,
};

pub const ROOM: RoomId = RoomId(7);

// ============================================================================
// Relay harness
// ============================================================================

/// An `SfuServer` plus a manual clock.
pub struct TestRelay {
    pub sfu: Arc<SfuServer>,
    pub start: Instant,
    now: Instant,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::with_config(Config::default_for_test())
    }

    pub fn with_config(config: Config) -> Self {
        let now = Instant::now();
        Self {
            sfu: Arc::new(SfuServer::new(Arc::new(config))),
            start: now,
            now,
        }
    }

    pub const fn now(&self) -> Instant {
        self.now
    }

    /// Move the clock forward.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn apply(&self, event: SignalingEvent) {
        self.sfu.apply(event, self.now).unwrap();
    }

    pub fn join(&self, participant: u32) {
        self.join_as(participant, Role::all());
    }

    pub fn join_as(&self, participant: u32, role: Role) {
        self.apply(SignalingEvent::Join {
            room_id: ROOM,
            participant_id: ParticipantId(participant),
            role,
            protocol_version: PROTOCOL_VERSION,
        });
    }

    pub fn negotiate(&self, sender: u32, kind: MediaKind, negotiation: CodecNegotiation) {
        self.apply(SignalingEvent::NegotiateCodec {
            room_id: ROOM,
            sender_id: ParticipantId(sender),
            kind,
            negotiation,
        });
    }

    pub fn subscribe(&self, receiver: u32, sender: u32, kind: MediaKind) {
        self.apply(SignalingEvent::Subscribe {
            room_id: ROOM,
            receiver_id: ParticipantId(receiver),
            sender_id: ParticipantId(sender),
            kind,
        });
    }

    /// Deliver a datagram as if it arrived from `participant`'s address.
    pub fn send(&self, participant: u32, datagram: &Bytes) -> Vec<Egress> {
        self.sfu
            .handle_datagram(datagram.clone(), addr(participant), self.now)
    }

    pub fn tick(&self) -> Vec<Egress> {
        self.sfu.on_tick(self.now)
    }
}

// ============================================================================
// Control API
// ============================================================================

/// The control API router over a fresh relay.
pub struct TestApp {
    pub router: Router,
    pub sfu: Arc<SfuServer>,
}

impl TestApp {
    pub fn new() -> Self {
        let sfu = Arc::new(SfuServer::new(Arc::new(Config::default_for_test())));
        Self {
            router: router(Arc::clone(&sfu)),
            sfu,
        }
    }

    /// Build an HTTP request with the given method and URI.
    pub fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    /// Send a request through the router via `tower::ServiceExt::oneshot`.
    pub async fn oneshot(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("oneshot request failed")
    }

    /// POST a signaling event given as JSON.
    pub async fn signal(&self, event: serde_json::Value) -> Response<Body> {
        let request = Self::request(Method::POST, "/signaling")
            .header("content-type", "application/json")
            .body(Body::from(event.to_string()))
            .unwrap();
        self.oneshot(request).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.oneshot(Self::request(Method::GET, uri).body(Body::empty()).unwrap())
            .await
    }
}

/// Collect a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Loopback address used for a participant.
pub fn addr(participant: u32) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 20_000 + participant as u16))
}

/// Receivers of a batch of egress datagrams.
pub fn recipients(egress: &[Egress]) -> Vec<ParticipantId> {
    let mut to: Vec<_> = egress.iter().map(|e| e.to).collect();
    to.sort();
    to
}

/// Decoded feedback messages among `egress` addressed to `to`.
pub fn feedback_to(egress: &[Egress], to: u32) -> Vec<FeedbackMessage> {
    egress
        .iter()
        .filter(|e| e.to == ParticipantId(to))
        .filter_map(|e| Datagram::decode(e.payload.clone()).ok())
        .filter(|d| d.header.packet_type == PacketType::Feedback)
        .filter_map(|d| d.feedback().ok())
        .collect()
}

// ============================================================================
// Negotiations
// ============================================================================

pub fn opus() -> CodecNegotiation {
    CodecNegotiation {
        codec: CodecId::Opus,
        layers: Vec::new(),
        templates: Vec::new(),
    }
}

/// Three spatial layers; template 0 is a keyframe, 2 is an S1 frame
/// predicted only from the S0 frame of the same picture. Templates 5 and 6
/// describe the S0T1 and S1T1 frames a two-temporal-layer encoder also emits.
pub fn svc_l3() -> CodecNegotiation {
    CodecNegotiation {
        codec: CodecId::Vp9,
        layers: vec![
            LayerSpec::new(0, 0, 150_000),
            LayerSpec::new(1, 0, 500_000),
            LayerSpec::new(2, 1, 2_000_000),
        ],
        templates: vec![
            template(0, LayerId::new(0, 0), &[]),
            template(1, LayerId::new(0, 0), &[3]),
            template(2, LayerId::new(1, 0), &[1]),
            template(3, LayerId::new(1, 0), &[1, 3]),
            template(4, LayerId::new(2, 1), &[1, 3]),
            template(5, LayerId::new(0, 1), &[3]),
            template(6, LayerId::new(1, 1), &[1, 3]),
        ],
    }
}

fn template(id: u8, layer: LayerId, diffs: &[u16]) -> DependencyTemplate {
    DependencyTemplate {
        id,
        layer,
        frame_diffs: diffs.to_vec(),
    }
}

// ============================================================================
// Datagram builders
// ============================================================================

fn header(sender: u32, packet_type: PacketType, codec: CodecId, sequence: u32) -> MediaHeader {
    MediaHeader {
        version: PROTOCOL_VERSION,
        packet_type,
        codec,
        flags: HeaderFlags::empty(),
        room_id: ROOM,
        sender_id: ParticipantId(sender),
        sequence,
        timestamp: sequence.wrapping_mul(960),
        layer: LayerId::BASE,
        dtx: false,
    }
}

/// Opus packet.
pub fn audio(sender: u32, sequence: u32, dtx: bool) -> Bytes {
    audio_in(ROOM, sender, sequence, dtx)
}

/// Opus packet addressed to `room`.
pub fn audio_in(room: RoomId, sender: u32, sequence: u32, dtx: bool) -> Bytes {
    Datagram {
        header: MediaHeader {
            dtx,
            room_id: room,
            ..header(sender, PacketType::Audio, CodecId::Opus, sequence)
        },
        descriptor: None,
        payload: Bytes::from_static(b"opus-frame"),
    }
    .encode()
    .unwrap()
}

/// One packet of an SVC frame.
pub struct VideoPacket {
    pub sequence: u32,
    pub frame: u16,
    pub layer: LayerId,
    pub template: u8,
    pub start_of_frame: bool,
}

impl VideoPacket {
    /// First packet of a frame.
    pub const fn start(sequence: u32, frame: u16, layer: LayerId, template: u8) -> Self {
        Self {
            sequence,
            frame,
            layer,
            template,
            start_of_frame: true,
        }
    }

    /// Follow-up packet of a frame.
    pub const fn continuation(sequence: u32, frame: u16, layer: LayerId, template: u8) -> Self {
        Self {
            sequence,
            frame,
            layer,
            template,
            start_of_frame: false,
        }
    }

    pub fn encode(&self, sender: u32) -> Bytes {
        let mut header = header(sender, PacketType::Video, CodecId::Vp9, self.sequence);
        header.layer = self.layer;
        header.flags = HeaderFlags::HAS_DEP_DESC;
        header.timestamp = u32::from(self.frame / 3) * 3000;
        Datagram {
            header,
            descriptor: Some(DependencyDescriptor {
                start_of_frame: self.start_of_frame,
                end_of_frame: !self.start_of_frame,
                template_id: self.template,
                frame_number: self.frame,
                decode_targets: 0xFF,
                custom_dependencies: None,
            }),
            payload: Bytes::from_static(b"vp9-slice"),
        }
        .encode()
        .unwrap()
    }
}

/// Video packet without a dependency descriptor.
pub fn bare_video(sender: u32, sequence: u32) -> Bytes {
    Datagram {
        header: header(sender, PacketType::Video, CodecId::Vp9, sequence),
        descriptor: None,
        payload: Bytes::from_static(b"vp9-slice"),
    }
    .encode()
    .unwrap()
}

fn feedback(from: u32, message: &FeedbackMessage) -> Bytes {
    Datagram::with_feedback(header(from, PacketType::Feedback, CodecId::None, 0), message)
        .unwrap()
        .encode()
        .unwrap()
}

pub fn receiver_estimate(from: u32, sender: u32, kind: MediaKind, bitrate_bps: u64) -> Bytes {
    feedback(
        from,
        &FeedbackMessage::ReceiverEstimate {
            media_sender: ParticipantId(sender),
            kind,
            bitrate_bps,
        },
    )
}

pub fn keyframe_request(from: u32, sender: u32, kind: MediaKind) -> Bytes {
    feedback(
        from,
        &FeedbackMessage::KeyframeRequest {
            media_sender: ParticipantId(sender),
            kind,
        },
    )
}

pub fn nack(from: u32, sender: u32, kind: MediaKind, sequences: Vec<u32>) -> Bytes {
    feedback(
        from,
        &FeedbackMessage::Nack {
            media_sender: ParticipantId(sender),
            kind,
            sequences,
        },
    )
}
