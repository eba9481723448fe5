//! Media Relay (SFU)
//!
//! Selective forwarding of audio, video and screen share datagrams.
//!
//! This module provides:
//! - Room registry with per-room routing snapshots
//! - Dependency tracking and layer selection for SVC streams
//! - Per-link bandwidth estimation driven by congestion feedback
//! - The forwarding hot path and the feedback relay
//! - HTTP control API for the signaling service

pub mod bwe;
pub mod dependency;
pub mod error;
mod feedback;
pub mod forwarder;
mod handlers;
pub mod layers;
pub mod link;
mod rate_limit;
pub mod registry;
pub mod room;
pub mod selector;
pub mod sfu;
pub mod signaling;
pub mod stats;

// Re-exports
pub use bwe::{Bitrate, CongestionController, ControllerFactory, GccEstimator, PacketResult};
pub use error::RelayError;
pub use feedback::{ArrivalRecorder, UplinkState};
pub use forwarder::Egress;
pub use handlers::router;
pub use layers::{CodecNegotiation, DependencyTemplate, LayerGraph, LayerSpec};
pub use room::{Role, Room, StreamKey};
pub use sfu::SfuServer;
pub use signaling::SignalingEvent;
pub use stats::{LinkStats, RelayStats, RoomStats, StreamStats};
