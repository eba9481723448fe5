//! `VoiceChat` Media Relay
//!
//! Selective forwarding unit for voice, video and screen share. Receives
//! media datagrams over UDP, fans them out to subscribed receivers and
//! adapts each receiver's SVC layer to its estimated bandwidth.

pub mod config;
pub mod metrics;
pub mod observability;
pub mod relay;
pub mod transport;
