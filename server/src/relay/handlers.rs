//! Control API
//!
//! HTTP surface called by the external signaling service.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use vc_common::RoomId;

use super::error::RelayError;
use super::sfu::SfuServer;
use super::signaling::SignalingEvent;
use super::stats::{RelayStats, RoomStats};

/// Build the control API router.
pub fn router(sfu: Arc<SfuServer>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/signaling", post(apply_event))
        .route("/stats", get(relay_stats))
        .route("/rooms/{room_id}", get(room_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(sfu)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Active rooms
    rooms: usize,
}

/// Health check endpoint.
async fn health_check(State(sfu): State<Arc<SfuServer>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rooms: sfu.registry().room_count(),
    })
}

/// Apply a signaling event.
///
/// POST /signaling
async fn apply_event(
    State(sfu): State<Arc<SfuServer>>,
    Json(event): Json<SignalingEvent>,
) -> Result<StatusCode, RelayError> {
    sfu.apply(event, Instant::now())?;
    Ok(StatusCode::NO_CONTENT)
}

/// Relay-wide statistics.
///
/// GET /stats
async fn relay_stats(State(sfu): State<Arc<SfuServer>>) -> Json<RelayStats> {
    Json(sfu.stats())
}

/// Statistics of one room.
///
/// GET /rooms/{room_id}
async fn room_stats(
    State(sfu): State<Arc<SfuServer>>,
    Path(room_id): Path<u32>,
) -> Result<Json<RoomStats>, RelayError> {
    sfu.room_stats(RoomId(room_id)).map(Json)
}
