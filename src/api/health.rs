//! Health and status endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::coordinator::Mode;
use crate::voice::SourceStats;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Coordinator status
#[derive(Serialize)]
pub struct StatusResponse {
    pub mode: Mode,
    pub microphone: SourceStats,
    pub history_messages: usize,
}

async fn welcome() -> &'static str {
    "Welcome to Remy!"
}

/// Liveness probe - is the service running?
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let status = if state.coordinator.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let coordinator = &state.coordinator;
    Json(StatusResponse {
        mode: coordinator.mode(),
        microphone: coordinator.source_stats(),
        history_messages: coordinator.history_snapshot().len(),
    })
}

/// Build health and status routes
pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(welcome))
        .route("/health", get(health))
        .route("/status", get(status))
}
