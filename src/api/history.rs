//! Chat history snapshot

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use super::ApiState;
use crate::history::Message;

async fn history(State(state): State<Arc<ApiState>>) -> Json<Vec<Message>> {
    Json(state.coordinator.history_snapshot())
}

pub fn router() -> Router<Arc<ApiState>> {
    Router::new().route("/history", get(history))
}
