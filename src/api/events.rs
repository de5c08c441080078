//! Server-Sent Events stream of coordinator events

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use super::ApiState;

async fn events(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.coordinator.subscribe()).filter_map(|event| {
        // Lagged subscribers skip what they missed
        let event = event.ok()?;
        match Event::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode event");
                None
            }
        }
    });

    // End the stream on shutdown so graceful shutdown is not held open
    let coordinator = state.coordinator.clone();
    let stream = futures::StreamExt::take_until(stream, async move { coordinator.stopped().await });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<Arc<ApiState>> {
    Router::new().route("/events", get(events))
}
