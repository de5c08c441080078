//! HTTP API server for Remy
//!
//! Push-only presentation: it reads coordinator state and streams events but
//! never drives the microphone, the camera or the chat service.

pub mod events;
pub mod health;
pub mod history;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{Error, Result};
use crate::coordinator::CoordinatorHandle;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: CoordinatorHandle,
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn new(coordinator: CoordinatorHandle, port: u16) -> Self {
        Self {
            state: Arc::new(ApiState { coordinator }),
            port,
        }
    }

    /// Build the router with all endpoints
    pub fn router(&self) -> Router {
        Router::new()
            .merge(health::router())
            .merge(history::router())
            .merge(events::router())
            .with_state(Arc::clone(&self.state))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the port and serve in a background task until the coordinator
    /// shuts down
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn spawn(self) -> Result<RunningServer> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server on port {}: {e}", self.port)))?;
        let addr = listener.local_addr()?;

        tracing::info!(%addr, "API server listening");

        let coordinator = self.state.coordinator.clone();
        let router = self.router();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { coordinator.stopped().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "API server stopped");
            }
        });

        Ok(RunningServer { addr, task })
    }
}

/// A bound API server serving in the background
pub struct RunningServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningServer {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the server to finish its graceful shutdown
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "API server task failed");
        }
    }
}
