#![forbid(unsafe_code)]

// Signaling module - WebSocket server and event dispatch.

pub mod connection;
pub mod orchestrator;
pub mod protocol;

pub use orchestrator::Orchestrator;

use crate::metrics::ServerMetrics;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state.
#[derive(Clone)]
pub struct SignalingServer {
    orchestrator: Arc<Orchestrator>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        metrics: ServerMetrics,
        max_connections: usize,
    ) -> Self {
        info!("Max connections: {}", max_connections);
        Self {
            orchestrator,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Builds the axum router. Cross-origin acceptance is permissive; the
    /// clients are browser pages served from anywhere.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds and serves until the process shuts down.
    ///
    /// # Errors
    /// Returns an error if the listener cannot bind.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let (rooms, members, workers) = server.orchestrator.snapshot().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "members": members,
        "mediaWorkers": workers,
    }))
}

async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let (rooms, members, workers) = server.orchestrator.snapshot().await;
    let body = server.metrics.render_prometheus(rooms, members, workers);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.orchestrator, server.metrics, permit)
        })
}
