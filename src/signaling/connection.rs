#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients.

use crate::metrics::ServerMetrics;
use crate::signaling::orchestrator::Orchestrator;
use crate::signaling::protocol::{ClientEvent, ServerEvent};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client. Events queued beyond this are stale
/// and dropped early.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this window. Prevents
/// half-open sockets from holding semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: burst capacity and refill per second.
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
const RATE_LIMIT_REFILL_RATE: u64 = 100;
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Handles a single WebSocket connection until it closes, then hands the
/// disconnect to the orchestrator for grace handling.
pub async fn handle_connection(
    socket: WebSocket,
    orchestrator: Arc<Orchestrator>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New connection: {}", connection_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let close = orchestrator.bus().register(&connection_id, tx);

    let send_metrics = metrics.clone();
    let send_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_events_sent();
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Send task finished for connection {}", send_connection_id);
    });

    // Token bucket state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = tokio::select! {
            _ = close.notified() => {
                info!("Connection {} force-closed after rebind", connection_id);
                break;
            }
            received = tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()) => {
                match received {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(_))) | Ok(None) => break,
                    Err(_) => {
                        warn!("Idle timeout for connection {}", connection_id);
                        break;
                    }
                }
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_events_received();

                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        orchestrator.bus().send_to(
                            &connection_id,
                            &ServerEvent::Error {
                                message: format!(
                                    "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} events/second"
                                ),
                            },
                        );
                    }
                    continue;
                }

                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        let start = Instant::now();
                        let result = orchestrator.handle_event(&connection_id, event).await;
                        metrics.observe_event_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling event from {}: {}", connection_id, e);
                            metrics.inc_errors();
                            orchestrator.bus().send_to(
                                &connection_id,
                                &ServerEvent::Error {
                                    message: e.to_string(),
                                },
                            );
                        }
                    }
                    Err(e) => {
                        warn!("Invalid event format from {}: {}", connection_id, e);
                        metrics.inc_errors();
                        orchestrator.bus().send_to(
                            &connection_id,
                            &ServerEvent::Error {
                                message: format!("Invalid event format: {e}"),
                            },
                        );
                    }
                }
            }
            Message::Close(_) => {
                info!("Connection {} closed by client", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected message type from connection {}", connection_id);
            }
        }
    }

    // Unregister before the disconnect handler runs so the grace timer's
    // liveness check sees this connection as gone.
    orchestrator.bus().unregister(&connection_id);
    orchestrator.handle_disconnect(&connection_id).await;

    let _ = send_task.await;
    info!("Connection handler finished for {}", connection_id);
}
