#![forbid(unsafe_code)]

mod bus;
mod chat;
mod config;
mod media;
mod metrics;
mod presence;
mod registry;
mod signaling;

use anyhow::Result;
use chat::{ChatCoordinator, ChatStore, JsonStore, PgStore, WordListFilter};
use config::{AppConfig, ChatStoreKind};
use media::{MediaConfig, MediaEngine};
use metrics::ServerMetrics;
use presence::GraceController;
use signaling::{Orchestrator, SignalingServer};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castroom=debug,mediasoup=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("castroom - starting server");
    let app_config = AppConfig::from_env();

    let mut media_config = MediaConfig::default();
    if let Some(ip) = app_config.announce_ip {
        media_config.transport = media_config.transport.with_announced_ip(ip);
    }
    if let Some(min_workers) = app_config.min_workers {
        media_config.worker = media_config.worker.with_min_workers(min_workers);
    }

    let media = MediaEngine::new(media_config).await?;
    info!(
        "Media engine initialized with {} workers",
        media.worker_count().await
    );

    let store: Arc<dyn ChatStore> = match app_config.chat_store {
        ChatStoreKind::Postgres => match &app_config.database_url {
            Some(url) => Arc::new(PgStore::connect(url).await?),
            None => {
                warn!("CHAT_STORE=postgres but DATABASE_URL not set, using JSON snapshot");
                Arc::new(JsonStore::open(app_config.chat_json_path.clone()).await?)
            }
        },
        ChatStoreKind::Json => Arc::new(JsonStore::open(app_config.chat_json_path.clone()).await?),
    };

    let chat = ChatCoordinator::new(store, Arc::new(WordListFilter::default()));
    let grace = GraceController::new(app_config.grace_period);
    let metrics = ServerMetrics::new();
    let orchestrator = Orchestrator::new(media, grace, chat, metrics.clone());

    let server = SignalingServer::new(
        Arc::clone(&orchestrator),
        metrics,
        app_config.max_connections,
    );

    tokio::select! {
        result = server.serve(app_config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            orchestrator.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
