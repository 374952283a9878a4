#![forbid(unsafe_code)]

// Process configuration, read once from the environment at startup.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// How long a disconnected user is considered recoverable before their
/// departure is committed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(8);

/// Which chat storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStoreKind {
    Postgres,
    Json,
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Publicly reachable address announced in ICE candidates. `None` means
    /// the media engine only announces a local address (development mode).
    pub announce_ip: Option<IpAddr>,
    pub chat_store: ChatStoreKind,
    pub database_url: Option<String>,
    pub chat_json_path: PathBuf,
    pub grace_period: Duration,
    pub min_workers: Option<usize>,
    pub max_connections: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        let announce_ip = match std::env::var("ANNOUNCE_IP") {
            Ok(raw) if !raw.is_empty() => match raw.parse::<IpAddr>() {
                Ok(ip) => {
                    info!("Using ANNOUNCE_IP={}", ip);
                    Some(ip)
                }
                Err(_) => {
                    warn!("Invalid ANNOUNCE_IP {:?}, announcing local address only", raw);
                    None
                }
            },
            _ => {
                info!("No ANNOUNCE_IP set, media engine announces local address only");
                None
            }
        };

        let chat_store = match std::env::var("CHAT_STORE").as_deref() {
            Ok("postgres") => ChatStoreKind::Postgres,
            Ok("json") | Err(_) => ChatStoreKind::Json,
            Ok(other) => {
                warn!("Unknown CHAT_STORE {:?}, falling back to json", other);
                ChatStoreKind::Json
            }
        };

        let grace_period = std::env::var("DISCONNECT_GRACE_PERIOD_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE_PERIOD);

        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }

        Self {
            port,
            announce_ip,
            chat_store,
            database_url: std::env::var("DATABASE_URL").ok(),
            chat_json_path: std::env::var("CHAT_JSON_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("chat-history.json")),
            grace_period,
            min_workers: std::env::var("MIN_WORKERS").ok().and_then(|v| v.parse().ok()),
            max_connections,
        }
    }
}
