#![forbid(unsafe_code)]

// Media Engine Facade - owns the worker pool and one media bundle per room,
// and exposes the operations the signaling layer consumes.
//
// Every operation is idempotent with respect to missing rooms and resources:
// lookups that find nothing return None/false instead of failing. Errors are
// reserved for genuine engine failures.

pub mod config;
pub mod types;
pub mod worker_pool;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use types::{ConsumerInfo, MediaError, MediaResult, TransportInfo};
pub use worker_pool::WorkerPool;

use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use types::{ConsumerEntry, RoomMedia};

/// Facade over the SFU runtime.
///
/// The outer room map is a std RwLock held only for lookups and inserts;
/// each room's bundle has its own tokio Mutex held across engine calls, so
/// one room's media work never blocks another's.
pub struct MediaEngine {
    pool: Arc<WorkerPool>,
    config: MediaConfig,
    rooms: StdRwLock<HashMap<String, Arc<TokioMutex<RoomMedia>>>>,
}

impl MediaEngine {
    pub async fn new(config: MediaConfig) -> MediaResult<Arc<Self>> {
        let pool = WorkerPool::new(config.worker.clone()).await?;
        Ok(Arc::new(Self {
            pool,
            config,
            rooms: StdRwLock::new(HashMap::new()),
        }))
    }

    fn room(&self, room_id: &str) -> Option<Arc<TokioMutex<RoomMedia>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Returns the room's router bundle, creating it on first use. Routers
    /// are placed round-robin across the worker pool and remember their
    /// worker so load can be attributed later.
    pub async fn create_router(self: &Arc<Self>, room_id: &str) -> MediaResult<()> {
        if self.room(room_id).is_some() {
            return Ok(());
        }

        let worker = self.pool.next_worker().await?;
        let worker_id = worker.id();
        let router = worker
            .create_router(self.config.router.to_router_options())
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        router
            .on_worker_close({
                let room_id = room_id.to_string();
                move || {
                    warn!("Worker died under the router for room {}", room_id);
                }
            })
            .detach();

        let created = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(room_id) {
                // Lost the creation race; drop ours and keep the winner.
                false
            } else {
                rooms.insert(
                    room_id.to_string(),
                    Arc::new(TokioMutex::new(RoomMedia::new(router, worker_id))),
                );
                true
            }
        };

        if created {
            info!("Created media router for room {} on worker {}", room_id, worker_id);
            self.trigger_autoscale();
        }
        Ok(())
    }

    pub async fn get_router_rtp_capabilities(
        &self,
        room_id: &str,
    ) -> Option<RtpCapabilitiesFinalized> {
        let room = self.room(room_id)?;
        let media = room.lock().await;
        Some(media.router.rtp_capabilities().clone())
    }

    /// Creates a WebRTC transport stored under the caller-composed key
    /// "{connectionId}-{direction}".
    pub async fn create_webrtc_transport(
        &self,
        room_id: &str,
        transport_id: &str,
    ) -> MediaResult<Option<TransportInfo>> {
        let Some(room) = self.room(room_id) else {
            return Ok(None);
        };

        // Clone the router handle so the engine call happens outside the
        // bundle lock.
        let router = { room.lock().await.router.clone() };
        let transport = router
            .create_webrtc_transport(self.config.transport.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        transport
            .on_ice_state_change({
                let transport_id = transport_id.to_string();
                move |ice_state| {
                    debug!("ICE state {:?} for transport {}", ice_state, transport_id);
                }
            })
            .detach();
        transport
            .on_dtls_state_change({
                let transport_id = transport_id.to_string();
                move |dtls_state| {
                    debug!("DTLS state {:?} for transport {}", dtls_state, transport_id);
                }
            })
            .detach();

        let info = TransportInfo::from(&transport);
        let mut media = room.lock().await;
        if let Some(old) = media.transports.insert(transport_id.to_string(), transport) {
            debug!(
                "Replaced existing transport {} in room {} (old engine id {})",
                transport_id,
                room_id,
                old.id()
            );
        }
        info!("Created transport {} in room {}", transport_id, room_id);
        Ok(Some(info))
    }

    /// Completes the DTLS handshake for a transport. `false` when the room
    /// or transport is unknown.
    pub async fn connect_transport(
        &self,
        room_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<bool> {
        let Some(room) = self.room(room_id) else {
            return Ok(false);
        };
        let transport = {
            let media = room.lock().await;
            match media.transports.get(transport_id) {
                Some(t) => t.clone(),
                None => return Ok(false),
            }
        };
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))?;
        debug!("Connected transport {} in room {}", transport_id, room_id);
        Ok(true)
    }

    /// Creates a producer on the given send transport. Returns the
    /// engine-assigned producer id.
    pub async fn produce(
        &self,
        room_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<Option<String>> {
        let Some(room) = self.room(room_id) else {
            return Ok(None);
        };
        let transport = {
            let media = room.lock().await;
            match media.transports.get(transport_id) {
                Some(t) => t.clone(),
                None => return Ok(None),
            }
        };

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;
        let producer_id = producer.id().to_string();

        producer
            .on_transport_close({
                let producer_id = producer_id.clone();
                move || {
                    debug!("Transport closed under producer {}", producer_id);
                }
            })
            .detach();

        let mut media = room.lock().await;
        media.producers.insert(producer_id.clone(), producer);
        info!(
            "Created {:?} producer {} on transport {} in room {}",
            kind, producer_id, transport_id, room_id
        );
        Ok(Some(producer_id))
    }

    /// Creates a consumer on the given recv transport. Consumers start
    /// paused; the client confirms readiness with `resumeConsumer`.
    pub async fn consume(
        &self,
        room_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Option<ConsumerInfo>> {
        let Some(room) = self.room(room_id) else {
            return Ok(None);
        };
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return Ok(None);
        };

        let (router, transport) = {
            let media = room.lock().await;
            let Some(transport) = media.transports.get(transport_id).cloned() else {
                return Ok(None);
            };
            (media.router.clone(), transport)
        };

        if !router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(MediaError::ConsumerError(format!(
                "Cannot consume producer {producer_id} with the given capabilities"
            )));
        }

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;
        let info = ConsumerInfo::from(&consumer);

        let mut media = room.lock().await;
        media.consumers.insert(
            info.id.clone(),
            ConsumerEntry {
                consumer,
                transport_key: transport_id.to_string(),
            },
        );
        info!(
            "Created consumer {} for producer {} in room {}",
            info.id, producer_id, room_id
        );
        Ok(Some(info))
    }

    /// Unpauses a consumer. `false` when the room or consumer is unknown.
    pub async fn resume_consumer(&self, room_id: &str, consumer_id: &str) -> MediaResult<bool> {
        let Some(room) = self.room(room_id) else {
            return Ok(false);
        };
        let consumer = {
            let media = room.lock().await;
            match media.consumers.get(consumer_id) {
                Some(entry) => entry.consumer.clone(),
                None => return Ok(false),
            }
        };
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))?;
        debug!("Resumed consumer {} in room {}", consumer_id, room_id);
        Ok(true)
    }

    pub async fn get_producers(&self, room_id: &str) -> Vec<String> {
        match self.room(room_id) {
            Some(room) => room.lock().await.producers.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Closes a producer. A missing room or producer is a no-op; the return
    /// value says whether anything was actually closed.
    pub async fn close_producer(&self, room_id: &str, producer_id: &str) -> bool {
        let Some(room) = self.room(room_id) else {
            return false;
        };
        let mut media = room.lock().await;
        if media.producers.remove(producer_id).is_some() {
            info!("Closed producer {} in room {}", producer_id, room_id);
            true
        } else {
            false
        }
    }

    /// Closes a transport and prunes the consumers that lived on it.
    pub async fn close_transport(&self, room_id: &str, transport_id: &str) {
        let Some(room) = self.room(room_id) else {
            return;
        };
        let mut media = room.lock().await;
        if media.transports.remove(transport_id).is_some() {
            media
                .consumers
                .retain(|_, entry| entry.transport_key != transport_id);
            info!("Closed transport {} in room {}", transport_id, room_id);
        }
    }

    /// Closes every transport whose key starts with `connection_prefix`. If
    /// any closed, every producer in the room is closed as well (producer
    /// ownership is not attributed per user at the engine level) and the
    /// closed producer ids are returned so the caller can notify viewers.
    pub async fn cleanup_user_media(
        &self,
        room_id: &str,
        connection_prefix: &str,
    ) -> Vec<String> {
        let Some(room) = self.room(room_id) else {
            return Vec::new();
        };
        let mut media = room.lock().await;

        let keys: Vec<String> = media
            .transports
            .keys()
            .filter(|key| key.starts_with(connection_prefix))
            .cloned()
            .collect();
        if keys.is_empty() {
            return Vec::new();
        }
        for key in &keys {
            media.transports.remove(key);
        }

        // All producers go with the departed connection's transports, and
        // every consumer in the room consumed one of them.
        let closed: Vec<String> = media.producers.drain().map(|(id, _)| id).collect();
        media.consumers.clear();
        info!(
            "Cleaned up {} transports and {} producers for {} in room {}",
            keys.len(),
            closed.len(),
            connection_prefix,
            room_id
        );
        closed
    }

    /// Destroys the room's media bundle: consumers, producers, transports,
    /// then the router.
    pub async fn close_room(self: &Arc<Self>, room_id: &str) {
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(room_id)
        };
        let Some(room) = removed else {
            return;
        };
        let mut media = room.lock().await;
        media.close_all();
        info!("Closed media router for room {}", room_id);
        drop(media);
        self.trigger_autoscale();
    }

    /// Fires an auto-scaling pass in the background. Overlapping triggers
    /// coalesce inside the pool.
    fn trigger_autoscale(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let room_count = engine.room_count();
            let attribution = engine.counts_by_worker().await;
            engine.pool.autoscale(room_count, &attribution).await;
        });
    }

    /// Live producer/consumer counts per worker, attributed through each
    /// router's recorded worker id.
    async fn counts_by_worker(&self) -> HashMap<WorkerId, (usize, usize)> {
        let bundles: Vec<Arc<TokioMutex<RoomMedia>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut counts: HashMap<WorkerId, (usize, usize)> = HashMap::new();
        for bundle in bundles {
            let media = bundle.lock().await;
            let entry = counts.entry(media.worker_id).or_insert((0, 0));
            entry.0 += media.producers.len();
            entry.1 += media.consumers.len();
        }
        counts
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.len()
    }

    pub async fn worker_count(&self) -> usize {
        self.pool.worker_count().await
    }

    /// Closes every room, then the worker pool.
    pub async fn shutdown(&self) {
        let bundles: Vec<(String, Arc<TokioMutex<RoomMedia>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };
        for (room_id, bundle) in bundles {
            bundle.lock().await.close_all();
            debug!("Closed media for room {} during shutdown", room_id);
        }
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> Arc<MediaEngine> {
        let mut config = MediaConfig::default();
        config.worker = config.worker.with_min_workers(1);
        MediaEngine::new(config).await.expect("engine should start")
    }

    #[tokio::test]
    async fn router_is_created_once_per_room() {
        let engine = engine().await;
        engine.create_router("room-a").await.expect("create");
        engine.create_router("room-a").await.expect("idempotent");
        assert_eq!(engine.room_count(), 1);

        let caps = engine.get_router_rtp_capabilities("room-a").await;
        assert!(caps.is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn missing_room_operations_are_noops() {
        let engine = engine().await;
        assert!(engine.get_router_rtp_capabilities("nope").await.is_none());
        assert!(engine
            .create_webrtc_transport("nope", "c1-send")
            .await
            .expect("no engine failure")
            .is_none());
        assert!(engine.get_producers("nope").await.is_empty());
        assert!(!engine
            .resume_consumer("nope", "consumer")
            .await
            .expect("no engine failure"));
        assert!(!engine.close_producer("nope", "producer").await);
        engine.close_room("nope").await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn transport_lifecycle_and_room_close() {
        let engine = engine().await;
        engine.create_router("room-a").await.expect("create");

        let info = engine
            .create_webrtc_transport("room-a", "c1-send")
            .await
            .expect("transport")
            .expect("room exists");
        assert!(!info.id.is_empty());

        engine.close_room("room-a").await;
        assert_eq!(engine.room_count(), 0);
        assert!(engine.get_router_rtp_capabilities("room-a").await.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_user_media_closes_prefixed_transports_and_all_producers() {
        let engine = engine().await;
        engine.create_router("room-a").await.expect("create");
        engine
            .create_webrtc_transport("room-a", "c1-send")
            .await
            .expect("transport")
            .expect("room exists");
        engine
            .create_webrtc_transport("room-a", "c2-recv")
            .await
            .expect("transport")
            .expect("room exists");

        // No producers yet; the prefixed transport still goes away.
        let closed = engine.cleanup_user_media("room-a", "c1").await;
        assert!(closed.is_empty());

        // Second cleanup for the same prefix finds nothing.
        let closed = engine.cleanup_user_media("room-a", "c1").await;
        assert!(closed.is_empty());
        engine.shutdown().await;
    }
}
