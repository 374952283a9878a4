#![forbid(unsafe_code)]

// Common types and error handling for the media engine.

use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Error type for media operations. Missing rooms and resources are NOT
/// errors at the facade boundary; this enum covers genuine engine failures.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Mediasoup error: {0}")]
    MediasoupError(#[from] mediasoup::worker::RequestError),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Transport parameters handed back to the client for DTLS/ICE setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportInfo {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Consumer parameters handed back to the requesting viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

impl From<&Consumer> for ConsumerInfo {
    fn from(consumer: &Consumer) -> Self {
        Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        }
    }
}

pub(crate) struct ConsumerEntry {
    pub consumer: Consumer,
    /// Facade-level key ("{connectionId}-recv") of the owning transport, so
    /// consumers can be pruned when their transport goes away.
    pub transport_key: String,
}

/// Per-room media bundle: one router on one worker, plus every transport,
/// producer, and consumer living on it. Destroyed atomically with the room.
///
/// `transports` is keyed by "{connectionId}-{direction}"; producers and
/// consumers are keyed by their engine-assigned ids.
pub(crate) struct RoomMedia {
    pub router: Router,
    pub worker_id: WorkerId,
    pub transports: HashMap<String, WebRtcTransport>,
    pub producers: HashMap<String, Producer>,
    pub consumers: HashMap<String, ConsumerEntry>,
}

impl RoomMedia {
    pub fn new(router: Router, worker_id: WorkerId) -> Self {
        Self {
            router,
            worker_id,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Drops every resource in child-to-parent order. Mediasoup objects close
    /// on drop.
    pub fn close_all(&mut self) {
        self.consumers.clear();
        self.producers.clear();
        self.transports.clear();
    }
}
