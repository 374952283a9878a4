#![forbid(unsafe_code)]

// Wire protocol - tagged event types for the bidirectional connection.
//
// Room and chat events use kebab-case names; SFU signaling events keep the
// camelCase names the media clients expect. Payload fields are camelCase.

use crate::chat::{ChatMessage, Reaction};
use crate::media::{ConsumerInfo, TransportInfo};
use crate::registry::RoomTheme;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// Direction of a WebRTC transport, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl std::fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

/// A room member as exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: String,
    pub name: String,
}

/// Client-to-server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    CreateRoom { host_id: String, name: String },

    #[serde(rename_all = "camelCase")]
    ValidateRoom { room_id: String },

    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        member_id: String,
        name: String,
    },

    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String, member_id: String },

    #[serde(rename_all = "camelCase")]
    SpinResult {
        room_id: String,
        result: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    Offer {
        room_id: String,
        offer: serde_json::Value,
        to: String,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        room_id: String,
        answer: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        room_id: String,
        candidate: serde_json::Value,
        #[serde(default)]
        to: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    StopSharing { room_id: String },

    #[serde(rename_all = "camelCase")]
    HostReadyToShare { room_id: String },

    #[serde(rename_all = "camelCase")]
    RequestStream { room_id: String },

    #[serde(rename_all = "camelCase")]
    LivestreamReaction {
        room_id: String,
        user_name: String,
        emoji: String,
        user_id: String,
    },

    #[serde(rename_all = "camelCase")]
    UpdateTheme { room_id: String, theme: RoomTheme },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        user_id: String,
        user_name: String,
        message: String,
        room_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ReactToMessage {
        room_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },

    #[serde(rename = "getRouterRtpCapabilities", rename_all = "camelCase")]
    GetRouterRtpCapabilities { room_id: String },

    #[serde(rename = "createTransport", rename_all = "camelCase")]
    CreateTransport {
        room_id: String,
        direction: TransportDirection,
    },

    #[serde(rename = "connectTransport", rename_all = "camelCase")]
    ConnectTransport {
        room_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    #[serde(rename_all = "camelCase")]
    Produce {
        room_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    #[serde(rename_all = "camelCase")]
    Consume {
        room_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },

    #[serde(rename = "resumeConsumer", rename_all = "camelCase")]
    ResumeConsumer {
        room_id: String,
        consumer_id: String,
    },

    #[serde(rename = "getProducers", rename_all = "camelCase")]
    GetProducers { room_id: String },

    #[serde(rename = "closeProducer", rename_all = "camelCase")]
    CloseProducer {
        room_id: String,
        producer_id: String,
    },
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_id: String,
        host_id: String,
        members: Vec<MemberInfo>,
        theme: RoomTheme,
    },

    #[serde(rename_all = "camelCase")]
    RoomValidated {
        exists: bool,
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        member_count: Option<usize>,
    },

    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        member_id: String,
        members: Vec<MemberInfo>,
        theme: RoomTheme,
    },

    RoomDeleted {
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    MemberJoined {
        member_id: String,
        name: String,
        members: Vec<MemberInfo>,
    },

    #[serde(rename_all = "camelCase")]
    MemberLeft {
        member_id: String,
        members: Vec<MemberInfo>,
    },

    #[serde(rename_all = "camelCase")]
    HostReconnected {
        host_id: String,
        host_socket_id: String,
    },

    ThemeUpdated {
        theme: RoomTheme,
    },

    Error {
        message: String,
    },

    Offer {
        offer: serde_json::Value,
        from: String,
    },

    Answer {
        answer: serde_json::Value,
        from: String,
    },

    IceCandidate {
        candidate: serde_json::Value,
        from: String,
    },

    StopSharing,

    #[serde(rename_all = "camelCase")]
    ExistingViewers { viewer_ids: Vec<String> },

    #[serde(rename_all = "camelCase")]
    RequestStream { viewer_id: String },

    #[serde(rename_all = "camelCase")]
    ViewerJoined { viewer_id: String },

    #[serde(rename_all = "camelCase")]
    LivestreamReaction {
        id: String,
        user_name: String,
        emoji: String,
        user_id: String,
    },

    SpinResult {
        result: serde_json::Value,
    },

    ChatMessage {
        #[serde(flatten)]
        message: ChatMessage,
    },

    ChatHistory {
        messages: Vec<ChatMessage>,
    },

    #[serde(rename_all = "camelCase")]
    MessageReactionUpdated {
        message_id: String,
        reactions: Vec<Reaction>,
    },

    #[serde(rename = "routerRtpCapabilities", rename_all = "camelCase")]
    RouterRtpCapabilities {
        rtp_capabilities: RtpCapabilitiesFinalized,
    },

    #[serde(rename = "transportCreated", rename_all = "camelCase")]
    TransportCreated {
        direction: TransportDirection,
        transport_id: String,
        #[serde(flatten)]
        transport: TransportInfo,
    },

    #[serde(rename = "transportConnected", rename_all = "camelCase")]
    TransportConnected { transport_id: String },

    Produced {
        kind: MediaKind,
        id: String,
    },

    #[serde(rename = "newProducer", rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        kind: MediaKind,
    },

    Consumed {
        #[serde(flatten)]
        consumer: ConsumerInfo,
    },

    #[serde(rename = "consumerResumed", rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },

    Producers {
        producers: Vec<String>,
    },

    #[serde(rename = "producerClosed", rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
}
