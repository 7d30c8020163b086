#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::media::types::{MediaKind, TapEndpoint, TransportInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A client frame: the message plus the id its acknowledgement echoes back
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enter a room; `viewMode` asks for the HLS tap instead of a seat
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        view_mode: bool,
    },
    /// Publish receive capabilities and catch up on existing producers
    #[serde(rename_all = "camelCase")]
    Join {
        rtp_capabilities: Value,
        #[serde(default)]
        sctp_capabilities: Option<Value>,
    },
    CreateWebRtcTransport {
        #[serde(default)]
        producing: bool,
        #[serde(default)]
        consuming: bool,
    },
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
}

impl ClientMessage {
    /// Wire name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "joinRoom",
            ClientMessage::Join { .. } => "join",
            ClientMessage::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            ClientMessage::ConnectWebRtcTransport { .. } => "connectWebRtcTransport",
            ClientMessage::Produce { .. } => "produce",
        }
    }
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    GetRouterRtpCapabilities {
        router_rtp_capabilities: Value,
    },
    /// Outcome of a request that carried a `requestId`
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<TransportInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer_id: Option<String>,
    },
    /// A consumer was created for a producer of `participantId`
    #[serde(rename_all = "camelCase")]
    NewConsumer {
        participant_id: String,
        producer_id: String,
        id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantDisconnected {
        participant_id: String,
    },
    /// The room is being republished as HLS
    #[serde(rename_all = "camelCase")]
    TapStarted {
        room_id: String,
        playlist: String,
        audio_transport: TapEndpoint,
        video_transport: TapEndpoint,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn ack(request_id: Option<u64>) -> Self {
        ServerMessage::Ack {
            request_id,
            success: true,
            error: None,
            transport: None,
            producer_id: None,
        }
    }

    pub fn nack(request_id: Option<u64>, error: impl ToString) -> Self {
        ServerMessage::Ack {
            request_id,
            success: false,
            error: Some(error.to_string()),
            transport: None,
            producer_id: None,
        }
    }
}

/// Serialize a ServerMessage and queue it on a client's outbound channel
pub fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
