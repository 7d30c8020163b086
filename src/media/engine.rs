#![forbid(unsafe_code)]

// Engine boundary - the operations the signaling core calls on the media engine.
// The core never inspects engine internals; negotiation data travels as JSON.

use crate::media::types::{MediaKind, MediaResult, PlainTuple, TransportInfo};
use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

/// Creates one routing context per room
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Short engine name for logs and the health endpoint
    fn name(&self) -> &'static str;

    /// Creates a new routing context (one engine round-trip)
    async fn create_router(&self, room_id: &str) -> MediaResult<Arc<dyn RoutingContext>>;
}

/// Per-room namespace inside the engine (a mediasoup router)
#[async_trait]
pub trait RoutingContext: Send + Sync {
    fn id(&self) -> String;

    /// Capabilities sent to every participant before the handshake
    fn rtp_capabilities(&self) -> Value;

    /// Whether a subscriber with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(&self) -> MediaResult<Box<dyn WebRtcTransport>>;

    /// Plain RTP transport without ICE/DTLS, used by the tap path
    async fn create_plain_transport(&self) -> MediaResult<Box<dyn PlainTransport>>;

    /// Releases the routing context and everything created on it
    fn close(&self);
}

/// Interactive transport negotiated with a participant
#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> String;

    /// Connection parameters for the remote peer
    fn info(&self) -> TransportInfo;

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Box<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Box<dyn Consumer>>;

    /// Closes the transport and every producer/consumer created on it
    fn close(&self);
}

/// One-way transport mirroring media to a plain RTP endpoint
#[async_trait]
pub trait PlainTransport: Send + Sync {
    fn id(&self) -> String;

    fn tuple(&self) -> PlainTuple;

    async fn connect(&self, ip: IpAddr, port: u16, rtcp_port: Option<u16>) -> MediaResult<()>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Box<dyn Consumer>>;

    fn close(&self);
}

pub trait Producer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;

    /// Engine consumer type ("simple", "simulcast", ...)
    fn consumer_type(&self) -> String;

    fn paused(&self) -> bool;
    async fn resume(&self) -> MediaResult<()>;
    fn close(&self);
}
