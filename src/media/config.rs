#![forbid(unsafe_code)]

// Configuration for the media engine: worker, router codecs, transports and the tap path

use crate::media::types::MediaKind;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Main media server configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_server_config: WebRtcServerConfig,
    pub plain_transport_config: PlainTransportConfig,
    pub tap_capabilities: TapCapabilities,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub dtls_certificate_file: Option<PathBuf>,
    pub dtls_private_key_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Engine codec list in mediasoup's JSON shape
    pub media_codecs: Value,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Returns default codec capabilities for audio and video
    pub fn default_codecs() -> Value {
        json!([
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 111,
                "clockRate": 48000,
                "channels": 2,
                "parameters": {},
                "rtcpFeedback": []
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 96,
                "clockRate": 90000,
                "parameters": {},
                "rtcpFeedback": []
            },
            {
                "kind": "video",
                "mimeType": "video/H264",
                "preferredPayloadType": 102,
                "clockRate": 90000,
                "parameters": {
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f",
                    "level-asymmetry-allowed": 1
                },
                "rtcpFeedback": []
            }
        ])
    }
}

/// Shared WebRTC server every interactive transport listens on
#[derive(Debug, Clone)]
pub struct WebRtcServerConfig {
    pub listen_ip: IpAddr,
    pub port: u16,
    pub announced_address: Option<String>,
    pub enable_tcp: bool,
}

impl Default for WebRtcServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 44444,
            announced_address: None,
            enable_tcp: true,
        }
    }
}

impl WebRtcServerConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }
}

/// Plain transport settings for tap transports
#[derive(Debug, Clone)]
pub struct PlainTransportConfig {
    pub listen_ip: IpAddr,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

impl Default for PlainTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtcp_mux: false,
            comedia: true,
        }
    }
}

/// Receive capabilities the tap presents when consuming a producer.
/// Payload types here end up in the SDP handed to the transcoder.
#[derive(Debug, Clone)]
pub struct TapCapabilities {
    pub audio: Value,
    pub video: Value,
}

impl Default for TapCapabilities {
    fn default() -> Self {
        Self {
            audio: json!({
                "codecs": [{
                    "kind": "audio",
                    "mimeType": "audio/opus",
                    "preferredPayloadType": 100,
                    "clockRate": 48000,
                    "channels": 2,
                    "parameters": { "useinbandfec": 1 },
                    "rtcpFeedback": []
                }],
                "headerExtensions": []
            }),
            video: json!({
                "codecs": [{
                    "kind": "video",
                    "mimeType": "video/VP8",
                    "preferredPayloadType": 101,
                    "clockRate": 90000,
                    "parameters": {},
                    "rtcpFeedback": [{ "type": "nack", "parameter": "" }]
                }],
                "headerExtensions": []
            }),
        }
    }
}

impl TapCapabilities {
    pub fn for_kind(&self, kind: MediaKind) -> &Value {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}
