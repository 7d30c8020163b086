#![forbid(unsafe_code)]

// Roomcast library - WebRTC room signaling with an HLS tap per room

pub mod bridge;
pub mod config;
pub mod media;
pub mod metrics;
pub mod ports;
pub mod room;
pub mod signaling;
pub mod transcode;
