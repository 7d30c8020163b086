#![forbid(unsafe_code)]

// SDP generation for the transcoder input

use super::TranscodeError;
use crate::media::types::{MediaKind, TapDescriptor};
use serde_json::Value;
use std::fmt::Write;

/// One tapped stream and the local port the transcoder listens on for it
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub port: u16,
    pub rtcp_port: Option<u16>,
    pub descriptor: TapDescriptor,
}

/// Everything needed to describe a room's tapped media to the transcoder
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    /// Address the transcoder receives on
    pub ip: String,
    pub audio: Option<StreamTarget>,
    pub video: Option<StreamTarget>,
}

impl SessionDescriptor {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

struct Codec<'a> {
    payload_type: u64,
    name: &'a str,
    clock_rate: u64,
    channels: Option<u64>,
    fmtp: Option<String>,
}

fn first_codec(descriptor: &TapDescriptor) -> Result<Codec<'_>, TranscodeError> {
    let codec = &descriptor.rtp_parameters["codecs"][0];
    let invalid = |field: &str| {
        TranscodeError::InvalidDescriptor(format!(
            "{} consumer {} has no {field}",
            descriptor.kind, descriptor.id
        ))
    };

    let mime = codec["mimeType"].as_str().ok_or_else(|| invalid("mimeType"))?;
    let name = mime.split_once('/').map(|(_, n)| n).unwrap_or(mime);
    let fmtp = match &codec["parameters"] {
        Value::Object(map) if !map.is_empty() => Some(
            map.iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{k}={s}"),
                    other => format!("{k}={other}"),
                })
                .collect::<Vec<_>>()
                .join(";"),
        ),
        _ => None,
    };

    Ok(Codec {
        payload_type: codec["payloadType"].as_u64().ok_or_else(|| invalid("payloadType"))?,
        name,
        clock_rate: codec["clockRate"].as_u64().ok_or_else(|| invalid("clockRate"))?,
        channels: codec["channels"].as_u64(),
        fmtp,
    })
}

fn write_media(out: &mut String, kind: MediaKind, target: &StreamTarget) -> Result<(), TranscodeError> {
    let codec = first_codec(&target.descriptor)?;
    let pt = codec.payload_type;

    let _ = writeln!(out, "m={kind} {} RTP/AVP {pt}", target.port);
    if let Some(rtcp) = target.rtcp_port {
        let _ = writeln!(out, "a=rtcp:{rtcp}");
    }
    match (kind, codec.channels) {
        (MediaKind::Audio, Some(channels)) => {
            let _ = writeln!(out, "a=rtpmap:{pt} {}/{}/{channels}", codec.name, codec.clock_rate);
        }
        _ => {
            let _ = writeln!(out, "a=rtpmap:{pt} {}/{}", codec.name, codec.clock_rate);
        }
    }
    if let Some(fmtp) = codec.fmtp {
        let _ = writeln!(out, "a=fmtp:{pt} {fmtp}");
    }
    let _ = writeln!(out, "a=recvonly");
    Ok(())
}

/// Renders the session description. Output depends only on the descriptor.
pub fn build_sdp(session: &SessionDescriptor) -> Result<String, TranscodeError> {
    if session.is_empty() {
        return Err(TranscodeError::InvalidDescriptor(
            "no tapped streams to describe".to_string(),
        ));
    }

    let ip = &session.ip;
    let mut out = String::with_capacity(512);
    let _ = writeln!(out, "v=0");
    let _ = writeln!(out, "o=- 0 0 IN IP4 {ip}");
    let _ = writeln!(out, "s=roomcast");
    let _ = writeln!(out, "c=IN IP4 {ip}");
    let _ = writeln!(out, "t=0 0");

    if let Some(audio) = &session.audio {
        write_media(&mut out, MediaKind::Audio, audio)?;
    }
    if let Some(video) = &session.video {
        write_media(&mut out, MediaKind::Video, video)?;
    }
    Ok(out)
}
