#![forbid(unsafe_code)]

// Server configuration read from the environment

use crate::media::MediaConfig;
use crate::room::TapSettings;
use crate::transcode::TranscodeConfig;
use anyhow::Context;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP / WebSocket listen port
    pub port: u16,
    pub max_connections: usize,
    /// Address announced in ICE candidates
    pub announce_ip: Option<IpAddr>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub webrtc_server_port: u16,
    pub tap_min_port: u16,
    pub tap_max_port: u16,
    pub tap_listen_ip: IpAddr,
    pub hls_root: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub transcoder_stop_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_connections: 10_000,
            announce_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            webrtc_server_port: 44444,
            tap_min_port: 20000,
            tap_max_port: 30000,
            tap_listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            hls_root: PathBuf::from("public/hls"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            transcoder_stop_grace: Duration::from_millis(3000),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        None => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let d = Self::default();
        let mut config = Self {
            port: parse_var(&lookup, "PORT", d.port)?,
            max_connections: parse_var(&lookup, "MAX_CONNECTIONS", d.max_connections)?,
            announce_ip: match lookup("ANNOUNCE_IP") {
                Some(raw) => Some(raw.trim().parse().with_context(|| format!("invalid ANNOUNCE_IP: {raw:?}"))?),
                None => None,
            },
            rtc_min_port: parse_var(&lookup, "RTC_MIN_PORT", d.rtc_min_port)?,
            rtc_max_port: parse_var(&lookup, "RTC_MAX_PORT", d.rtc_max_port)?,
            webrtc_server_port: parse_var(&lookup, "WEBRTC_SERVER_PORT", d.webrtc_server_port)?,
            tap_min_port: parse_var(&lookup, "TAP_MIN_PORT", d.tap_min_port)?,
            tap_max_port: parse_var(&lookup, "TAP_MAX_PORT", d.tap_max_port)?,
            tap_listen_ip: parse_var(&lookup, "TAP_LISTEN_IP", d.tap_listen_ip)?,
            hls_root: lookup("HLS_ROOT").map(PathBuf::from).unwrap_or(d.hls_root),
            ffmpeg_bin: lookup("FFMPEG_BIN").map(PathBuf::from).unwrap_or(d.ffmpeg_bin),
            transcoder_stop_grace: Duration::from_millis(parse_var(
                &lookup,
                "TRANSCODER_STOP_GRACE_MS",
                3000u64,
            )?),
        };

        if config.max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            config.max_connections = d.max_connections;
        }
        if config.rtc_min_port > config.rtc_max_port {
            anyhow::bail!(
                "RTC_MIN_PORT ({}) is above RTC_MAX_PORT ({})",
                config.rtc_min_port,
                config.rtc_max_port
            );
        }
        if config.tap_min_port >= config.tap_max_port {
            anyhow::bail!(
                "TAP_MIN_PORT ({}) must be below TAP_MAX_PORT ({})",
                config.tap_min_port,
                config.tap_max_port
            );
        }
        Ok(config)
    }

    pub fn media_config(&self) -> MediaConfig {
        let mut media = MediaConfig::default();
        media.worker_config.rtc_min_port = self.rtc_min_port;
        media.worker_config.rtc_max_port = self.rtc_max_port;
        media.webrtc_server_config.port = self.webrtc_server_port;
        media.plain_transport_config.listen_ip = self.tap_listen_ip;

        let announce = self.announce_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        if self.announce_ip.is_none() {
            info!("No ANNOUNCE_IP set, using {}", announce);
        }
        media.webrtc_server_config = media.webrtc_server_config.with_public_ip(announce);
        media
    }

    pub fn tap_settings(&self, media: &MediaConfig) -> TapSettings {
        TapSettings {
            listen_ip: self.tap_listen_ip,
            rtcp_mux: media.plain_transport_config.rtcp_mux,
            capabilities: media.tap_capabilities.clone(),
            transcode: TranscodeConfig {
                ffmpeg_bin: self.ffmpeg_bin.clone(),
                hls_root: self.hls_root.clone(),
                stop_grace: self.transcoder_stop_grace,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.tap_min_port, 20000);
        assert_eq!(config.tap_max_port, 30000);
        assert_eq!(config.hls_root, PathBuf::from("public/hls"));
        assert_eq!(config.transcoder_stop_grace, Duration::from_secs(3));
        assert!(config.announce_ip.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("ANNOUNCE_IP", "203.0.113.7"),
            ("TAP_MIN_PORT", "40000"),
            ("TAP_MAX_PORT", "40100"),
            ("FFMPEG_BIN", "/opt/ffmpeg/bin/ffmpeg"),
            ("MAX_CONNECTIONS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.announce_ip, Some("203.0.113.7".parse().unwrap()));
        assert_eq!(config.tap_min_port, 40000);
        assert_eq!(config.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.max_connections, 10_000);

        let media = config.media_config();
        assert_eq!(
            media.webrtc_server_config.announced_address.as_deref(),
            Some("203.0.113.7")
        );
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("TAP_MIN_PORT", "30000")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("ANNOUNCE_IP", "nope")])).is_err());
    }
}
