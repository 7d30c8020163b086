#![forbid(unsafe_code)]

// Media bridge - receive-only plain RTP transports mirroring a room's producers
// to an external process (the transcoder).

use crate::media::engine::{Consumer, PlainTransport, RoutingContext};
use crate::media::types::{MediaError, MediaResult, TapDescriptor, TapEndpoint};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct TapTransport {
    label: String,
    handle: Box<dyn PlainTransport>,
}

/// Plain transports and tap consumers for one room viewing session.
///
/// Shares the room's routing context but owns every transport and consumer it
/// creates; nothing here is visible to interactive participants.
pub struct MediaBridge {
    router: Arc<dyn RoutingContext>,
    transports: HashMap<String, TapTransport>,
    consumers: HashMap<String, Box<dyn Consumer>>,
}

impl MediaBridge {
    pub fn new(router: Arc<dyn RoutingContext>) -> Self {
        Self {
            router,
            transports: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Creates a plain transport; `label` is only used in logs ("audio", "video")
    pub async fn open_tap(&mut self, label: &str) -> MediaResult<TapEndpoint> {
        let transport = self.router.create_plain_transport().await?;
        let tuple = transport.tuple();
        let endpoint = TapEndpoint {
            id: transport.id(),
            ip: tuple.local_ip.to_string(),
            port: tuple.local_port,
            rtcp_port: tuple.local_rtcp_port,
        };

        info!(
            "Opened {} tap transport {} on {}:{}",
            label, endpoint.id, endpoint.ip, endpoint.port
        );
        self.transports.insert(
            endpoint.id.clone(),
            TapTransport {
                label: label.to_string(),
                handle: transport,
            },
        );
        Ok(endpoint)
    }

    /// Points a tap transport at the receiving process
    pub async fn connect(
        &self,
        transport_id: &str,
        remote_ip: IpAddr,
        remote_port: u16,
        remote_rtcp_port: Option<u16>,
    ) -> MediaResult<()> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::TransportNotFound(transport_id.to_string()))?;

        transport
            .handle
            .connect(remote_ip, remote_port, remote_rtcp_port)
            .await
            .map_err(|e| MediaError::TransportError(format!("connect failed: {e}")))?;

        debug!(
            "{} tap transport {} sending to {}:{}",
            transport.label, transport_id, remote_ip, remote_port
        );
        Ok(())
    }

    /// Consumes `producer_id` on a tap transport and describes the resulting stream
    pub async fn tap_producer(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<TapDescriptor> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::TransportNotFound(transport_id.to_string()))?;

        // Always start paused so the descriptor is known before media flows
        let consumer = transport
            .handle
            .consume(producer_id, rtp_capabilities, true)
            .await?;

        let descriptor = TapDescriptor {
            id: consumer.id(),
            producer_id: consumer.producer_id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
        };
        info!(
            "Tapped {} producer {} as consumer {}",
            descriptor.kind, producer_id, descriptor.id
        );
        self.consumers.insert(descriptor.id.clone(), consumer);
        if !paused {
            if let Err(e) = self.resume(&descriptor.id).await {
                self.untap(&descriptor.id);
                return Err(e);
            }
        }
        Ok(descriptor)
    }

    /// Closes one tap consumer; false if it is not ours
    pub fn untap(&mut self, consumer_id: &str) -> bool {
        match self.consumers.remove(consumer_id) {
            Some(consumer) => {
                debug!("Closing tap consumer {}", consumer_id);
                consumer.close();
                true
            }
            None => false,
        }
    }

    pub async fn resume(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| MediaError::ConsumerError(format!("consumer {consumer_id} not found")))?;
        consumer.resume().await
    }

    #[cfg(test)]
    pub fn is_tapping(&self, producer_id: &str) -> bool {
        self.consumers.values().any(|c| c.producer_id() == producer_id)
    }

    #[cfg(test)]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[cfg(test)]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Closes tap consumers, then tap transports
    pub fn close(&mut self) {
        for (id, consumer) in self.consumers.drain() {
            debug!("Closing tap consumer {}", id);
            consumer.close();
        }
        for (id, transport) in self.transports.drain() {
            debug!("Closing {} tap transport {}", transport.label, id);
            transport.handle.close();
        }
    }
}

impl Drop for MediaBridge {
    fn drop(&mut self) {
        if !self.transports.is_empty() {
            warn!("Media bridge dropped with {} open transport(s)", self.transports.len());
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::{RouterConfig, TapCapabilities};
    use crate::media::engine::MediaEngine;
    use crate::media::loopback::{rtp_parameters, LoopbackEngine};
    use crate::media::types::MediaKind;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_tap_mirrors_a_producer() {
        let engine = LoopbackEngine::new(RouterConfig::default_codecs());
        let router = engine.create_router("room").await.unwrap();
        let publisher = router.create_webrtc_transport().await.unwrap();
        let producer = publisher
            .produce(MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();

        let mut bridge = MediaBridge::new(router.clone());
        let endpoint = bridge.open_tap("audio").await.unwrap();
        assert_eq!(endpoint.ip, "127.0.0.1");
        bridge
            .connect(&endpoint.id, IpAddr::V4(Ipv4Addr::LOCALHOST), 20000, Some(20001))
            .await
            .unwrap();

        let caps = TapCapabilities::default();
        let descriptor = bridge
            .tap_producer(&endpoint.id, &producer.id(), caps.audio.clone(), false)
            .await
            .unwrap();

        assert_eq!(descriptor.producer_id, producer.id());
        assert_eq!(descriptor.kind, MediaKind::Audio);
        assert_eq!(descriptor.rtp_parameters["codecs"][0]["payloadType"], 100);
        assert!(bridge.is_tapping(&producer.id()));
    }

    #[tokio::test]
    async fn test_untap_closes_only_that_consumer() {
        let engine = LoopbackEngine::new(RouterConfig::default_codecs());
        let state = engine.state();
        let router = engine.create_router("room").await.unwrap();
        let publisher = router.create_webrtc_transport().await.unwrap();
        let producer = publisher
            .produce(MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();

        let mut bridge = MediaBridge::new(router);
        let endpoint = bridge.open_tap("audio").await.unwrap();
        let descriptor = bridge
            .tap_producer(&endpoint.id, &producer.id(), TapCapabilities::default().audio, false)
            .await
            .unwrap();

        assert!(bridge.untap(&descriptor.id));
        assert!(!bridge.untap(&descriptor.id));
        assert!(state.was_closed("consumer", &descriptor.id));
        assert!(!bridge.is_tapping(&producer.id()));
        assert_eq!(bridge.transport_count(), 1);
        bridge.close();
    }

    #[tokio::test]
    async fn test_unknown_transport_is_rejected() {
        let engine = LoopbackEngine::new(RouterConfig::default_codecs());
        let router = engine.create_router("room").await.unwrap();
        let mut bridge = MediaBridge::new(router);

        let err = bridge
            .connect("nope", IpAddr::V4(Ipv4Addr::LOCALHOST), 20000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::TransportNotFound(_)));

        let err = bridge
            .tap_producer("nope", "p", serde_json::json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_close_releases_consumers_before_transports() {
        let engine = LoopbackEngine::new(RouterConfig::default_codecs());
        let state = engine.state();
        let router = engine.create_router("room").await.unwrap();
        let publisher = router.create_webrtc_transport().await.unwrap();
        let producer = publisher
            .produce(MediaKind::Video, rtp_parameters("video/VP8"))
            .await
            .unwrap();

        let mut bridge = MediaBridge::new(router);
        let endpoint = bridge.open_tap("video").await.unwrap();
        let descriptor = bridge
            .tap_producer(
                &endpoint.id,
                &producer.id(),
                TapCapabilities::default().video,
                true,
            )
            .await
            .unwrap();
        bridge.resume(&descriptor.id).await.unwrap();

        bridge.close();

        let events = state.events();
        let consumer_at = events
            .iter()
            .position(|e| *e == format!("close:consumer:{}", descriptor.id))
            .unwrap();
        let transport_at = events
            .iter()
            .position(|e| *e == format!("close:plain:{}", endpoint.id))
            .unwrap();
        assert!(consumer_at < transport_at);
        assert_eq!(bridge.transport_count(), 0);
        assert_eq!(bridge.consumer_count(), 0);
    }
}
