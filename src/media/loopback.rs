#![forbid(unsafe_code)]

// Loopback engine - an in-process stand-in for the mediasoup worker.
// Keeps just enough state to answer capability checks and hand back
// plausible negotiation blobs; every close is recorded in an event log.

use crate::media::engine::{
    Consumer, MediaEngine, PlainTransport, Producer, RoutingContext, WebRtcTransport,
};
use crate::media::types::{MediaError, MediaKind, MediaResult, PlainTuple, TransportInfo};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::debug;

/// Shared bookkeeping visible to tests
#[derive(Default)]
pub struct LoopbackState {
    next_id: AtomicU64,
    next_plain_port: AtomicU16,
    events: StdMutex<Vec<String>>,
    routers_created: AtomicUsize,
    fail_router: AtomicBool,
    fail_connect: AtomicBool,
    fail_produce: AtomicBool,
}

impl LoopbackState {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }

    fn record(&self, event: String) {
        debug!("loopback: {}", event);
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    /// Every recorded event, oldest first ("close:consumer:consumer-7", ...)
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether `close:<what>:<id>` was recorded
    pub fn was_closed(&self, what: &str, id: &str) -> bool {
        let needle = format!("close:{what}:{id}");
        self.events().iter().any(|e| *e == needle)
    }

    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Relaxed)
    }

    pub fn set_fail_router(&self, fail: bool) {
        self.fail_router.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_produce(&self, fail: bool) {
        self.fail_produce.store(fail, Ordering::Relaxed);
    }
}

/// Engine that never leaves the process
pub struct LoopbackEngine {
    state: Arc<LoopbackState>,
    media_codecs: Value,
}

impl LoopbackEngine {
    pub fn new(media_codecs: Value) -> Self {
        let state = LoopbackState::default();
        state.next_plain_port.store(40000, Ordering::Relaxed);
        Self {
            state: Arc::new(state),
            media_codecs,
        }
    }

    pub fn state(&self) -> Arc<LoopbackState> {
        self.state.clone()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn create_router(&self, room_id: &str) -> MediaResult<Arc<dyn RoutingContext>> {
        if self.state.fail_router.load(Ordering::Relaxed) {
            return Err(MediaError::RouterError(format!(
                "loopback refused router for room {room_id}"
            )));
        }
        tokio::task::yield_now().await;
        self.state.routers_created.fetch_add(1, Ordering::Relaxed);
        let id = self.state.next_id("router");
        self.state.record(format!("create:router:{id}"));
        Ok(Arc::new(LoopbackRouter {
            id,
            codecs: self.media_codecs.clone(),
            producers: Arc::new(StdMutex::new(HashMap::new())),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

type ProducerTable = Arc<StdMutex<HashMap<String, (MediaKind, Value)>>>;

struct LoopbackRouter {
    id: String,
    codecs: Value,
    producers: ProducerTable,
    state: Arc<LoopbackState>,
    closed: AtomicBool,
}

fn first_mime(rtp_parameters: &Value) -> Option<String> {
    rtp_parameters["codecs"][0]["mimeType"]
        .as_str()
        .map(|m| m.to_ascii_lowercase())
}

/// Capability codec matching the producer, if any
fn matching_codec(kind: MediaKind, rtp_parameters: &Value, rtp_capabilities: &Value) -> Option<Value> {
    let codecs = rtp_capabilities["codecs"].as_array()?;
    let wanted = first_mime(rtp_parameters);
    codecs
        .iter()
        .find(|codec| {
            let mime = codec["mimeType"].as_str().map(|m| m.to_ascii_lowercase());
            match &wanted {
                Some(w) => mime.as_deref() == Some(w.as_str()),
                None => codec["kind"].as_str() == Some(&kind.to_string()),
            }
        })
        .cloned()
}

#[async_trait]
impl RoutingContext for LoopbackRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        json!({ "codecs": self.codecs, "headerExtensions": [] })
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let producers = self.producers.lock().unwrap_or_else(|e| e.into_inner());
        match producers.get(producer_id) {
            Some((kind, params)) => matching_codec(*kind, params, rtp_capabilities).is_some(),
            None => false,
        }
    }

    async fn create_webrtc_transport(&self) -> MediaResult<Box<dyn WebRtcTransport>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(MediaError::RouterError(format!("router {} closed", self.id)));
        }
        tokio::task::yield_now().await;
        let id = self.state.next_id("transport");
        Ok(Box::new(LoopbackWebRtcTransport {
            inner: TransportCore::new(id, self.producers.clone(), self.state.clone()),
        }))
    }

    async fn create_plain_transport(&self) -> MediaResult<Box<dyn PlainTransport>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(MediaError::RouterError(format!("router {} closed", self.id)));
        }
        tokio::task::yield_now().await;
        let id = self.state.next_id("plain");
        let port = self.state.next_plain_port.fetch_add(2, Ordering::Relaxed);
        Ok(Box::new(LoopbackPlainTransport {
            inner: TransportCore::new(id, self.producers.clone(), self.state.clone()),
            tuple: PlainTuple {
                local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                local_port: port,
                local_rtcp_port: Some(port + 1),
            },
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.producers.lock().unwrap_or_else(|e| e.into_inner()).clear();
            self.state.record(format!("close:router:{}", self.id));
        }
    }
}

/// Child handle bookkeeping shared by both transport flavours
struct TransportCore {
    id: String,
    producers: ProducerTable,
    state: Arc<LoopbackState>,
    closed: Arc<AtomicBool>,
    children: StdMutex<Vec<(&'static str, String, Arc<AtomicBool>)>>,
}

impl TransportCore {
    fn new(id: String, producers: ProducerTable, state: Arc<LoopbackState>) -> Self {
        Self {
            id,
            producers,
            state,
            closed: Arc::new(AtomicBool::new(false)),
            children: StdMutex::new(Vec::new()),
        }
    }

    fn adopt(&self, what: &'static str, id: String, flag: Arc<AtomicBool>) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((what, id, flag));
    }

    fn consume(&self, producer_id: &str, rtp_capabilities: Value, paused: bool) -> MediaResult<Box<dyn Consumer>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(MediaError::TransportError(format!("transport {} closed", self.id)));
        }
        let (kind, params) = {
            let producers = self.producers.lock().unwrap_or_else(|e| e.into_inner());
            producers
                .get(producer_id)
                .cloned()
                .ok_or_else(|| MediaError::ConsumerError(format!("producer {producer_id} not found")))?
        };
        let codec = matching_codec(kind, &params, &rtp_capabilities).ok_or_else(|| {
            MediaError::ConsumerError(format!("cannot consume producer {producer_id}"))
        })?;

        let id = self.state.next_id("consumer");
        let mut codec_params = json!({
            "mimeType": codec["mimeType"],
            "payloadType": codec["preferredPayloadType"],
            "clockRate": codec["clockRate"],
            "parameters": codec.get("parameters").cloned().unwrap_or_else(|| json!({})),
        });
        if let Some(channels) = codec.get("channels") {
            codec_params["channels"] = channels.clone();
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.adopt("consumer", id.clone(), closed.clone());

        Ok(Box::new(LoopbackConsumer {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: json!({ "codecs": [codec_params], "encodings": [{ "ssrc": 1000 }] }),
            paused: AtomicBool::new(paused),
            state: self.state.clone(),
            closed,
        }))
    }

    fn close(&self, what: &str) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(|e| e.into_inner()));
        for (child, id, flag) in children {
            if !flag.swap(true, Ordering::Relaxed) {
                if child == "producer" {
                    self.producers.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                }
                self.state.record(format!("close:{child}:{id}"));
            }
        }
        self.state.record(format!("close:{what}:{}", self.id));
    }
}

struct LoopbackWebRtcTransport {
    inner: TransportCore,
}

#[async_trait]
impl WebRtcTransport for LoopbackWebRtcTransport {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.inner.id.clone(),
            ice_parameters: json!({ "usernameFragment": self.inner.id, "password": "loopback", "iceLite": true }),
            ice_candidates: json!([{ "foundation": "udpcandidate", "ip": "127.0.0.1", "port": 44444, "protocol": "udp", "type": "host", "priority": 1 }]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
            sctp_parameters: Some(json!({ "port": 5000, "OS": 1024, "MIS": 1024, "maxMessageSize": 262144 })),
        }
    }

    async fn connect(&self, _dtls_parameters: Value) -> MediaResult<()> {
        tokio::task::yield_now().await;
        if self.inner.state.fail_connect.load(Ordering::Relaxed) {
            return Err(MediaError::TransportError("dtls handshake rejected".to_string()));
        }
        self.inner.state.record(format!("connect:transport:{}", self.inner.id));
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Box<dyn Producer>> {
        tokio::task::yield_now().await;
        if self.inner.state.fail_produce.load(Ordering::Relaxed) {
            return Err(MediaError::ProducerError("invalid rtp parameters".to_string()));
        }
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(MediaError::TransportError(format!("transport {} closed", self.inner.id)));
        }
        let id = self.inner.state.next_id("producer");
        self.inner
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), (kind, rtp_parameters));
        let closed = Arc::new(AtomicBool::new(false));
        self.inner.adopt("producer", id.clone(), closed.clone());
        Ok(Box::new(LoopbackProducer {
            id,
            kind,
            producers: self.inner.producers.clone(),
            state: self.inner.state.clone(),
            closed,
        }))
    }

    async fn consume(&self, producer_id: &str, rtp_capabilities: Value, paused: bool) -> MediaResult<Box<dyn Consumer>> {
        tokio::task::yield_now().await;
        self.inner.consume(producer_id, rtp_capabilities, paused)
    }

    fn close(&self) {
        self.inner.close("transport");
    }
}

struct LoopbackPlainTransport {
    inner: TransportCore,
    tuple: PlainTuple,
}

#[async_trait]
impl PlainTransport for LoopbackPlainTransport {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn tuple(&self) -> PlainTuple {
        self.tuple
    }

    async fn connect(&self, ip: IpAddr, port: u16, rtcp_port: Option<u16>) -> MediaResult<()> {
        tokio::task::yield_now().await;
        if self.inner.state.fail_connect.load(Ordering::Relaxed) {
            return Err(MediaError::TransportError("plain connect rejected".to_string()));
        }
        let rtcp = rtcp_port.map(|p| p.to_string()).unwrap_or_else(|| "mux".to_string());
        self.inner
            .state
            .record(format!("connect:plain:{}:{ip}:{port}:{rtcp}", self.inner.id));
        Ok(())
    }

    async fn consume(&self, producer_id: &str, rtp_capabilities: Value, paused: bool) -> MediaResult<Box<dyn Consumer>> {
        tokio::task::yield_now().await;
        self.inner.consume(producer_id, rtp_capabilities, paused)
    }

    fn close(&self) {
        self.inner.close("plain");
    }
}

struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    producers: ProducerTable,
    state: Arc<LoopbackState>,
    closed: Arc<AtomicBool>,
}

impl Producer for LoopbackProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.producers.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
            self.state.record(format!("close:producer:{}", self.id));
        }
    }
}

struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    state: Arc<LoopbackState>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        "simple".to_string()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    async fn resume(&self) -> MediaResult<()> {
        tokio::task::yield_now().await;
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.state.record(format!("close:consumer:{}", self.id));
        }
    }
}

/// Producer rtp parameters advertising a single codec, for tests
#[cfg(test)]
pub(crate) fn rtp_parameters(mime_type: &str) -> Value {
    json!({ "codecs": [{ "mimeType": mime_type, "payloadType": 111, "clockRate": 48000 }], "encodings": [{ "ssrc": 1 }] })
}

/// Receive capabilities listing the given codecs, for tests
#[cfg(test)]
pub(crate) fn rtp_capabilities(mime_types: &[&str]) -> Value {
    let codecs: Vec<Value> = mime_types
        .iter()
        .map(|m| {
            let kind = if m.starts_with("audio/") { "audio" } else { "video" };
            json!({ "kind": kind, "mimeType": m, "preferredPayloadType": 100, "clockRate": 48000, "channels": 2 })
        })
        .collect();
    json!({ "codecs": codecs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::RouterConfig;

    #[tokio::test]
    async fn test_capability_check_follows_codecs() {
        let engine = LoopbackEngine::new(RouterConfig::default_codecs());
        let router = engine.create_router("r").await.unwrap();
        let transport = router.create_webrtc_transport().await.unwrap();
        let producer = transport
            .produce(MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();

        assert!(router.can_consume(&producer.id(), &rtp_capabilities(&["audio/opus"])));
        assert!(!router.can_consume(&producer.id(), &rtp_capabilities(&["video/VP8"])));
        assert!(!router.can_consume("producer-unknown", &rtp_capabilities(&["audio/opus"])));
    }

    #[tokio::test]
    async fn test_transport_close_is_transitive() {
        let engine = LoopbackEngine::new(RouterConfig::default_codecs());
        let state = engine.state();
        let router = engine.create_router("r").await.unwrap();
        let transport = router.create_webrtc_transport().await.unwrap();
        let producer = transport
            .produce(MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();

        transport.close();

        assert!(state.was_closed("producer", &producer.id()));
        assert!(state.was_closed("transport", &transport.id()));
        assert!(!router.can_consume(&producer.id(), &rtp_capabilities(&["audio/opus"])));
    }
}
