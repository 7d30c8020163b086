#![forbid(unsafe_code)]

// mediasoup adapter - one worker with a shared WebRtcServer, routers per room.
// Negotiation blobs are converted to and from mediasoup's serde types at this edge.

use crate::media::config::{MediaConfig, WorkerConfig};
use crate::media::engine::{
    Consumer, MediaEngine, PlainTransport, Producer, RoutingContext, WebRtcTransport,
};
use crate::media::types::{MediaError, MediaKind, MediaResult, PlainTuple, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::MediaKind as EngineKind;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, error, info};

fn from_json<T: DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value)
        .map_err(|e| MediaError::InvalidParameters(format!("invalid {what}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn engine_kind(kind: MediaKind) -> EngineKind {
    match kind {
        MediaKind::Audio => EngineKind::Audio,
        MediaKind::Video => EngineKind::Video,
    }
}

fn our_kind(kind: EngineKind) -> MediaKind {
    match kind {
        EngineKind::Audio => MediaKind::Audio,
        EngineKind::Video => MediaKind::Video,
    }
}

fn worker_settings(config: &WorkerConfig) -> WorkerSettings {
    let mut settings = WorkerSettings::default();
    settings.log_level = match config.log_level.as_str() {
        "debug" => WorkerLogLevel::Debug,
        "error" => WorkerLogLevel::Error,
        "none" => WorkerLogLevel::None,
        _ => WorkerLogLevel::Warn,
    };
    settings.rtc_port_range = config.rtc_min_port..=config.rtc_max_port;
    if let (Some(cert), Some(key)) = (&config.dtls_certificate_file, &config.dtls_private_key_file) {
        settings.dtls_files = Some(WorkerDtlsFiles {
            certificate: cert.clone(),
            private_key: key.clone(),
        });
    }
    settings
}

/// Real engine backed by a single mediasoup worker
pub struct MediasoupEngine {
    _manager: mediasoup::worker_manager::WorkerManager,
    worker: Worker,
    webrtc_server: WebRtcServer,
    config: Arc<MediaConfig>,
}

impl MediasoupEngine {
    pub async fn new(config: MediaConfig) -> MediaResult<Self> {
        let manager = mediasoup::worker_manager::WorkerManager::new();
        let worker = manager
            .create_worker(worker_settings(&config.worker_config))
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;

        let worker_id = worker.id();
        worker
            .on_dead(move |reason| {
                error!("mediasoup worker {} died ({:?}), exiting", worker_id, reason);
                std::process::exit(1);
            })
            .detach();

        let server_config = &config.webrtc_server_config;
        let listen_info = |protocol| ListenInfo {
            protocol,
            ip: server_config.listen_ip,
            announced_address: server_config.announced_address.clone(),
            port: Some(server_config.port),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let mut listen_infos = WebRtcServerListenInfos::new(listen_info(Protocol::Udp));
        if server_config.enable_tcp {
            listen_infos = listen_infos.insert(listen_info(Protocol::Tcp));
        }
        let webrtc_server = worker
            .create_webrtc_server(WebRtcServerOptions::new(listen_infos))
            .await
            .map_err(|e| {
                MediaError::WorkerError(format!(
                    "Failed to create WebRtcServer on port {}: {e}",
                    server_config.port
                ))
            })?;

        info!(
            "mediasoup worker {} ready, WebRtcServer on port {}",
            worker_id, server_config.port
        );
        Ok(Self {
            _manager: manager,
            worker,
            webrtc_server,
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn name(&self) -> &'static str {
        "mediasoup"
    }

    async fn create_router(&self, room_id: &str) -> MediaResult<Arc<dyn RoutingContext>> {
        let codecs: Vec<RtpCodecCapability> =
            from_json(self.config.router_config.media_codecs.clone(), "media codecs")?;
        let router = self
            .worker
            .create_router(RouterOptions::new(codecs))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        debug!("Created router {} for room {}", router.id(), room_id);
        Ok(Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            router: StdMutex::new(Some(router)),
            webrtc_server: self.webrtc_server.clone(),
            config: self.config.clone(),
        }))
    }
}

struct MediasoupRouter {
    id: String,
    router: StdMutex<Option<Router>>,
    webrtc_server: WebRtcServer,
    config: Arc<MediaConfig>,
}

impl MediasoupRouter {
    fn router(&self) -> MediaResult<Router> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::RouterError(format!("router {} closed", self.id)))
    }
}

#[async_trait]
impl RoutingContext for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        match self.router() {
            Ok(router) => to_json(router.rtp_capabilities()),
            Err(_) => Value::Null,
        }
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        let Ok(caps) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        router.can_consume(&producer_id, &caps)
    }

    async fn create_webrtc_transport(&self) -> MediaResult<Box<dyn WebRtcTransport>> {
        let router = self.router()?;
        let mut options = WebRtcTransportOptions::new_with_server(self.webrtc_server.clone());
        options.enable_sctp = true;
        options.num_sctp_streams = NumSctpStreams { os: 1024, mis: 1024 };

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;
        Ok(Box::new(MediasoupWebRtcTransport {
            id: transport.id().to_string(),
            transport: StdMutex::new(Some(transport)),
        }))
    }

    async fn create_plain_transport(&self) -> MediaResult<Box<dyn PlainTransport>> {
        let router = self.router()?;
        let plain = &self.config.plain_transport_config;
        let mut options = PlainTransportOptions::new(ListenInfo {
            protocol: Protocol::Udp,
            ip: plain.listen_ip,
            announced_address: None,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        });
        options.rtcp_mux = plain.rtcp_mux;
        options.comedia = plain.comedia;

        let transport = router
            .create_plain_transport(options)
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create plain transport: {e}")))?;
        let tuple = PlainTuple {
            local_ip: plain.listen_ip,
            local_port: transport.tuple().local_port(),
            local_rtcp_port: transport.rtcp_tuple().map(|t| t.local_port()),
        };
        Ok(Box::new(MediasoupPlainTransport {
            id: transport.id().to_string(),
            tuple,
            transport: StdMutex::new(Some(transport)),
        }))
    }

    fn close(&self) {
        // Dropping the last handle closes the router worker-side
        self.router.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

async fn consume_on<T: Transport>(
    transport: T,
    producer_id: &str,
    rtp_capabilities: Value,
    paused: bool,
) -> MediaResult<Box<dyn Consumer>> {
    let producer_id = producer_id
        .parse::<ProducerId>()
        .map_err(|e| MediaError::InvalidParameters(format!("invalid producer id: {e}")))?;
    let caps: RtpCapabilities = from_json(rtp_capabilities, "rtp capabilities")?;
    let mut options = ConsumerOptions::new(producer_id, caps);
    options.paused = paused;

    let consumer = transport
        .consume(options)
        .await
        .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;
    Ok(Box::new(MediasoupConsumer {
        id: consumer.id().to_string(),
        consumer: StdMutex::new(Some(consumer)),
    }))
}

struct MediasoupWebRtcTransport {
    id: String,
    transport: StdMutex<Option<mediasoup::webrtc_transport::WebRtcTransport>>,
}

impl MediasoupWebRtcTransport {
    fn handle(&self) -> MediaResult<mediasoup::webrtc_transport::WebRtcTransport> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::TransportError(format!("transport {} closed", self.id)))
    }
}

#[async_trait]
impl WebRtcTransport for MediasoupWebRtcTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        match self.handle() {
            Ok(transport) => TransportInfo {
                id: self.id.clone(),
                ice_parameters: to_json(transport.ice_parameters()),
                ice_candidates: to_json(transport.ice_candidates()),
                dtls_parameters: to_json(&transport.dtls_parameters()),
                sctp_parameters: transport.sctp_parameters().map(|p| to_json(&p)),
            },
            Err(_) => TransportInfo {
                id: self.id.clone(),
                ice_parameters: Value::Null,
                ice_candidates: Value::Null,
                dtls_parameters: Value::Null,
                sctp_parameters: None,
            },
        }
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = from_json(dtls_parameters, "dtls parameters")?;
        self.handle()?
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(e.to_string()))
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Box<dyn Producer>> {
        let rtp_parameters: RtpParameters = from_json(rtp_parameters, "rtp parameters")?;
        let producer = self
            .handle()?
            .produce(ProducerOptions::new(engine_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(e.to_string()))?;
        Ok(Box::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind,
            producer: StdMutex::new(Some(producer)),
        }))
    }

    async fn consume(&self, producer_id: &str, rtp_capabilities: Value, paused: bool) -> MediaResult<Box<dyn Consumer>> {
        consume_on(self.handle()?, producer_id, rtp_capabilities, paused).await
    }

    fn close(&self) {
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct MediasoupPlainTransport {
    id: String,
    tuple: PlainTuple,
    transport: StdMutex<Option<mediasoup::plain_transport::PlainTransport>>,
}

impl MediasoupPlainTransport {
    fn handle(&self) -> MediaResult<mediasoup::plain_transport::PlainTransport> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::TransportError(format!("transport {} closed", self.id)))
    }
}

#[async_trait]
impl PlainTransport for MediasoupPlainTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn tuple(&self) -> PlainTuple {
        self.tuple
    }

    async fn connect(&self, ip: IpAddr, port: u16, rtcp_port: Option<u16>) -> MediaResult<()> {
        self.handle()?
            .connect(PlainTransportRemoteParameters {
                ip: Some(ip),
                port: Some(port),
                rtcp_port,
                srtp_parameters: None,
            })
            .await
            .map_err(|e| MediaError::TransportError(e.to_string()))
    }

    async fn consume(&self, producer_id: &str, rtp_capabilities: Value, paused: bool) -> MediaResult<Box<dyn Consumer>> {
        consume_on(self.handle()?, producer_id, rtp_capabilities, paused).await
    }

    fn close(&self) {
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    producer: StdMutex<Option<mediasoup::producer::Producer>>,
}

impl Producer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.producer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct MediasoupConsumer {
    id: String,
    consumer: StdMutex<Option<mediasoup::consumer::Consumer>>,
}

impl MediasoupConsumer {
    fn handle(&self) -> Option<mediasoup::consumer::Consumer> {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Consumer for MediasoupConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.handle().map(|c| c.producer_id().to_string()).unwrap_or_default()
    }

    fn kind(&self) -> MediaKind {
        self.handle().map(|c| our_kind(c.kind())).unwrap_or(MediaKind::Audio)
    }

    fn rtp_parameters(&self) -> Value {
        self.handle().map(|c| to_json(c.rtp_parameters())).unwrap_or(Value::Null)
    }

    fn consumer_type(&self) -> String {
        self.handle()
            .and_then(|c| to_json(&c.r#type()).as_str().map(str::to_string))
            .unwrap_or_else(|| "simple".to_string())
    }

    fn paused(&self) -> bool {
        self.handle().map(|c| c.paused()).unwrap_or(true)
    }

    async fn resume(&self) -> MediaResult<()> {
        let consumer = self
            .handle()
            .ok_or_else(|| MediaError::ConsumerError(format!("consumer {} closed", self.id)))?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    fn close(&self) {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
