#![forbid(unsafe_code)]

// Media module - the engine boundary and its implementations
// The signaling core only talks to `MediaEngine` and the handles it returns

pub mod config;
pub mod engine;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;

pub use config::{MediaConfig, PlainTransportConfig, RouterConfig, TapCapabilities, WorkerConfig};
pub use engine::{Consumer, MediaEngine, PlainTransport, Producer, RoutingContext, WebRtcTransport};
#[cfg(any(test, feature = "loopback"))]
pub use loopback::LoopbackEngine;
pub use types::{
    ConsumerInfo, MediaError, MediaKind, MediaResult, PublishedProducer, TapDescriptor,
    TapEndpoint, TransportInfo,
};

use std::sync::Arc;
use tracing::info;

#[cfg(not(any(feature = "mediasoup", feature = "loopback")))]
compile_error!("roomcast needs a media engine: enable the `mediasoup` or `loopback` feature");

/// Starts the engine the binary was built with
pub async fn start_engine(config: MediaConfig) -> MediaResult<Arc<dyn MediaEngine>> {
    #[cfg(feature = "mediasoup")]
    {
        let engine = mediasoup_engine::MediasoupEngine::new(config).await?;
        info!("Media engine: mediasoup");
        Ok(Arc::new(engine))
    }

    #[cfg(all(feature = "loopback", not(feature = "mediasoup")))]
    {
        tracing::warn!("Built without the `mediasoup` feature, media stays in-process (loopback)");
        let engine = LoopbackEngine::new(config.router_config.media_codecs);
        info!("Media engine: {}", engine.name());
        Ok(Arc::new(engine))
    }
}
