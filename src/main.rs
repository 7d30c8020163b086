#![forbid(unsafe_code)]

use anyhow::Result;
use roomcast::config::ServerConfig;
use roomcast::media;
use roomcast::metrics::ServerMetrics;
use roomcast::ports::PortAllocator;
use roomcast::room::RoomRegistry;
use roomcast::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Roomcast - Starting server");

    let config = ServerConfig::from_env()?;
    let media_config = config.media_config();
    let tap_settings = config.tap_settings(&media_config);

    let engine = media::start_engine(media_config).await?;
    info!("Media engine started: {}", engine.name());

    let ports = Arc::new(PortAllocator::new(config.tap_min_port, config.tap_max_port)?);
    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(engine, ports, tap_settings, metrics.clone()));

    let signaling_server = SignalingServer::new(
        registry.clone(),
        metrics,
        config.max_connections,
        config.hls_root.clone(),
    );

    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    registry.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
