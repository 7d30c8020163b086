#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server and the HTTP viewer path

pub mod connection;
pub mod protocol;

use crate::media::types::MediaError;
use crate::metrics::ServerMetrics;
use crate::room::{RoomRegistry, TapError};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    hls_root: PathBuf,
}

impl SignalingServer {
    pub fn new(registry: Arc<RoomRegistry>, metrics: ServerMetrics, max_connections: usize, hls_root: PathBuf) -> Self {
        info!("Max connections: {}", max_connections);
        Self {
            registry,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            hls_root,
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let hls = ServeDir::new(self.hls_root.clone());
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/watch", get(watch_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .nest_service("/hls", hls)
            .fallback(not_found)
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

#[derive(Debug, Deserialize)]
struct WatchQuery {
    room: Option<String>,
}

/// Opens (or reuses) the room's tap and returns its transport endpoints
async fn watch_handler(State(server): State<SignalingServer>, Query(query): Query<WatchQuery>) -> Response {
    let Some(room_id) = query.room.filter(|r| !r.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing roomId").into_response();
    };

    match server.registry.open_tap(&room_id).await {
        Ok(tap) => (StatusCode::OK, Json(tap)).into_response(),
        Err(TapError::Media(MediaError::RoomNotFound(_))) => {
            (StatusCode::NOT_FOUND, "Room not found").into_response()
        }
        Err(e) => {
            error!("Tap for room {} failed: {}", room_id, e);
            server.metrics.inc_errors();
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.registry.room_count();
    let participants = server.registry.participant_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "engine": server.registry.engine_name(),
        "rooms": rooms,
        "participants": participants,
        "tapPorts": server.registry.ports().leased_count(),
    }))
}

/// Metrics handler - Prometheus text exposition format
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let rooms = server.registry.room_count();
    let participants = server.registry.participant_count().await;
    let body = server.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server.registry, server.metrics, permit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::tests::{fixture, peer, Fixture};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn server(f: &Fixture) -> SignalingServer {
        SignalingServer::new(f.registry.clone(), ServerMetrics::new(), 16, f.dir.path().join("hls"))
    }

    async fn get(server: &SignalingServer, uri: &str) -> (StatusCode, String) {
        let response = server
            .clone()
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_watch_requires_room() {
        let f = fixture();
        let server = server(&f);
        assert_eq!(get(&server, "/watch").await, (StatusCode::BAD_REQUEST, "Missing roomId".to_string()));
        assert_eq!(get(&server, "/watch?room=").await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_watch_unknown_room_is_404_and_creates_nothing() {
        let f = fixture();
        let server = server(&f);
        assert_eq!(
            get(&server, "/watch?room=nowhere").await,
            (StatusCode::NOT_FOUND, "Room not found".to_string())
        );
        assert_eq!(f.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_returns_tap_transports() {
        let f = fixture();
        let (a, _inbox, _out) = peer("a");
        f.registry.join_room("lobby", a).await.unwrap();
        let server = server(&f);

        let (status, body) = get(&server, "/watch?room=lobby").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["audioTransport"]["ip"], "127.0.0.1");
        assert!(json["audioTransport"]["port"].is_u64());
        assert!(json["videoTransport"]["rtcpPort"].is_u64());
        assert_ne!(json["audioTransport"]["id"], json["videoTransport"]["id"]);

        // Second viewer gets the same tap
        let (_, again) = get(&server, "/watch?room=lobby").await;
        assert_eq!(body, again);
        assert_eq!(f.registry.ports().leased_count(), 4);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let f = fixture();
        let (a, _inbox, _out) = peer("a");
        f.registry.join_room("lobby", a).await.unwrap();
        let server = server(&f);

        let (status, body) = get(&server, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["engine"], "loopback");
        assert_eq!(json["rooms"], 1);
        assert_eq!(json["participants"], 1);
        assert_eq!(json["tapPorts"], 0);

        let (status, body) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("roomcast_rooms_active 1"));
        assert!(body.contains("roomcast_participants_active 1"));
    }

    #[tokio::test]
    async fn test_hls_files_are_served() {
        let f = fixture();
        let dir = f.dir.path().join("hls/lobby");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stream.m3u8"), "#EXTM3U\n").unwrap();
        let server = server(&f);

        let (status, body) = get(&server, "/hls/lobby/stream.m3u8").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "#EXTM3U\n");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let f = fixture();
        let server = server(&f);
        assert_eq!(get(&server, "/nope").await, (StatusCode::NOT_FOUND, "Not Found".to_string()));
    }
}
