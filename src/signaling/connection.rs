#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{send_json, ClientMessage, ClientRequest, ServerMessage};
use crate::media::types::MediaError;
use crate::metrics::ServerMetrics;
use crate::room::{ParticipantSession, RoomRegistry, SessionError, SessionEvent, TapError};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client; frames beyond it are dropped
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if the client sends nothing for this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// What this connection is doing in the room layer
enum Seat {
    Idle,
    Participant {
        session: ParticipantSession,
        inbox: mpsc::UnboundedReceiver<SessionEvent>,
    },
    /// Watching a room's HLS tap
    Viewer { room_id: String },
}

async fn next_event(seat: &mut Seat) -> Option<SessionEvent> {
    match seat {
        Seat::Participant { inbox, .. } => inbox.recv().await,
        _ => std::future::pending().await,
    }
}

/// Per-connection context shared by the frame handlers
struct Connection {
    id: String,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    tx: mpsc::Sender<Arc<String>>,
    seat: Seat,
}

impl Connection {
    fn send(&self, message: &ServerMessage) {
        if let Err(e) = send_json(&self.tx, message) {
            debug!("Dropping frame for connection {}: {}", self.id, e);
        }
    }

    fn fail(&self, request_id: Option<u64>, error: impl ToString) {
        self.metrics.inc_errors();
        self.send(&ServerMessage::nack(request_id, error));
    }

    async fn handle_text(&mut self, text: &str) {
        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid frame from {}: {}", self.id, e);
                self.metrics.inc_errors();
                self.send(&ServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
                return;
            }
        };

        let started = Instant::now();
        let name = request.message.name();
        self.dispatch(request).await;
        self.metrics.observe_message_handling(started.elapsed());
        debug!("Handled {} for {} in {:?}", name, self.id, started.elapsed());
    }

    async fn dispatch(&mut self, request: ClientRequest) {
        let request_id = request.request_id;

        let message = match request.message {
            ClientMessage::JoinRoom { room_id, view_mode } => {
                if !matches!(self.seat, Seat::Idle) {
                    self.metrics.inc_errors();
                    self.send(&ServerMessage::Error {
                        message: "Already in a room".to_string(),
                    });
                } else if view_mode {
                    self.watch(room_id).await;
                } else {
                    self.enter(room_id).await;
                }
                return;
            }
            other => other,
        };

        if !matches!(self.seat, Seat::Participant { .. }) {
            self.fail(request_id, SessionError::NotJoinedRoom);
            return;
        }
        let Seat::Participant { session, .. } = &mut self.seat else {
            return;
        };

        let reply = match message {
            ClientMessage::JoinRoom { .. } => return,
            ClientMessage::Join {
                rtp_capabilities,
                sctp_capabilities,
            } => session
                .join(rtp_capabilities, sctp_capabilities)
                .await
                .map(|()| ServerMessage::ack(request_id)),
            ClientMessage::CreateWebRtcTransport {
                producing,
                consuming,
            } => session
                .create_transport(producing, consuming)
                .await
                .map(|info| ServerMessage::Ack {
                    request_id,
                    success: true,
                    error: None,
                    transport: Some(info),
                    producer_id: None,
                }),
            ClientMessage::ConnectWebRtcTransport {
                transport_id,
                dtls_parameters,
            } => session
                .connect_transport(&transport_id, dtls_parameters)
                .await
                .map(|()| ServerMessage::ack(request_id)),
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => session
                .produce(&transport_id, kind, rtp_parameters)
                .await
                .map(|producer_id| ServerMessage::Ack {
                    request_id,
                    success: true,
                    error: None,
                    transport: None,
                    producer_id: Some(producer_id),
                }),
        };

        match reply {
            Ok(message) => self.send(&message),
            Err(e) => {
                debug!("Request from {} failed: {}", self.id, e);
                self.fail(request_id, e);
            }
        }
    }

    async fn enter(&mut self, room_id: String) {
        match ParticipantSession::open(
            self.id.clone(),
            &room_id,
            self.registry.clone(),
            self.tx.clone(),
            self.metrics.clone(),
        )
        .await
        {
            Ok((session, inbox)) => self.seat = Seat::Participant { session, inbox },
            Err(e) => {
                warn!("Connection {} could not enter room {}: {}", self.id, room_id, e);
                self.metrics.inc_errors();
                self.send(&ServerMessage::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn watch(&mut self, room_id: String) {
        match self.registry.watch_tap(&room_id).await {
            Ok(tap) => {
                info!("Connection {} watching room {}", self.id, room_id);
                self.send(&ServerMessage::TapStarted {
                    room_id: tap.room_id,
                    playlist: tap.playlist,
                    audio_transport: tap.audio_transport,
                    video_transport: tap.video_transport,
                });
                self.seat = Seat::Viewer { room_id };
            }
            Err(e) => {
                let message = match e {
                    TapError::Media(MediaError::RoomNotFound(_)) => "Room not found".to_string(),
                    other => other.to_string(),
                };
                self.metrics.inc_errors();
                self.send(&ServerMessage::Error { message });
            }
        }
    }
}

impl Connection {
    /// Leaves whatever the connection was seated in
    async fn close(&mut self) {
        match std::mem::replace(&mut self.seat, Seat::Idle) {
            Seat::Participant { mut session, .. } => {
                debug!(
                    "Closing session {} in room {} ({:?}, {} consumer(s))",
                    session.id(),
                    session.room_id(),
                    session.state(),
                    session.consumer_count()
                );
                session.disconnect().await;
            }
            Seat::Viewer { room_id } => {
                let released = self.registry.unwatch_tap(&room_id).await;
                debug!("Viewer {} left room {} (tap released: {})", self.id, room_id, released);
            }
            Seat::Idle => {}
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_id = connection_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", send_id);
    });

    let mut conn = Connection {
        id: connection_id.clone(),
        registry,
        metrics: metrics.clone(),
        tx,
        seat: Seat::Idle,
    };
    let mut deadline = tokio::time::Instant::now() + IDLE_TIMEOUT;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let msg = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => break,
                };
                deadline = tokio::time::Instant::now() + IDLE_TIMEOUT;
                match msg {
                    Message::Text(text) => {
                        metrics.inc_messages_received();
                        conn.handle_text(text.as_str()).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = next_event(&mut conn.seat) => {
                if let Seat::Participant { session, .. } = &mut conn.seat {
                    session.handle_event(event).await;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        }
    }

    conn.close().await;
    send_task.abort();
    info!("WebSocket connection closed: {}", connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::tests::{fixture, peer, Fixture};
    use serde_json::{json, Value};

    fn connection(f: &Fixture) -> (Connection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let conn = Connection {
            id: "conn-1".to_string(),
            registry: f.registry.clone(),
            metrics: ServerMetrics::new(),
            tx,
            seat: Seat::Idle,
        };
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(json) = rx.try_recv() {
            frames.push(serde_json::from_str(&json).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_invalid_frame_is_reported_and_connection_stays_usable() {
        let f = fixture();
        let (mut conn, mut rx) = connection(&f);

        conn.handle_text("{not json").await;
        conn.handle_text(r#"{"type":"dance"}"#).await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(frame["type"], "error");
            assert!(frame["message"].as_str().unwrap().starts_with("Invalid message"));
        }

        conn.handle_text(r#"{"type":"joinRoom","roomId":"lobby"}"#).await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "getRouterRtpCapabilities");
        assert!(matches!(conn.seat, Seat::Participant { .. }));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_requests_before_join_room_are_nacked() {
        let f = fixture();
        let (mut conn, mut rx) = connection(&f);

        conn.handle_text(r#"{"type":"createWebRtcTransport","requestId":7,"producing":true}"#)
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![json!({ "type": "ack", "requestId": 7, "success": false, "error": "Not in a room" })]
        );
        assert_eq!(f.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_view_mode_for_unknown_room() {
        let f = fixture();
        let (mut conn, mut rx) = connection(&f);

        conn.handle_text(r#"{"type":"joinRoom","roomId":"nowhere","viewMode":true}"#)
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![json!({ "type": "error", "message": "Room not found" })]
        );
        assert!(matches!(conn.seat, Seat::Idle));
        assert_eq!(f.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_second_join_room_is_rejected() {
        let f = fixture();
        let (mut conn, mut rx) = connection(&f);

        conn.handle_text(r#"{"type":"joinRoom","roomId":"lobby"}"#).await;
        drain(&mut rx);
        conn.handle_text(r#"{"type":"joinRoom","roomId":"other"}"#).await;
        assert_eq!(
            drain(&mut rx),
            vec![json!({ "type": "error", "message": "Already in a room" })]
        );
        assert!(f.registry.get("other").is_none());
        conn.close().await;
        assert!(f.registry.get("lobby").is_none());
    }

    #[tokio::test]
    async fn test_handshake_requests_are_acked() {
        let f = fixture();
        let (mut conn, mut rx) = connection(&f);

        conn.handle_text(r#"{"type":"joinRoom","roomId":"lobby"}"#).await;
        conn.handle_text(r#"{"type":"join","requestId":1,"rtpCapabilities":{"codecs":[]}}"#)
            .await;
        conn.handle_text(r#"{"type":"createWebRtcTransport","requestId":2,"producing":true}"#)
            .await;
        let frames = drain(&mut rx);
        assert_eq!(frames[1], json!({ "type": "ack", "requestId": 1, "success": true }));
        assert_eq!(frames[2]["requestId"], 2);
        assert_eq!(frames[2]["success"], true);
        let transport_id = frames[2]["transport"]["id"].as_str().unwrap().to_string();

        let produce = json!({
            "type": "produce",
            "requestId": 3,
            "transportId": transport_id,
            "kind": "audio",
            "rtpParameters": { "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }] },
        });
        conn.handle_text(&produce.to_string()).await;
        conn.handle_text(r#"{"type":"join","requestId":4,"rtpCapabilities":{}}"#).await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["requestId"], 3);
        assert!(frames[0]["producerId"].is_string());
        assert_eq!(
            frames[1],
            json!({ "type": "ack", "requestId": 4, "success": false, "error": "Already joined" })
        );
        conn.close().await;
    }

    #[tokio::test]
    async fn test_viewer_close_releases_the_tap() {
        let f = fixture();
        let (a, _inbox, _out) = peer("a");
        f.registry.join_room("lobby", a).await.unwrap();
        let (mut conn, mut rx) = connection(&f);

        conn.handle_text(r#"{"type":"joinRoom","roomId":"lobby","viewMode":true}"#)
            .await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "tapStarted");
        assert_eq!(frames[0]["playlist"], "/hls/lobby/stream.m3u8");
        assert_eq!(f.registry.ports().leased_count(), 4);

        conn.close().await;
        assert!(matches!(conn.seat, Seat::Idle));
        assert_eq!(f.registry.ports().leased_count(), 0);
        assert!(f.registry.get("lobby").is_some());
    }
}
