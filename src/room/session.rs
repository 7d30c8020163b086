#![forbid(unsafe_code)]

// Participant session - one connection's handshake state and the producer/consumer fan-out.
// A session is owned by its connection task; other sessions reach it only via SessionEvent.

use super::{PeerHandle, RoomRegistry};
use crate::media::engine::{Consumer, Producer, RoutingContext, WebRtcTransport};
use crate::media::types::{ConsumerInfo, MediaError, MediaKind, PublishedProducer, TransportInfo};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{send_json, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Already joined")]
    AlreadyJoined,

    #[error("transport {0} not found")]
    TransportNotFound(String),

    #[error("Media engine unavailable for room {0}")]
    EngineUnavailable(String),

    #[error("{0}")]
    ConnectFailed(String),

    #[error("{0}")]
    ProduceFailed(String),

    #[error("Not in a room")]
    NotJoinedRoom,

    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    CapabilitiesPublished,
    Joined,
    Producing,
    Disconnected,
}

/// Notifications other sessions deliver to this one
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Another participant published a producer
    ProducerAvailable { producer: PublishedProducer },
    /// A participant left; its producers are gone
    PeerLeft {
        participant_id: String,
        producer_ids: Vec<String>,
    },
}

struct SessionTransport {
    handle: Box<dyn WebRtcTransport>,
    producing: bool,
    consuming: bool,
}

pub struct ParticipantSession {
    id: String,
    room_id: String,
    router: Arc<dyn RoutingContext>,
    registry: Arc<RoomRegistry>,
    outbound: mpsc::Sender<Arc<String>>,
    metrics: ServerMetrics,
    state: SessionState,
    rtp_capabilities: Option<Value>,
    sctp_capabilities: Option<Value>,
    /// Creation order is kept; the first consuming transport receives consumers
    transports: Vec<(String, SessionTransport)>,
    producers: HashMap<String, Box<dyn Producer>>,
    consumers: HashMap<String, Box<dyn Consumer>>,
}

impl ParticipantSession {
    /// Enters `room_id` (creating it if needed), registers in the peer
    /// directory and publishes the router capabilities to the client
    pub async fn open(
        id: String,
        room_id: &str,
        registry: Arc<RoomRegistry>,
        outbound: mpsc::Sender<Arc<String>>,
        metrics: ServerMetrics,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        // Unbounded: fan-out must reach a peer even while its task is busy
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let handle = PeerHandle {
            id: id.clone(),
            inbox,
            outbound: outbound.clone(),
        };
        let router = registry.join_room(room_id, handle).await?;

        let mut session = Self {
            id,
            room_id: room_id.to_string(),
            router,
            registry,
            outbound,
            metrics,
            state: SessionState::Connected,
            rtp_capabilities: None,
            sctp_capabilities: None,
            transports: Vec::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        };

        session.send(&ServerMessage::GetRouterRtpCapabilities {
            router_rtp_capabilities: session.router.rtp_capabilities(),
        });
        session.state = SessionState::CapabilitiesPublished;
        info!("Participant {} entered room {}", session.id, session.room_id);
        Ok((session, inbox_rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    #[cfg(test)]
    pub fn sctp_capabilities(&self) -> Option<&Value> {
        self.sctp_capabilities.as_ref()
    }

    fn send(&self, message: &ServerMessage) {
        if let Err(e) = send_json(&self.outbound, message) {
            debug!("Dropping frame for participant {}: {}", self.id, e);
        }
    }

    /// Records capabilities and catches up on every producer already in the room
    pub async fn join(&mut self, rtp_capabilities: Value, sctp_capabilities: Option<Value>) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Joined | SessionState::Producing) {
            return Err(SessionError::AlreadyJoined);
        }
        self.rtp_capabilities = Some(rtp_capabilities);
        self.sctp_capabilities = sctp_capabilities;
        self.state = SessionState::Joined;
        self.metrics.inc_joins();

        let snapshot = self.registry.peers(&self.room_id, Some(&self.id)).await;
        let mut created = 0;
        for peer in &snapshot.peers {
            for producer in &peer.producers {
                if let Some(consumer) = self.consume_producer(producer).await {
                    self.emit_new_consumer(&peer.handle.id, consumer);
                    created += 1;
                }
            }
        }
        info!(
            "Participant {} joined room {} ({} peer(s), {} consumer(s))",
            self.id,
            self.room_id,
            snapshot.len(),
            created
        );
        Ok(())
    }

    pub async fn create_transport(&mut self, producing: bool, consuming: bool) -> Result<TransportInfo, SessionError> {
        let router = self
            .registry
            .get(&self.room_id)
            .ok_or_else(|| SessionError::EngineUnavailable(self.room_id.clone()))?;
        let transport = router.create_webrtc_transport().await?;
        let info = transport.info();
        debug!(
            "Created transport {} for participant {} (producing: {}, consuming: {})",
            info.id, self.id, producing, consuming
        );
        self.transports.push((
            info.id.clone(),
            SessionTransport {
                handle: transport,
                producing,
                consuming,
            },
        ));
        Ok(info)
    }

    fn transport(&self, transport_id: &str) -> Result<&SessionTransport, SessionError> {
        self.transports
            .iter()
            .find(|(id, _)| id == transport_id)
            .map(|(_, t)| t)
            .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))
    }

    pub async fn connect_transport(&mut self, transport_id: &str, dtls_parameters: Value) -> Result<(), SessionError> {
        let transport = self.transport(transport_id)?;
        transport
            .handle
            .connect(dtls_parameters)
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        debug!("Connected transport {} for participant {}", transport_id, self.id);
        Ok(())
    }

    /// Creates a producer and tells every other peer about it
    pub async fn produce(&mut self, transport_id: &str, kind: MediaKind, rtp_parameters: Value) -> Result<String, SessionError> {
        let transport = self.transport(transport_id)?;
        if !transport.producing {
            debug!("Producing on transport {} not tagged producing", transport_id);
        }
        let producer = transport
            .handle
            .produce(kind, rtp_parameters)
            .await
            .map_err(|e| SessionError::ProduceFailed(e.to_string()))?;

        let producer_id = producer.id();
        let published = PublishedProducer {
            id: producer_id.clone(),
            kind,
            participant_id: self.id.clone(),
        };
        if let Err(e) = self.registry.publish(&self.room_id, published.clone()).await {
            producer.close();
            return Err(SessionError::ProduceFailed(e.to_string()));
        }
        self.producers.insert(producer_id.clone(), producer);
        self.state = SessionState::Producing;
        self.metrics.inc_producers_created();
        info!("Participant {} producing {} ({})", self.id, producer_id, kind);

        let snapshot = self.registry.peers(&self.room_id, Some(&self.id)).await;
        for peer in &snapshot.peers {
            let event = SessionEvent::ProducerAvailable {
                producer: published.clone(),
            };
            if let Err(e) = peer.handle.inbox.send(event) {
                debug!(
                    "Could not notify participant {} of producer {}: {}",
                    peer.handle.id, producer_id, e
                );
            }
        }

        if let Err(e) = self.registry.offer_producer(&self.room_id, &published).await {
            warn!("Room {}: tap did not take producer {}: {}", self.room_id, producer_id, e);
        }
        Ok(producer_id)
    }

    /// Applies a notification from another session
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ProducerAvailable { producer } => {
                if producer.participant_id == self.id {
                    return;
                }
                if let Some(consumer) = self.consume_producer(&producer).await {
                    self.emit_new_consumer(&producer.participant_id, consumer);
                }
            }
            SessionEvent::PeerLeft {
                participant_id,
                producer_ids,
            } => {
                let stale: Vec<String> = self
                    .consumers
                    .iter()
                    .filter(|(_, c)| producer_ids.contains(&c.producer_id()))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in stale {
                    if let Some(consumer) = self.consumers.remove(&id) {
                        consumer.close();
                    }
                }
                self.send(&ServerMessage::ParticipantDisconnected { participant_id });
            }
        }
    }

    fn emit_new_consumer(&self, participant_id: &str, consumer: ConsumerInfo) {
        self.send(&ServerMessage::NewConsumer {
            participant_id: participant_id.to_string(),
            producer_id: consumer.producer_id,
            id: consumer.id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
        });
    }

    /// Subscribes this session to `producer`.
    ///
    /// `None` when there are no capabilities yet, the engine says they do not
    /// match, there is no consuming transport, or the producer is already
    /// consumed. Engine failures are logged and also yield `None`.
    async fn consume_producer(&mut self, producer: &PublishedProducer) -> Option<ConsumerInfo> {
        let rtp_capabilities = self.rtp_capabilities.as_ref()?;
        if !self.router.can_consume(&producer.id, rtp_capabilities) {
            debug!("Participant {} cannot consume producer {}", self.id, producer.id);
            return None;
        }
        let (_, transport) = self.transports.iter().find(|(_, t)| t.consuming)?;
        if self.consumers.values().any(|c| c.producer_id() == producer.id) {
            return None;
        }

        let consumer = match transport
            .handle
            .consume(&producer.id, rtp_capabilities.clone(), true)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!("Participant {}: consume {} failed: {}", self.id, producer.id, e);
                return None;
            }
        };
        let info = ConsumerInfo {
            id: consumer.id(),
            producer_id: producer.id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        self.consumers.insert(info.id.clone(), consumer);

        if let Some(consumer) = self.consumers.get(&info.id) {
            if let Err(e) = consumer.resume().await {
                warn!("Participant {}: resume {} failed: {}", self.id, info.id, e);
            }
        }
        self.metrics.inc_consumers_created();
        debug!("Participant {} consuming {} as {}", self.id, producer.id, info.id);
        Some(info)
    }

    /// Tears the session down: consumers, then producers, then transports;
    /// leaves the room and tells the remaining peers
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        for (_, consumer) in self.consumers.drain() {
            consumer.close();
        }
        let producer_ids: Vec<String> = self.producers.keys().cloned().collect();
        for (_, producer) in self.producers.drain() {
            producer.close();
        }
        for (_, transport) in self.transports.drain(..) {
            transport.handle.close();
        }
        self.state = SessionState::Disconnected;
        self.metrics.inc_leaves();

        let departure = self.registry.detach(&self.room_id, &self.id).await;
        for peer in &departure.remaining {
            let event = SessionEvent::PeerLeft {
                participant_id: self.id.clone(),
                producer_ids: producer_ids.clone(),
            };
            if let Err(e) = peer.inbox.send(event) {
                debug!("Could not tell participant {} about departure: {}", peer.id, e);
            }
        }
        info!(
            "Participant {} left room {}{}",
            self.id,
            self.room_id,
            if departure.room_closed { " (room closed)" } else { "" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::{rtp_capabilities, rtp_parameters};
    use crate::room::tests::{fixture, Fixture};
    use serde_json::json;

    struct Client {
        session: ParticipantSession,
        inbox: mpsc::UnboundedReceiver<SessionEvent>,
        frames: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        fn next_frame(&mut self) -> Option<Value> {
            self.frames
                .try_recv()
                .ok()
                .map(|json| serde_json::from_str(&json).unwrap())
        }

        fn frames_of(&mut self, kind: &str) -> Vec<Value> {
            let mut out = Vec::new();
            while let Some(frame) = self.next_frame() {
                if frame["type"] == kind {
                    out.push(frame);
                }
            }
            out
        }

        async fn pump(&mut self) {
            while let Ok(event) = self.inbox.try_recv() {
                self.session.handle_event(event).await;
            }
        }
    }

    async fn connect(f: &Fixture, id: &str) -> Client {
        let (tx, frames) = mpsc::channel(256);
        let (session, inbox) = ParticipantSession::open(
            id.to_string(),
            "lobby",
            f.registry.clone(),
            tx,
            ServerMetrics::new(),
        )
        .await
        .unwrap();
        Client {
            session,
            inbox,
            frames,
        }
    }

    /// Client that has a send and a receive transport and has joined
    async fn joined(f: &Fixture, id: &str, caps: Value) -> (Client, String) {
        let mut client = connect(f, id).await;
        let send = client.session.create_transport(true, false).await.unwrap();
        client.session.create_transport(false, true).await.unwrap();
        client.session.join(caps, None).await.unwrap();
        (client, send.id)
    }

    #[tokio::test]
    async fn test_open_publishes_router_capabilities() {
        let f = fixture();
        let mut a = connect(&f, "a").await;
        let frame = a.next_frame().unwrap();
        assert_eq!(frame["type"], "getRouterRtpCapabilities");
        assert!(frame["routerRtpCapabilities"]["codecs"].is_array());
        assert_eq!(a.session.state(), SessionState::CapabilitiesPublished);
    }

    #[tokio::test]
    async fn test_late_joiner_consumes_existing_producer_and_sees_departure() {
        let f = fixture();
        let (mut a, a_send) = joined(&f, "a", rtp_capabilities(&["audio/opus"])).await;
        let p1 = a
            .session
            .produce(&a_send, MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();
        assert_eq!(a.session.state(), SessionState::Producing);

        let (mut b, _) = joined(&f, "b", rtp_capabilities(&["audio/opus"])).await;
        let consumers = b.frames_of("newConsumer");
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0]["participantId"], "a");
        assert_eq!(consumers[0]["producerId"], p1.as_str());
        assert_eq!(consumers[0]["kind"], "audio");

        b.session.disconnect().await;
        a.pump().await;
        let left = a.frames_of("participantDisconnected");
        assert_eq!(left, vec![json!({ "type": "participantDisconnected", "participantId": "b" })]);
    }

    #[tokio::test]
    async fn test_new_producer_reaches_joined_peers() {
        let f = fixture();
        let (mut a, a_send) = joined(&f, "a", rtp_capabilities(&["video/VP8"])).await;
        let (mut b, _) = joined(&f, "b", rtp_capabilities(&["video/VP8"])).await;

        let producer_id = a
            .session
            .produce(&a_send, MediaKind::Video, rtp_parameters("video/VP8"))
            .await
            .unwrap();
        b.pump().await;

        let consumers = b.frames_of("newConsumer");
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0]["producerId"], producer_id.as_str());
        assert_eq!(b.session.consumer_count(), 1);
        // The producer's own session never consumes it
        a.pump().await;
        assert_eq!(a.session.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_peer_receives_every_producer() {
        let f = fixture();
        let (mut a, a_send) = joined(&f, "a", rtp_capabilities(&["audio/opus"])).await;
        let (mut b, _) = joined(&f, "b", rtp_capabilities(&["audio/opus"])).await;

        // b does not drain its inbox until a is done publishing
        for _ in 0..100 {
            a.session
                .produce(&a_send, MediaKind::Audio, rtp_parameters("audio/opus"))
                .await
                .unwrap();
        }
        b.pump().await;

        assert_eq!(b.session.consumer_count(), 100);
        assert_eq!(b.frames_of("newConsumer").len(), 100);
    }

    #[tokio::test]
    async fn test_no_consumer_without_compatible_capabilities() {
        let f = fixture();
        let (mut a, a_send) = joined(&f, "a", rtp_capabilities(&["audio/opus"])).await;
        a.session
            .produce(&a_send, MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();

        let (mut b, _) = joined(&f, "b", rtp_capabilities(&["video/VP8"])).await;
        assert!(b.frames_of("newConsumer").is_empty());
        assert_eq!(b.session.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_no_consumer_without_consuming_transport() {
        let f = fixture();
        let (mut a, a_send) = joined(&f, "a", rtp_capabilities(&["audio/opus"])).await;
        a.session
            .produce(&a_send, MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();

        let mut b = connect(&f, "b").await;
        b.session.create_transport(true, false).await.unwrap();
        b.session.join(rtp_capabilities(&["audio/opus"]), None).await.unwrap();
        assert!(b.frames_of("newConsumer").is_empty());
    }

    #[tokio::test]
    async fn test_producer_is_consumed_once() {
        let f = fixture();
        let mut b = connect(&f, "b").await;
        b.session.create_transport(false, true).await.unwrap();
        let (mut a, a_send) = joined(&f, "a", rtp_capabilities(&["audio/opus"])).await;
        a.session
            .produce(&a_send, MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();

        // The producer shows up in both the catch-up snapshot and the inbox
        b.session.join(rtp_capabilities(&["audio/opus"]), None).await.unwrap();
        b.pump().await;
        assert_eq!(b.frames_of("newConsumer").len(), 1);
        assert_eq!(b.session.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_second_join_is_rejected() {
        let f = fixture();
        let (mut a, _) = joined(&f, "a", rtp_capabilities(&["audio/opus"])).await;
        let err = a.session.join(json!({}), None).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyJoined));
        assert_eq!(err.to_string(), "Already joined");
    }

    #[tokio::test]
    async fn test_transport_errors() {
        let f = fixture();
        let mut a = connect(&f, "a").await;
        let transport = a.session.create_transport(true, false).await.unwrap();

        let err = a.session.connect_transport("missing", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "transport missing not found");

        f.state.set_fail_connect(true);
        let err = a.session.connect_transport(&transport.id, json!({})).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed(ref msg) if msg.contains("dtls handshake rejected")));

        f.state.set_fail_produce(true);
        let err = a
            .session
            .produce(&transport.id, MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProduceFailed(_)));

        let err = a
            .session
            .produce("missing", MediaKind::Audio, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_in_order_and_leaves_nothing_behind() {
        let f = fixture();
        let (mut a, a_send) = joined(&f, "a", rtp_capabilities(&["audio/opus"])).await;
        let (mut b, b_send) = joined(&f, "b", rtp_capabilities(&["audio/opus"])).await;
        a.session
            .produce(&a_send, MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();
        let b_producer = b
            .session
            .produce(&b_send, MediaKind::Audio, rtp_parameters("audio/opus"))
            .await
            .unwrap();
        b.pump().await;
        assert_eq!(b.session.consumer_count(), 1);

        b.session.disconnect().await;
        assert_eq!(b.session.state(), SessionState::Disconnected);

        let events = f.state.events();
        let close_positions = |what: &str| -> Vec<usize> {
            events
                .iter()
                .enumerate()
                .filter(|(_, e)| e.starts_with(&format!("close:{what}:")))
                .map(|(i, _)| i)
                .collect()
        };
        let consumers = close_positions("consumer");
        let producers = close_positions("producer");
        let transports = close_positions("transport");
        assert_eq!(producers.len(), 1);
        assert_eq!(transports.len(), 2);
        assert!(consumers.iter().max() < producers.iter().min());
        assert!(producers.iter().max() < transports.iter().min());

        let snapshot = f.registry.peers("lobby", None).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.peers[0].handle.id, "a");
        assert!(snapshot.peers[0].producers.iter().all(|p| p.id != b_producer));

        a.pump().await;
        assert_eq!(a.frames_of("participantDisconnected").len(), 1);

        a.session.disconnect().await;
        assert!(f.registry.get("lobby").is_none());
        assert_eq!(f.registry.room_count(), 0);
    }
}
