#![forbid(unsafe_code)]

// Room module - room registry, peer directory and the per-room HLS tap
pub mod session;

pub use session::{ParticipantSession, SessionError, SessionEvent, SessionState};

use crate::bridge::MediaBridge;
use crate::media::config::TapCapabilities;
use crate::media::engine::{MediaEngine, RoutingContext};
use crate::media::types::{MediaError, MediaKind, MediaResult, PublishedProducer, TapDescriptor, TapEndpoint};
use crate::metrics::ServerMetrics;
use crate::ports::PortAllocator;
use crate::transcode::{SessionDescriptor, StreamTarget, TranscodeConfig, TranscodeError, TranscodeJob};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{Mutex as TokioMutex, RwLock as TokioRwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How the rest of the room reaches one participant
#[derive(Clone)]
pub struct PeerHandle {
    pub id: String,
    /// Session inbox; consumed by the participant's own connection task
    pub inbox: mpsc::UnboundedSender<SessionEvent>,
    /// Pre-serialized frames for the participant's client
    pub outbound: mpsc::Sender<Arc<String>>,
}

/// A peer and the producers it had published when the snapshot was taken
#[derive(Clone)]
pub struct PeerView {
    pub handle: PeerHandle,
    pub producers: Vec<PublishedProducer>,
}

/// Point-in-time copy of a room's peer directory
#[derive(Clone, Default)]
pub struct PeerSnapshot {
    pub peers: Vec<PeerView>,
}

impl PeerSnapshot {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Live peers and their published producers
struct Room {
    id: String,
    peers: HashMap<String, PeerHandle>,
    /// Publication order is kept so the tap picks producers deterministically
    producers: Vec<PublishedProducer>,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            peers: HashMap::new(),
            producers: Vec::new(),
        }
    }

    fn snapshot(&self, except: Option<&str>) -> PeerSnapshot {
        let peers = self
            .peers
            .values()
            .filter(|peer| Some(peer.id.as_str()) != except)
            .map(|peer| PeerView {
                handle: peer.clone(),
                producers: self
                    .producers
                    .iter()
                    .filter(|p| p.participant_id == peer.id)
                    .cloned()
                    .collect(),
            })
            .collect();
        PeerSnapshot { peers }
    }
}

/// One tapped kind: its plain transport, the leased transcoder ports and,
/// once a producer of that kind exists, the tap consumer
struct TappedStream {
    endpoint: TapEndpoint,
    rtp_port: u16,
    /// `None` when RTCP is muxed onto the RTP port
    rtcp_port: Option<u16>,
    descriptor: Option<TapDescriptor>,
}

impl TappedStream {
    fn target(&self) -> Option<StreamTarget> {
        self.descriptor.as_ref().map(|descriptor| StreamTarget {
            port: self.rtp_port,
            rtcp_port: self.rtcp_port,
            descriptor: descriptor.clone(),
        })
    }
}

/// Bridge + transcoder + port leases republishing a room as HLS
struct RoomTap {
    owner: String,
    bridge: MediaBridge,
    job: TranscodeJob,
    audio: TappedStream,
    video: TappedStream,
    /// WebSocket viewers currently watching
    viewers: usize,
    /// Opened over HTTP; such a tap has no viewer to outlive and stays up
    /// until the room closes
    pinned: bool,
}

/// Who is asking for a room's tap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapHold {
    Pinned,
    Viewer,
}

impl RoomTap {
    fn hold(&mut self, hold: TapHold) {
        match hold {
            TapHold::Pinned => self.pinned = true,
            TapHold::Viewer => self.viewers += 1,
        }
    }

    fn stream_mut(&mut self, kind: MediaKind) -> &mut TappedStream {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn session_descriptor(&self, ip: IpAddr) -> SessionDescriptor {
        SessionDescriptor {
            ip: ip.to_string(),
            audio: self.audio.target(),
            video: self.video.target(),
        }
    }

    fn info(&self, room_id: &str) -> TapInfo {
        TapInfo {
            room_id: room_id.to_string(),
            playlist: self.job.playlist_url(),
            audio_transport: self.audio.endpoint.clone(),
            video_transport: self.video.endpoint.clone(),
        }
    }
}

/// What a viewer needs to find a room's tap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TapInfo {
    pub room_id: String,
    pub playlist: String,
    pub audio_transport: TapEndpoint,
    pub video_transport: TapEndpoint,
}

#[derive(Error, Debug)]
pub enum TapError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

/// Settings for the tap path
#[derive(Debug, Clone)]
pub struct TapSettings {
    /// Address the transcoder listens on and the tap transports send to
    pub listen_ip: IpAddr,
    /// Send RTCP on the RTP port; only one port is leased per stream then
    pub rtcp_mux: bool,
    pub capabilities: TapCapabilities,
    pub transcode: TranscodeConfig,
}

struct RoomEntry {
    router: Arc<dyn RoutingContext>,
    room: TokioRwLock<Room>,
    /// Held across tap setup so concurrent requests serialize
    tap: TokioMutex<Option<RoomTap>>,
    closing: AtomicBool,
}

impl RoomEntry {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Result of removing a participant from its room
pub struct Departure {
    /// Peers still in the room at removal time
    pub remaining: Vec<PeerHandle>,
    pub room_closed: bool,
}

/// Attempts at joining a room that is concurrently closing
const JOIN_ATTEMPTS: usize = 3;

/// Room id to routing context, peer directory and tap.
///
/// The map lock is a `std` lock held only for lookups and inserts, never across
/// an await; per-room state lives behind tokio locks inside each entry.
pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    rooms: StdRwLock<HashMap<String, Arc<RoomEntry>>>,
    ports: Arc<PortAllocator>,
    tap_settings: TapSettings,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        ports: Arc<PortAllocator>,
        tap_settings: TapSettings,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            engine,
            rooms: StdRwLock::new(HashMap::new()),
            ports,
            tap_settings,
            metrics,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    fn entry(&self, room_id: &str) -> Option<Arc<RoomEntry>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).filter(|entry| !entry.is_closing()).cloned()
    }

    /// Routing context of a live room
    pub fn get(&self, room_id: &str) -> Option<Arc<dyn RoutingContext>> {
        self.entry(room_id).map(|entry| entry.router.clone())
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().filter(|entry| !entry.is_closing()).count()
    }

    pub async fn participant_count(&self) -> usize {
        let entries: Vec<Arc<RoomEntry>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().filter(|entry| !entry.is_closing()).cloned().collect()
        };
        let mut total = 0;
        for entry in entries {
            total += entry.room.read().await.peers.len();
        }
        total
    }

    /// Returns the room's routing context, creating the room if needed.
    ///
    /// Concurrent creators converge on one context; the loser's is closed.
    pub async fn resolve_or_create(&self, room_id: &str) -> MediaResult<Arc<dyn RoutingContext>> {
        if let Some(router) = self.get(room_id) {
            return Ok(router);
        }

        let router = self.engine.create_router(room_id).await?;

        let winner = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room_id) {
                Some(existing) if !existing.is_closing() => Err(existing.router.clone()),
                _ => {
                    rooms.insert(
                        room_id.to_string(),
                        Arc::new(RoomEntry {
                            router: router.clone(),
                            room: TokioRwLock::new(Room::new(room_id.to_string())),
                            tap: TokioMutex::new(None),
                            closing: AtomicBool::new(false),
                        }),
                    );
                    Ok(router.clone())
                }
            }
        };

        match winner {
            Ok(router) => {
                self.metrics.inc_rooms_created();
                info!("Created room {} (router {})", room_id, router.id());
                Ok(router)
            }
            Err(existing) => {
                debug!("Room {} created concurrently, discarding router {}", room_id, router.id());
                router.close();
                Ok(existing)
            }
        }
    }

    /// Adds a peer to the room's directory
    pub async fn attach(&self, room_id: &str, peer: PeerHandle) -> MediaResult<()> {
        let entry = self
            .entry(room_id)
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))?;
        // Re-checked under the room lock: a closing room accepts no one
        let mut room = entry.room.write().await;
        if entry.is_closing() {
            return Err(MediaError::RoomNotFound(room_id.to_string()));
        }
        debug!("Participant {} attached to room {}", peer.id, room.id);
        room.peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    /// Resolves or creates the room and attaches `peer`, retrying if the room
    /// closes in between
    pub async fn join_room(&self, room_id: &str, peer: PeerHandle) -> MediaResult<Arc<dyn RoutingContext>> {
        let mut last_err = MediaError::RoomNotFound(room_id.to_string());
        for _ in 0..JOIN_ATTEMPTS {
            let router = self.resolve_or_create(room_id).await?;
            match self.attach(room_id, peer.clone()).await {
                Ok(()) => return Ok(router),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Snapshot of every peer except `except`, with their published producers
    pub async fn peers(&self, room_id: &str, except: Option<&str>) -> PeerSnapshot {
        match self.entry(room_id) {
            Some(entry) => entry.room.read().await.snapshot(except),
            None => PeerSnapshot::default(),
        }
    }

    /// Records a producer so late joiners and the tap can find it
    pub async fn publish(&self, room_id: &str, producer: PublishedProducer) -> MediaResult<()> {
        let entry = self
            .entry(room_id)
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))?;
        let mut room = entry.room.write().await;
        if room.producers.iter().any(|p| p.id == producer.id) {
            return Err(MediaError::ProducerError(format!(
                "producer {} already published in room {}",
                producer.id, room_id
            )));
        }
        room.producers.push(producer);
        Ok(())
    }

    /// Removes a participant and its producers. Closes the room if the live
    /// directory is empty afterwards.
    pub async fn detach(&self, room_id: &str, participant_id: &str) -> Departure {
        let Some(entry) = self.entry(room_id) else {
            return Departure {
                remaining: Vec::new(),
                room_closed: false,
            };
        };

        let (remaining, withdrawn, empty) = {
            let mut room = entry.room.write().await;
            room.peers.remove(participant_id);
            let (withdrawn, kept): (Vec<_>, Vec<_>) = room
                .producers
                .drain(..)
                .partition(|p| p.participant_id == participant_id);
            room.producers = kept;
            let empty = room.peers.is_empty();
            if empty {
                entry.closing.store(true, Ordering::Release);
            }
            (room.peers.values().cloned().collect::<Vec<_>>(), withdrawn, empty)
        };
        debug!(
            "Participant {} detached from room {} ({} remaining)",
            participant_id,
            room_id,
            remaining.len()
        );

        if empty {
            self.close_entry(room_id, &entry).await;
        } else if !withdrawn.is_empty() {
            self.withdraw_from_tap(room_id, &entry, &withdrawn).await;
        }
        Departure {
            remaining,
            room_closed: empty,
        }
    }

    /// Stops the room tap, closes the routing context and removes the room
    pub async fn remove(&self, room_id: &str) -> bool {
        let entry = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(room_id).cloned()
        };
        let Some(entry) = entry else {
            return false;
        };
        if entry.closing.swap(true, Ordering::AcqRel) {
            // Another caller is already closing it
            return false;
        }
        self.close_entry(room_id, &entry).await;
        true
    }

    async fn close_entry(&self, room_id: &str, entry: &Arc<RoomEntry>) {
        if let Some(tap) = entry.tap.lock().await.take() {
            self.teardown_tap(room_id, tap).await;
        }

        entry.router.close();

        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            // A new room under the same id may already have replaced this one
            if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                rooms.remove(room_id);
            }
        }
        self.metrics.inc_rooms_closed();
        info!("Closed room {}", room_id);
    }

    async fn teardown_tap(&self, room_id: &str, mut tap: RoomTap) {
        tap.job.stop().await;
        tap.bridge.close();
        let freed = self.ports.release(&tap.owner);
        info!("Tore down tap for room {} ({} port(s) released)", room_id, freed);
    }

    /// Closes every room
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.keys().cloned().collect()
        };
        for id in ids {
            self.remove(&id).await;
        }
    }

    /// Opens (or returns) the room's tap: two plain transports aimed at leased
    /// transcoder ports, tap consumers for the first audio and video producers,
    /// and a running transcoder once there is something to transcode.
    ///
    /// Never creates a room. A tap opened here stays up until the room closes.
    pub async fn open_tap(&self, room_id: &str) -> Result<TapInfo, TapError> {
        self.acquire_tap(room_id, TapHold::Pinned).await
    }

    /// Like `open_tap`, for a viewer that later calls `unwatch_tap`
    pub async fn watch_tap(&self, room_id: &str) -> Result<TapInfo, TapError> {
        self.acquire_tap(room_id, TapHold::Viewer).await
    }

    /// Drops one viewer; tears the tap down when it was the last one and the
    /// tap is not pinned. Returns whether the tap was torn down.
    pub async fn unwatch_tap(&self, room_id: &str) -> bool {
        let Some(entry) = self.entry(room_id) else {
            return false;
        };
        let mut slot = entry.tap.lock().await;
        let idle = match slot.as_mut() {
            Some(tap) => {
                tap.viewers = tap.viewers.saturating_sub(1);
                tap.viewers == 0 && !tap.pinned
            }
            None => false,
        };
        if !idle {
            return false;
        }
        match slot.take() {
            Some(tap) => {
                self.teardown_tap(room_id, tap).await;
                true
            }
            None => false,
        }
    }

    async fn acquire_tap(&self, room_id: &str, hold: TapHold) -> Result<TapInfo, TapError> {
        let entry = self
            .entry(room_id)
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))?;

        let mut slot = entry.tap.lock().await;
        if let Some(tap) = slot.as_mut() {
            debug!("Tap for room {} already open", room_id);
            tap.hold(hold);
            return Ok(tap.info(room_id));
        }
        if entry.is_closing() {
            return Err(MediaError::RoomNotFound(room_id.to_string()).into());
        }

        let owner = format!("tap:{}:{}", room_id, Uuid::new_v4());
        let mut bridge = MediaBridge::new(entry.router.clone());
        let built = self.build_tap(room_id, &entry, &owner, &mut bridge).await;
        let (audio, video) = match built {
            Ok(streams) => streams,
            Err(e) => {
                bridge.close();
                self.ports.release(&owner);
                return Err(e);
            }
        };

        let mut tap = RoomTap {
            owner,
            bridge,
            job: TranscodeJob::new(room_id, self.tap_settings.transcode.clone(), self.metrics.clone()),
            audio,
            video,
            viewers: 0,
            pinned: false,
        };
        tap.hold(hold);

        let session = tap.session_descriptor(self.tap_settings.listen_ip);
        if !session.is_empty() {
            if let Err(e) = tap.job.start(&session).await {
                self.teardown_tap(room_id, tap).await;
                return Err(e.into());
            }
        }

        self.metrics.inc_taps_opened();
        let info = tap.info(room_id);
        info!("Opened tap for room {}, playlist {}", room_id, info.playlist);
        *slot = Some(tap);
        Ok(info)
    }

    async fn build_tap(
        &self,
        room_id: &str,
        entry: &RoomEntry,
        owner: &str,
        bridge: &mut MediaBridge,
    ) -> Result<(TappedStream, TappedStream), TapError> {
        let listen_ip = self.tap_settings.listen_ip;
        let mut streams = Vec::with_capacity(2);
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let endpoint = bridge.open_tap(&kind.to_string()).await?;
            let (rtp_port, rtcp_port) = if self.tap_settings.rtcp_mux {
                (self.ports.lease(owner)?, None)
            } else {
                let (rtp, rtcp) = self.ports.lease_pair(owner)?;
                (rtp, Some(rtcp))
            };
            bridge.connect(&endpoint.id, listen_ip, rtp_port, rtcp_port).await?;
            streams.push(TappedStream {
                endpoint,
                rtp_port,
                rtcp_port,
                descriptor: None,
            });
        }
        let mut video = streams.pop().ok_or_else(|| MediaError::TransportError("tap setup failed".into()))?;
        let mut audio = streams.pop().ok_or_else(|| MediaError::TransportError("tap setup failed".into()))?;

        let producers = entry.room.read().await.producers.clone();
        self.fill_streams(room_id, bridge, &mut audio, &mut video, &producers)
            .await;
        Ok((audio, video))
    }

    /// Taps the first producer of each kind whose stream is still empty.
    /// Returns whether anything was tapped.
    async fn fill_streams(
        &self,
        room_id: &str,
        bridge: &mut MediaBridge,
        audio: &mut TappedStream,
        video: &mut TappedStream,
        producers: &[PublishedProducer],
    ) -> bool {
        let mut tapped = false;
        for producer in producers {
            let stream = match producer.kind {
                MediaKind::Audio => &mut *audio,
                MediaKind::Video => &mut *video,
            };
            if stream.descriptor.is_some() {
                continue;
            }
            let caps = self.tap_settings.capabilities.for_kind(producer.kind).clone();
            match bridge.tap_producer(&stream.endpoint.id, &producer.id, caps, false).await {
                Ok(descriptor) => {
                    stream.descriptor = Some(descriptor);
                    tapped = true;
                }
                Err(e) => warn!("Room {}: cannot tap producer {}: {}", room_id, producer.id, e),
            }
        }
        tapped
    }

    /// Stops the transcoder and starts it again on the tap's current streams;
    /// leaves it stopped when nothing is tapped
    async fn restart_job(&self, tap: &mut RoomTap) -> Result<(), TranscodeError> {
        tap.job.stop().await;
        let session = tap.session_descriptor(self.tap_settings.listen_ip);
        if !session.is_empty() {
            tap.job.start(&session).await?;
        }
        Ok(())
    }

    /// Drops tap consumers of departed producers and re-taps each emptied kind
    /// from the producers still in the room
    async fn withdraw_from_tap(&self, room_id: &str, entry: &RoomEntry, withdrawn: &[PublishedProducer]) {
        let mut slot = entry.tap.lock().await;
        let Some(tap) = slot.as_mut() else {
            return;
        };

        let mut changed = false;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let stream = tap.stream_mut(kind);
            let Some(consumer_id) = stream
                .descriptor
                .as_ref()
                .filter(|d| withdrawn.iter().any(|p| p.id == d.producer_id))
                .map(|d| d.id.clone())
            else {
                continue;
            };
            stream.descriptor = None;
            tap.bridge.untap(&consumer_id);
            changed = true;
        }
        if !changed {
            return;
        }

        let producers = entry.room.read().await.producers.clone();
        let RoomTap {
            bridge, audio, video, ..
        } = &mut *tap;
        self.fill_streams(room_id, bridge, audio, video, &producers).await;

        if let Err(e) = self.restart_job(tap).await {
            error!("Room {}: transcoder restart failed: {}", room_id, e);
            return;
        }
        info!(
            "Room {}: tap dropped {} departed producer(s), transcoder {}",
            room_id,
            withdrawn.len(),
            if tap.job.is_running() { "restarted" } else { "stopped" }
        );
    }

    /// Hands a freshly published producer to the room tap when its kind is not
    /// tapped yet; the transcoder is restarted with the new description.
    pub async fn offer_producer(&self, room_id: &str, producer: &PublishedProducer) -> Result<bool, TapError> {
        let Some(entry) = self.entry(room_id) else {
            return Ok(false);
        };
        let mut slot = entry.tap.lock().await;
        let Some(tap) = slot.as_mut() else {
            return Ok(false);
        };

        let caps = self.tap_settings.capabilities.for_kind(producer.kind).clone();
        let transport_id = {
            let stream = tap.stream_mut(producer.kind);
            if stream.descriptor.is_some() {
                return Ok(false);
            }
            stream.endpoint.id.clone()
        };
        // Its publisher may have left since
        if !entry.room.read().await.producers.iter().any(|p| p.id == producer.id) {
            return Ok(false);
        }
        let descriptor = tap
            .bridge
            .tap_producer(&transport_id, &producer.id, caps, false)
            .await?;
        tap.stream_mut(producer.kind).descriptor = Some(descriptor);

        if let Err(e) = self.restart_job(tap).await {
            error!("Room {}: transcoder restart failed: {}", room_id, e);
            return Err(e.into());
        }
        info!("Room {}: tapped {} producer {}", room_id, producer.kind, producer.id);
        Ok(true)
    }

    /// Number of transcoder processes spawned for the room's current tap
    #[cfg(test)]
    pub async fn transcoder_spawns(&self, room_id: &str) -> usize {
        match self.entry(room_id) {
            Some(entry) => entry.tap.lock().await.as_ref().map_or(0, |tap| tap.job.spawn_count()),
            None => 0,
        }
    }
}
