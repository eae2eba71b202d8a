#![forbid(unsafe_code)]

// Room registry, peer sessions, and the producer/consumer broker.

pub mod chat;
pub mod peer;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::RwLock as TokioRwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::engine::types::{
    ConsumerId, ConsumerType, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId, WorkerId,
};
use crate::engine::{EngineError, MediaConsumer, MediaProducer, MediaRouter, MediaTransport};
use crate::error::{SignalError, SignalResult};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{ChatDraft, PeerInfo, ServerMessage};
use crate::worker_pool::WorkerPool;
use chat::{ChatLog, ChatMessage, unix_timestamp_millis};
use peer::{Direction, PeerSession, ProducerRecord, TransportRecord, TransportState};

pub const MAX_ROOM_ID_LEN: usize = 128;
pub const MAX_PEER_ID_LEN: usize = 128;
pub const MAX_PEER_NAME_LEN: usize = 64;
pub const MAX_CHAT_TEXT_LEN: usize = 4096;

/// Negotiation parameters handed back to the transport's owner over RPC,
/// never over the broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub transport_id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub peers_count: usize,
    pub transports_count: usize,
    pub producers_count: usize,
    pub consumers_count: usize,
    pub chat_messages_count: usize,
}

/// What a joiner is told at registration: the peers already present and the
/// chat backlog, both snapshotted before its own record is inserted.
#[derive(Debug)]
pub struct JoinSnapshot {
    pub existing_peers: Vec<PeerInfo>,
    pub chat_history: Vec<ChatMessage>,
}

/// Engine handles detached from room state under the lock; closed by the
/// caller after the lock is released.
struct ProducerTeardown {
    producer: Arc<dyn MediaProducer>,
    consumers: Vec<Arc<dyn MediaConsumer>>,
}

impl ProducerTeardown {
    async fn close(self) {
        for consumer in self.consumers {
            consumer.close().await;
        }
        self.producer.close().await;
    }
}

/// Room state: one router on one worker for the room's whole life, the peer
/// sessions, and the bounded chat backlog.
pub struct Room {
    pub id: String,
    router: Arc<dyn MediaRouter>,
    worker_id: WorkerId,
    peers: HashMap<String, PeerSession>,
    chat: ChatLog,
    /// Set when a destroy wins; a joiner holding a stale handle re-runs
    /// `ensure_room` instead of entering a dead room.
    closed: bool,
}

impl Room {
    fn new(id: String, router: Arc<dyn MediaRouter>, worker_id: WorkerId) -> Self {
        Self {
            id,
            router,
            worker_id,
            peers: HashMap::new(),
            chat: ChatLog::new(),
            closed: false,
        }
    }

    /// Best-effort fan-out: serialize once, `try_send` per peer. A full
    /// channel drops the message for that peer, a closed one is skipped.
    fn broadcast(&self, skip: Option<&str>, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("failed to serialize broadcast message: {e}");
                return;
            }
        };
        for (id, peer) in &self.peers {
            if skip == Some(id.as_str()) {
                continue;
            }
            match peer.channel.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "channel full for peer {} in room {}, dropping message",
                        id, self.id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(
                        "channel closed for peer {} in room {} (disconnected)",
                        id, self.id
                    );
                }
            }
        }
    }

    fn broadcast_except(&self, peer_id: &str, message: &ServerMessage) {
        self.broadcast(Some(peer_id), message);
    }

    fn broadcast_all(&self, message: &ServerMessage) {
        self.broadcast(None, message);
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.values().map(PeerSession::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn find_producer(&self, producer_id: ProducerId) -> Option<(&str, MediaKind, &ProducerRecord)> {
        for (owner_id, peer) in &self.peers {
            for (kind, record) in &peer.producers {
                if record.producer.id() == producer_id {
                    return Some((owner_id.as_str(), *kind, record));
                }
            }
        }
        None
    }

    /// Detaches every consumer referencing the producer and notifies the
    /// owner's peers with `producer-closed`. The extracted engine handles
    /// are closed by the caller once the room lock is released.
    fn cascade_producer_close(&mut self, owner_id: &str, record: ProducerRecord) -> ProducerTeardown {
        let producer_id = record.producer.id();
        let mut consumers = Vec::new();
        for peer in self.peers.values_mut() {
            peer.consumers.retain(|_, consumer| {
                if consumer.producer_id() == producer_id {
                    consumers.push(consumer.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.broadcast_except(owner_id, &ServerMessage::ProducerClosed { producer_id });
        ProducerTeardown {
            producer: record.producer,
            consumers,
        }
    }
}

type RoomMap = HashMap<String, Arc<TokioRwLock<Room>>>;

/// Close notice from a transport's engine-side observer. Carries the
/// transport id so a replaced slot ignores stale events.
struct TransportClosedEvent {
    room_id: String,
    peer_id: String,
    direction: Direction,
    transport_id: TransportId,
}

/// Owns all rooms and brokers every signaling operation against them.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups/inserts, never across await points), while each
/// room is protected by its own tokio::sync::RwLock. Engine calls are awaited
/// outside room locks; their results are recorded only after re-checking that
/// the peer is still registered.
pub struct RoomManager {
    rooms: Arc<StdRwLock<RoomMap>>,
    worker_pool: Arc<WorkerPool>,
    media_config: MediaConfig,
    metrics: ServerMetrics,
    transport_events: mpsc::UnboundedSender<TransportClosedEvent>,
}

impl RoomManager {
    pub fn new(
        worker_pool: Arc<WorkerPool>,
        media_config: MediaConfig,
        metrics: ServerMetrics,
    ) -> Self {
        let rooms: Arc<StdRwLock<RoomMap>> = Arc::new(StdRwLock::new(HashMap::new()));
        let (transport_events, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::transport_event_pump(rooms.clone(), events_rx));
        Self {
            rooms,
            worker_pool,
            media_config,
            metrics,
            transport_events,
        }
    }

    /// Applies engine-driven transport closes: removes the matching slot and
    /// cascades whatever the transport carried. A non-matching transport id
    /// means the slot was already replaced and the event is stale.
    async fn transport_event_pump(
        rooms: Arc<StdRwLock<RoomMap>>,
        mut events: mpsc::UnboundedReceiver<TransportClosedEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let room_arc = {
                let map = rooms.read().unwrap_or_else(|e| e.into_inner());
                map.get(&event.room_id).cloned()
            };
            let Some(room_arc) = room_arc else { continue };

            let mut teardowns = Vec::new();
            let mut orphaned: Vec<Arc<dyn MediaConsumer>> = Vec::new();
            {
                let mut room = room_arc.write().await;
                let mut producer_records: Vec<ProducerRecord> = Vec::new();
                {
                    let Some(peer) = room.peers.get_mut(&event.peer_id) else {
                        continue;
                    };
                    let slot = peer.transport_slot_mut(event.direction);
                    if slot.as_ref().map(|r| r.transport.id()) != Some(event.transport_id) {
                        continue;
                    }
                    let _ = slot.take();
                    match event.direction {
                        Direction::Send => {
                            producer_records.extend(peer.producers.drain().map(|(_, r)| r));
                        }
                        Direction::Receive => {
                            orphaned.extend(peer.consumers.drain().map(|(_, c)| c));
                        }
                    }
                }
                for record in producer_records {
                    teardowns.push(room.cascade_producer_close(&event.peer_id, record));
                }
                debug!(
                    room_id = %event.room_id,
                    peer_id = %event.peer_id,
                    direction = %event.direction,
                    "transport closed by engine"
                );
            }
            for teardown in teardowns {
                teardown.close().await;
            }
            for consumer in orphaned {
                consumer.close().await;
            }
        }
    }

    /// Room lookup without creation (brief outer read lock, no await).
    fn get_room(&self, room_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| SignalError::NotFound(format!("room {room_id} not found")))
    }

    /// Gets or creates a room. Creation is double-checked: the loser of a
    /// concurrent create closes its just-created router and takes the
    /// registered one. A closed handle means a destroy won a race, so the
    /// lookup restarts.
    async fn ensure_room(&self, room_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        loop {
            let existing = {
                let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
                rooms.get(room_id).cloned()
            };
            if let Some(room_arc) = existing {
                if room_arc.read().await.closed {
                    continue;
                }
                return Ok(room_arc);
            }

            let worker = self.worker_pool.acquire();
            let router = worker
                .create_router(self.media_config.media_codecs.clone())
                .await?;

            let inserted = {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                if rooms.contains_key(room_id) {
                    None
                } else {
                    let room_arc = Arc::new(TokioRwLock::new(Room::new(
                        room_id.to_string(),
                        router.clone(),
                        worker.id(),
                    )));
                    rooms.insert(room_id.to_string(), room_arc.clone());
                    Some(room_arc)
                }
            };

            match inserted {
                Some(room_arc) => {
                    self.metrics.inc_rooms_created();
                    info!(%room_id, router_id = %router.id(), worker_id = %worker.id(), "room created");
                    return Ok(room_arc);
                }
                None => {
                    // Lost the creation race; discard our router and retry.
                    router.close().await;
                }
            }
        }
    }

    /// Destroys the room if its peer map is empty. The emptiness re-check
    /// happens under the outer write lock with a non-blocking room lock
    /// attempt, so a racing join aborts the destroy.
    async fn destroy_if_empty(&self, room_id: &str) {
        let destroyed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let Some(room_arc) = rooms.get(room_id).cloned() else {
                return;
            };
            match room_arc.try_write() {
                Ok(mut room) if room.peers.is_empty() && !room.closed => {
                    room.closed = true;
                    rooms.remove(room_id);
                    Some((room.router.clone(), room.worker_id))
                }
                _ => None,
            }
        };
        if let Some((router, worker_id)) = destroyed {
            router.close().await;
            self.metrics.inc_rooms_destroyed();
            info!(%room_id, %worker_id, "room destroyed");
        }
    }

    fn validate_field(field: &str, value: &str, max_len: usize) -> SignalResult<()> {
        if value.is_empty() {
            return Err(SignalError::Validation(format!("{field} must not be empty")));
        }
        if value.len() > max_len {
            return Err(SignalError::Validation(format!(
                "{field} exceeds {max_len} bytes"
            )));
        }
        Ok(())
    }

    /// Router capability descriptor for a joining peer to intersect with its
    /// own. Creates the room if absent.
    pub async fn capabilities(&self, room_id: &str) -> SignalResult<RtpCapabilities> {
        Self::validate_field("roomId", room_id, MAX_ROOM_ID_LEN)?;
        let room_arc = self.ensure_room(room_id).await?;
        let room = room_arc.read().await;
        Ok(room.router.rtp_capabilities())
    }

    /// Registers a peer session and tells the rest of the room. The returned
    /// snapshot is what the joiner sees: peers present before it, plus the
    /// chat backlog.
    pub async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        name: &str,
        channel: mpsc::Sender<Arc<String>>,
    ) -> SignalResult<JoinSnapshot> {
        Self::validate_field("roomId", room_id, MAX_ROOM_ID_LEN)?;
        Self::validate_field("peerId", peer_id, MAX_PEER_ID_LEN)?;
        Self::validate_field("name", name, MAX_PEER_NAME_LEN)?;

        loop {
            let room_arc = self.ensure_room(room_id).await?;
            let mut room = room_arc.write().await;
            if room.closed {
                continue;
            }
            if room.peers.contains_key(peer_id) {
                return Err(SignalError::Conflict(format!(
                    "peer {peer_id} already joined room {room_id}"
                )));
            }

            let snapshot = JoinSnapshot {
                existing_peers: room.peer_infos(),
                chat_history: room.chat.snapshot(),
            };
            let session = PeerSession::new(peer_id.to_string(), name.to_string(), channel);
            let joined = session.info();
            room.peers.insert(peer_id.to_string(), session);
            room.broadcast_except(peer_id, &ServerMessage::PeerJoined { peer: joined });

            self.metrics.inc_joins();
            info!(%room_id, %peer_id, peers = room.peers.len(), "peer joined");
            return Ok(snapshot);
        }
    }

    /// Removes the peer and everything it owns: producers cascade to their
    /// consumers, its own consumers and transports are closed, the rest of
    /// the room learns `peer-left`, and an emptied room is destroyed.
    pub async fn leave(&self, room_id: &str, peer_id: &str) -> SignalResult<()> {
        let room_arc = self.get_room(room_id)?;

        let mut teardowns = Vec::new();
        let mut consumers: Vec<Arc<dyn MediaConsumer>> = Vec::new();
        let mut transports: Vec<Arc<dyn MediaTransport>> = Vec::new();
        let now_empty;
        {
            let mut room = room_arc.write().await;
            let mut session = room.peers.remove(peer_id).ok_or_else(|| {
                SignalError::NotFound(format!("peer {peer_id} not in room {room_id}"))
            })?;

            let records: Vec<ProducerRecord> =
                session.producers.drain().map(|(_, r)| r).collect();
            for record in records {
                teardowns.push(room.cascade_producer_close(peer_id, record));
            }
            consumers.extend(session.consumers.drain().map(|(_, c)| c));
            if let Some(record) = session.send_transport.take() {
                transports.push(record.transport.clone());
            }
            if let Some(record) = session.recv_transport.take() {
                transports.push(record.transport.clone());
            }

            room.broadcast_all(&ServerMessage::PeerLeft {
                peer_id: peer_id.to_string(),
            });
            now_empty = room.peers.is_empty();
        }

        for teardown in teardowns {
            teardown.close().await;
        }
        for consumer in consumers {
            consumer.close().await;
        }
        for transport in transports {
            transport.close().await;
        }

        self.metrics.inc_leaves();
        info!(%room_id, %peer_id, "peer left");
        if now_empty {
            self.destroy_if_empty(room_id).await;
        }
        Ok(())
    }

    /// Requests a transport from the engine and stores it in the peer's slot
    /// for `direction`. An occupied slot is close-then-replaced, cascading
    /// whatever the old transport carried.
    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: Direction,
    ) -> SignalResult<TransportInfo> {
        Self::validate_field("roomId", room_id, MAX_ROOM_ID_LEN)?;
        Self::validate_field("peerId", peer_id, MAX_PEER_ID_LEN)?;
        let room_arc = self.ensure_room(room_id).await?;

        let router = {
            let room = room_arc.read().await;
            if !room.peers.contains_key(peer_id) {
                return Err(SignalError::NotFound(format!(
                    "peer {peer_id} is not registered in room {room_id}"
                )));
            }
            room.router.clone()
        };

        let transport = router
            .create_transport(self.media_config.transport_options())
            .await?;
        let info = TransportInfo {
            transport_id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        };

        let mut replaced: Option<Arc<dyn MediaTransport>> = None;
        let mut teardowns = Vec::new();
        let mut orphaned: Vec<Arc<dyn MediaConsumer>> = Vec::new();
        let mut stale = false;
        {
            let mut room = room_arc.write().await;
            let mut producer_records: Vec<ProducerRecord> = Vec::new();
            match room.peers.get_mut(peer_id) {
                Some(peer) => {
                    let watch = {
                        let events = self.transport_events.clone();
                        let room_id = room_id.to_string();
                        let peer_id = peer_id.to_string();
                        let transport_id = transport.id();
                        transport.on_close(Box::new(move || {
                            let _ = events.send(TransportClosedEvent {
                                room_id,
                                peer_id,
                                direction,
                                transport_id,
                            });
                        }))
                    };
                    let slot = peer.transport_slot_mut(direction);
                    replaced = slot.take().map(|old| old.transport.clone());
                    *slot = Some(TransportRecord::new(transport.clone(), watch));
                    if replaced.is_some() {
                        match direction {
                            Direction::Send => {
                                producer_records.extend(peer.producers.drain().map(|(_, r)| r));
                            }
                            Direction::Receive => {
                                orphaned.extend(peer.consumers.drain().map(|(_, c)| c));
                            }
                        }
                    }
                }
                None => stale = true,
            }
            for record in producer_records {
                teardowns.push(room.cascade_producer_close(peer_id, record));
            }
        }

        if stale {
            // Peer left while the engine call was in flight.
            transport.close().await;
            return Err(SignalError::NotFound(format!(
                "peer {peer_id} left room {room_id} during transport setup"
            )));
        }
        for teardown in teardowns {
            teardown.close().await;
        }
        for consumer in orphaned {
            consumer.close().await;
        }
        if let Some(old) = replaced {
            debug!(%room_id, %peer_id, %direction, "replacing existing transport");
            old.close().await;
        }

        debug!(%room_id, %peer_id, %direction, transport_id = %info.transport_id, "transport created");
        Ok(info)
    }

    /// Finalizes the secure channel on the peer's transport for `direction`.
    /// The slot moves new -> connecting -> connected; a failed engine call
    /// rolls it back to new so the client may retry.
    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> SignalResult<()> {
        let room_arc = self.get_room(room_id)?;

        let transport = {
            let mut room = room_arc.write().await;
            let peer = room.peers.get_mut(peer_id).ok_or_else(|| {
                SignalError::NotFound(format!("peer {peer_id} not in room {room_id}"))
            })?;
            let record = peer.transport_slot_mut(direction).as_mut().ok_or_else(|| {
                SignalError::NotFound(format!("no {direction} transport; create it first"))
            })?;
            match record.state {
                TransportState::New => {}
                TransportState::Connecting | TransportState::Connected => {
                    return Err(SignalError::Conflict(format!(
                        "{direction} transport is already connecting or connected"
                    )));
                }
                TransportState::Closed => {
                    return Err(SignalError::NotFound(format!(
                        "{direction} transport is closed"
                    )));
                }
            }
            record.state = TransportState::Connecting;
            record.transport.clone()
        };

        let result = transport.connect(dtls_parameters).await;

        {
            let mut room = room_arc.write().await;
            if let Some(peer) = room.peers.get_mut(peer_id) {
                if let Some(record) = peer.transport_slot_mut(direction).as_mut() {
                    if record.transport.id() == transport.id() {
                        record.state = if result.is_ok() {
                            TransportState::Connected
                        } else {
                            TransportState::New
                        };
                    }
                }
            }
        }

        result?;
        debug!(%room_id, %peer_id, %direction, "transport connected");
        Ok(())
    }

    /// Creates a producer on the peer's connected send transport and
    /// announces it. At most one producer per kind: an existing one is
    /// close-then-replaced with full cascade.
    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> SignalResult<ProducerId> {
        let room_arc = self.get_room(room_id)?;

        let transport = {
            let room = room_arc.read().await;
            let peer = room.peers.get(peer_id).ok_or_else(|| {
                SignalError::NotFound(format!("peer {peer_id} not in room {room_id}"))
            })?;
            let record = peer.transport(Direction::Send).ok_or_else(|| {
                SignalError::NotFound("no send transport; create it first".to_string())
            })?;
            if record.state != TransportState::Connected {
                return Err(SignalError::Validation(
                    "send transport is not connected".to_string(),
                ));
            }
            record.transport.clone()
        };

        let producer = transport.produce(kind, rtp_parameters).await?;

        let mut teardown = None;
        let mut stale = false;
        {
            let mut room = room_arc.write().await;
            if room.peers.contains_key(peer_id) {
                let replaced = room
                    .peers
                    .get_mut(peer_id)
                    .and_then(|peer| peer.producers.remove(&kind));
                if let Some(old) = replaced {
                    teardown = Some(room.cascade_producer_close(peer_id, old));
                }
                if let Some(peer) = room.peers.get_mut(peer_id) {
                    peer.producers
                        .insert(kind, ProducerRecord::new(producer.clone()));
                }
                room.broadcast_except(
                    peer_id,
                    &ServerMessage::NewProducer {
                        peer_id: peer_id.to_string(),
                        producer_id: producer.id(),
                        kind,
                    },
                );
            } else {
                stale = true;
            }
        }

        if stale {
            // Peer left while the engine call was in flight.
            producer.close().await;
            return Err(SignalError::NotFound(format!(
                "peer {peer_id} left room {room_id} during produce"
            )));
        }
        if let Some(teardown) = teardown {
            debug!(%room_id, %peer_id, %kind, "replacing existing producer");
            teardown.close().await;
        }

        self.metrics.inc_producers_created();
        info!(%room_id, %peer_id, %kind, producer_id = %producer.id(), "producer created");
        Ok(producer.id())
    }

    /// Creates a consumer of `producer_id` on the peer's receive transport.
    /// A vanished producer is a benign race and reports not-found; an
    /// incompatible capability set creates nothing.
    pub async fn consume(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> SignalResult<ConsumerInfo> {
        let room_arc = self.get_room(room_id)?;

        let transport = {
            let room = room_arc.read().await;
            let peer = room.peers.get(peer_id).ok_or_else(|| {
                SignalError::NotFound(format!("peer {peer_id} not in room {room_id}"))
            })?;
            if room.find_producer(producer_id).is_none() {
                return Err(SignalError::NotFound(format!(
                    "producer {producer_id} not found"
                )));
            }
            if !room.router.can_consume(producer_id, &rtp_capabilities) {
                return Err(SignalError::IncompatibleMedia(format!(
                    "peer {peer_id} cannot consume producer {producer_id}"
                )));
            }
            let record = peer.transport(Direction::Receive).ok_or_else(|| {
                SignalError::NotFound("no receive transport; create it first".to_string())
            })?;
            record.transport.clone()
        };

        let consumer = transport
            .consume(producer_id, rtp_capabilities)
            .await
            .map_err(|e| match e {
                EngineError::ProducerNotFound(id) => {
                    SignalError::NotFound(format!("producer {id} not found"))
                }
                other => SignalError::from(other),
            })?;

        let mut producer_paused = false;
        let mut stale = false;
        {
            let mut room = room_arc.write().await;
            match room.find_producer(producer_id) {
                Some((_, _, record)) => producer_paused = record.is_paused(),
                None => stale = true,
            }
            if !stale {
                match room.peers.get_mut(peer_id) {
                    Some(peer) => {
                        peer.consumers.insert(consumer.id(), consumer.clone());
                    }
                    None => stale = true,
                }
            }
        }

        if stale {
            // Producer or peer vanished while the engine call was in flight.
            consumer.close().await;
            return Err(SignalError::NotFound(format!(
                "producer {producer_id} closed during consume"
            )));
        }

        self.metrics.inc_consumers_created();
        debug!(%room_id, %peer_id, %producer_id, consumer_id = %consumer.id(), "consumer created");

        Ok(ConsumerInfo {
            consumer_id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused,
        })
    }

    pub async fn pause_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: ProducerId,
    ) -> SignalResult<()> {
        self.set_producer_paused(room_id, peer_id, producer_id, true)
            .await
    }

    pub async fn resume_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: ProducerId,
    ) -> SignalResult<()> {
        self.set_producer_paused(room_id, peer_id, producer_id, false)
            .await
    }

    /// Owner-scoped pause/resume: flips the engine producer, records the new
    /// state, and notifies the other peers.
    async fn set_producer_paused(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: ProducerId,
        paused: bool,
    ) -> SignalResult<()> {
        let room_arc = self.get_room(room_id)?;

        let producer = {
            let room = room_arc.read().await;
            let peer = room.peers.get(peer_id).ok_or_else(|| {
                SignalError::NotFound(format!("peer {peer_id} not in room {room_id}"))
            })?;
            let kind = peer.producer_kind(producer_id).ok_or_else(|| {
                SignalError::NotFound(format!(
                    "producer {producer_id} not owned by peer {peer_id}"
                ))
            })?;
            peer.producers
                .get(&kind)
                .map(|record| record.producer.clone())
                .ok_or_else(|| {
                    SignalError::NotFound(format!("producer {producer_id} not found"))
                })?
        };

        let result = if paused {
            producer.pause().await
        } else {
            producer.resume().await
        };
        result.map_err(|e| match e {
            EngineError::ProducerNotFound(id) => {
                SignalError::NotFound(format!("producer {id} not found"))
            }
            other => SignalError::from(other),
        })?;

        {
            let mut room = room_arc.write().await;
            let mut still_present = false;
            if let Some(peer) = room.peers.get_mut(peer_id) {
                if let Some(kind) = peer.producer_kind(producer_id) {
                    if let Some(record) = peer.producers.get_mut(&kind) {
                        record.state = if paused {
                            peer::ProducerState::Paused
                        } else {
                            peer::ProducerState::Active
                        };
                        still_present = true;
                    }
                }
            }
            if still_present {
                let message = if paused {
                    ServerMessage::ProducerPaused { producer_id }
                } else {
                    ServerMessage::ProducerResumed { producer_id }
                };
                room.broadcast_except(peer_id, &message);
            }
        }

        debug!(%room_id, %peer_id, %producer_id, paused, "producer state changed");
        Ok(())
    }

    /// Owner-scoped close with cascade: every consumer referencing the
    /// producer is closed and its owner notified.
    pub async fn close_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: ProducerId,
    ) -> SignalResult<()> {
        let room_arc = self.get_room(room_id)?;

        let teardown = {
            let mut room = room_arc.write().await;
            let removed = {
                let peer = room.peers.get_mut(peer_id).ok_or_else(|| {
                    SignalError::NotFound(format!("peer {peer_id} not in room {room_id}"))
                })?;
                peer.producer_kind(producer_id)
                    .and_then(|kind| peer.producers.remove(&kind))
            };
            let record = removed.ok_or_else(|| {
                SignalError::NotFound(format!(
                    "producer {producer_id} not owned by peer {peer_id}"
                ))
            })?;
            room.cascade_producer_close(peer_id, record)
        };

        teardown.close().await;
        info!(%room_id, %peer_id, %producer_id, "producer closed");
        Ok(())
    }

    /// Validates, stamps, stores, and fans out a chat message. The sender
    /// receives its own copy and de-duplicates on the id.
    pub async fn post_chat(
        &self,
        room_id: &str,
        peer_id: &str,
        draft: ChatDraft,
    ) -> SignalResult<ChatMessage> {
        if draft.text.is_empty() {
            return Err(SignalError::Validation(
                "chat text must not be empty".to_string(),
            ));
        }
        if draft.text.len() > MAX_CHAT_TEXT_LEN {
            return Err(SignalError::Validation(format!(
                "chat text exceeds {MAX_CHAT_TEXT_LEN} bytes"
            )));
        }
        let room_arc = self.get_room(room_id)?;

        let message = {
            let mut room = room_arc.write().await;
            let peer = room.peers.get(peer_id).ok_or_else(|| {
                SignalError::NotFound(format!("peer {peer_id} not in room {room_id}"))
            })?;
            let sender = match draft.sender {
                Some(s) if !s.is_empty() => s,
                _ => peer.name.clone(),
            };
            let id = match draft.id {
                Some(id) if !id.is_empty() => id,
                _ => uuid::Uuid::new_v4().to_string(),
            };
            let message = ChatMessage {
                id,
                sender,
                text: draft.text,
                timestamp: unix_timestamp_millis(),
            };
            room.chat.append(message.clone());
            room.broadcast_all(&ServerMessage::ChatMessage {
                message: message.clone(),
            });
            message
        };

        self.metrics.inc_chat_messages();
        Ok(message)
    }

    /// Live counts for an existing room; `None` otherwise. Never creates.
    pub async fn stats(&self, room_id: &str) -> Option<RoomStats> {
        let room_arc = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(room_id).cloned()
        }?;
        let room = room_arc.read().await;
        if room.closed {
            return None;
        }
        let mut transports = 0;
        let mut producers = 0;
        let mut consumers = 0;
        for peer in room.peers.values() {
            transports += peer.transport_count();
            producers += peer.producers.len();
            consumers += peer.consumers.len();
        }
        Some(RoomStats {
            peers_count: room.peers.len(),
            transports_count: transports,
            producers_count: producers,
            consumers_count: consumers,
            chat_messages_count: room.chat.len(),
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(room_id)
    }

    pub async fn total_peer_count(&self) -> usize {
        let room_arcs: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut total = 0;
        for room_arc in room_arcs {
            if let Ok(room) = room_arc.try_read() {
                total += room.peers.len();
            }
        }
        total
    }

    /// Drains every room: peers dropped, engine objects closed, routers shut.
    pub async fn shutdown(&self) {
        info!("shutting down all rooms");
        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_arc) in &all_rooms {
            let mut producers: Vec<Arc<dyn MediaProducer>> = Vec::new();
            let mut consumers: Vec<Arc<dyn MediaConsumer>> = Vec::new();
            let mut transports: Vec<Arc<dyn MediaTransport>> = Vec::new();
            let router = {
                let mut room = room_arc.write().await;
                room.closed = true;
                let sessions: Vec<PeerSession> =
                    room.peers.drain().map(|(_, s)| s).collect();
                for mut session in sessions {
                    producers.extend(session.producers.drain().map(|(_, r)| r.producer));
                    consumers.extend(session.consumers.drain().map(|(_, c)| c));
                    if let Some(record) = session.send_transport.take() {
                        transports.push(record.transport.clone());
                    }
                    if let Some(record) = session.recv_transport.take() {
                        transports.push(record.transport.clone());
                    }
                }
                room.router.clone()
            };
            for consumer in consumers {
                consumer.close().await;
            }
            for producer in producers {
                producer.close().await;
            }
            for transport in transports {
                transport.close().await;
            }
            router.close().await;
            info!(%room_id, "room shut down");
        }
        info!(count = all_rooms.len(), "all rooms shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaEngine;
    use crate::engine::stub::StubEngine;
    use crate::engine::types::{
        DtlsFingerprint, DtlsRole, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    };
    use serde_json::Value;

    const ROOM: &str = "ABCD";

    async fn setup() -> RoomManager {
        let engine: Arc<dyn MediaEngine> = Arc::new(StubEngine::new());
        let config = MediaConfig {
            num_workers: 2,
            ..MediaConfig::default()
        };
        let pool = Arc::new(
            WorkerPool::new(engine, &config)
                .await
                .expect("worker pool starts"),
        );
        RoomManager::new(pool, config, ServerMetrics::new())
    }

    fn audio_caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(111),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: Default::default(),
                rtcp_feedback: Vec::new(),
            }],
        }
    }

    fn video_only_caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(96),
                clock_rate: 90_000,
                channels: None,
                parameters: Default::default(),
                rtcp_feedback: Vec::new(),
            }],
        }
    }

    fn audio_params() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48_000,
                channels: Some(2),
                parameters: Default::default(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                rid: None,
                max_bitrate: None,
            }],
        }
    }

    fn test_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB:CC:DD".to_string(),
            }],
        }
    }

    async fn join_peer(
        manager: &RoomManager,
        peer_id: &str,
        name: &str,
    ) -> (JoinSnapshot, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let snapshot = manager.join(ROOM, peer_id, name, tx).await.expect("join");
        (snapshot, rx)
    }

    /// p1 joins, connects a send transport, and produces one audio track.
    async fn producing_peer(manager: &RoomManager) -> (ProducerId, mpsc::Receiver<Arc<String>>) {
        let (_, rx) = join_peer(manager, "p1", "Ann").await;
        manager
            .create_transport(ROOM, "p1", Direction::Send)
            .await
            .expect("send transport");
        manager
            .connect_transport(ROOM, "p1", Direction::Send, test_dtls())
            .await
            .expect("connect");
        let producer_id = manager
            .produce(ROOM, "p1", MediaKind::Audio, audio_params())
            .await
            .expect("produce");
        (producer_id, rx)
    }

    /// p2 joins with a receive transport and consumes `producer_id`.
    async fn consuming_peer(
        manager: &RoomManager,
        producer_id: ProducerId,
    ) -> (ConsumerInfo, mpsc::Receiver<Arc<String>>) {
        let (_, rx) = join_peer(manager, "p2", "Bo").await;
        manager
            .create_transport(ROOM, "p2", Direction::Receive)
            .await
            .expect("recv transport");
        let info = manager
            .consume(ROOM, "p2", producer_id, audio_caps())
            .await
            .expect("consume");
        (info, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            out.push(serde_json::from_str(&raw).expect("broadcast is valid json"));
        }
        out
    }

    #[tokio::test]
    async fn room_lives_exactly_as_long_as_its_peers() {
        let manager = setup().await;
        assert!(!manager.has_room(ROOM));
        let (_, _rx) = join_peer(&manager, "p1", "Ann").await;
        assert!(manager.has_room(ROOM));
        manager.leave(ROOM, "p1").await.expect("leave");
        assert!(!manager.has_room(ROOM));
        assert!(manager.stats(ROOM).await.is_none());
    }

    #[tokio::test]
    async fn capabilities_creates_exactly_one_room() {
        let manager = setup().await;
        let first = manager.capabilities(ROOM).await.expect("capabilities");
        let second = manager.capabilities(ROOM).await.expect("capabilities");
        assert_eq!(manager.room_count(), 1);
        assert!(!first.codecs.is_empty());
        assert_eq!(first.codecs.len(), second.codecs.len());
    }

    #[tokio::test]
    async fn duplicate_join_is_rejected_and_keeps_the_first_session() {
        let manager = setup().await;
        let (_, _rx1) = join_peer(&manager, "p1", "Ann").await;
        let (tx, _rx2) = mpsc::channel(32);
        let err = manager
            .join(ROOM, "p1", "Mallory", tx)
            .await
            .expect_err("duplicate join");
        assert!(matches!(err, SignalError::Conflict(_)));

        let (snapshot, _rx3) = join_peer(&manager, "p2", "Bo").await;
        assert_eq!(snapshot.existing_peers.len(), 1);
        assert_eq!(snapshot.existing_peers[0].name, "Ann");
    }

    #[tokio::test]
    async fn join_rejects_missing_or_oversize_fields() {
        let manager = setup().await;
        let (tx, _rx) = mpsc::channel(4);
        let err = manager
            .join(&"r".repeat(MAX_ROOM_ID_LEN + 1), "p", "n", tx)
            .await
            .expect_err("long room id");
        assert!(matches!(err, SignalError::Validation(_)));

        let (tx, _rx) = mpsc::channel(4);
        let err = manager
            .join(ROOM, "", "n", tx)
            .await
            .expect_err("empty peer id");
        assert!(matches!(err, SignalError::Validation(_)));

        let (tx, _rx) = mpsc::channel(4);
        let err = manager
            .join(ROOM, "p", &"n".repeat(MAX_PEER_NAME_LEN + 1), tx)
            .await
            .expect_err("long name");
        assert!(matches!(err, SignalError::Validation(_)));
    }

    #[tokio::test]
    async fn join_produce_consume_flow() {
        let manager = setup().await;
        let (producer_id, mut rx1) = producing_peer(&manager).await;

        let (snapshot, _rx2) = join_peer(&manager, "p2", "Bo").await;
        assert_eq!(snapshot.existing_peers.len(), 1);
        let p1 = &snapshot.existing_peers[0];
        assert_eq!(p1.id, "p1");
        assert_eq!(p1.producers.len(), 1);
        assert_eq!(p1.producers[0].kind, MediaKind::Audio);
        assert!(!p1.producers[0].paused);

        manager
            .create_transport(ROOM, "p2", Direction::Receive)
            .await
            .expect("recv transport");
        let consumer = manager
            .consume(ROOM, "p2", producer_id, audio_caps())
            .await
            .expect("consume");
        assert_eq!(consumer.kind, MediaKind::Audio);
        assert_eq!(consumer.producer_id, producer_id);
        assert!(!consumer.producer_paused);

        let events = drain(&mut rx1);
        assert!(events.iter().any(|e| e["type"] == "peer-joined"));
    }

    #[tokio::test]
    async fn chat_reaches_every_peer_with_one_stable_id() {
        let manager = setup().await;
        let (_, mut rx1) = join_peer(&manager, "p1", "Ann").await;
        let (_, mut rx2) = join_peer(&manager, "p2", "Bo").await;
        drain(&mut rx1);

        let message = manager
            .post_chat(
                ROOM,
                "p1",
                ChatDraft {
                    id: None,
                    sender: None,
                    text: "hello".to_string(),
                },
            )
            .await
            .expect("chat");
        assert_eq!(message.sender, "Ann");
        assert!(message.timestamp > 0);

        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            let chat = events
                .iter()
                .find(|e| e["type"] == "chat-message")
                .expect("chat broadcast");
            assert_eq!(chat["message"]["id"], message.id);
            assert_eq!(chat["message"]["sender"], "Ann");
            assert_eq!(chat["message"]["text"], "hello");
        }
    }

    #[tokio::test]
    async fn chat_rejects_empty_and_oversize_text() {
        let manager = setup().await;
        let (_, _rx) = join_peer(&manager, "p1", "Ann").await;

        let err = manager
            .post_chat(
                ROOM,
                "p1",
                ChatDraft {
                    id: None,
                    sender: None,
                    text: String::new(),
                },
            )
            .await
            .expect_err("empty text");
        assert!(matches!(err, SignalError::Validation(_)));

        let err = manager
            .post_chat(
                ROOM,
                "p1",
                ChatDraft {
                    id: None,
                    sender: None,
                    text: "x".repeat(MAX_CHAT_TEXT_LEN + 1),
                },
            )
            .await
            .expect_err("oversize text");
        assert!(matches!(err, SignalError::Validation(_)));

        manager
            .post_chat(
                ROOM,
                "p1",
                ChatDraft {
                    id: None,
                    sender: None,
                    text: "x".repeat(MAX_CHAT_TEXT_LEN),
                },
            )
            .await
            .expect("text at the cap");
        let stats = manager.stats(ROOM).await.expect("stats");
        assert_eq!(stats.chat_messages_count, 1);
    }

    #[tokio::test]
    async fn leaving_peer_cascades_to_its_consumers() {
        let manager = setup().await;
        let (producer_id, _rx1) = producing_peer(&manager).await;
        let (_consumer, mut rx2) = consuming_peer(&manager, producer_id).await;
        manager
            .post_chat(
                ROOM,
                "p1",
                ChatDraft {
                    id: None,
                    sender: None,
                    text: "hello".to_string(),
                },
            )
            .await
            .expect("chat");
        drain(&mut rx2);

        manager.leave(ROOM, "p1").await.expect("leave");

        let events = drain(&mut rx2);
        assert!(events.iter().any(|e| {
            e["type"] == "producer-closed" && e["producerId"] == producer_id.to_string()
        }));
        assert!(events
            .iter()
            .any(|e| e["type"] == "peer-left" && e["peerId"] == "p1"));

        let err = manager
            .consume(ROOM, "p2", producer_id, audio_caps())
            .await
            .expect_err("producer gone");
        assert!(matches!(err, SignalError::NotFound(_)));

        let stats = manager.stats(ROOM).await.expect("room still alive");
        assert_eq!(stats.peers_count, 1);
        assert_eq!(stats.consumers_count, 0);

        manager.leave(ROOM, "p2").await.expect("leave");
        assert!(!manager.has_room(ROOM));

        manager.capabilities(ROOM).await.expect("recreate");
        let (snapshot, _rx) = join_peer(&manager, "p9", "Zed").await;
        assert!(snapshot.chat_history.is_empty());
    }

    #[tokio::test]
    async fn incompatible_capabilities_create_no_consumer() {
        let manager = setup().await;
        let (producer_id, _rx1) = producing_peer(&manager).await;
        let (_, _rx2) = join_peer(&manager, "p2", "Bo").await;
        manager
            .create_transport(ROOM, "p2", Direction::Receive)
            .await
            .expect("recv transport");

        let err = manager
            .consume(ROOM, "p2", producer_id, video_only_caps())
            .await
            .expect_err("capability mismatch");
        assert!(matches!(err, SignalError::IncompatibleMedia(_)));

        let stats = manager.stats(ROOM).await.expect("stats");
        assert_eq!(stats.consumers_count, 0);
    }

    #[tokio::test]
    async fn produce_requires_a_connected_send_transport() {
        let manager = setup().await;
        let (_, _rx) = join_peer(&manager, "p1", "Ann").await;

        let err = manager
            .produce(ROOM, "p1", MediaKind::Audio, audio_params())
            .await
            .expect_err("no transport");
        assert!(matches!(err, SignalError::NotFound(_)));

        manager
            .create_transport(ROOM, "p1", Direction::Send)
            .await
            .expect("send transport");
        let err = manager
            .produce(ROOM, "p1", MediaKind::Audio, audio_params())
            .await
            .expect_err("not connected");
        assert!(matches!(err, SignalError::Validation(_)));
    }

    #[tokio::test]
    async fn transport_replacement_never_leaks() {
        let manager = setup().await;
        let (_, _rx1) = join_peer(&manager, "p1", "Ann").await;
        let first = manager
            .create_transport(ROOM, "p1", Direction::Send)
            .await
            .expect("first transport");
        manager
            .connect_transport(ROOM, "p1", Direction::Send, test_dtls())
            .await
            .expect("connect");
        let producer_id = manager
            .produce(ROOM, "p1", MediaKind::Audio, audio_params())
            .await
            .expect("produce");
        let (_, mut rx2) = join_peer(&manager, "p2", "Bo").await;

        let second = manager
            .create_transport(ROOM, "p1", Direction::Send)
            .await
            .expect("replacement transport");
        assert_ne!(first.transport_id, second.transport_id);

        let stats = manager.stats(ROOM).await.expect("stats");
        assert_eq!(stats.transports_count, 1);
        assert_eq!(stats.producers_count, 0);

        let events = drain(&mut rx2);
        assert!(events.iter().any(|e| {
            e["type"] == "producer-closed" && e["producerId"] == producer_id.to_string()
        }));
    }

    #[tokio::test]
    async fn closing_a_producer_notifies_and_closes_consumers() {
        let manager = setup().await;
        let (producer_id, _rx1) = producing_peer(&manager).await;
        let (_consumer, mut rx2) = consuming_peer(&manager, producer_id).await;
        drain(&mut rx2);

        manager
            .close_producer(ROOM, "p1", producer_id)
            .await
            .expect("close producer");

        let events = drain(&mut rx2);
        assert!(events.iter().any(|e| e["type"] == "producer-closed"));

        let stats = manager.stats(ROOM).await.expect("stats");
        assert_eq!(stats.producers_count, 0);
        assert_eq!(stats.consumers_count, 0);

        let err = manager
            .pause_producer(ROOM, "p1", producer_id)
            .await
            .expect_err("producer is gone");
        assert!(matches!(err, SignalError::NotFound(_)));
    }

    #[tokio::test]
    async fn pause_state_travels_through_descriptors_and_broadcasts() {
        let manager = setup().await;
        let (producer_id, _rx1) = producing_peer(&manager).await;
        let (_, mut rx2) = join_peer(&manager, "p2", "Bo").await;

        manager
            .pause_producer(ROOM, "p1", producer_id)
            .await
            .expect("pause");
        let events = drain(&mut rx2);
        assert!(events.iter().any(|e| e["type"] == "producer-paused"));

        let (snapshot, _rx3) = join_peer(&manager, "p3", "Cy").await;
        let p1 = snapshot
            .existing_peers
            .iter()
            .find(|p| p.id == "p1")
            .expect("p1 listed");
        assert!(p1.producers[0].paused);

        manager
            .create_transport(ROOM, "p3", Direction::Receive)
            .await
            .expect("recv transport");
        let consumer = manager
            .consume(ROOM, "p3", producer_id, audio_caps())
            .await
            .expect("consume");
        assert!(consumer.producer_paused);

        manager
            .resume_producer(ROOM, "p1", producer_id)
            .await
            .expect("resume");
        let events = drain(&mut rx2);
        assert!(events.iter().any(|e| e["type"] == "producer-resumed"));
    }

    #[tokio::test]
    async fn transports_require_a_registered_peer() {
        let manager = setup().await;
        let err = manager
            .create_transport(ROOM, "ghost", Direction::Send)
            .await
            .expect_err("peer never joined");
        assert!(matches!(err, SignalError::NotFound(_)));
    }

    #[tokio::test]
    async fn connecting_twice_is_a_conflict() {
        let manager = setup().await;
        let (_, _rx) = join_peer(&manager, "p1", "Ann").await;
        manager
            .create_transport(ROOM, "p1", Direction::Send)
            .await
            .expect("send transport");
        manager
            .connect_transport(ROOM, "p1", Direction::Send, test_dtls())
            .await
            .expect("first connect");
        let err = manager
            .connect_transport(ROOM, "p1", Direction::Send, test_dtls())
            .await
            .expect_err("second connect");
        assert!(matches!(err, SignalError::Conflict(_)));
    }

    #[tokio::test]
    async fn shutdown_drains_every_room() {
        let manager = setup().await;
        let (producer_id, _rx1) = producing_peer(&manager).await;
        let (_consumer, _rx2) = consuming_peer(&manager, producer_id).await;
        assert_eq!(manager.room_count(), 1);

        manager.shutdown().await;
        assert_eq!(manager.room_count(), 0);
        assert!(manager.stats(ROOM).await.is_none());
    }
}
