#![forbid(unsafe_code)]

// In-process media engine. Implements the full negotiation surface (codec
// intersection, producer liveness, close/death observers) and forwards no
// media. The binary runs on it in development; the test suite drives every
// manager code path through it. A real engine adapter implements the same
// traits in its own crate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

use super::types::{
    ConsumerId, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportId, TransportOptions, WorkerId, WorkerSettings, is_rtx,
};
use super::{
    EngineError, EngineResult, EventSubscription, MediaConsumer, MediaEngine, MediaProducer,
    MediaRouter, MediaTransport, MediaWorker,
};

/// Keyed observer registrations with drop-to-unsubscribe guards.
struct Observers<F: ?Sized> {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<u64, Box<F>>>,
}

impl<F: ?Sized> Observers<F> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    fn insert(self: &Arc<Self>, handler: Box<F>) -> EventSubscription
    where
        F: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handler);
        let weak = Arc::downgrade(self);
        EventSubscription::new(move || {
            if let Some(observers) = weak.upgrade() {
                observers
                    .handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
            }
        })
    }

    fn drain(&self) -> Vec<Box<F>> {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.drain().map(|(_, h)| h).collect()
    }
}

/// Producers visible to a router, for `can_consume` and consumer creation.
struct ProducerDirectory {
    entries: Mutex<HashMap<ProducerId, Weak<StubProducer>>>,
}

impl ProducerDirectory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, producer: &Arc<StubProducer>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.id, Arc::downgrade(producer));
    }

    fn remove(&self, producer_id: ProducerId) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&producer_id);
    }

    fn live(&self, producer_id: ProducerId) -> Option<Arc<StubProducer>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.closed.load(Ordering::Acquire))
    }
}

#[derive(Default)]
pub struct StubEngine {
    workers: Mutex<Vec<Arc<StubWorker>>>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers created so far, in creation order. Lets tests reach the
    /// concrete handles behind the trait objects (e.g. to kill one).
    pub fn workers(&self) -> Vec<Arc<StubWorker>> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl MediaEngine for StubEngine {
    async fn create_worker(&self, settings: WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        let worker = Arc::new(StubWorker {
            id: WorkerId::new(),
            settings,
            closed: AtomicBool::new(false),
            death_reason: Mutex::new(None),
            dead_observers: Observers::new(),
        });
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker.clone());
        Ok(worker)
    }
}

pub struct StubWorker {
    id: WorkerId,
    settings: WorkerSettings,
    closed: AtomicBool,
    death_reason: Mutex<Option<String>>,
    dead_observers: Arc<Observers<dyn FnOnce(String) + Send>>,
}

impl StubWorker {
    /// Simulates an engine-side worker crash: marks the worker closed and
    /// fires every death observer with `reason`.
    pub fn kill(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.death_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
        for handler in self.dead_observers.drain() {
            handler(reason.to_string());
        }
    }
}

#[async_trait]
impl MediaWorker for StubWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn on_dead(&self, handler: Box<dyn FnOnce(String) + Send>) -> EventSubscription {
        if self.closed.load(Ordering::Acquire) {
            // Late registration on a dead worker fires immediately rather
            // than dropping the event.
            let reason = self
                .death_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_else(|| "worker closed".to_string());
            handler(reason);
            return EventSubscription::detached();
        }
        self.dead_observers.insert(handler)
    }

    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> EngineResult<Arc<dyn MediaRouter>> {
        if self.is_closed() {
            return Err(EngineError::WorkerClosed);
        }
        Ok(Arc::new(StubRouter {
            id: RouterId::new(),
            codecs,
            port_range: self.settings.rtc_port_range.clone(),
            next_port_offset: AtomicU64::new(0),
            directory: ProducerDirectory::new(),
            transports: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct StubRouter {
    id: RouterId,
    codecs: Vec<RtpCodecCapability>,
    port_range: std::ops::RangeInclusive<u16>,
    next_port_offset: AtomicU64,
    directory: Arc<ProducerDirectory>,
    transports: Mutex<Vec<Weak<StubTransport>>>,
    closed: AtomicBool,
}

impl StubRouter {
    fn allocate_port(&self) -> u16 {
        let span = u64::from(*self.port_range.end() - *self.port_range.start()) + 1;
        let offset = self.next_port_offset.fetch_add(1, Ordering::Relaxed) % span;
        *self.port_range.start() + offset as u16
    }
}

#[async_trait]
impl MediaRouter for StubRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.codecs.clone(),
        }
    }

    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        match self.directory.live(producer_id) {
            Some(producer) => capabilities.can_consume(&producer.rtp_parameters),
            None => false,
        }
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Failure("router is closed".to_string()));
        }
        let address = options
            .announced_address
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());
        let transport = Arc::new(StubTransport {
            id: TransportId::new(),
            ice_parameters: IceParameters {
                username_fragment: random_token(8),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 2_130_706_431,
                address,
                protocol: "udp".to_string(),
                port: self.allocate_port(),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint_value(),
                }],
            },
            router_codecs: self.codecs.clone(),
            directory: self.directory.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_observers: Observers::new(),
        });
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&transport));
        Ok(transport)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transports: Vec<_> = self
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for transport in transports {
            transport.close().await;
        }
    }
}

pub struct StubTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    router_codecs: Vec<RtpCodecCapability>,
    directory: Arc<ProducerDirectory>,
    connected: AtomicBool,
    closed: AtomicBool,
    close_observers: Arc<Observers<dyn FnOnce() + Send>>,
}

#[async_trait]
impl MediaTransport for StubTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn on_close(&self, handler: Box<dyn FnOnce() + Send>) -> EventSubscription {
        if self.closed.load(Ordering::Acquire) {
            handler();
            return EventSubscription::detached();
        }
        self.close_observers.insert(handler)
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::TransportClosed);
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Failure(
                "connect already called on transport".to_string(),
            ));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::TransportClosed);
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Failure(
                "produce requires at least one codec".to_string(),
            ));
        }
        let router_caps = RtpCapabilities {
            codecs: self.router_codecs.clone(),
        };
        for codec in &rtp_parameters.codecs {
            if is_rtx(&codec.mime_type) {
                continue;
            }
            if !router_caps.supports(&codec.mime_type, codec.clock_rate) {
                return Err(EngineError::Failure(format!(
                    "codec {} not negotiated by router",
                    codec.mime_type
                )));
            }
        }
        let producer = Arc::new(StubProducer {
            id: ProducerId::new(),
            kind,
            rtp_parameters,
            directory: self.directory.clone(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.directory.insert(&producer);
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: RtpCapabilities,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::TransportClosed);
        }
        let producer = self
            .directory
            .live(producer_id)
            .ok_or(EngineError::ProducerNotFound(producer_id))?;
        if !capabilities.can_consume(&producer.rtp_parameters) {
            return Err(EngineError::Failure(format!(
                "capabilities cannot consume producer {producer_id}"
            )));
        }
        let consumer_type = if producer.rtp_parameters.encodings.len() > 1 {
            ConsumerType::Simulcast
        } else {
            ConsumerType::Simple
        };
        Ok(Arc::new(StubConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            consumer_type,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for handler in self.close_observers.drain() {
            handler();
        }
    }
}

pub struct StubProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    directory: Arc<ProducerDirectory>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for StubProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn pause(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ProducerNotFound(self.id));
        }
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ProducerNotFound(self.id));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.directory.remove(self.id);
    }
}

pub struct StubConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for StubConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn random_token(len: usize) -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    while token.len() < len {
        token.push_str(&Uuid::new_v4().simple().to_string());
    }
    token.truncate(len);
    token
}

fn fingerprint_value() -> String {
    Uuid::new_v4()
        .into_bytes()
        .iter()
        .chain(Uuid::new_v4().into_bytes().iter())
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
