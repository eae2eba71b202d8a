#![forbid(unsafe_code)]

// Capability interface onto the external real-time media engine.
//
// The manager owns rooms, peers, and signaling; the engine owns packets.
// Everything the manager needs from the engine goes through these traits:
// workers host routers, routers scope one room's routing domain, transports
// carry producers and consumers. State-change callbacks (transport close,
// worker death) are observer registrations that return a guard; dropping
// the guard unsubscribes.

pub mod stub;
pub mod types;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use types::{
    ConsumerId, ConsumerType, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RouterId, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportId, TransportOptions,
    WorkerId, WorkerSettings,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("producer {0} not found in routing domain")]
    ProducerNotFound(ProducerId),
    #[error("transport is closed")]
    TransportClosed,
    #[error("worker is closed")]
    WorkerClosed,
    #[error("{0}")]
    Failure(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Guard for an observer registration. Dropping it unsubscribes, so holders
/// keep it alongside the state the callback would mutate.
pub struct EventSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl EventSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A registration that needs no cleanup.
    pub fn detached() -> Self {
        Self { cancel: None }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>>;
}

#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    fn is_closed(&self) -> bool;

    /// Registers a death observer. Fired at most once, with the engine's
    /// reason string, unless the subscription is dropped first.
    fn on_dead(&self, handler: Box<dyn FnOnce(String) + Send>) -> EventSubscription;

    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> EngineResult<Arc<dyn MediaRouter>>;
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    /// The negotiated codec set a joining peer intersects with its own.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `capabilities` could receive the producer.
    /// False when the producer is gone or no codec matches.
    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>>;

    /// Closes the router and everything it hosts.
    async fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// Registers a close observer. Fired once when the transport closes,
    /// engine-driven or not, unless the subscription is dropped first.
    fn on_close(&self, handler: Box<dyn FnOnce() + Send>) -> EventSubscription;

    /// Finalizes the secure channel with the remote DTLS parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: RtpCapabilities,
    ) -> EngineResult<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn is_paused(&self) -> bool;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn consumer_type(&self) -> ConsumerType;

    async fn close(&self);
}
