#![forbid(unsafe_code)]

// Per-connection state: one send and one receive transport slot, at most
// one producer per media kind, and the consumers the peer owns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::engine::types::{ConsumerId, MediaKind, ProducerId};
use crate::engine::{EventSubscription, MediaConsumer, MediaProducer, MediaTransport};
use crate::signaling::protocol::{PeerInfo, ProducerDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Active,
    Paused,
    Closed,
}

/// A transport slot plus its close-observer guard; dropping the record
/// unsubscribes the observer before the handle is closed.
pub struct TransportRecord {
    pub transport: Arc<dyn MediaTransport>,
    pub state: TransportState,
    _close_watch: EventSubscription,
}

impl TransportRecord {
    pub fn new(transport: Arc<dyn MediaTransport>, close_watch: EventSubscription) -> Self {
        Self {
            transport,
            state: TransportState::New,
            _close_watch: close_watch,
        }
    }
}

pub struct ProducerRecord {
    pub producer: Arc<dyn MediaProducer>,
    pub state: ProducerState,
}

impl ProducerRecord {
    pub fn new(producer: Arc<dyn MediaProducer>) -> Self {
        Self {
            producer,
            state: ProducerState::Active,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state == ProducerState::Paused
    }
}

pub struct PeerSession {
    pub id: String,
    pub name: String,
    /// Fan-out channel to the peer's WebSocket send task.
    pub channel: mpsc::Sender<Arc<String>>,
    pub send_transport: Option<TransportRecord>,
    pub recv_transport: Option<TransportRecord>,
    pub producers: HashMap<MediaKind, ProducerRecord>,
    pub consumers: HashMap<ConsumerId, Arc<dyn MediaConsumer>>,
}

impl PeerSession {
    pub fn new(id: String, name: String, channel: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            name,
            channel,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn transport(&self, direction: Direction) -> Option<&TransportRecord> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Receive => self.recv_transport.as_ref(),
        }
    }

    pub fn transport_slot_mut(&mut self, direction: Direction) -> &mut Option<TransportRecord> {
        match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Receive => &mut self.recv_transport,
        }
    }

    pub fn transport_count(&self) -> usize {
        usize::from(self.send_transport.is_some()) + usize::from(self.recv_transport.is_some())
    }

    /// The media kind producing under `producer_id`, if this session owns it.
    pub fn producer_kind(&self, producer_id: ProducerId) -> Option<MediaKind> {
        self.producers
            .iter()
            .find(|(_, record)| record.producer.id() == producer_id)
            .map(|(kind, _)| *kind)
    }

    pub fn info(&self) -> PeerInfo {
        let mut producers: Vec<ProducerDescriptor> = self
            .producers
            .iter()
            .map(|(kind, record)| ProducerDescriptor {
                id: record.producer.id(),
                kind: *kind,
                paused: record.is_paused(),
            })
            .collect();
        producers.sort_by_key(|d| d.id);
        PeerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            producers,
        }
    }
}
