//! Transport boundary.
//!
//! The comms core never speaks WebRTC, WebSockets or relays directly; it
//! drives a [`Transport`] produced by a [`TransportFactory`]. Inbound
//! packets flow back through the [`PacketSink`] the factory received, tagged
//! with the generation of the transport that produced them so packets from
//! a disposed transport can be recognised and dropped.
//!
//! ```text
//! WorldInstanceConnection
//!   ├── TransportFactory::open(realm, sink)  → Arc<dyn Transport>
//!   │        (sink carries the generation number)
//!   └── inbound: mpsc<InboundPacket> ← sink.deliver(sender, room, payload)
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::CommsError;
use crate::registry::KindPolicy;
use crate::types::{PeerId, Realm};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Expected under concurrent join/leave; callers swallow it.
    #[error("message sent to room '{0}' which is not joined")]
    RoomNotJoined(String),

    #[error("realm rejected the connection: capacity reached")]
    RealmFull,

    #[error("connection not established within {0} ms")]
    Timeout(u64),

    #[error("transport disposed")]
    Disposed,

    #[error("transport failure: {0}")]
    Other(String),
}

impl From<TransportError> for CommsError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::RoomNotJoined(room) => CommsError::RoomNotJoined(room),
            TransportError::RealmFull => CommsError::RealmFull("capacity reached".into()),
            TransportError::Timeout(ms) => CommsError::Timeout(ms),
            TransportError::Disposed => CommsError::Superseded,
            TransportError::Other(msg) => CommsError::Connection(msg),
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

// ---------------------------------------------------------------------------
// Inbound packets
// ---------------------------------------------------------------------------

/// A raw packet as delivered by a transport.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Generation of the transport that produced the packet.
    pub generation: u64,
    pub sender: PeerId,
    pub room: String,
    pub payload: Bytes,
}

/// Handed to a transport at open time; forwards packets to the connection.
#[derive(Debug, Clone)]
pub struct PacketSink {
    generation: u64,
    tx: mpsc::UnboundedSender<InboundPacket>,
}

impl PacketSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<InboundPacket>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the owning connection has gone away.
    pub fn deliver(&self, sender: PeerId, room: impl Into<String>, payload: Bytes) -> bool {
        self.tx
            .send(InboundPacket {
                generation: self.generation,
                sender,
                room: room.into(),
                payload,
            })
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    /// Peers currently reachable through this transport.
    fn connected_count(&self) -> usize;

    /// Resolve once at least the relay / first peer link is up.
    async fn await_connection_established(&self, timeout: Duration) -> TransportResult<()>;

    async fn join_room(&self, room: &str) -> TransportResult<()>;

    async fn leave_room(&self, room: &str) -> TransportResult<()>;

    async fn send_message(
        &self,
        room: &str,
        payload: Bytes,
        policy: &KindPolicy,
    ) -> TransportResult<()>;

    fn current_rooms(&self) -> BTreeSet<String>;

    /// Release every resource. Idempotent.
    async fn dispose(&self);
}

/// Builds a fresh transport for a realm.
pub trait TransportFactory: Send + Sync {
    fn open(&self, realm: &Realm, sink: PacketSink) -> TransportResult<Arc<dyn Transport>>;
}
