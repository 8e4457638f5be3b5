//! In-process transport.
//!
//! A [`LoopbackHub`] plays the role of the relay mesh: every
//! [`LoopbackTransport`] opened against the same realm hostname can reach
//! every other one that joined the same room. Used by the CLI demo and by
//! the test-suite, with knobs to simulate slow, failing or full realms.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use crate::registry::KindPolicy;
use crate::transport::{
    PacketSink, Transport, TransportError, TransportFactory, TransportResult,
};
use crate::types::{PeerId, Realm};

/// How establishment behaves for a given realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Establish {
    Immediate,
    /// Succeeds after the delay (or times out if the delay is longer).
    Delay(Duration),
    Fail(String),
    RealmFull,
    /// Never resolves; only a timeout or dispose ends the wait.
    Never,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct LoopbackHub {
    transports: Mutex<Vec<Weak<LoopbackTransport>>>,
    /// Simulate load: optimistic messages are silently dropped.
    drop_optimistic: AtomicBool,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_drop_optimistic(&self, drop: bool) {
        self.drop_optimistic.store(drop, Ordering::SeqCst);
    }

    fn register(&self, transport: &Arc<LoopbackTransport>) {
        let mut transports = self.transports.lock();
        transports.retain(|t| t.strong_count() > 0);
        transports.push(Arc::downgrade(transport));
    }

    fn live_peers(&self, hostname: &str) -> Vec<Arc<LoopbackTransport>> {
        self.transports
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.hostname == hostname && !t.is_disposed())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    peer_id: PeerId,
    hostname: String,
    sink: PacketSink,
    establish: Establish,
    established: AtomicBool,
    disposed: AtomicBool,
    disposed_notify: Notify,
    rooms: Mutex<BTreeSet<String>>,
    failing_rooms: HashSet<String>,
    join_calls: AtomicUsize,
    leave_calls: AtomicUsize,
}

impl LoopbackTransport {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn join_calls(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }

    pub fn leave_calls(&self) -> usize {
        self.leave_calls.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> TransportResult<()> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }
        Ok(())
    }

    async fn wait_disposed(&self) {
        loop {
            let notified = self.disposed_notify.notified();
            if self.is_disposed() {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn connected_count(&self) -> usize {
        if !self.established.load(Ordering::SeqCst) || self.is_disposed() {
            return 0;
        }
        self.hub
            .live_peers(&self.hostname)
            .iter()
            .filter(|t| t.peer_id != self.peer_id)
            .count()
    }

    async fn await_connection_established(&self, timeout: Duration) -> TransportResult<()> {
        self.ensure_alive()?;
        let timeout_ms = timeout.as_millis() as u64;

        let outcome = match &self.establish {
            Establish::Immediate => Ok(()),
            Establish::Fail(reason) => Err(TransportError::Other(reason.clone())),
            Establish::RealmFull => Err(TransportError::RealmFull),
            Establish::Delay(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(*delay), if *delay <= timeout => Ok(()),
                    _ = tokio::time::sleep(timeout), if *delay > timeout => {
                        Err(TransportError::Timeout(timeout_ms))
                    }
                    _ = self.wait_disposed() => Err(TransportError::Disposed),
                }
            }
            Establish::Never => {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout(timeout_ms)),
                    _ = self.wait_disposed() => Err(TransportError::Disposed),
                }
            }
        };

        if outcome.is_ok() {
            self.ensure_alive()?;
            self.established.store(true, Ordering::SeqCst);
        }
        outcome
    }

    async fn join_room(&self, room: &str) -> TransportResult<()> {
        self.ensure_alive()?;
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_rooms.contains(room) {
            return Err(TransportError::Other(format!("join {} refused", room)));
        }
        tokio::task::yield_now().await;
        self.rooms.lock().insert(room.to_string());
        Ok(())
    }

    async fn leave_room(&self, room: &str) -> TransportResult<()> {
        self.ensure_alive()?;
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.rooms.lock().remove(room);
        Ok(())
    }

    async fn send_message(
        &self,
        room: &str,
        payload: Bytes,
        policy: &KindPolicy,
    ) -> TransportResult<()> {
        self.ensure_alive()?;
        if !self.rooms.lock().contains(room) {
            return Err(TransportError::RoomNotJoined(room.to_string()));
        }
        if policy.optimistic && self.hub.drop_optimistic.load(Ordering::SeqCst) {
            debug!("loopback: dropping optimistic {} under load", policy.kind);
            return Ok(());
        }

        let targets: Vec<_> = self
            .hub
            .live_peers(&self.hostname)
            .into_iter()
            .filter(|t| t.peer_id != self.peer_id && t.rooms.lock().contains(room))
            .collect();
        for target in targets {
            target
                .sink
                .deliver(self.peer_id.clone(), room, payload.clone());
        }
        Ok(())
    }

    fn current_rooms(&self) -> BTreeSet<String> {
        self.rooms.lock().clone()
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!(
                "loopback: disposing transport gen {} for {}",
                self.generation(),
                self.peer_id
            );
            self.rooms.lock().clear();
            self.disposed_notify.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Opens [`LoopbackTransport`]s for one local peer.
pub struct LoopbackFactory {
    hub: Arc<LoopbackHub>,
    peer_id: PeerId,
    behaviors: Mutex<HashMap<String, Establish>>,
    failing_rooms: Mutex<HashSet<String>>,
    opened: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackFactory {
    pub fn new(hub: Arc<LoopbackHub>, peer_id: impl Into<String>) -> Self {
        Self {
            hub,
            peer_id: PeerId::new(peer_id),
            behaviors: Mutex::new(HashMap::new()),
            failing_rooms: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Establishment behaviour for transports opened against `hostname`.
    pub fn set_behavior(&self, hostname: impl Into<String>, establish: Establish) {
        self.behaviors.lock().insert(hostname.into(), establish);
    }

    /// Joins of `room` fail on transports opened after this call.
    pub fn fail_joins_for(&self, room: impl Into<String>) {
        self.failing_rooms.lock().insert(room.into());
    }

    /// Every transport this factory ever opened, oldest first.
    pub fn opened(&self) -> Vec<Arc<LoopbackTransport>> {
        self.opened.lock().clone()
    }

    pub fn live(&self) -> Vec<Arc<LoopbackTransport>> {
        self.opened
            .lock()
            .iter()
            .filter(|t| !t.is_disposed())
            .cloned()
            .collect()
    }
}

impl TransportFactory for LoopbackFactory {
    fn open(&self, realm: &Realm, sink: PacketSink) -> TransportResult<Arc<dyn Transport>> {
        let establish = self
            .behaviors
            .lock()
            .get(&realm.hostname)
            .cloned()
            .unwrap_or(Establish::Immediate);

        let transport = Arc::new(LoopbackTransport {
            hub: self.hub.clone(),
            peer_id: self.peer_id.clone(),
            hostname: realm.hostname.clone(),
            sink,
            establish,
            established: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            disposed_notify: Notify::new(),
            rooms: Mutex::new(BTreeSet::new()),
            failing_rooms: self.failing_rooms.lock().clone(),
            join_calls: AtomicUsize::new(0),
            leave_calls: AtomicUsize::new(0),
        });

        self.hub.register(&transport);
        self.opened.lock().push(transport.clone());
        debug!(
            "loopback: opened gen {} for {} on {}",
            transport.generation(),
            self.peer_id,
            realm.hostname
        );
        Ok(transport)
    }
}
