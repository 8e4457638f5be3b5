//! World instance connection – owns the live transport to one realm.
//!
//! ## State machine
//!
//! ```text
//! disconnected ──change_realm──▶ connecting ──connect ok──▶ connected
//!       ▲                            │
//!       │                            ├── capacity rejection ──▶ realm_full
//!       └────────── disconnect ◀─────┴── timeout / failure ───▶ error
//! ```
//!
//! ## Ownership
//!
//! The connection is the only owner of its transport. Every transport gets
//! a generation number; replacing it bumps the generation, so
//!
//! - a `connect()` still waiting on an old transport resolves to
//!   [`CommsError::Superseded`],
//! - packets the old transport delivered late are dropped unread.
//!
//! Realm changes and disconnects are serialized by one async lifecycle
//! lock. `connect()` never holds it while waiting for establishment.

use futures::future::{join, join_all};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

use crate::error::{CommsError, Result};
use crate::events::{ListenerId, Listeners};
use crate::protocol::{
    self, ChatData, CommsMessage, Frame, Package, ProfileData, ProfileRequestData,
    ProfileResponseData, SceneData, VoiceData,
};
use crate::registry;
use crate::transport::{InboundPacket, PacketSink, Transport, TransportError, TransportFactory};
use crate::types::{ConnectionState, ConnectionStatus, PeerId, Position, Realm};

/// Upper bound for transport establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Milliseconds since the Unix epoch, as stamped on outgoing frames.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type Handler<T> = Arc<dyn Fn(Package<T>) + Send + Sync>;

/// Exactly one handler per kind; registering again replaces it.
#[derive(Default)]
struct Handlers {
    chat: Option<Handler<ChatData>>,
    position: Option<Handler<Position>>,
    profile: Option<Handler<ProfileData>>,
    scene: Option<Handler<SceneData>>,
    voice: Option<Handler<VoiceData>>,
    profile_request: Option<Handler<ProfileRequestData>>,
    profile_response: Option<Handler<ProfileResponseData>>,
}

fn invoke<T>(handler: Option<Handler<T>>, package: Package<T>) -> bool {
    match handler {
        Some(handler) => {
            handler(package);
            true
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Room reconciliation report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSyncReport {
    pub joined: Vec<String>,
    pub left: Vec<String>,
    /// `(room, reason)` for every join or leave that failed.
    pub failed: Vec<(String, String)>,
}

impl RoomSyncReport {
    /// True when nothing had to be joined or left.
    pub fn is_noop(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Slot {
    generation: u64,
    realm: Option<Realm>,
    transport: Option<Arc<dyn Transport>>,
}

pub struct WorldInstanceConnection {
    factory: Arc<dyn TransportFactory>,
    connect_timeout: Duration,
    slot: Mutex<Slot>,
    lifecycle: tokio::sync::Mutex<()>,
    status: Mutex<ConnectionStatus>,
    status_listeners: Listeners<ConnectionStatus>,
    handlers: RwLock<Handlers>,
    desired_topics: Mutex<BTreeSet<String>>,
    /// `(generation, room)` joins currently in flight.
    pending_joins: Mutex<HashSet<(u64, String)>>,
    inbound_tx: mpsc::UnboundedSender<InboundPacket>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundPacket>>,
    closed: watch::Sender<bool>,
    message_seq: AtomicU64,
}

impl WorldInstanceConnection {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_timeout(factory, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(factory: Arc<dyn TransportFactory>, connect_timeout: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            factory,
            connect_timeout,
            slot: Mutex::new(Slot {
                generation: 0,
                realm: None,
                transport: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            status: Mutex::new(ConnectionStatus::default()),
            status_listeners: Listeners::new(),
            handlers: RwLock::new(Handlers::default()),
            desired_topics: Mutex::new(BTreeSet::new()),
            pending_joins: Mutex::new(HashSet::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed,
            message_seq: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().clone()
    }

    pub fn realm(&self) -> Option<Realm> {
        self.slot.lock().realm.clone()
    }

    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    pub fn connected_peers(&self) -> usize {
        self.current_transport()
            .map(|t| t.connected_count())
            .unwrap_or(0)
    }

    pub fn desired_topics(&self) -> BTreeSet<String> {
        self.desired_topics.lock().clone()
    }

    /// Rooms the live transport has actually joined.
    pub fn joined_rooms(&self) -> BTreeSet<String> {
        self.current_transport()
            .map(|t| t.current_rooms())
            .unwrap_or_default()
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.slot.lock().transport.clone()
    }

    // -----------------------------------------------------------------------
    // Status observers
    // -----------------------------------------------------------------------

    pub fn on_status<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.status_listeners.subscribe(callback)
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.status_listeners.unsubscribe(id)
    }

    fn set_status(&self, state: ConnectionState, connected_peers: usize) {
        let next = ConnectionStatus::new(state, connected_peers);
        {
            let mut status = self.status.lock();
            if *status == next {
                return;
            }
            *status = next.clone();
        }
        debug!("comms status → {:?} ({} peers)", state, connected_peers);
        self.status_listeners.notify(&next);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Wait for the current transport to come up.
    pub async fn connect(&self) -> Result<()> {
        let (generation, realm, transport) = {
            let slot = self.slot.lock();
            (slot.generation, slot.realm.clone(), slot.transport.clone())
        };
        let transport =
            transport.ok_or_else(|| CommsError::Connection("no realm selected".into()))?;
        self.connect_generation(generation, realm, transport).await
    }

    /// Wait on `transport`, which was installed as `generation`. Any later
    /// replacement or disconnect turns the outcome into `Superseded`.
    async fn connect_generation(
        &self,
        generation: u64,
        realm: Option<Realm>,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        let realm_name = realm.map(|r| r.server_name).unwrap_or_default();

        if self.generation() != generation {
            return Err(CommsError::Superseded);
        }
        let peers = transport.connected_count();
        if peers > 0 {
            self.set_status(ConnectionState::Connected, peers);
            return Ok(());
        }

        self.set_status(ConnectionState::Connecting, 0);
        let outcome = transport
            .await_connection_established(self.connect_timeout)
            .await;

        if self.generation() != generation {
            debug!("connect to '{}' superseded by a newer transport", realm_name);
            return Err(CommsError::Superseded);
        }

        match outcome {
            Ok(()) => {
                let peers = transport.connected_count();
                info!("Connected to realm '{}' ({} peers)", realm_name, peers);
                self.set_status(ConnectionState::Connected, peers);
                Ok(())
            }
            Err(TransportError::RealmFull) => {
                warn!("Realm '{}' rejected the connection: full", realm_name);
                self.set_status(ConnectionState::RealmFull, 0);
                Err(CommsError::RealmFull(realm_name))
            }
            Err(TransportError::Disposed) => Err(CommsError::Superseded),
            Err(e) => {
                warn!("Connection to realm '{}' failed: {}", realm_name, e);
                self.set_status(ConnectionState::Error, 0);
                Err(CommsError::Connection(e.to_string()))
            }
        }
    }

    /// Tear down the current transport, open one against `realm`, connect
    /// and re-join the desired rooms.
    pub async fn change_realm(&self, realm: Realm) -> Result<()> {
        let (generation, transport) = {
            let _guard = self.lifecycle.lock().await;
            info!("Changing realm to {}", realm);
            self.set_status(ConnectionState::Connecting, 0);

            if let Some(old) = self.take_transport() {
                old.dispose().await;
            }

            let mut slot = self.slot.lock();
            let sink = PacketSink::new(slot.generation, self.inbound_tx.clone());
            match self.factory.open(&realm, sink) {
                Ok(transport) => {
                    slot.transport = Some(transport.clone());
                    slot.realm = Some(realm.clone());
                    (slot.generation, transport)
                }
                Err(e) => {
                    drop(slot);
                    warn!("Failed to open transport: {}", e);
                    self.set_status(ConnectionState::Error, 0);
                    return Err(CommsError::Connection(e.to_string()));
                }
            }
        };

        self.connect_generation(generation, Some(realm), transport).await?;
        if self.generation() != generation {
            return Err(CommsError::Superseded);
        }
        let report = self.sync_rooms().await;
        if !report.joined.is_empty() {
            debug!("Re-joined {} rooms after realm change", report.joined.len());
        }
        Ok(())
    }

    /// Dispose the transport. Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        if let Some(old) = self.take_transport() {
            info!("Disconnecting from realm");
            old.dispose().await;
        }
        self.set_status(ConnectionState::Disconnected, 0);
    }

    /// Disconnect and stop [`run_inbound`](Self::run_inbound).
    pub async fn close(&self) {
        self.disconnect().await;
        self.closed.send_replace(true);
    }

    /// Detach the transport and bump the generation.
    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.realm = None;
        self.pending_joins.lock().clear();
        slot.transport.take()
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    /// Make the joined room set equal to `topics`.
    pub async fn set_topics<I, S>(&self, topics: I) -> RoomSyncReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.desired_topics.lock() = topics.into_iter().map(Into::into).collect();
        self.sync_rooms().await
    }

    async fn sync_rooms(&self) -> RoomSyncReport {
        let (generation, transport) = {
            let slot = self.slot.lock();
            (slot.generation, slot.transport.clone())
        };
        let Some(transport) = transport else {
            return RoomSyncReport::default();
        };

        let desired = self.desired_topics.lock().clone();
        let current = transport.current_rooms();

        let (to_join, to_leave) = {
            let mut pending = self.pending_joins.lock();
            let to_join: Vec<String> = desired
                .difference(&current)
                .filter(|room| !pending.contains(&(generation, (*room).clone())))
                .cloned()
                .collect();
            for room in &to_join {
                pending.insert((generation, room.clone()));
            }
            let to_leave: Vec<String> = current.difference(&desired).cloned().collect();
            (to_join, to_leave)
        };

        if to_join.is_empty() && to_leave.is_empty() {
            return RoomSyncReport::default();
        }

        let joins = to_join.iter().map(|room| {
            let transport = transport.clone();
            async move { (room.clone(), transport.join_room(room).await) }
        });
        let leaves = to_leave.iter().map(|room| {
            let transport = transport.clone();
            async move { (room.clone(), transport.leave_room(room).await) }
        });
        let (join_results, leave_results) = join(join_all(joins), join_all(leaves)).await;

        {
            let mut pending = self.pending_joins.lock();
            for room in &to_join {
                pending.remove(&(generation, room.clone()));
            }
        }

        let mut report = RoomSyncReport::default();
        for (room, result) in join_results {
            match result {
                Ok(()) => report.joined.push(room),
                Err(e) => {
                    warn!("Failed to join room {}: {}", room, e);
                    report.failed.push((room, e.to_string()));
                }
            }
        }
        for (room, result) in leave_results {
            match result {
                Ok(()) => report.left.push(room),
                Err(e) => {
                    warn!("Failed to leave room {}: {}", room, e);
                    report.failed.push((room, e.to_string()));
                }
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Encode `message` and hand it to the transport with its kind's policy.
    pub async fn send(&self, topic: &str, message: &CommsMessage) -> Result<()> {
        let transport = self
            .current_transport()
            .ok_or_else(|| CommsError::Connection("not connected".into()))?;
        let policy = registry::policy_for(message.kind());
        let payload = protocol::encode(now_ms(), message);

        match transport.send_message(topic, payload, policy).await {
            Ok(()) => Ok(()),
            Err(TransportError::RoomNotJoined(room)) => {
                debug!("Dropped {} for room {} (not joined)", message.kind(), room);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn next_message_id(&self) -> String {
        let seq = self.message_seq.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{}", now_ms() as u64, seq)
    }

    /// Returns the generated message id.
    pub async fn send_chat(&self, topic: &str, text: impl Into<String>) -> Result<String> {
        let message_id = self.next_message_id();
        let message = CommsMessage::Chat(ChatData {
            message_id: message_id.clone(),
            text: text.into(),
        });
        self.send(topic, &message).await?;
        Ok(message_id)
    }

    pub async fn send_position(&self, topic: &str, position: Position) -> Result<()> {
        self.send(topic, &CommsMessage::Position(position)).await
    }

    pub async fn send_profile(&self, topic: &str, profile: ProfileData) -> Result<()> {
        self.send(topic, &CommsMessage::Profile(profile)).await
    }

    pub async fn send_scene(
        &self,
        topic: &str,
        scene_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<()> {
        let message = CommsMessage::Scene(SceneData {
            scene_id: scene_id.into(),
            text: text.into(),
        });
        self.send(topic, &message).await
    }

    pub async fn send_voice(&self, topic: &str, voice: VoiceData) -> Result<()> {
        self.send(topic, &CommsMessage::Voice(voice)).await
    }

    pub async fn send_profile_request(
        &self,
        topic: &str,
        request: ProfileRequestData,
    ) -> Result<()> {
        self.send(topic, &CommsMessage::ProfileRequest(request)).await
    }

    pub async fn send_profile_response(
        &self,
        topic: &str,
        response: ProfileResponseData,
    ) -> Result<()> {
        self.send(topic, &CommsMessage::ProfileResponse(response)).await
    }

    // -----------------------------------------------------------------------
    // Handler registration
    // -----------------------------------------------------------------------

    pub fn on_chat<F>(&self, f: F)
    where
        F: Fn(Package<ChatData>) + Send + Sync + 'static,
    {
        self.handlers.write().chat = Some(Arc::new(f));
    }

    pub fn on_position<F>(&self, f: F)
    where
        F: Fn(Package<Position>) + Send + Sync + 'static,
    {
        self.handlers.write().position = Some(Arc::new(f));
    }

    pub fn on_profile<F>(&self, f: F)
    where
        F: Fn(Package<ProfileData>) + Send + Sync + 'static,
    {
        self.handlers.write().profile = Some(Arc::new(f));
    }

    pub fn on_scene<F>(&self, f: F)
    where
        F: Fn(Package<SceneData>) + Send + Sync + 'static,
    {
        self.handlers.write().scene = Some(Arc::new(f));
    }

    pub fn on_voice<F>(&self, f: F)
    where
        F: Fn(Package<VoiceData>) + Send + Sync + 'static,
    {
        self.handlers.write().voice = Some(Arc::new(f));
    }

    pub fn on_profile_request<F>(&self, f: F)
    where
        F: Fn(Package<ProfileRequestData>) + Send + Sync + 'static,
    {
        self.handlers.write().profile_request = Some(Arc::new(f));
    }

    pub fn on_profile_response<F>(&self, f: F)
    where
        F: Fn(Package<ProfileResponseData>) + Send + Sync + 'static,
    {
        self.handlers.write().profile_response = Some(Arc::new(f));
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Decode one inbound packet and invoke the handler for its kind.
    ///
    /// Returns `true` if a handler ran. Bad packets are logged and dropped;
    /// they never affect the connection.
    pub fn handle_packet(&self, packet: InboundPacket) -> bool {
        if packet.generation != self.generation() {
            debug!(
                "Dropping packet from {} delivered by stale transport gen {}",
                packet.sender, packet.generation
            );
            return false;
        }

        match protocol::decode(&packet.payload) {
            Ok(Some(frame)) => self.dispatch(packet.sender, frame),
            Ok(None) => {
                debug!(
                    "Ignoring message of unknown kind from {} in {}",
                    packet.sender, packet.room
                );
                false
            }
            Err(e) => {
                warn!(
                    "Dropping malformed packet from {}: {}",
                    packet.sender,
                    CommsError::from(e)
                );
                false
            }
        }
    }

    fn dispatch(&self, sender: PeerId, frame: Frame) -> bool {
        let Frame { time, message } = frame;
        let kind = message.kind();
        // Clone the handler out so callbacks may re-register handlers.
        match message {
            CommsMessage::Chat(data) => {
                let handler = self.handlers.read().chat.clone();
                invoke(handler, Package::new(sender, time, kind, data))
            }
            CommsMessage::Position(data) => {
                let handler = self.handlers.read().position.clone();
                invoke(handler, Package::new(sender, time, kind, data))
            }
            CommsMessage::Profile(data) => {
                let handler = self.handlers.read().profile.clone();
                invoke(handler, Package::new(sender, time, kind, data))
            }
            CommsMessage::Scene(data) => {
                let handler = self.handlers.read().scene.clone();
                invoke(handler, Package::new(sender, time, kind, data))
            }
            CommsMessage::Voice(data) => {
                let handler = self.handlers.read().voice.clone();
                invoke(handler, Package::new(sender, time, kind, data))
            }
            CommsMessage::ProfileRequest(data) => {
                let handler = self.handlers.read().profile_request.clone();
                invoke(handler, Package::new(sender, time, kind, data))
            }
            CommsMessage::ProfileResponse(data) => {
                let handler = self.handlers.read().profile_response.clone();
                invoke(handler, Package::new(sender, time, kind, data))
            }
        }
    }

    /// Handle every packet already queued, without waiting.
    ///
    /// Returns the number of packets taken off the queue. Returns 0 while
    /// [`run_inbound`](Self::run_inbound) owns the queue.
    pub fn process_pending(&self) -> usize {
        let Ok(mut rx) = self.inbound_rx.try_lock() else {
            return 0;
        };
        let mut count = 0;
        while let Ok(packet) = rx.try_recv() {
            self.handle_packet(packet);
            count += 1;
        }
        count
    }

    /// Pump inbound packets in delivery order until [`close`](Self::close).
    pub async fn run_inbound(&self) {
        let mut rx = self.inbound_rx.lock().await;
        let mut closed = self.closed.subscribe();
        let closed = async move {
            let _ = closed.wait_for(|closed| *closed).await;
        };
        tokio::pin!(closed);
        loop {
            tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        self.handle_packet(packet);
                    }
                    None => break,
                },
                _ = &mut closed => break,
            }
        }
        debug!("Inbound pump stopped");
    }
}
