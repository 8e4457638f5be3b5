//! Inbound fan-out and outbound helpers on top of a connection.
//!
//! | Kind               | Destination                                         |
//! |--------------------|-----------------------------------------------------|
//! | `position`         | peer tracker → `RendererBridge::peer_position`      |
//! | `chat`             | chat listeners + `RendererBridge::chat_message`     |
//! | `profile`          | peer tracker → `RendererBridge::peer_profile`       |
//! | `scene`            | channel of the sandbox registered for the scene id  |
//! | `voice`            | voice listeners                                     |
//! | `profile_request`  | local [`ProfileProvider`], answered on the island   |
//! | `profile_response` | pending [`CommsFanout::request_profile`] calls      |
//!
//! Stale position and profile updates are dropped according to each kind's
//! `discard_older_than_ms` policy before they reach the renderer.

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::RendererBridge;
use crate::connection::{now_ms, RoomSyncReport, WorldInstanceConnection};
use crate::error::{CommsError, Result};
use crate::events::{ListenerId, Listeners};
use crate::protocol::{
    ChatData, Package, ProfileData, ProfileRequestData, ProfileResponseData, SceneData, VoiceData,
};
use crate::registry::MessageKind;
use crate::topics::{island_topics, position_hash, scene_topic};
use crate::types::{ConnectionState, PeerId, Position};

// ---------------------------------------------------------------------------
// Peer tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub position: Option<Position>,
    pub profile: Option<ProfileData>,
    /// Local clock of the last accepted message.
    pub last_seen_ms: f64,
    latest: HashMap<MessageKind, f64>,
}

impl PeerInfo {
    fn new(id: PeerId, now: f64) -> Self {
        Self {
            id,
            position: None,
            profile: None,
            last_seen_ms: now,
            latest: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct PeerTracker {
    peers: Mutex<HashMap<PeerId, PeerInfo>>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message stamped `time` (sender clock) received at `now`.
    ///
    /// Returns `false` if the kind's discard policy rejects it as stale.
    pub fn accept(&self, sender: &PeerId, kind: MessageKind, time: f64, now: f64) -> bool {
        let mut peers = self.peers.lock();
        let peer = peers
            .entry(sender.clone())
            .or_insert_with(|| PeerInfo::new(sender.clone(), now));

        let latest = peer.latest.get(&kind).copied();
        if kind.policy().should_discard(time, latest) {
            debug!("Discarding stale {} from {}", kind, sender);
            return false;
        }
        peer.latest
            .insert(kind, latest.map_or(time, |latest| latest.max(time)));
        peer.last_seen_ms = peer.last_seen_ms.max(now);
        true
    }

    pub fn set_position(&self, peer: &PeerId, position: Position) {
        if let Some(info) = self.peers.lock().get_mut(peer) {
            info.position = Some(position);
        }
    }

    pub fn set_profile(&self, peer: &PeerId, profile: ProfileData) {
        if let Some(info) = self.peers.lock().get_mut(peer) {
            info.profile = Some(profile);
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers.lock().get(peer).cloned()
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove peers silent for longer than `timeout` as of `now`.
    pub fn expire(&self, now: f64, timeout: Duration) -> Vec<PeerId> {
        let limit = timeout.as_secs_f64() * 1000.0;
        let mut expired = Vec::new();
        self.peers.lock().retain(|id, info| {
            let keep = now - info.last_seen_ms <= limit;
            if !keep {
                expired.push(id.clone());
            }
            keep
        });
        expired.sort();
        expired
    }

    #[cfg(test)]
    fn backdate(&self, peer: &PeerId, by_ms: f64) {
        if let Some(info) = self.peers.lock().get_mut(peer) {
            info.last_seen_ms -= by_ms;
        }
    }

    pub fn remove_all(&self) -> Vec<PeerId> {
        let mut removed: Vec<PeerId> = self.peers.lock().drain().map(|(id, _)| id).collect();
        removed.sort();
        removed
    }
}

// ---------------------------------------------------------------------------
// Scene router
// ---------------------------------------------------------------------------

/// Scene id → sandbox channel.
#[derive(Default)]
pub struct SceneRouter {
    scenes: Mutex<HashMap<String, mpsc::UnboundedSender<Package<SceneData>>>>,
}

impl SceneRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous registration for `scene_id`.
    pub fn register(
        &self,
        scene_id: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<Package<SceneData>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scenes.lock().insert(scene_id.into(), tx);
        rx
    }

    pub fn unregister(&self, scene_id: &str) -> bool {
        self.scenes.lock().remove(scene_id).is_some()
    }

    pub fn scene_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scenes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns `false` when no live sandbox is registered for the scene.
    pub fn route(&self, package: Package<SceneData>) -> bool {
        let mut scenes = self.scenes.lock();
        let scene_id = package.data.scene_id.clone();
        let Some(tx) = scenes.get(&scene_id) else {
            debug!("No sandbox for scene {}, dropping message", scene_id);
            return false;
        };
        if tx.send(package).is_err() {
            debug!("Sandbox for scene {} is gone, unregistering", scene_id);
            scenes.remove(&scene_id);
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// Answers profile requests addressed to the local user.
pub trait ProfileProvider: Send + Sync {
    fn respond(&self, request: &ProfileRequestData) -> Option<ProfileResponseData>;
}

/// Always answers requests for one user id with the same response.
pub struct StaticProfileProvider {
    user_id: String,
    response: ProfileResponseData,
}

impl StaticProfileProvider {
    pub fn new(user_id: impl Into<String>, response: ProfileResponseData) -> Self {
        Self {
            user_id: user_id.into(),
            response,
        }
    }
}

impl ProfileProvider for StaticProfileProvider {
    fn respond(&self, request: &ProfileRequestData) -> Option<ProfileResponseData> {
        (request.user_id == self.user_id).then(|| self.response.clone())
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

pub struct CommsFanout {
    connection: Arc<WorldInstanceConnection>,
    renderer: Arc<dyn RendererBridge>,
    island_radius: u32,
    peers: PeerTracker,
    scenes: SceneRouter,
    chat_listeners: Listeners<Package<ChatData>>,
    voice_listeners: Listeners<Package<VoiceData>>,
    profile_provider: RwLock<Option<Arc<dyn ProfileProvider>>>,
    pending_profiles: Mutex<HashMap<PeerId, Vec<oneshot::Sender<ProfileResponseData>>>>,
    current_island: Mutex<Option<String>>,
    last_position: Mutex<Option<Position>>,
}

impl CommsFanout {
    /// Build the fan-out and install it as the connection's handler for
    /// every message kind.
    pub fn attach(
        connection: Arc<WorldInstanceConnection>,
        renderer: Arc<dyn RendererBridge>,
        island_radius: u32,
    ) -> Arc<Self> {
        let fanout = Arc::new(Self {
            connection: connection.clone(),
            renderer,
            island_radius,
            peers: PeerTracker::new(),
            scenes: SceneRouter::new(),
            chat_listeners: Listeners::new(),
            voice_listeners: Listeners::new(),
            profile_provider: RwLock::new(None),
            pending_profiles: Mutex::new(HashMap::new()),
            current_island: Mutex::new(None),
            last_position: Mutex::new(None),
        });

        // Weak: the connection must not keep the fan-out alive.
        let weak = Arc::downgrade(&fanout);
        connection.on_position(with_fanout(&weak, Self::handle_position));
        connection.on_chat(with_fanout(&weak, Self::handle_chat));
        connection.on_profile(with_fanout(&weak, Self::handle_profile));
        connection.on_scene(with_fanout(&weak, Self::handle_scene));
        connection.on_voice(with_fanout(&weak, Self::handle_voice));
        connection.on_profile_request(with_fanout(&weak, Self::handle_profile_request));
        connection.on_profile_response(with_fanout(&weak, Self::handle_profile_response));

        let on_status = weak.clone();
        connection.on_status(move |status| {
            if status.state == ConnectionState::Connecting {
                if let Some(fanout) = on_status.upgrade() {
                    fanout.remove_all_peers();
                }
            }
        });

        fanout
    }

    pub fn connection(&self) -> &Arc<WorldInstanceConnection> {
        &self.connection
    }

    pub fn peers(&self) -> &PeerTracker {
        &self.peers
    }

    pub fn scenes(&self) -> &SceneRouter {
        &self.scenes
    }

    pub fn current_island(&self) -> Option<String> {
        self.current_island.lock().clone()
    }

    pub fn on_chat<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Package<ChatData>) + Send + Sync + 'static,
    {
        self.chat_listeners.subscribe(callback)
    }

    pub fn remove_chat_listener(&self, id: ListenerId) -> bool {
        self.chat_listeners.unsubscribe(id)
    }

    pub fn on_voice<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Package<VoiceData>) + Send + Sync + 'static,
    {
        self.voice_listeners.subscribe(callback)
    }

    pub fn remove_voice_listener(&self, id: ListenerId) -> bool {
        self.voice_listeners.unsubscribe(id)
    }

    pub fn set_profile_provider(&self, provider: Option<Arc<dyn ProfileProvider>>) {
        *self.profile_provider.write() = provider;
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn handle_position(&self, package: Package<Position>) {
        if !self
            .peers
            .accept(&package.sender, package.kind, package.time, now_ms())
        {
            return;
        }
        self.peers.set_position(&package.sender, package.data);
        self.renderer.peer_position(&package.sender, &package.data);
    }

    fn handle_chat(&self, package: Package<ChatData>) {
        self.peers.accept(&package.sender, package.kind, package.time, now_ms());
        self.renderer.chat_message(&package.sender, &package.data);
        self.chat_listeners.notify(&package);
    }

    fn handle_profile(&self, package: Package<ProfileData>) {
        if !self
            .peers
            .accept(&package.sender, package.kind, package.time, now_ms())
        {
            return;
        }
        self.peers.set_profile(&package.sender, package.data.clone());
        self.renderer.peer_profile(&package.sender, &package.data);
    }

    fn handle_scene(&self, package: Package<SceneData>) {
        self.scenes.route(package);
    }

    fn handle_voice(&self, package: Package<VoiceData>) {
        self.peers.accept(&package.sender, package.kind, package.time, now_ms());
        self.voice_listeners.notify(&package);
    }

    fn handle_profile_request(&self, package: Package<ProfileRequestData>) {
        let provider = self.profile_provider.read().clone();
        let Some(response) = provider.and_then(|p| p.respond(&package.data)) else {
            return;
        };
        let Some(topic) = self.current_island() else {
            debug!(
                "Profile request from {} before any position was reported",
                package.sender
            );
            return;
        };

        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connection.send_profile_response(&topic, response).await {
                        warn!("Failed to answer profile request: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                "No async runtime to answer profile request from {}",
                package.sender
            ),
        }
    }

    fn handle_profile_response(&self, package: Package<ProfileResponseData>) {
        let waiters = self.pending_profiles.lock().remove(&package.sender);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(package.data.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn island_topic(&self) -> Result<String> {
        self.current_island()
            .ok_or_else(|| CommsError::Connection("no position reported yet".into()))
    }

    /// Broadcast the local position; re-syncs rooms when the island changes.
    pub async fn report_position(&self, position: Position) -> Result<()> {
        let topic = position_hash(&position);
        let changed = {
            let mut current = self.current_island.lock();
            let changed = current.as_deref() != Some(topic.as_str());
            *current = Some(topic.clone());
            changed
        };
        *self.last_position.lock() = Some(position);

        if changed {
            debug!("Entered island {}", topic);
            self.sync_topics().await;
        }
        self.connection.send_position(&topic, position).await
    }

    /// Desired rooms = islands around the last position + registered scenes.
    pub async fn sync_topics(&self) -> RoomSyncReport {
        let position = *self.last_position.lock();
        let mut topics = position
            .map(|p| island_topics(&p, self.island_radius))
            .unwrap_or_default();
        topics.extend(self.scenes.scene_ids().iter().map(|id| scene_topic(id)));
        self.connection.set_topics(topics).await
    }

    /// Register a sandbox for `scene_id` and join its topic.
    pub async fn join_scene(
        &self,
        scene_id: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<Package<SceneData>> {
        let rx = self.scenes.register(scene_id);
        self.sync_topics().await;
        rx
    }

    pub async fn leave_scene(&self, scene_id: &str) {
        if self.scenes.unregister(scene_id) {
            self.sync_topics().await;
        }
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<String> {
        let topic = self.island_topic()?;
        self.connection.send_chat(&topic, text).await
    }

    pub async fn send_scene_message(
        &self,
        scene_id: &str,
        text: impl Into<String>,
    ) -> Result<()> {
        self.connection
            .send_scene(&scene_topic(scene_id), scene_id, text)
            .await
    }

    pub async fn send_voice(&self, voice: VoiceData) -> Result<()> {
        let topic = self.island_topic()?;
        self.connection.send_voice(&topic, voice).await
    }

    pub async fn announce_profile(&self, profile: ProfileData) -> Result<()> {
        let topic = self.island_topic()?;
        self.connection.send_profile(&topic, profile).await
    }

    /// Ask `peer` for its full profile and wait up to `timeout` for it.
    pub async fn request_profile(
        &self,
        peer: &PeerId,
        timeout: Duration,
    ) -> Result<ProfileResponseData> {
        let topic = self.island_topic()?;
        let (tx, rx) = oneshot::channel();
        self.pending_profiles
            .lock()
            .entry(peer.clone())
            .or_default()
            .push(tx);

        // Providers answer by user id; the transport id stands in until the
        // peer has announced a profile.
        let known = self.peers.get(peer).and_then(|info| info.profile);
        let request = ProfileRequestData {
            user_id: known
                .as_ref()
                .map(|profile| profile.user_id.clone())
                .unwrap_or_else(|| peer.as_str().to_string()),
            profile_version: known
                .map(|profile| profile.profile_version)
                .unwrap_or_default(),
        };
        if let Err(e) = self.connection.send_profile_request(&topic, request).await {
            self.drop_closed_requests(peer);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Waiters are dropped when peers are cleared on realm change.
            Ok(Err(_)) => Err(CommsError::Superseded),
            Err(_) => {
                self.drop_closed_requests(peer);
                Err(CommsError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn drop_closed_requests(&self, peer: &PeerId) {
        let mut pending = self.pending_profiles.lock();
        if let Some(waiters) = pending.get_mut(peer) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                pending.remove(peer);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Peer lifecycle
    // -----------------------------------------------------------------------

    /// Drop peers silent for longer than `timeout` and tell the renderer.
    pub fn expire_peers(&self, now: f64, timeout: Duration) -> Vec<PeerId> {
        let expired = self.peers.expire(now, timeout);
        for peer in &expired {
            self.pending_profiles.lock().remove(peer);
            self.renderer.peer_removed(peer);
        }
        expired
    }

    /// Run [`expire_peers`](Self::expire_peers) every half `timeout` until
    /// the fan-out is dropped.
    pub fn spawn_peer_expiry(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = (timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(fanout) = weak.upgrade() else { break };
                let expired = fanout.expire_peers(now_ms(), timeout);
                if !expired.is_empty() {
                    debug!("Expired {} silent peers", expired.len());
                }
            }
        })
    }

    pub fn remove_all_peers(&self) -> Vec<PeerId> {
        let removed = self.peers.remove_all();
        self.pending_profiles.lock().clear();
        for peer in &removed {
            self.renderer.peer_removed(peer);
        }
        if !removed.is_empty() {
            debug!("Removed {} peers", removed.len());
        }
        removed
    }
}

fn with_fanout<T>(
    weak: &Weak<CommsFanout>,
    handler: fn(&CommsFanout, Package<T>),
) -> impl Fn(Package<T>) + Send + Sync + 'static
where
    T: 'static,
{
    let weak = weak.clone();
    move |package| {
        if let Some(fanout) = weak.upgrade() {
            handler(&fanout, package);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeEvent, RecordingBridge};
    use crate::loopback::{LoopbackFactory, LoopbackHub};
    use crate::protocol::{self, CommsMessage, ProfileType};
    use crate::transport::InboundPacket;
    use crate::types::{ProtocolVersion, Realm};
    use bytes::Bytes;

    fn realm(host: &str) -> Realm {
        Realm::new(ProtocolVersion::V2, host, host)
    }

    struct Peer {
        connection: Arc<WorldInstanceConnection>,
        fanout: Arc<CommsFanout>,
        bridge: Arc<RecordingBridge>,
    }

    async fn peer(hub: &Arc<LoopbackHub>, name: &str) -> Peer {
        let factory = Arc::new(LoopbackFactory::new(hub.clone(), name));
        let connection = Arc::new(WorldInstanceConnection::new(factory));
        connection.change_realm(realm("loop")).await.unwrap();
        let bridge = Arc::new(RecordingBridge::new());
        let fanout = CommsFanout::attach(connection.clone(), bridge.clone(), 0);
        Peer {
            connection,
            fanout,
            bridge,
        }
    }

    fn profile(version: &str) -> ProfileData {
        ProfileData {
            user_id: "bob".into(),
            profile_version: version.into(),
            profile_type: ProfileType::Deployed,
        }
    }

    #[test]
    fn tracker_discards_stale_positions_and_profiles() {
        let tracker = PeerTracker::new();
        let bob = PeerId::new("bob");

        assert!(tracker.accept(&bob, MessageKind::Position, 100.0, 0.0));
        assert!(!tracker.accept(&bob, MessageKind::Position, 50.0, 0.0));
        assert!(tracker.accept(&bob, MessageKind::Position, 100.0, 0.0));

        assert!(tracker.accept(&bob, MessageKind::Profile, 100_000.0, 0.0));
        assert!(tracker.accept(&bob, MessageKind::Profile, 50_000.0, 0.0));
        assert!(!tracker.accept(&bob, MessageKind::Profile, 30_000.0, 0.0));

        // No window for chat: always accepted.
        assert!(tracker.accept(&bob, MessageKind::Chat, 1.0, 0.0));
        assert!(tracker.accept(&bob, MessageKind::Chat, 0.0, 0.0));
    }

    #[test]
    fn tracker_expires_silent_peers() {
        let tracker = PeerTracker::new();
        tracker.accept(&PeerId::new("old"), MessageKind::Chat, 0.0, 1_000.0);
        tracker.accept(&PeerId::new("fresh"), MessageKind::Chat, 0.0, 40_000.0);

        let expired = tracker.expire(45_000.0, Duration::from_secs(30));
        assert_eq!(expired, vec![PeerId::new("old")]);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn scene_router_drops_unregistered_and_closed_scenes() {
        let router = SceneRouter::new();
        let package = |scene: &str| {
            Package::new(
                PeerId::new("p"),
                0.0,
                MessageKind::Scene,
                SceneData {
                    scene_id: scene.into(),
                    text: "ping".into(),
                },
            )
        };

        let mut rx = router.register("s1");
        assert!(router.route(package("s1")));
        assert_eq!(rx.recv().await.unwrap().data.text, "ping");

        assert!(!router.route(package("s2")));

        drop(rx);
        assert!(!router.route(package("s1")));
        assert!(router.scene_ids().is_empty());
    }

    #[tokio::test]
    async fn positions_and_chat_reach_the_renderer() {
        let hub = LoopbackHub::new();
        let alice = peer(&hub, "alice").await;
        let bob = peer(&hub, "bob").await;

        let heard = Arc::new(Mutex::new(Vec::new()));
        let h = heard.clone();
        bob.fanout
            .on_chat(move |package| h.lock().push(package.data.text.clone()));

        alice
            .fanout
            .report_position(Position::new(1.0, 0.0, 1.0))
            .await
            .unwrap();
        bob.fanout
            .report_position(Position::new(2.0, 0.0, 2.0))
            .await
            .unwrap();
        assert_eq!(alice.fanout.current_island().as_deref(), Some("37:37"));

        assert_eq!(alice.connection.process_pending(), 1);
        assert_eq!(
            alice.bridge.events(),
            vec![BridgeEvent::Position(
                PeerId::new("bob"),
                Position::new(2.0, 0.0, 2.0)
            )]
        );
        assert!(alice.fanout.peers().get(&PeerId::new("bob")).is_some());

        alice.fanout.send_chat("hello").await.unwrap();
        bob.connection.process_pending();
        assert_eq!(
            bob.bridge.events(),
            vec![BridgeEvent::Chat(PeerId::new("alice"), "hello".into())]
        );
        assert_eq!(*heard.lock(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn scene_messages_reach_the_registered_sandbox() {
        let hub = LoopbackHub::new();
        let alice = peer(&hub, "alice").await;
        let bob = peer(&hub, "bob").await;

        let _alice_scene = alice.fanout.join_scene("plaza").await;
        let mut sandbox = bob.fanout.join_scene("plaza").await;
        assert!(bob.connection.joined_rooms().contains("scene:plaza"));

        alice
            .fanout
            .send_scene_message("plaza", "door opened")
            .await
            .unwrap();
        bob.connection.process_pending();
        let package = sandbox.recv().await.unwrap();
        assert_eq!(package.sender, PeerId::new("alice"));
        assert_eq!(package.data.text, "door opened");

        // Unregistered scene: handled, but routed nowhere.
        let payload: Bytes = protocol::encode(
            now_ms(),
            &CommsMessage::Scene(SceneData {
                scene_id: "elsewhere".into(),
                text: "lost".into(),
            }),
        );
        bob.connection.handle_packet(InboundPacket {
            generation: bob.connection.generation(),
            sender: PeerId::new("alice"),
            room: "scene:elsewhere".into(),
            payload,
        });
        assert!(sandbox.try_recv().is_err());

        bob.fanout.leave_scene("plaza").await;
        assert!(!bob.connection.joined_rooms().contains("scene:plaza"));
    }

    #[tokio::test]
    async fn profile_request_round_trip() {
        let hub = LoopbackHub::new();
        let alice = peer(&hub, "alice").await;
        let bob = peer(&hub, "bob").await;
        bob.fanout
            .set_profile_provider(Some(Arc::new(StaticProfileProvider::new(
                "bob",
                ProfileResponseData {
                    serialized_profile: "{\"name\":\"bob\"}".into(),
                    has_connected_web3: true,
                },
            ))));

        let here = Position::new(1.0, 0.0, 1.0);
        alice.fanout.report_position(here).await.unwrap();
        bob.fanout.report_position(here).await.unwrap();

        let pumps = [alice.connection.clone(), bob.connection.clone()].map(|c| {
            tokio::spawn(async move { c.run_inbound().await })
        });

        let response = alice
            .fanout
            .request_profile(&PeerId::new("bob"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.has_connected_web3);

        let err = alice
            .fanout
            .request_profile(&PeerId::new("carol"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::Timeout(50)));
        assert!(alice.fanout.pending_profiles.lock().is_empty());

        alice.connection.close().await;
        bob.connection.close().await;
        for pump in pumps {
            pump.await.unwrap();
        }
    }

    #[tokio::test]
    async fn profile_request_uses_the_announced_user_id() {
        let hub = LoopbackHub::new();
        let alice = peer(&hub, "alice").await;
        let bob = peer(&hub, "peer-b").await;
        bob.fanout
            .set_profile_provider(Some(Arc::new(StaticProfileProvider::new(
                "0xbob",
                ProfileResponseData {
                    serialized_profile: "{}".into(),
                    has_connected_web3: false,
                },
            ))));

        let here = Position::new(1.0, 0.0, 1.0);
        alice.fanout.report_position(here).await.unwrap();
        bob.fanout.report_position(here).await.unwrap();
        bob.fanout
            .announce_profile(ProfileData {
                user_id: "0xbob".into(),
                profile_version: "3".into(),
                profile_type: ProfileType::Deployed,
            })
            .await
            .unwrap();
        alice.connection.process_pending();
        let known = alice.fanout.peers().get(&PeerId::new("peer-b")).unwrap();
        assert_eq!(known.profile.unwrap().user_id, "0xbob");

        let pumps = [alice.connection.clone(), bob.connection.clone()].map(|c| {
            tokio::spawn(async move { c.run_inbound().await })
        });

        let response = alice
            .fanout
            .request_profile(&PeerId::new("peer-b"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.serialized_profile, "{}");

        alice.connection.close().await;
        bob.connection.close().await;
        for pump in pumps {
            pump.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_task_removes_silent_peers_and_stops_with_the_fanout() {
        let hub = LoopbackHub::new();
        let alice = peer(&hub, "alice").await;
        alice.connection.handle_packet(InboundPacket {
            generation: alice.connection.generation(),
            sender: PeerId::new("bob"),
            room: "37:37".into(),
            payload: protocol::encode(now_ms(), &CommsMessage::Position(Position::default())),
        });
        assert_eq!(alice.fanout.peers().len(), 1);

        let task = alice.fanout.spawn_peer_expiry(Duration::from_millis(100));
        // The tracker runs on wall-clock time, so age the peer by hand.
        alice.fanout.peers().backdate(&PeerId::new("bob"), 1_000.0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(alice.fanout.peers().is_empty());
        assert!(alice
            .bridge
            .events()
            .contains(&BridgeEvent::Removed(PeerId::new("bob"))));

        drop(alice);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn stale_profile_is_not_forwarded() {
        let hub = LoopbackHub::new();
        let alice = peer(&hub, "alice").await;
        let bob = PeerId::new("bob");

        let deliver = |time: f64, version: &str| {
            alice.connection.handle_packet(InboundPacket {
                generation: alice.connection.generation(),
                sender: bob.clone(),
                room: "37:37".into(),
                payload: protocol::encode(time, &CommsMessage::Profile(profile(version))),
            });
        };
        deliver(200_000.0, "2");
        deliver(100_000.0, "1");

        assert_eq!(
            alice.bridge.events(),
            vec![BridgeEvent::Profile(bob.clone(), profile("2"))]
        );
        assert_eq!(
            alice.fanout.peers().get(&bob).unwrap().profile,
            Some(profile("2"))
        );
    }

    #[tokio::test]
    async fn expiry_and_realm_change_remove_peers() {
        let hub = LoopbackHub::new();
        let alice = peer(&hub, "alice").await;
        let bob = peer(&hub, "bob").await;
        let here = Position::new(1.0, 0.0, 1.0);
        alice.fanout.report_position(here).await.unwrap();
        bob.fanout.report_position(here).await.unwrap();
        alice.connection.process_pending();
        alice.bridge.take();

        assert!(alice
            .fanout
            .expire_peers(now_ms(), Duration::from_secs(30))
            .is_empty());
        let expired = alice
            .fanout
            .expire_peers(now_ms() + 60_000.0, Duration::from_secs(30));
        assert_eq!(expired, vec![PeerId::new("bob")]);
        assert_eq!(
            alice.bridge.take(),
            vec![BridgeEvent::Removed(PeerId::new("bob"))]
        );

        bob.fanout.report_position(here).await.unwrap();
        alice.connection.process_pending();
        alice.bridge.take();
        alice.connection.change_realm(realm("elsewhere")).await.unwrap();
        assert!(alice.fanout.peers().is_empty());
        assert_eq!(
            alice.bridge.take(),
            vec![BridgeEvent::Removed(PeerId::new("bob"))]
        );
    }
}
