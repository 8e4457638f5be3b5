//! Renderer boundary.
//!
//! The comms layer never touches the scene graph; it reports peer activity
//! through a [`RendererBridge`]. Two stock implementations:
//!
//! | Bridge            | Use                                   |
//! |-------------------|---------------------------------------|
//! | [`LogBridge`]     | headless runs, logs every event       |
//! | [`RecordingBridge`] | tests, keeps every event in order   |

use log::{info, warn};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::events::Listeners;
use crate::protocol::{ChatData, ProfileData};
use crate::types::{PeerId, Position};

/// How long a crash payload request waits for the renderer.
pub const CRASH_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(2);

pub trait RendererBridge: Send + Sync {
    fn peer_position(&self, peer: &PeerId, position: &Position);
    fn chat_message(&self, peer: &PeerId, chat: &ChatData);
    fn peer_profile(&self, peer: &PeerId, profile: &ProfileData);
    fn peer_removed(&self, peer: &PeerId);

    /// Ask the renderer for a crash/debug payload. The answer comes back
    /// through [`CrashPayloadRequests::resolve`].
    fn request_crash_payload(&self) {}
}

// ---------------------------------------------------------------------------
// Crash payload requests
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CrashPayloadRequests {
    listeners: Listeners<String>,
}

impl CrashPayloadRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn request(&self, bridge: &dyn RendererBridge) -> Option<String> {
        self.request_with_timeout(bridge, CRASH_PAYLOAD_TIMEOUT).await
    }

    /// `None` if the renderer stays silent for `timeout`. The one-shot
    /// listener is removed either way.
    pub async fn request_with_timeout(
        &self,
        bridge: &dyn RendererBridge,
        timeout: Duration,
    ) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.listeners.subscribe(move |payload: &String| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(payload.clone());
            }
        });

        bridge.request_crash_payload();
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.listeners.unsubscribe(id);

        match outcome {
            Ok(Ok(payload)) => Some(payload),
            _ => {
                warn!("Renderer did not provide a crash payload within {:?}", timeout);
                None
            }
        }
    }

    /// Deliver a payload to every waiting request.
    pub fn resolve(&self, payload: impl Into<String>) {
        self.listeners.notify(&payload.into());
    }

    pub fn pending(&self) -> usize {
        self.listeners.len()
    }
}

// ---------------------------------------------------------------------------
// Stock bridges
// ---------------------------------------------------------------------------

pub struct LogBridge;

impl RendererBridge for LogBridge {
    fn peer_position(&self, peer: &PeerId, position: &Position) {
        info!("[{}] moved to {}", peer, position);
    }

    fn chat_message(&self, peer: &PeerId, chat: &ChatData) {
        info!("[{}] says: {}", peer, chat.text);
    }

    fn peer_profile(&self, peer: &PeerId, profile: &ProfileData) {
        info!(
            "[{}] profile {} v{}",
            peer, profile.user_id, profile.profile_version
        );
    }

    fn peer_removed(&self, peer: &PeerId) {
        info!("[{}] left", peer);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Position(PeerId, Position),
    Chat(PeerId, String),
    Profile(PeerId, ProfileData),
    Removed(PeerId),
    CrashPayloadRequested,
}

#[derive(Default)]
pub struct RecordingBridge {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<BridgeEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl RendererBridge for RecordingBridge {
    fn peer_position(&self, peer: &PeerId, position: &Position) {
        self.events
            .lock()
            .push(BridgeEvent::Position(peer.clone(), *position));
    }

    fn chat_message(&self, peer: &PeerId, chat: &ChatData) {
        self.events
            .lock()
            .push(BridgeEvent::Chat(peer.clone(), chat.text.clone()));
    }

    fn peer_profile(&self, peer: &PeerId, profile: &ProfileData) {
        self.events
            .lock()
            .push(BridgeEvent::Profile(peer.clone(), profile.clone()));
    }

    fn peer_removed(&self, peer: &PeerId) {
        self.events.lock().push(BridgeEvent::Removed(peer.clone()));
    }

    fn request_crash_payload(&self) {
        self.events.lock().push(BridgeEvent::CrashPayloadRequested);
    }
}
