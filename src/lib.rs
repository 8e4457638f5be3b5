//! Realm Comms
//!
//! Realm selection, peer-mesh connection lifecycle and typed message routing
//! for a multiplayer virtual-world client.
//!
//! ## Architecture
//!
//! ```text
//! RealmSaga  (saga.rs)            ← session lifecycle, realm priority
//!   ├── CandidateSource  (candidates.rs)  ← discovery + version filter
//!   ├── SelectionAlgorithm  (selection.rs)
//!   ├── RealmCache  (cache.rs)
//!   └── WorldInstanceConnection  (connection.rs)  ← owns the transport
//!         ├── Transport / TransportFactory  (transport.rs, loopback.rs)
//!         ├── wire codec  (protocol.rs) + kind policies (registry.rs)
//!         └── CommsFanout  (fanout.rs)  ← peers, scenes, chat, voice
//!               └── RendererBridge  (bridge.rs)
//! ```
//!
//! Rooms are derived from the local position by `topics.rs`. The library
//! logs through `log`; the `realm-comms` binary installs a subscriber.

pub mod bridge;
pub mod cache;
pub mod candidates;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fanout;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod saga;
pub mod selection;
pub mod topics;
pub mod transport;
pub mod types;

// Convenience re-exports
pub use bridge::{CrashPayloadRequests, RendererBridge};
pub use cache::{JsonFileCache, MemoryCache, RealmCache};
#[cfg(feature = "http")]
pub use candidates::{HttpCandidateSource, HttpRealmPinger};
pub use candidates::{filter_by_min_version, CandidateSource, StaticCandidateSource};
pub use config::CommsConfig;
pub use connection::{RoomSyncReport, WorldInstanceConnection};
pub use error::{CommsError, DecodeError, Result};
pub use fanout::{CommsFanout, ProfileProvider};
pub use protocol::{CommsMessage, Package};
pub use registry::{KindPolicy, MessageKind};
pub use saga::{CommsPhase, Gates, RealmSaga, SessionRequest};
pub use selection::{RealmPinger, SelectionAlgorithm, StrategyConfig};
pub use topics::position_hash;
pub use transport::{Transport, TransportError, TransportFactory};
pub use types::{
    Candidate, ConnectionState, ConnectionStatus, Parcel, PeerId, Position, ProtocolVersion, Realm,
};
