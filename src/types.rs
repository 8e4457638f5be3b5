//! Core data model shared across all modules.

use serde::{Deserialize, Serialize};

/// World units per parcel side.
pub const PARCEL_SIZE: f32 = 16.0;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Transport-assigned identifier of a remote peer.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Realms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
        }
    }
}

/// A selectable server cluster. Replaced wholesale on realm change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Realm {
    pub protocol: ProtocolVersion,
    /// Base URL / domain of the cluster.
    pub hostname: String,
    /// Human readable name (what `?realm=` refers to).
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

impl Realm {
    pub fn new(
        protocol: ProtocolVersion,
        hostname: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            hostname: hostname.into(),
            server_name: server_name.into(),
            layer: None,
        }
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    /// Whether `name` identifies this realm, either by server name,
    /// `server-layer` or by hostname.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim();
        if name.eq_ignore_ascii_case(&self.server_name) || name == self.hostname {
            return true;
        }
        match &self.layer {
            Some(layer) => name.eq_ignore_ascii_case(&format!("{}-{}", self.server_name, layer)),
            None => false,
        }
    }
}

impl std::fmt::Display for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.layer {
            Some(layer) => write!(
                f,
                "{}-{} ({} @ {})",
                self.server_name, layer, self.protocol, self.hostname
            ),
            None => write!(f, "{} ({} @ {})", self.server_name, self.protocol, self.hostname),
        }
    }
}

/// Integer world-grid cell.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Default)]
pub struct Parcel {
    pub x: i32,
    pub y: i32,
}

impl Parcel {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Parcel containing a world-space position (`z` is the ground axis).
    pub fn from_world(x: f32, z: f32) -> Self {
        Self::new(
            (x / PARCEL_SIZE).floor() as i32,
            (z / PARCEL_SIZE).floor() as i32,
        )
    }

    /// Chebyshev distance in parcels.
    pub fn distance(&self, other: &Parcel) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }
}

impl std::fmt::Display for Parcel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// A realm plus live telemetry. Refreshes replace the whole list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub realm: Realm,
    pub users_count: u32,
    #[serde(default)]
    pub max_users: Option<u32>,
    /// Catalyst software version, e.g. `"5.1.0"`.
    pub version: String,
    /// Round-trip time of the status request in milliseconds.
    pub elapsed_ms: u64,
    #[serde(default)]
    pub users_parcels: Vec<Parcel>,
}

impl Candidate {
    pub fn is_full(&self) -> bool {
        matches!(self.max_users, Some(max) if self.users_count >= max)
    }

    /// Users within `distance` parcels of `origin`.
    pub fn users_near(&self, origin: &Parcel, distance: u32) -> usize {
        self.users_parcels
            .iter()
            .filter(|p| p.distance(origin) <= distance)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Hot-path avatar transform broadcast at high frequency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Quaternion `(x, y, z, w)`.
    pub rotation: [f32; 4],
    /// Apply without interpolation (teleports, respawns).
    pub immediate: bool,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            rotation: [0.0, 0.0, 0.0, 1.0],
            immediate: false,
        }
    }

    pub fn with_rotation(mut self, rotation: [f32; 4]) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn parcel(&self) -> Parcel {
        Parcel::from_world(self.x, self.z)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    RealmFull,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected_peers: usize,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState, connected_peers: usize) -> Self {
        Self {
            state,
            connected_peers,
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected, 0)
    }
}
