//! Error taxonomy for the comms layer.
//!
//! | Variant          | Raised by                    | Handling                              |
//! |------------------|------------------------------|---------------------------------------|
//! | `Network`        | candidate / status fetches   | keep stale candidates, skip refresh   |
//! | `Connection`     | transport establishment      | saga escalates to a fatal UI error    |
//! | `RealmFull`      | capacity rejection           | surfaced distinctly to the UI         |
//! | `RoomNotJoined`  | send to a room just left     | swallowed at the send call site       |
//! | `Decode`         | malformed inbound packet     | logged, packet dropped                |

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = CommsError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("network error: {0}")]
    Network(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("realm is full: {0}")]
    RealmFull(String),

    #[error("room not joined: {0}")]
    RoomNotJoined(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// The operation was overtaken by a realm change or disconnect.
    #[error("superseded by a newer connection")]
    Superseded,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("config error: {0}")]
    Config(String),
}

impl CommsError {
    /// True for failures the saga must surface as a fatal session error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::RealmFull(_))
    }
}

/// Wire decode failures. Never fatal for the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet is empty")]
    Empty,

    #[error("truncated packet: needed {needed} bytes for {field}, {remaining} left")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u64 },
}

impl From<serde_json::Error> for CommsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Cache(e.to_string())
    }
}

impl From<std::io::Error> for CommsError {
    fn from(e: std::io::Error) -> Self {
        Self::Cache(e.to_string())
    }
}

impl From<config::ConfigError> for CommsError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
