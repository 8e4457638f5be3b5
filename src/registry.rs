//! Message type registry.
//!
//! The single table describing how the transport treats each message kind.
//! Call sites look policies up here; nothing else hardcodes reliability or
//! expiration.
//!
//! | Kind               | ttl (s) | expiration (ms) | optimistic | discard older than (ms) |
//! |--------------------|---------|-----------------|------------|-------------------------|
//! | `chat`             | 10      | 10 000          | no         | –                       |
//! | `position`         | 1       | 2 000           | yes        | 0                       |
//! | `profile`          | 10      | 60 000          | yes        | 60 000                  |
//! | `scene`            | 10      | 10 000          | no         | –                       |
//! | `voice`            | 5       | 1 000           | yes        | –                       |
//! | `profile_request`  | 10      | 10 000          | no         | –                       |
//! | `profile_response` | 10      | 10 000          | no         | –                       |

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Position,
    Profile,
    Scene,
    Voice,
    ProfileRequest,
    ProfileResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Chat,
        MessageKind::Position,
        MessageKind::Profile,
        MessageKind::Scene,
        MessageKind::Voice,
        MessageKind::ProfileRequest,
        MessageKind::ProfileResponse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Position => "position",
            Self::Profile => "profile",
            Self::Scene => "scene",
            Self::Voice => "voice",
            Self::ProfileRequest => "profile_request",
            Self::ProfileResponse => "profile_response",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Delivery policy for this kind.
    pub fn policy(self) -> &'static KindPolicy {
        policy_for(self)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How the transport should treat one kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindPolicy {
    pub kind: MessageKind,
    /// Relay hops / seconds the message may live in the mesh.
    pub ttl_secs: u32,
    pub expiration_ms: u64,
    /// May be dropped under load instead of being delivered reliably.
    pub optimistic: bool,
    /// Drop inbound messages this much older than the newest one seen from
    /// the same peer for the same kind.
    pub discard_older_than_ms: Option<u64>,
}

impl KindPolicy {
    pub fn is_reliable(&self) -> bool {
        !self.optimistic
    }

    /// Whether a message stamped `time` should be dropped given the newest
    /// accepted time `latest` from the same peer.
    pub fn should_discard(&self, time: f64, latest: Option<f64>) -> bool {
        match (self.discard_older_than_ms, latest) {
            (Some(window), Some(latest)) => time < latest - window as f64,
            _ => false,
        }
    }
}

const fn reliable(kind: MessageKind, ttl_secs: u32, expiration_ms: u64) -> KindPolicy {
    KindPolicy {
        kind,
        ttl_secs,
        expiration_ms,
        optimistic: false,
        discard_older_than_ms: None,
    }
}

const fn optimistic(
    kind: MessageKind,
    ttl_secs: u32,
    expiration_ms: u64,
    discard_older_than_ms: Option<u64>,
) -> KindPolicy {
    KindPolicy {
        kind,
        ttl_secs,
        expiration_ms,
        optimistic: true,
        discard_older_than_ms,
    }
}

static POLICIES: [KindPolicy; 7] = [
    reliable(MessageKind::Chat, 10, 10_000),
    optimistic(MessageKind::Position, 1, 2_000, Some(0)),
    optimistic(MessageKind::Profile, 10, 60_000, Some(60_000)),
    reliable(MessageKind::Scene, 10, 10_000),
    optimistic(MessageKind::Voice, 5, 1_000, None),
    reliable(MessageKind::ProfileRequest, 10, 10_000),
    reliable(MessageKind::ProfileResponse, 10, 10_000),
];

/// Look up the policy for `kind`.
pub fn policy_for(kind: MessageKind) -> &'static KindPolicy {
    // Table order matches `MessageKind::ALL`.
    &POLICIES[kind as usize]
}

/// The whole table, in `MessageKind::ALL` order.
pub fn policies() -> &'static [KindPolicy] {
    &POLICIES
}
