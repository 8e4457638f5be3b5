//! Peer wire protocol.
//!
//! Every message that crosses the transport is a tagged binary frame:
//!
//! ```text
//! [tag: u8][time: f64 LE][kind-specific payload …]
//! ```
//!
//! | Tag | Kind               | Payload                                              |
//! |-----|--------------------|------------------------------------------------------|
//! | 0   | unknown            | –                                                    |
//! | 1   | chat               | message_id: str, text: str                           |
//! | 2   | position           | x y z: f32, rotation: 4 × f32, immediate: u8         |
//! | 3   | profile            | user_id: str, profile_version: str, profile_type: u8 |
//! | 4   | scene              | scene_id: str, text: str                             |
//! | 5   | voice              | index: u32, encoded_samples: blob                    |
//! | 6   | profile_request    | user_id: str, profile_version: str                   |
//! | 7   | profile_response   | serialized_profile: str, has_connected_web3: u8      |
//!
//! Strings and blobs are `u32 LE` length-prefixed. All numbers are
//! little-endian.
//!
//! ## Compatibility rules
//!
//! 1. Tags are never reused within a protocol major version.
//! 2. Unknown tags decode to `None` (a no-op), never to an error.
//! 3. Trailing bytes after a known payload are ignored so later versions may
//!    append fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::registry::MessageKind;
use crate::types::{PeerId, Position};

/// Numeric discriminants on the wire.
pub mod tags {
    pub const UNKNOWN: u8 = 0;
    pub const CHAT: u8 = 1;
    pub const POSITION: u8 = 2;
    pub const PROFILE: u8 = 3;
    pub const SCENE: u8 = 4;
    pub const VOICE: u8 = 5;
    pub const PROFILE_REQUEST: u8 = 6;
    pub const PROFILE_RESPONSE: u8 = 7;
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatData {
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    Local,
    Deployed,
}

impl ProfileType {
    fn to_wire(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Deployed => 1,
        }
    }

    fn from_wire(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(Self::Local),
            1 => Ok(Self::Deployed),
            other => Err(DecodeError::InvalidValue {
                field: "profile_type",
                value: other as u64,
            }),
        }
    }
}

/// "My profile is at version N" announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileData {
    pub user_id: String,
    pub profile_version: String,
    pub profile_type: ProfileType,
}

/// Scene-script message; `scene_id` selects the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneData {
    pub scene_id: String,
    pub text: String,
}

/// One encoded voice frame. The codec is external.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceData {
    pub index: u32,
    pub encoded_samples: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRequestData {
    pub user_id: String,
    pub profile_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileResponseData {
    /// Opaque serialized profile owned by the profile service.
    pub serialized_profile: String,
    pub has_connected_web3: bool,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Closed set of peer messages.
#[derive(Debug, Clone, PartialEq)]
pub enum CommsMessage {
    Chat(ChatData),
    Position(Position),
    Profile(ProfileData),
    Scene(SceneData),
    Voice(VoiceData),
    ProfileRequest(ProfileRequestData),
    ProfileResponse(ProfileResponseData),
}

impl CommsMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Chat(_) => MessageKind::Chat,
            Self::Position(_) => MessageKind::Position,
            Self::Profile(_) => MessageKind::Profile,
            Self::Scene(_) => MessageKind::Scene,
            Self::Voice(_) => MessageKind::Voice,
            Self::ProfileRequest(_) => MessageKind::ProfileRequest,
            Self::ProfileResponse(_) => MessageKind::ProfileResponse,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Chat(_) => tags::CHAT,
            Self::Position(_) => tags::POSITION,
            Self::Profile(_) => tags::PROFILE,
            Self::Scene(_) => tags::SCENE,
            Self::Voice(_) => tags::VOICE,
            Self::ProfileRequest(_) => tags::PROFILE_REQUEST,
            Self::ProfileResponse(_) => tags::PROFILE_RESPONSE,
        }
    }
}

/// A decoded frame before the sender is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Sender clock, milliseconds since the Unix epoch.
    pub time: f64,
    pub message: CommsMessage,
}

/// Uniform envelope handed to every inbound handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Package<T> {
    pub sender: PeerId,
    pub time: f64,
    pub kind: MessageKind,
    pub data: T,
}

impl<T> Package<T> {
    pub fn new(sender: PeerId, time: f64, kind: MessageKind, data: T) -> Self {
        Self {
            sender,
            time,
            kind,
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Serialize `message` stamped with `time`.
pub fn encode(time: f64, message: &CommsMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(message.tag());
    buf.put_f64_le(time);

    match message {
        CommsMessage::Chat(chat) => {
            put_str(&mut buf, &chat.message_id);
            put_str(&mut buf, &chat.text);
        }
        CommsMessage::Position(p) => {
            buf.put_f32_le(p.x);
            buf.put_f32_le(p.y);
            buf.put_f32_le(p.z);
            for r in p.rotation {
                buf.put_f32_le(r);
            }
            buf.put_u8(p.immediate as u8);
        }
        CommsMessage::Profile(profile) => {
            put_str(&mut buf, &profile.user_id);
            put_str(&mut buf, &profile.profile_version);
            buf.put_u8(profile.profile_type.to_wire());
        }
        CommsMessage::Scene(scene) => {
            put_str(&mut buf, &scene.scene_id);
            put_str(&mut buf, &scene.text);
        }
        CommsMessage::Voice(voice) => {
            buf.put_u32_le(voice.index);
            put_blob(&mut buf, &voice.encoded_samples);
        }
        CommsMessage::ProfileRequest(req) => {
            put_str(&mut buf, &req.user_id);
            put_str(&mut buf, &req.profile_version);
        }
        CommsMessage::ProfileResponse(resp) => {
            put_str(&mut buf, &resp.serialized_profile);
            buf.put_u8(resp.has_connected_web3 as u8);
        }
    }

    buf.freeze()
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one frame.
///
/// Returns `Ok(None)` for tags this build does not know (including
/// `UNKNOWN`), so newer peers never break older ones.
pub fn decode(data: &[u8]) -> Result<Option<Frame>, DecodeError> {
    let mut r = Reader { buf: data };
    if r.buf.is_empty() {
        return Err(DecodeError::Empty);
    }

    let tag = r.u8("tag")?;
    if !(tags::CHAT..=tags::PROFILE_RESPONSE).contains(&tag) {
        return Ok(None);
    }

    let time = r.f64("time")?;

    let message = match tag {
        tags::CHAT => CommsMessage::Chat(ChatData {
            message_id: r.string("chat.message_id")?,
            text: r.string("chat.text")?,
        }),
        tags::POSITION => {
            let x = r.f32("position.x")?;
            let y = r.f32("position.y")?;
            let z = r.f32("position.z")?;
            let mut rotation = [0.0f32; 4];
            for slot in rotation.iter_mut() {
                *slot = r.f32("position.rotation")?;
            }
            let immediate = r.bool("position.immediate")?;
            CommsMessage::Position(Position {
                x,
                y,
                z,
                rotation,
                immediate,
            })
        }
        tags::PROFILE => CommsMessage::Profile(ProfileData {
            user_id: r.string("profile.user_id")?,
            profile_version: r.string("profile.profile_version")?,
            profile_type: ProfileType::from_wire(r.u8("profile.profile_type")?)?,
        }),
        tags::SCENE => CommsMessage::Scene(SceneData {
            scene_id: r.string("scene.scene_id")?,
            text: r.string("scene.text")?,
        }),
        tags::VOICE => CommsMessage::Voice(VoiceData {
            index: r.u32("voice.index")?,
            encoded_samples: r.blob("voice.encoded_samples")?,
        }),
        tags::PROFILE_REQUEST => CommsMessage::ProfileRequest(ProfileRequestData {
            user_id: r.string("profile_request.user_id")?,
            profile_version: r.string("profile_request.profile_version")?,
        }),
        tags::PROFILE_RESPONSE => CommsMessage::ProfileResponse(ProfileResponseData {
            serialized_profile: r.string("profile_response.serialized_profile")?,
            has_connected_web3: r.bool("profile_response.has_connected_web3")?,
        }),
        _ => return Ok(None),
    };

    Ok(Some(Frame { time, message }))
}

/// Bounds-checked cursor; `bytes::Buf` panics on underflow.
struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, field: &'static str, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        self.need(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidValue {
                field,
                value: other as u64,
            }),
        }
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        self.need(field, 4)?;
        Ok(self.buf.get_u32_le())
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, DecodeError> {
        self.need(field, 4)?;
        Ok(self.buf.get_f32_le())
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, DecodeError> {
        self.need(field, 8)?;
        Ok(self.buf.get_f64_le())
    }

    fn blob(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32(field)? as usize;
        self.need(field, len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        String::from_utf8(self.blob(field)?).map_err(|_| DecodeError::InvalidUtf8(field))
    }
}
