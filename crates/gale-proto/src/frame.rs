//! Control frame envelopes.
//!
//! Each frame is a typed JSON payload on the wire; binary bodies are
//! base64-encoded so they survive the text encoding unchanged.

use serde::{Deserialize, Serialize};

use crate::codec::ProtoError;
use crate::headers::Headers;

/// Protocol version declared in `REGISTER` and echoed in `REGISTER_ACK`.
pub const PROTOCOL_VERSION: u32 = 1;

/// One-byte frame type discriminants. Stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Register = 1,
    RegisterAck = 2,
    RegisterNack = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Request = 6,
    Response = 7,
    Error = 8,
    Close = 9,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Register),
            2 => Some(Self::RegisterAck),
            3 => Some(Self::RegisterNack),
            4 => Some(Self::Heartbeat),
            5 => Some(Self::HeartbeatAck),
            6 => Some(Self::Request),
            7 => Some(Self::Response),
            8 => Some(Self::Error),
            9 => Some(Self::Close),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// First frame a client sends: claim a subdomain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub subdomain: String,
    pub protocol_version: u32,
}

/// Successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    /// Opaque identifier assigned by the server, stable for the session.
    pub client_id: String,
    pub server_time_ms: u64,
    pub protocol_version: u32,
}

/// Rejected registration. The connection closes after this frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNack {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Monotonic per session.
    pub nonce: u64,
    pub timestamp_ms: u64,
}

/// Echo of a [`Heartbeat`], carrying the same nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub nonce: u64,
    pub server_time_ms: u64,
}

/// A public HTTP request relayed server -> client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Monotonic per session; correlates the matching [`ResponseEnvelope`].
    pub request_id: u64,
    pub method: String,
    /// Request-target: path plus query string.
    pub path: String,
    pub headers: Headers,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

/// The origin's answer, relayed client -> server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub headers: Headers,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

/// Non-fatal (or pre-close) error notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

/// Orderly shutdown announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Register(Register),
    RegisterAck(RegisterAck),
    RegisterNack(RegisterNack),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Error(ErrorFrame),
    Close(Close),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Register(_) => FrameType::Register,
            Frame::RegisterAck(_) => FrameType::RegisterAck,
            Frame::RegisterNack(_) => FrameType::RegisterNack,
            Frame::Heartbeat(_) => FrameType::Heartbeat,
            Frame::HeartbeatAck(_) => FrameType::HeartbeatAck,
            Frame::Request(_) => FrameType::Request,
            Frame::Response(_) => FrameType::Response,
            Frame::Error(_) => FrameType::Error,
            Frame::Close(_) => FrameType::Close,
        }
    }

    /// Serialize the payload (everything after the type byte).
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtoError> {
        let bytes = match self {
            Frame::Register(p) => serde_json::to_vec(p)?,
            Frame::RegisterAck(p) => serde_json::to_vec(p)?,
            Frame::RegisterNack(p) => serde_json::to_vec(p)?,
            Frame::Heartbeat(p) => serde_json::to_vec(p)?,
            Frame::HeartbeatAck(p) => serde_json::to_vec(p)?,
            Frame::Request(p) => serde_json::to_vec(p)?,
            Frame::Response(p) => serde_json::to_vec(p)?,
            Frame::Error(p) => serde_json::to_vec(p)?,
            Frame::Close(p) => serde_json::to_vec(p)?,
        };
        Ok(bytes)
    }

    /// Decode a payload for the given type byte.
    pub fn decode(type_byte: u8, payload: &[u8]) -> Result<Frame, ProtoError> {
        let Some(frame_type) = FrameType::from_u8(type_byte) else {
            return Err(ProtoError::UnknownFrameType(type_byte));
        };
        let frame = match frame_type {
            FrameType::Register => Frame::Register(serde_json::from_slice(payload)?),
            FrameType::RegisterAck => Frame::RegisterAck(serde_json::from_slice(payload)?),
            FrameType::RegisterNack => Frame::RegisterNack(serde_json::from_slice(payload)?),
            FrameType::Heartbeat => Frame::Heartbeat(serde_json::from_slice(payload)?),
            FrameType::HeartbeatAck => Frame::HeartbeatAck(serde_json::from_slice(payload)?),
            FrameType::Request => Frame::Request(serde_json::from_slice(payload)?),
            FrameType::Response => Frame::Response(serde_json::from_slice(payload)?),
            FrameType::Error => Frame::Error(serde_json::from_slice(payload)?),
            FrameType::Close => Frame::Close(serde_json::from_slice(payload)?),
        };
        Ok(frame)
    }
}

/// Current wall-clock time in unix milliseconds, for frame timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
