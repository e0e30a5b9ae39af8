//! Wire protocol for the gale tunnel.
//!
//! Everything that crosses the control channel between `gale-client` and
//! `gale-server` lives here:
//! - typed control envelopes (register, heartbeat, request, response, ...)
//! - the length-prefixed frame codec that carries them over TCP or TLS
//! - the ordered, case-insensitive header model shared by both endpoints

pub mod codec;
pub mod frame;
pub mod headers;
pub mod subdomain;

pub use codec::{FramedReader, FramedStream, FramedWriter, ProtoError, MAX_FRAME_LEN};
pub use frame::{
    now_ms, Close, ErrorFrame, Frame, FrameType, Heartbeat, HeartbeatAck, Register, RegisterAck,
    RegisterNack, RequestEnvelope, ResponseEnvelope, PROTOCOL_VERSION,
};
pub use headers::{is_hop_by_hop, Headers};
