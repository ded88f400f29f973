//! Protocol control (types 1, 2, 3, 5, 6) and user control (type 4)
//! message bodies.
//!
//! Bodies are a handful of big-endian integers. Encoding produces the raw
//! payload; framing into chunks is the transport's job.

use crate::wire::{MessageType, WireError};

// ── Protocol control ──────────────────────────────────────────────────────────

/// How the peer should treat a bandwidth announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LimitType {
    Hard = 0,
    Soft = 1,
    Dynamic = 2,
}

impl LimitType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Hard),
            1 => Some(Self::Soft),
            2 => Some(Self::Dynamic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    SetChunkSize(u32),
    /// Discard the partial message on this chunk stream.
    Abort(u32),
    /// Bytes received so far.
    Ack(u32),
    AckWindow(u32),
    PeerBandwidth { size: u32, limit: u8 },
}

impl ControlMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::SetChunkSize(_) => MessageType::SetChunkSize,
            Self::Abort(_) => MessageType::Abort,
            Self::Ack(_) => MessageType::Ack,
            Self::AckWindow(_) => MessageType::AckWindow,
            Self::PeerBandwidth { .. } => MessageType::PeerBandwidth,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::SetChunkSize(v) | Self::Abort(v) | Self::Ack(v) | Self::AckWindow(v) => {
                v.to_be_bytes().to_vec()
            }
            Self::PeerBandwidth { size, limit } => {
                let mut out = size.to_be_bytes().to_vec();
                out.push(limit);
                out
            }
        }
    }

    pub fn parse(msg_type: MessageType, payload: &[u8]) -> Result<Self, WireError> {
        let what = msg_type.name();
        let word = be_u32(payload, 0, what)?;
        Ok(match msg_type {
            MessageType::SetChunkSize => Self::SetChunkSize(word),
            MessageType::Abort => Self::Abort(word),
            MessageType::Ack => Self::Ack(word),
            MessageType::AckWindow => Self::AckWindow(word),
            MessageType::PeerBandwidth => {
                let limit = *payload.get(4).ok_or(WireError::Truncated {
                    what,
                    need: 5,
                    got: payload.len(),
                })?;
                Self::PeerBandwidth { size: word, limit }
            }
            other => return Err(WireError::UnknownMessageType(other.into())),
        })
    }
}

// ── User control ──────────────────────────────────────────────────────────────

pub mod event {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
    pub const STREAM_DRY: u16 = 2;
    pub const SET_BUFFER_LENGTH: u16 = 3;
    pub const STREAM_IS_RECORDED: u16 = 4;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { msid: u32, buflen_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    /// Event types with no known body; logged and ignored.
    Unknown(u16),
}

impl UserEvent {
    pub fn kind(&self) -> u16 {
        match self {
            Self::StreamBegin(_) => event::STREAM_BEGIN,
            Self::StreamEof(_) => event::STREAM_EOF,
            Self::StreamDry(_) => event::STREAM_DRY,
            Self::SetBufferLength { .. } => event::SET_BUFFER_LENGTH,
            Self::StreamIsRecorded(_) => event::STREAM_IS_RECORDED,
            Self::PingRequest(_) => event::PING_REQUEST,
            Self::PingResponse(_) => event::PING_RESPONSE,
            Self::Unknown(kind) => *kind,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.kind().to_be_bytes().to_vec();
        match *self {
            Self::StreamBegin(v)
            | Self::StreamEof(v)
            | Self::StreamDry(v)
            | Self::StreamIsRecorded(v)
            | Self::PingRequest(v)
            | Self::PingResponse(v) => out.extend_from_slice(&v.to_be_bytes()),
            Self::SetBufferLength { msid, buflen_ms } => {
                out.extend_from_slice(&msid.to_be_bytes());
                out.extend_from_slice(&buflen_ms.to_be_bytes());
            }
            Self::Unknown(_) => {}
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let what = "user control";
        let kind = match payload {
            [a, b, ..] => u16::from_be_bytes([*a, *b]),
            _ => {
                return Err(WireError::Truncated { what, need: 2, got: payload.len() });
            }
        };
        let arg = || be_u32(payload, 2, what);
        Ok(match kind {
            event::STREAM_BEGIN => Self::StreamBegin(arg()?),
            event::STREAM_EOF => Self::StreamEof(arg()?),
            event::STREAM_DRY => Self::StreamDry(arg()?),
            event::SET_BUFFER_LENGTH => Self::SetBufferLength {
                msid: arg()?,
                buflen_ms: be_u32(payload, 6, what)?,
            },
            event::STREAM_IS_RECORDED => Self::StreamIsRecorded(arg()?),
            event::PING_REQUEST => Self::PingRequest(arg()?),
            event::PING_RESPONSE => Self::PingResponse(arg()?),
            other => Self::Unknown(other),
        })
    }
}

fn be_u32(payload: &[u8], at: usize, what: &'static str) -> Result<u32, WireError> {
    payload
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(WireError::Truncated { what, need: at + 4, got: payload.len() })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
