//! RTMP wire format: chunk headers, message types, and protocol constants.
//!
//! A chunk starts with a 1–3 byte basic header (format + chunk-stream id),
//! followed by a 0/3/7/11 byte message header selected by the format, and an
//! optional 4-byte extended timestamp. Multi-byte fields are big-endian with
//! one exception: the message-stream id in a format 0 header is little-endian.
//!
//! Fixed-layout pieces are zerocopy structs with compile-time size guards.
//! Everything that depends on per-stream state (extended timestamp
//! inheritance, header compression) lives with the chunk transport.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::pool::PoolError;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol version carried in the first handshake byte.
pub const RTMP_VERSION: u8 = 3;

/// Chunk size both ends assume until a set-chunk-size message says otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Largest chunk size a peer may negotiate.
pub const MAX_CHUNK_SIZE: usize = 10_485_760;

/// Worst-case chunk header: 3 byte basic header, 11 byte message header,
/// 4 byte extended timestamp.
pub const MAX_CHUNK_HEADER: usize = 18;

/// Inline timestamp value announcing a 4-byte extended timestamp.
pub const EXTENDED_TIMESTAMP: u32 = 0x00FF_FFFF;

/// Highest message type the dispatcher indexes.
pub const MSG_MAX: u8 = 22;

/// Chunk-stream ids used for locally originated messages.
pub const CSID_CONTROL: u32 = 2;
pub const CSID_AMF_INI: u32 = 3;
pub const CSID_AMF: u32 = 5;
pub const CSID_AUDIO: u32 = 6;
pub const CSID_VIDEO: u32 = 7;

/// Message-stream id handed out by createStream. One media stream per
/// connection.
pub const MSID: u32 = 1;

/// Largest chunk-stream id the 3-byte basic header can carry.
pub const MAX_CSID: u32 = 65_599;

// ── Message types ─────────────────────────────────────────────────────────────

/// Message type byte carried in format 0 and 1 headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    SetChunkSize = 1,
    Abort = 2,
    Ack = 3,
    UserControl = 4,
    AckWindow = 5,
    PeerBandwidth = 6,
    Edge = 7,
    Audio = 8,
    Video = 9,
    Amf3Meta = 15,
    Amf3Shared = 16,
    Amf3Command = 17,
    AmfMeta = 18,
    AmfShared = 19,
    AmfCommand = 20,
    Aggregate = 22,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::SetChunkSize => "chunk_size",
            Self::Abort => "abort",
            Self::Ack => "ack",
            Self::UserControl => "user",
            Self::AckWindow => "ack_size",
            Self::PeerBandwidth => "bandwidth",
            Self::Edge => "edge",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Amf3Meta => "amf3_meta",
            Self::Amf3Shared => "amf3_shared",
            Self::Amf3Command => "amf3_cmd",
            Self::AmfMeta => "amf_meta",
            Self::AmfShared => "amf_shared",
            Self::AmfCommand => "amf_cmd",
            Self::Aggregate => "aggregate",
        }
    }

    /// Types whose payload starts with an AMF-encoded name.
    pub fn is_amf(self) -> bool {
        matches!(
            self,
            Self::Amf3Meta
                | Self::Amf3Shared
                | Self::Amf3Command
                | Self::AmfMeta
                | Self::AmfShared
                | Self::AmfCommand
        )
    }

    /// AMF3 variants carry one format byte before the AMF0 body.
    pub fn is_amf3(self) -> bool {
        matches!(self, Self::Amf3Meta | Self::Amf3Shared | Self::Amf3Command)
    }

    /// Shared-object messages send their name without a type marker.
    pub fn is_shared_object(self) -> bool {
        matches!(self, Self::Amf3Shared | Self::AmfShared)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::SetChunkSize,
            2 => Self::Abort,
            3 => Self::Ack,
            4 => Self::UserControl,
            5 => Self::AckWindow,
            6 => Self::PeerBandwidth,
            7 => Self::Edge,
            8 => Self::Audio,
            9 => Self::Video,
            15 => Self::Amf3Meta,
            16 => Self::Amf3Shared,
            17 => Self::Amf3Command,
            18 => Self::AmfMeta,
            19 => Self::AmfShared,
            20 => Self::AmfCommand,
            22 => Self::Aggregate,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Message header ────────────────────────────────────────────────────────────

/// Logical header of a complete message.
///
/// `timestamp` is always absolute here; deltas only exist on the wire.
/// `msg_type` stays a raw byte so unknown types can reach the dispatcher,
/// which logs and ignores them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub csid: u32,
    pub timestamp: u32,
    pub mlen: u32,
    pub msg_type: u8,
    pub msid: u32,
}

impl Header {
    pub fn new(csid: u32, msg_type: MessageType, msid: u32, timestamp: u32) -> Self {
        Self {
            csid,
            timestamp,
            mlen: 0,
            msg_type: msg_type.into(),
            msid,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.msg_type).ok()
    }
}

/// Format 0 message header: everything spelled out.
/// Wire size: 11 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader0 {
    pub timestamp: [u8; 3],
    pub mlen: [u8; 3],
    pub msg_type: u8,
    /// The one little-endian field in the protocol.
    pub msid: U32<LittleEndian>,
}

assert_eq_size!(MessageHeader0, [u8; 11]);

/// Format 1 message header: message-stream id inherited.
/// Wire size: 7 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader1 {
    pub timestamp: [u8; 3],
    pub mlen: [u8; 3],
    pub msg_type: u8,
}

assert_eq_size!(MessageHeader1, [u8; 7]);

/// Format 2 message header: timestamp delta only.
/// Wire size: 3 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader2 {
    pub timestamp: [u8; 3],
}

assert_eq_size!(MessageHeader2, [u8; 3]);

/// Extended timestamp trailer.
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ExtendedTimestamp {
    pub value: U32<BigEndian>,
}

assert_eq_size!(ExtendedTimestamp, [u8; 4]);

/// Message header length for each format.
pub const MESSAGE_HEADER_LEN: [usize; 4] = [11, 7, 3, 0];

pub fn read_u24(b: [u8; 3]) -> u32 {
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

pub fn u24_bytes(v: u32) -> [u8; 3] {
    let b = v.to_be_bytes();
    [b[1], b[2], b[3]]
}

// ── Basic header ──────────────────────────────────────────────────────────────

/// Format and chunk-stream id from the first 1–3 bytes of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    pub fmt: u8,
    pub csid: u32,
    /// Bytes the basic header occupied on the wire.
    pub width: usize,
}

impl BasicHeader {
    /// Parse from the front of `buf`. `None` means more bytes are needed.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let first = *buf.first()?;
        let fmt = first >> 6;
        match first & 0x3f {
            0 => {
                let b1 = *buf.get(1)?;
                Some(Self { fmt, csid: 64 + b1 as u32, width: 2 })
            }
            1 => {
                let b1 = *buf.get(1)?;
                let b2 = *buf.get(2)?;
                Some(Self {
                    fmt,
                    csid: 64 + b1 as u32 + ((b2 as u32) << 8),
                    width: 3,
                })
            }
            id => Some(Self { fmt, csid: id as u32, width: 1 }),
        }
    }

    /// Wire width of a basic header for `csid`.
    pub fn width_for(csid: u32) -> usize {
        match csid {
            2..=63 => 1,
            64..=319 => 2,
            _ => 3,
        }
    }

    /// Encode into `out`, returning the number of bytes written.
    /// Ids 0 and 1 are escape values and cannot be sent.
    pub fn encode(fmt: u8, csid: u32, out: &mut [u8; 3]) -> Result<usize, ChunkError> {
        if csid < 2 || csid > MAX_CSID {
            return Err(ChunkError::InvalidChunkStream(csid));
        }
        let fmt = (fmt & 0x03) << 6;
        Ok(match Self::width_for(csid) {
            1 => {
                out[0] = fmt | csid as u8;
                1
            }
            2 => {
                out[0] = fmt;
                out[1] = (csid - 64) as u8;
                2
            }
            _ => {
                let id = csid - 64;
                out[0] = fmt | 1;
                out[1] = (id & 0xff) as u8;
                out[2] = (id >> 8) as u8;
                3
            }
        })
    }
}

/// Message header fields present on the wire for one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFields {
    /// Timestamp or delta as carried, already widened from the extended
    /// field when present. `None` for format 3 without an extended field.
    pub timestamp: Option<u32>,
    pub mlen: Option<u32>,
    pub msg_type: Option<u8>,
    pub msid: Option<u32>,
    /// Whether an extended timestamp followed.
    pub extended: bool,
    /// Bytes consumed after the basic header.
    pub len: usize,
}

impl ChunkFields {
    /// Parse the message header and optional extended timestamp.
    ///
    /// `inherit_extended` is the chunk stream's current extended flag; it
    /// decides whether a format 3 header carries the 4-byte field.
    /// `None` means more bytes are needed.
    pub fn parse(fmt: u8, buf: &[u8], inherit_extended: bool) -> Option<Self> {
        let mut f = ChunkFields { extended: inherit_extended, ..Default::default() };
        let hlen = MESSAGE_HEADER_LEN[(fmt & 0x03) as usize];
        let head = buf.get(..hlen)?;

        match fmt & 0x03 {
            0 => {
                let h = MessageHeader0::read_from(head)?;
                f.timestamp = Some(read_u24(h.timestamp));
                f.mlen = Some(read_u24(h.mlen));
                f.msg_type = Some(h.msg_type);
                f.msid = Some(h.msid.get());
            }
            1 => {
                let h = MessageHeader1::read_from(head)?;
                f.timestamp = Some(read_u24(h.timestamp));
                f.mlen = Some(read_u24(h.mlen));
                f.msg_type = Some(h.msg_type);
            }
            2 => {
                let h = MessageHeader2::read_from(head)?;
                f.timestamp = Some(read_u24(h.timestamp));
            }
            _ => {}
        }

        if fmt & 0x03 != 3 {
            f.extended = f.timestamp == Some(EXTENDED_TIMESTAMP);
        }
        f.len = hlen;

        if f.extended {
            let ext = ExtendedTimestamp::read_from(buf.get(hlen..hlen + 4)?)?;
            f.timestamp = Some(ext.value.get());
            f.len += 4;
        }
        Some(f)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("{what} payload too short: need {need} bytes, got {got}")]
    Truncated {
        what: &'static str,
        need: usize,
        got: usize,
    },
}

/// Protocol violations detected by the chunk transport. All are fatal to
/// the connection.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("message length {mlen} exceeds maximum {max}")]
    MessageTooLarge { mlen: u32, max: u32 },

    #[error("chunk stream {csid} out of range (max {max})")]
    StreamOutOfRange { csid: u32, max: u32 },

    #[error("chunk stream {0} cannot be encoded")]
    InvalidChunkStream(u32),

    #[error("chunk size {0} out of range")]
    ChunkSizeOutOfRange(u32),

    #[error("message length changed to {mlen} after {received} bytes")]
    MessageLengthChanged { mlen: u32, received: u32 },

    #[error("payload has no room for a chunk header")]
    NoHeaderRoom,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
