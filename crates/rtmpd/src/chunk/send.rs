//! Send path: frame a message payload into chunks in place.
//!
//! Payload blocks are sized to the outbound chunk size, so each block is
//! one chunk. Chunk headers go into the header room in front of each
//! block; the payload itself is never copied once it is framed.

use zerocopy::byteorder::{BigEndian, LittleEndian, U32};
use zerocopy::AsBytes;

use rtmp_core::wire::{
    u24_bytes, BasicHeader, ExtendedTimestamp, MessageHeader0, MessageHeader1, MessageHeader2,
    EXTENDED_TIMESTAMP, MAX_CHUNK_HEADER,
};
use rtmp_core::{BufferPool, Chain, ChunkError, Header};

/// Largest length a 3-byte message length field carries.
const MAX_MLEN: u32 = 0x00FF_FFFF;

/// What the peer's chunk stream holds after a message was framed.
///
/// Feed it back as `last` for the next message on the same chunk stream
/// to get compressed headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub header: Header,
    /// Delta the receiver applies to a following format 3 header.
    pub delta: u32,
    /// The timestamp field went out in extended form.
    pub extended: bool,
}

/// Frame `payload` as one message with header `h`.
///
/// `last` is what was previously sent on the same chunk stream, if the
/// caller tracks it. Without it the message gets a format 0 header.
pub fn prepare_message(
    h: &Header,
    last: Option<&Sent>,
    payload: &mut Chain,
    pool: &BufferPool,
    play_time_fix: bool,
) -> Result<Sent, ChunkError> {
    conform(payload, pool)?;

    let mlen = payload.len() as u32;
    if mlen > MAX_MLEN {
        return Err(ChunkError::MessageTooLarge { mlen, max: MAX_MLEN });
    }
    if payload.blocks().is_empty() {
        payload.push(pool.acquire()?);
    }

    let mut fmt = 0u8;
    let mut field = h.timestamp;
    let mut delta = 0;
    if let Some(lh) = last.filter(|lh| lh.header.msid == h.msid) {
        fmt = 1;
        field = h.timestamp.wrapping_sub(lh.header.timestamp);
        delta = field;
        // Zero-length messages always restate their length: a repeat
        // stays at format 1.
        if h.msg_type == lh.header.msg_type && mlen != 0 && mlen == lh.header.mlen {
            fmt = 2;
            // Format 3 makes the receiver reuse its stored delta.
            if field == lh.delta && !lh.extended && field < EXTENDED_TIMESTAMP {
                fmt = 3;
            }
        }
    }
    let extended = fmt != 3 && field >= EXTENDED_TIMESTAMP;

    let mut head = [0u8; MAX_CHUNK_HEADER];
    let mut basic = [0u8; 3];
    let width = BasicHeader::encode(fmt, h.csid, &mut basic)?;
    head[..width].copy_from_slice(&basic[..width]);
    let mut n = width;

    let ts = u24_bytes(field.min(EXTENDED_TIMESTAMP));
    let body = match fmt {
        0 => MessageHeader0 {
            timestamp: ts,
            mlen: u24_bytes(mlen),
            msg_type: h.msg_type,
            msid: U32::<LittleEndian>::new(h.msid),
        }
        .as_bytes()
        .to_vec(),
        1 => MessageHeader1 { timestamp: ts, mlen: u24_bytes(mlen), msg_type: h.msg_type }
            .as_bytes()
            .to_vec(),
        2 => MessageHeader2 { timestamp: ts }.as_bytes().to_vec(),
        _ => Vec::new(),
    };
    head[n..n + body.len()].copy_from_slice(&body);
    n += body.len();

    let ext = ExtendedTimestamp { value: U32::<BigEndian>::new(field) };
    if extended {
        head[n..n + 4].copy_from_slice(ext.as_bytes());
        n += 4;
    }

    // Continuation chunks: format 3 with the same width.
    let mut cont = [0u8; 7];
    cont[..width].copy_from_slice(&basic[..width]);
    cont[0] |= 0xc0;
    let mut cn = width;
    if extended && play_time_fix {
        cont[cn..cn + 4].copy_from_slice(ext.as_bytes());
        cn += 4;
    }

    let (first, rest) = payload
        .blocks_mut()
        .split_first_mut()
        .ok_or(ChunkError::NoHeaderRoom)?;
    if !first.prepend(&head[..n]) {
        return Err(ChunkError::NoHeaderRoom);
    }
    for block in rest {
        if !block.prepend(&cont[..cn]) {
            return Err(ChunkError::NoHeaderRoom);
        }
    }

    let header = Header { mlen, ..*h };
    tracing::trace!(csid = h.csid, fmt, mlen, timestamp = h.timestamp, "message framed");

    Ok(Sent {
        header,
        delta: match (fmt, last) {
            (3, Some(lh)) => lh.delta,
            _ => delta,
        },
        extended,
    })
}

/// Make every block but the last exactly one chunk, each with full header
/// room. Chains built by this pool already are; anything else is copied.
fn conform(payload: &mut Chain, pool: &BufferPool) -> Result<(), ChunkError> {
    let blocks = payload.blocks();
    let fits = blocks.iter().enumerate().all(|(i, b)| {
        b.headroom() == MAX_CHUNK_HEADER
            && b.len() <= pool.chunk_size()
            && (i + 1 == blocks.len() || b.len() == pool.chunk_size())
    });
    if !fits {
        let mut repacked = Chain::new();
        pool.append_chain(&mut repacked, payload)?;
        *payload = repacked;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
