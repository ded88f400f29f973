//! Receive path: reassemble interleaved chunks into complete messages.
//!
//! `Demuxer::poll` is a pure function of the bytes buffered so far and the
//! per-chunk-stream state. It only commits when a whole chunk (headers and
//! payload) is available, so a short read leaves the buffer and the state
//! untouched and the next read simply retries.

use bytes::{Buf, BytesMut};

use rtmp_core::wire::{BasicHeader, ChunkFields, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use rtmp_core::{BufferPool, Chain, ChunkError, Header};

/// A reassembled message.
#[derive(Debug)]
pub struct Message {
    /// Absolute timestamp, full length, and the chunk stream it arrived on.
    pub header: Header,
    pub payload: Chain,
}

/// Per chunk stream reassembly state.
#[derive(Debug, Default)]
struct ChunkStream {
    header: Header,
    /// Continuation chunks carry a 4-byte extended timestamp.
    extended: bool,
    /// Delta added to the header timestamp when the message completes.
    dtime: u32,
    /// Payload bytes received for the message in progress.
    len: u32,
    partial: Chain,
}

pub struct Demuxer {
    pool: BufferPool,
    /// Pools replaced by a chunk-size change while a batch was in flight.
    retired: Vec<BufferPool>,
    chunk_size: usize,
    streams: Vec<ChunkStream>,
    max_message: u32,
    publish_time_fix: bool,
}

impl Demuxer {
    pub fn new(max_streams: u32, max_message: u32, publish_time_fix: bool) -> Self {
        Self {
            pool: BufferPool::new(DEFAULT_CHUNK_SIZE),
            retired: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: (0..max_streams).map(|_| ChunkStream::default()).collect(),
            max_message,
            publish_time_fix,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Extract the next complete message from `buf`.
    ///
    /// Consumes whole chunks only. Returns `Ok(None)` once the remaining
    /// bytes do not form a complete chunk.
    pub fn poll(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ChunkError> {
        loop {
            let Some(basic) = BasicHeader::parse(&buf[..]) else {
                return Ok(None);
            };
            let csid = basic.csid;
            if csid as usize >= self.streams.len() {
                return Err(ChunkError::StreamOutOfRange {
                    csid,
                    max: self.streams.len() as u32,
                });
            }

            let st = &self.streams[csid as usize];
            let Some(fields) = ChunkFields::parse(basic.fmt, &buf[basic.width..], st.extended) else {
                return Ok(None);
            };

            let mut header = st.header;
            header.csid = csid;
            if let Some(mlen) = fields.mlen {
                header.mlen = mlen;
            }
            if let Some(t) = fields.msg_type {
                header.msg_type = t;
            }
            if let Some(msid) = fields.msid {
                header.msid = msid;
            }

            let timestamp = fields.timestamp.unwrap_or(st.dtime);
            let (mut extended, mut dtime) = (st.extended, st.dtime);
            if st.len == 0 {
                extended = fields.extended && self.publish_time_fix;
                if basic.fmt == 0 {
                    header.timestamp = timestamp;
                    dtime = 0;
                } else {
                    dtime = timestamp;
                }
            }

            if header.mlen > self.max_message {
                return Err(ChunkError::MessageTooLarge {
                    mlen: header.mlen,
                    max: self.max_message,
                });
            }
            if header.mlen < st.len {
                return Err(ChunkError::MessageLengthChanged {
                    mlen: header.mlen,
                    received: st.len,
                });
            }

            let size = ((header.mlen - st.len) as usize).min(self.chunk_size);
            let head = basic.width + fields.len;
            if buf.len() < head + size {
                return Ok(None);
            }

            // Whole chunk present: commit.
            let st = &mut self.streams[csid as usize];
            st.header = header;
            st.extended = extended;
            st.dtime = dtime;
            buf.advance(head);
            self.pool.append(&mut st.partial, &buf[..size])?;
            buf.advance(size);
            st.len += size as u32;

            tracing::trace!(csid, fmt = basic.fmt, size, len = st.len, mlen = header.mlen, "chunk");

            if st.len == st.header.mlen {
                st.header.timestamp = st.header.timestamp.wrapping_add(st.dtime);
                st.len = 0;
                return Ok(Some(Message {
                    header: st.header,
                    payload: std::mem::take(&mut st.partial),
                }));
            }
        }
    }

    /// Adopt a new inbound chunk size.
    ///
    /// Partial messages on other chunk streams are copied into blocks of the
    /// new size. The old pool is kept until `finish_drain`.
    pub fn set_chunk_size(&mut self, size: u32, from_csid: u32) -> Result<(), ChunkError> {
        if size == 0 || size as usize > MAX_CHUNK_SIZE {
            return Err(ChunkError::ChunkSizeOutOfRange(size));
        }
        let size = size as usize;
        if size == self.chunk_size {
            return Ok(());
        }

        let pool = BufferPool::new(size);
        for (csid, st) in self.streams.iter_mut().enumerate() {
            if csid as u32 == from_csid || st.partial.blocks().is_empty() {
                continue;
            }
            let mut repacked = Chain::new();
            pool.append_chain(&mut repacked, &st.partial)?;
            st.partial = repacked;
        }

        tracing::debug!(old = self.chunk_size, new = size, "inbound chunk size changed");
        self.retired.push(std::mem::replace(&mut self.pool, pool));
        self.chunk_size = size;
        Ok(())
    }

    /// Drop the partial message on `csid`.
    pub fn abort(&mut self, csid: u32) {
        if let Some(st) = self.streams.get_mut(csid as usize) {
            st.len = 0;
            st.partial = Chain::new();
        }
    }

    /// Release pools retired during the batch just dispatched.
    pub fn finish_drain(&mut self) {
        self.retired.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
