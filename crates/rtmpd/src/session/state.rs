//! Per-connection protocol state.
//!
//! Owned by exactly one connection task. Handlers get `&mut Session` and
//! send through it; nothing here is shared across threads.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rtmp_core::amf::{self, Value};
use rtmp_core::message::{ControlMessage, UserEvent};
use rtmp_core::wire::{CSID_CONTROL, DEFAULT_CHUNK_SIZE};
use rtmp_core::{BufferPool, Chain, Header, MessageType, RtmpConfig, SharedChain};

use super::SessionError;
use crate::chunk::{prepare_message, Demuxer, OutQueue, Sent};

/// Received byte count wraps back to zero here.
const IN_BYTES_WRAP: u32 = 0xF000_0000;

/// What the client sent in `connect`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectInfo {
    pub app: String,
    /// Query string split off the application name, without the `?`.
    pub args: String,
    pub flash_ver: String,
    pub swf_url: String,
    pub tc_url: String,
    pub page_url: String,
    pub audio_codecs: f64,
    pub video_codecs: f64,
    pub object_encoding: f64,
}

pub struct Session {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub config: Arc<RtmpConfig>,
    /// Our handshake epoch.
    pub epoch: u32,
    pub peer_epoch: u32,
    started: Instant,

    pub demux: Demuxer,
    pub out: OutQueue,
    out_pool: BufferPool,

    /// Acknowledge after this many received bytes. 0 = never.
    pub ack_size: u32,
    in_bytes: u32,
    in_last_ack: u32,
    pub buflen_ms: u32,

    ping_active: bool,
    ping_reset: bool,

    pub connect: Option<ConnectInfo>,
    closed: Option<String>,
}

impl Session {
    pub fn new(id: u64, peer_addr: SocketAddr, config: Arc<RtmpConfig>) -> Self {
        let chunk = &config.chunk;
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(0);
        Self {
            id,
            peer_addr,
            epoch,
            peer_epoch: 0,
            started: Instant::now(),
            demux: Demuxer::new(chunk.max_streams, chunk.max_message, chunk.publish_time_fix),
            out: OutQueue::new(chunk.out_queue, chunk.out_cork, chunk.busy),
            out_pool: BufferPool::new(DEFAULT_CHUNK_SIZE),
            ack_size: 0,
            in_bytes: 0,
            in_last_ack: 0,
            buflen_ms: config.buflen_ms,
            ping_active: false,
            ping_reset: false,
            connect: None,
            closed: None,
            config,
        }
    }

    /// Milliseconds since the session started.
    pub fn timestamp(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    /// Pool for payloads of outbound messages. Blocks are sized to the
    /// current outbound chunk size.
    pub fn out_pool(&self) -> &BufferPool {
        &self.out_pool
    }

    pub fn in_bytes(&self) -> u32 {
        self.in_bytes
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Mark the session closed. Only the first call has any effect;
    /// returns whether this call was it.
    pub fn finalize(&mut self, reason: impl fmt::Display) -> bool {
        if self.closed.is_some() {
            return false;
        }
        let reason = reason.to_string();
        tracing::info!(id = self.id, peer = %self.peer_addr, %reason, "session finalized");
        self.closed = Some(reason);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn closed_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Frame `payload` and queue it.
    ///
    /// A message refused by the outbound queue is dropped, not an error.
    pub fn send_message(
        &mut self,
        h: &Header,
        mut payload: Chain,
        last: Option<&Sent>,
        priority: u8,
    ) -> Result<Sent, SessionError> {
        let sent = prepare_message(
            h,
            last,
            &mut payload,
            &self.out_pool,
            self.config.chunk.play_time_fix,
        )?;
        self.out.push(payload.share(), priority);
        Ok(sent)
    }

    /// Queue an already framed message, possibly shared with other sessions.
    pub fn send_shared(&mut self, chain: &SharedChain, priority: u8) -> bool {
        self.out.push(chain.retain(), priority)
    }

    pub fn send_control(&mut self, msg: ControlMessage) -> Result<(), SessionError> {
        let h = Header::new(CSID_CONTROL, msg.message_type(), 0, 0);
        let payload = self.out_pool.chain_from(&msg.encode())?;
        self.send_message(&h, payload, None, 0)?;

        if let ControlMessage::SetChunkSize(size) = msg {
            // Everything after this message goes out in the new size.
            self.out_pool = BufferPool::new(size as usize);
            tracing::debug!(id = self.id, size, "outbound chunk size changed");
        }
        Ok(())
    }

    pub fn send_user(&mut self, event: UserEvent) -> Result<(), SessionError> {
        let h = Header::new(CSID_CONTROL, MessageType::UserControl, 0, 0);
        let payload = self.out_pool.chain_from(&event.encode())?;
        self.send_message(&h, payload, None, 0)?;
        Ok(())
    }

    /// Encode `values` as an AMF0 command on `csid`.
    pub fn send_amf(&mut self, csid: u32, msid: u32, values: &[Value<'_>]) -> Result<(), SessionError> {
        let h = Header::new(csid, MessageType::AmfCommand, msid, 0);
        let payload = amf::encode(&self.out_pool, values)?;
        self.send_message(&h, payload, None, 0)?;
        Ok(())
    }

    // ── Accounting ────────────────────────────────────────────────────────────

    /// Count `n` received bytes and acknowledge when a window fills.
    pub fn on_received(&mut self, n: usize) -> Result<(), SessionError> {
        self.ping_reset = true;
        self.in_bytes = self.in_bytes.wrapping_add(n as u32);
        if self.in_bytes >= IN_BYTES_WRAP {
            tracing::trace!(id = self.id, "received byte counter reset");
            self.in_bytes = 0;
            self.in_last_ack = 0;
        }

        if self.ack_size != 0 && self.in_bytes - self.in_last_ack >= self.ack_size {
            self.in_last_ack = self.in_bytes;
            tracing::trace!(id = self.id, bytes = self.in_bytes, "sending ack");
            self.send_control(ControlMessage::Ack(self.in_bytes))?;
        }
        Ok(())
    }

    /// Keepalive timer fired. Returns how long to sleep before the next
    /// tick, or `None` when keepalive is disabled.
    ///
    /// Only inbound bytes count as a sign of life; our own writes, the
    /// ping request included, do not. A `busy` session is expected to
    /// stream continuously, so an idle interval ends it without a ping.
    pub fn ping_tick(&mut self) -> Result<Option<Duration>, SessionError> {
        let Some(interval) = self.config.timeouts.ping() else {
            return Ok(None);
        };

        if self.ping_reset {
            self.ping_reset = false;
            self.ping_active = false;
            return Ok(Some(interval));
        }
        if self.ping_active {
            return Err(SessionError::PingTimeout);
        }
        if self.config.chunk.busy {
            return Err(SessionError::Idle);
        }

        let ts = self.timestamp();
        tracing::debug!(id = self.id, ts, "ping request");
        self.send_user(UserEvent::PingRequest(ts))?;
        self.ping_active = true;
        Ok(Some(self.config.timeouts.ping_timeout()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn session(config: RtmpConfig) -> Session {
        Session::new(1, "127.0.0.1:5000".parse().unwrap(), Arc::new(config))
    }

    /// Flush the outbound queue and decode what a peer would receive.
    fn drain(s: &mut Session, peer: &mut Demuxer) -> Vec<crate::chunk::Message> {
        let mut wire = BytesMut::new();
        s.out
            .flush(|b| {
                wire.extend_from_slice(b);
                Ok(b.len())
            })
            .unwrap();
        std::iter::from_fn(|| peer.poll(&mut wire).unwrap()).collect()
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut s = session(RtmpConfig::default());
        assert!(s.finalize("first"));
        assert!(!s.finalize("second"));
        assert_eq!(s.closed_reason(), Some("first"));
    }

    #[test]
    fn ack_sent_when_window_fills() {
        let mut s = session(RtmpConfig::default());
        s.ack_size = 1000;
        s.on_received(600).unwrap();
        assert!(s.out.is_empty());
        s.on_received(600).unwrap();
        assert_eq!(s.out.len(), 1);

        let mut peer = Demuxer::new(32, 1 << 20, true);
        let msgs = drain(&mut s, &mut peer);
        assert_eq!(msgs[0].header.msg_type, MessageType::Ack as u8);
        assert_eq!(msgs[0].payload.to_vec(), 1200u32.to_be_bytes());
    }

    #[test]
    fn received_counter_wraps() {
        let mut s = session(RtmpConfig::default());
        s.on_received(0xEFFF_FFFF).unwrap();
        s.on_received(1).unwrap();
        assert_eq!(s.in_bytes(), 0);
        s.on_received(10).unwrap();
        assert_eq!(s.in_bytes(), 10);
    }

    #[test]
    fn no_ack_without_window() {
        let mut s = session(RtmpConfig::default());
        s.on_received(10_000_000).unwrap();
        assert!(s.out.is_empty());
    }

    #[test]
    fn ping_cycle() {
        let mut s = session(RtmpConfig::default());
        let ping = Duration::from_millis(s.config.timeouts.ping_ms);
        let wait = Duration::from_millis(s.config.timeouts.ping_timeout_ms);

        s.on_received(1).unwrap();
        assert_eq!(s.ping_tick().unwrap(), Some(ping), "recent I/O rearms");

        assert_eq!(s.ping_tick().unwrap(), Some(wait), "idle sends a ping");
        let mut peer = Demuxer::new(32, 1 << 20, true);
        let msgs = drain(&mut s, &mut peer);
        assert_eq!(msgs[0].header.msg_type, MessageType::UserControl as u8);
        assert_eq!(&msgs[0].payload.to_vec()[..2], &[0, 6]);

        assert!(matches!(s.ping_tick(), Err(SessionError::PingTimeout)));
    }

    #[test]
    fn ping_answered_by_io() {
        let mut s = session(RtmpConfig::default());
        s.ping_tick().unwrap();
        s.on_received(6).unwrap();
        assert!(s.ping_tick().unwrap().is_some());
        assert!(s.ping_tick().unwrap().is_some());
    }

    #[test]
    fn busy_session_idle_between_pings_is_dropped() {
        let mut config = RtmpConfig::default();
        config.chunk.busy = true;
        let mut s = session(config);

        s.on_received(1).unwrap();
        assert!(s.ping_tick().unwrap().is_some(), "recent I/O rearms");
        assert!(matches!(s.ping_tick(), Err(SessionError::Idle)));
        assert!(s.out.is_empty(), "no ping request sent");
    }

    #[test]
    fn ping_disabled() {
        let mut config = RtmpConfig::default();
        config.timeouts.ping_ms = 0;
        let mut s = session(config);
        assert_eq!(s.ping_tick().unwrap(), None);
    }

    #[test]
    fn chunk_size_announcement_switches_out_pool() {
        let mut s = session(RtmpConfig::default());
        assert_eq!(s.out_pool().chunk_size(), DEFAULT_CHUNK_SIZE);
        s.send_control(ControlMessage::SetChunkSize(4096)).unwrap();
        assert_eq!(s.out_pool().chunk_size(), 4096);

        s.send_amf(3, 0, &[Value::string("x".repeat(1000))]).unwrap();

        let mut peer = Demuxer::new(32, 1 << 20, true);
        let mut wire = BytesMut::new();
        s.out
            .flush(|b| {
                wire.extend_from_slice(b);
                Ok(b.len())
            })
            .unwrap();
        let first = peer.poll(&mut wire).unwrap().unwrap();
        let size = u32::from_be_bytes(first.payload.to_vec().try_into().unwrap());
        peer.set_chunk_size(size, first.header.csid).unwrap();
        let second = peer.poll(&mut wire).unwrap().unwrap();
        assert_eq!(second.header.mlen, 1003);
        assert!(wire.is_empty());
    }
}
