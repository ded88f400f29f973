//! Handshake state machine, server and client roles.
//!
//! The machine does no I/O itself. It exposes one window of its buffer at
//! a time: `want()` says whether the window is to be filled from the peer
//! or written to it, and the `advance_*` calls report progress. When a
//! window completes the machine moves to its next stage.
//!
//! Server:  recv C0C1 → send S0S1 → send S2 → recv C2 → done
//! Client:  send C0C1 → recv S0S1 → recv S2 → send C2 → done
//!
//! Digest mode is used when the peer's challenge carries a version and a
//! valid digest; otherwise the server falls back to echoing the client's
//! own packets back.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::net::TcpStream;

use rtmp_core::crypto::{
    self, HandshakeError, Keys, CLIENT_KEYS, DIGEST_LEN, PACKET_LEN, SERVER_KEYS,
};
use rtmp_core::wire::RTMP_VERSION;

use super::SessionError;

/// One version byte plus one packet.
pub const BUFFER_LEN: usize = PACKET_LEN + 1;

// ── Buffer free list ──────────────────────────────────────────────────────────

type FreeList = RefCell<Vec<Box<[u8; BUFFER_LEN]>>>;

/// Handshake buffers recycled across connections of one worker.
#[derive(Clone, Default)]
pub struct HandshakePool {
    free: Rc<FreeList>,
}

impl HandshakePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> HandshakeBuffer {
        let data = self
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| Box::new([0u8; BUFFER_LEN]));
        HandshakeBuffer { data: Some(data), pool: Rc::downgrade(&self.free) }
    }

    pub fn free_buffers(&self) -> usize {
        self.free.borrow().len()
    }
}

/// A buffer on loan from a `HandshakePool`. Returned on drop.
pub struct HandshakeBuffer {
    data: Option<Box<[u8; BUFFER_LEN]>>,
    pool: Weak<FreeList>,
}

impl HandshakeBuffer {
    /// A buffer that belongs to no pool.
    pub fn unpooled() -> Self {
        Self { data: Some(Box::new([0u8; BUFFER_LEN])), pool: Weak::new() }
    }

    fn bytes(&self) -> &[u8] {
        match &self.data {
            Some(d) => &d[..],
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(d) => &mut d[..],
            None => &mut [],
        }
    }
}

impl Drop for HandshakeBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) {
            pool.borrow_mut().push(data);
        }
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ServerRecvChallenge,
    ServerSendChallenge,
    ServerSendResponse,
    ServerRecvResponse,
    ClientSendChallenge,
    ClientRecvChallenge,
    ClientRecvResponse,
    ClientSendResponse,
    Done,
}

/// What the machine needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
    Done,
}

pub struct Handshake {
    role: Role,
    stage: Stage,
    buf: HandshakeBuffer,
    /// Current window is `buf[pos..last]`.
    pos: usize,
    last: usize,
    epoch: u32,
    peer_epoch: u32,
    /// Echo the peer's packets instead of answering with digests.
    legacy: bool,
    /// Key for the digest on our response.
    response_key: Option<[u8; DIGEST_LEN]>,
    /// Digest embedded in the challenge we sent.
    own_digest: Option<[u8; DIGEST_LEN]>,
    verified: Option<bool>,
    rng: StdRng,
}

impl Handshake {
    /// Server side: waits for C0C1.
    pub fn server(buf: HandshakeBuffer, epoch: u32) -> Self {
        Self::server_with_rng(buf, epoch, StdRng::from_entropy())
    }

    pub fn server_with_rng(buf: HandshakeBuffer, epoch: u32, rng: StdRng) -> Self {
        Self::with(Role::Server, Stage::ServerRecvChallenge, buf, epoch, rng)
    }

    /// Client side: C0C1 is ready to send immediately.
    pub fn client(buf: HandshakeBuffer, epoch: u32) -> Self {
        Self::client_with_rng(buf, epoch, StdRng::from_entropy())
    }

    pub fn client_with_rng(buf: HandshakeBuffer, epoch: u32, rng: StdRng) -> Self {
        let mut hs = Self::with(Role::Client, Stage::ClientSendChallenge, buf, epoch, rng);
        hs.create_challenge(&CLIENT_KEYS);
        hs
    }

    fn with(role: Role, stage: Stage, buf: HandshakeBuffer, epoch: u32, rng: StdRng) -> Self {
        Self {
            role,
            stage,
            buf,
            pos: 0,
            last: BUFFER_LEN,
            epoch,
            peer_epoch: 0,
            legacy: false,
            response_key: None,
            own_digest: None,
            verified: None,
            rng,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn want(&self) -> Want {
        match self.stage {
            Stage::ServerRecvChallenge
            | Stage::ServerRecvResponse
            | Stage::ClientRecvChallenge
            | Stage::ClientRecvResponse => Want::Read,
            Stage::ServerSendChallenge
            | Stage::ServerSendResponse
            | Stage::ClientSendChallenge
            | Stage::ClientSendResponse => Want::Write,
            Stage::Done => Want::Done,
        }
    }

    pub fn peer_epoch(&self) -> u32 {
        self.peer_epoch
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Outcome of checking the peer's response digest. `None` when the
    /// exchange was legacy or the check has not happened yet.
    pub fn response_verified(&self) -> Option<bool> {
        self.verified
    }

    /// Space to fill with bytes from the peer.
    pub fn read_buf(&mut self) -> &mut [u8] {
        let (pos, last) = (self.pos, self.last);
        &mut self.buf.bytes_mut()[pos..last]
    }

    /// Bytes to send to the peer.
    pub fn write_buf(&self) -> &[u8] {
        &self.buf.bytes()[self.pos..self.last]
    }

    pub fn advance_read(&mut self, n: usize) -> Result<(), HandshakeError> {
        self.advance(n)
    }

    pub fn advance_write(&mut self, n: usize) -> Result<(), HandshakeError> {
        self.advance(n)
    }

    fn advance(&mut self, n: usize) -> Result<(), HandshakeError> {
        self.pos = (self.pos + n).min(self.last);
        if self.pos == self.last && self.stage != Stage::Done {
            self.step()?;
        }
        Ok(())
    }

    fn window(&mut self, from: usize) {
        self.pos = from;
        self.last = BUFFER_LEN;
    }

    /// The current window completed.
    fn step(&mut self) -> Result<(), HandshakeError> {
        tracing::trace!(stage = ?self.stage, "handshake stage complete");
        self.stage = match self.stage {
            Stage::ServerRecvChallenge => {
                self.parse_challenge(&CLIENT_KEYS, &SERVER_KEYS)?;
                if self.legacy {
                    tracing::debug!("handshake: old-style challenge");
                } else {
                    self.create_challenge(&SERVER_KEYS);
                }
                self.window(0);
                Stage::ServerSendChallenge
            }
            Stage::ServerSendChallenge => {
                if !self.legacy {
                    self.create_response();
                }
                self.window(1);
                Stage::ServerSendResponse
            }
            Stage::ServerSendResponse => {
                self.window(1);
                Stage::ServerRecvResponse
            }
            Stage::ServerRecvResponse => {
                self.verify_response(CLIENT_KEYS.full);
                Stage::Done
            }
            Stage::ClientSendChallenge => {
                self.window(0);
                Stage::ClientRecvChallenge
            }
            Stage::ClientRecvChallenge => {
                self.parse_challenge(&SERVER_KEYS, &CLIENT_KEYS)?;
                self.window(1);
                Stage::ClientRecvResponse
            }
            Stage::ClientRecvResponse => {
                self.verify_response(SERVER_KEYS.full);
                self.create_response();
                self.window(1);
                Stage::ClientSendResponse
            }
            Stage::ClientSendResponse | Stage::Done => Stage::Done,
        };
        Ok(())
    }

    /// Read the peer's C0C1/S0S1.
    ///
    /// `peer` keys the peer's challenge digest; `own` derives the key for
    /// our response digest.
    fn parse_challenge(&mut self, peer: &Keys, own: &Keys) -> Result<(), HandshakeError> {
        let b = self.buf.bytes();
        if b.len() < BUFFER_LEN {
            return Err(HandshakeError::Truncated(b.len()));
        }
        if b[0] != RTMP_VERSION {
            return Err(HandshakeError::BadVersion(b[0]));
        }
        let packet = &b[1..];
        self.peer_epoch = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let version = [packet[4], packet[5], packet[6], packet[7]];
        tracing::debug!(
            peer_epoch = self.peer_epoch,
            version = hex::encode(version),
            "handshake: peer challenge"
        );

        if version == [0; 4] {
            self.legacy = true;
            return Ok(());
        }
        let Some(offset) = crypto::find_digest(packet, peer.partial) else {
            tracing::debug!("handshake: digest not found");
            self.legacy = true;
            return Ok(());
        };
        let digest = &packet[offset..offset + DIGEST_LEN];
        self.response_key = Some(crypto::hmac_sha256(own.full, &[digest]));
        Ok(())
    }

    /// Fill the buffer with our C0C1/S0S1.
    fn create_challenge(&mut self, own: &Keys) {
        let epoch = self.epoch;
        let b = self.buf.bytes_mut();
        b[0] = RTMP_VERSION;
        b[1..5].copy_from_slice(&epoch.to_be_bytes());
        b[5..9].copy_from_slice(&own.version);
        self.rng.fill_bytes(&mut b[9..]);

        let packet = &mut b[1..];
        let offset = crypto::write_digest(packet, own.partial);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&packet[offset..offset + DIGEST_LEN]);
        tracing::trace!(digest = hex::encode(digest), "handshake: challenge digest");
        self.own_digest = Some(digest);
    }

    /// Fill the packet area with our C2/S2.
    fn create_response(&mut self) {
        let key = self.response_key;
        let b = self.buf.bytes_mut();
        let packet = &mut b[1..];
        self.rng.fill_bytes(packet);
        if let Some(key) = key {
            let digest = crypto::response_digest(&key, packet);
            packet[PACKET_LEN - DIGEST_LEN..].copy_from_slice(&digest);
        }
    }

    /// Check the peer's C2/S2 against the challenge digest we sent.
    fn verify_response(&mut self, peer_full_key: &[u8]) {
        let (Some(own), false) = (self.own_digest, self.legacy) else {
            return;
        };
        let ok = crypto::verify_response(peer_full_key, &own, &self.buf.bytes()[1..]);
        if !ok {
            tracing::debug!(role = ?self.role, "handshake: peer response digest mismatch");
        }
        self.verified = Some(ok);
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// Run `hs` to completion over `stream`, bounded by `limit`.
pub async fn drive(stream: &TcpStream, hs: &mut Handshake, limit: Duration) -> Result<(), SessionError> {
    tokio::time::timeout(limit, exchange(stream, hs))
        .await
        .map_err(|_| SessionError::Timeout("handshake"))?
}

async fn exchange(stream: &TcpStream, hs: &mut Handshake) -> Result<(), SessionError> {
    loop {
        match hs.want() {
            Want::Read => {
                stream.readable().await?;
                match stream.try_read(hs.read_buf()) {
                    Ok(0) => return Err(SessionError::PeerClosed),
                    Ok(n) => hs.advance_read(n)?,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Want::Write => {
                stream.writable().await?;
                match stream.try_write(hs.write_buf()) {
                    Ok(n) => hs.advance_write(n)?,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Want::Done => return Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    /// Move bytes from a writer to a reader. Returns false if neither side
    /// is in position.
    fn transfer(from: &mut Handshake, to: &mut Handshake) -> bool {
        if from.want() != Want::Write || to.want() != Want::Read {
            return false;
        }
        let n = from.write_buf().len().min(to.read_buf().len());
        let chunk = from.write_buf()[..n].to_vec();
        to.read_buf()[..n].copy_from_slice(&chunk);
        from.advance_write(n).unwrap();
        to.advance_read(n).unwrap();
        true
    }

    fn run(server: &mut Handshake, client: &mut Handshake) {
        for _ in 0..16 {
            let moved = transfer(client, server) | transfer(server, client);
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn digest_handshake_completes_and_verifies() {
        let pool = HandshakePool::new();
        let mut server = Handshake::server_with_rng(pool.acquire(), 1000, rng(1));
        let mut client = Handshake::client_with_rng(pool.acquire(), 2000, rng(2));
        run(&mut server, &mut client);

        assert_eq!(server.want(), Want::Done);
        assert_eq!(client.want(), Want::Done);
        assert!(!server.is_legacy() && !client.is_legacy());
        assert_eq!(server.peer_epoch(), 2000);
        assert_eq!(client.peer_epoch(), 1000);
        assert_eq!(server.response_verified(), Some(true));
        assert_eq!(client.response_verified(), Some(true));
    }

    #[test]
    fn legacy_client_gets_echo() {
        let mut c0c1 = vec![3u8, 0, 0, 0, 9, 0, 0, 0, 0];
        c0c1.extend((0..PACKET_LEN - 8).map(|i| (i * 7) as u8));

        let mut server = Handshake::server_with_rng(HandshakeBuffer::unpooled(), 0, rng(3));
        server.read_buf().copy_from_slice(&c0c1);
        server.advance_read(BUFFER_LEN).unwrap();
        assert!(server.is_legacy());
        assert_eq!(server.peer_epoch(), 9);

        assert_eq!(server.want(), Want::Write);
        assert_eq!(server.write_buf(), &c0c1[..]);
        server.advance_write(BUFFER_LEN).unwrap();
        assert_eq!(server.write_buf(), &c0c1[1..]);
        server.advance_write(PACKET_LEN).unwrap();

        assert_eq!(server.want(), Want::Read);
        assert_eq!(server.read_buf().len(), PACKET_LEN);
        server.advance_read(PACKET_LEN).unwrap();
        assert_eq!(server.want(), Want::Done);
        assert_eq!(server.response_verified(), None);
    }

    #[test]
    fn unknown_digest_falls_back_to_legacy() {
        let mut c0c1 = vec![3u8, 0, 0, 0, 0, 1, 2, 3, 4];
        c0c1.resize(BUFFER_LEN, 0x42);
        let mut server = Handshake::server_with_rng(HandshakeBuffer::unpooled(), 0, rng(4));
        server.read_buf().copy_from_slice(&c0c1);
        server.advance_read(BUFFER_LEN).unwrap();
        assert!(server.is_legacy());
        assert_eq!(server.write_buf(), &c0c1[..]);
    }

    #[test]
    fn tampered_challenge_falls_back_to_echo() {
        let client = Handshake::client_with_rng(HandshakeBuffer::unpooled(), 0, rng(11));
        let mut c0c1 = client.write_buf().to_vec();
        // Covered by the digest, outside both digest fields and their locators.
        c0c1[1 + 1200] ^= 0x01;

        let mut server = Handshake::server_with_rng(HandshakeBuffer::unpooled(), 0, rng(12));
        server.read_buf().copy_from_slice(&c0c1);
        server.advance_read(BUFFER_LEN).unwrap();
        assert!(server.is_legacy());
        assert_eq!(server.write_buf(), &c0c1[..]);
        server.advance_write(BUFFER_LEN).unwrap();
        assert_eq!(server.write_buf(), &c0c1[1..]);
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut server = Handshake::server_with_rng(HandshakeBuffer::unpooled(), 0, rng(5));
        server.read_buf()[0] = 6;
        assert!(matches!(
            server.advance_read(BUFFER_LEN),
            Err(HandshakeError::BadVersion(6))
        ));
    }

    #[test]
    fn partial_reads_accumulate() {
        let mut server = Handshake::server_with_rng(HandshakeBuffer::unpooled(), 0, rng(6));
        let mut client = Handshake::client_with_rng(HandshakeBuffer::unpooled(), 0, rng(7));
        let c0c1 = client.write_buf().to_vec();
        for piece in c0c1.chunks(100) {
            assert_eq!(server.want(), Want::Read);
            server.read_buf()[..piece.len()].copy_from_slice(piece);
            server.advance_read(piece.len()).unwrap();
        }
        assert_eq!(server.want(), Want::Write);
        assert_eq!(server.stage(), Stage::ServerSendChallenge);
    }

    #[test]
    fn client_against_echo_server_is_legacy() {
        let mut client = Handshake::client_with_rng(HandshakeBuffer::unpooled(), 0, rng(8));
        let c0c1 = client.write_buf().to_vec();
        client.advance_write(BUFFER_LEN).unwrap();

        // Echo server sends C0C1 back as S0S1, then C1 as S2.
        client.read_buf().copy_from_slice(&c0c1);
        client.advance_read(BUFFER_LEN).unwrap();
        assert!(client.is_legacy());
        client.read_buf().copy_from_slice(&c0c1[1..]);
        client.advance_read(PACKET_LEN).unwrap();
        assert_eq!(client.want(), Want::Write);
        assert_eq!(client.response_verified(), None);
    }

    #[test]
    fn tampered_response_fails_verification_but_completes() {
        let mut server = Handshake::server_with_rng(HandshakeBuffer::unpooled(), 0, rng(9));
        let mut client = Handshake::client_with_rng(HandshakeBuffer::unpooled(), 0, rng(10));
        // C0C1, S0S1, S2
        assert!(transfer(&mut client, &mut server));
        assert!(transfer(&mut server, &mut client));
        assert!(transfer(&mut server, &mut client));
        assert_eq!(client.want(), Want::Write);

        let mut c2 = client.write_buf().to_vec();
        c2[10] ^= 0xff;
        server.read_buf().copy_from_slice(&c2);
        server.advance_read(PACKET_LEN).unwrap();
        assert_eq!(server.want(), Want::Done);
        assert_eq!(server.response_verified(), Some(false));
    }

    #[test]
    fn buffers_return_to_pool() {
        let pool = HandshakePool::new();
        let hs = Handshake::server(pool.acquire(), 0);
        assert_eq!(pool.free_buffers(), 0);
        drop(hs);
        assert_eq!(pool.free_buffers(), 1);
        let _again = pool.acquire();
        assert_eq!(pool.free_buffers(), 0);
    }

    #[tokio::test]
    async fn handshake_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = async {
            let (stream, _) = listener.accept().await.unwrap();
            let mut hs = Handshake::server(HandshakeBuffer::unpooled(), 0);
            drive(&stream, &mut hs, Duration::from_secs(5)).await.unwrap();
            hs.response_verified()
        };
        let client = async {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut hs = Handshake::client(HandshakeBuffer::unpooled(), 0);
            drive(&stream, &mut hs, Duration::from_secs(5)).await.unwrap();
            hs.response_verified()
        };
        let (s, c) = tokio::join!(server, client);
        assert_eq!((s, c), (Some(true), Some(true)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut hs = Handshake::server(HandshakeBuffer::unpooled(), 0);
        let err = drive(&stream, &mut hs, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout("handshake")));
    }
}
