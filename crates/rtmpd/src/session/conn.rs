//! Connection loop: handshake, then read / dispatch / write until the
//! session is finalized.
//!
//! All progress lives in the `Session`; each readiness wakeup does as much
//! work as the socket allows and goes back to waiting.

use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::handshake::{self, Handshake, HandshakePool};
use super::{Session, SessionError};
use crate::dispatch::{Dispatcher, Event};

/// Socket read granularity.
const READ_CHUNK: usize = 16 * 1024;

/// Stand-in deadline for a disabled keepalive timer.
const NEVER: Duration = Duration::from_secs(86_400 * 365);

/// Serve one accepted connection to the end. Always finalizes the session
/// and fires `Event::Disconnect` exactly once.
pub async fn run(stream: TcpStream, mut s: Session, d: &Dispatcher, handshakes: &HandshakePool) {
    tracing::debug!(id = s.id, peer = %s.peer_addr, "connection accepted");

    let reason = match serve(&stream, &mut s, d, handshakes).await {
        Ok(()) => "closed".to_string(),
        Err(e) => e.to_string(),
    };
    close(&mut s, d, reason);
}

/// Finalize `s` and tell the handlers. Safe to call more than once.
pub fn close(s: &mut Session, d: &Dispatcher, reason: impl std::fmt::Display) {
    if !s.finalize(reason) {
        return;
    }
    if let Err(e) = d.fire(s, Event::Disconnect) {
        tracing::debug!(id = s.id, error = %e, "disconnect handler failed");
    }
}

async fn serve(
    stream: &TcpStream,
    s: &mut Session,
    d: &Dispatcher,
    handshakes: &HandshakePool,
) -> Result<(), SessionError> {
    {
        let mut hs = Handshake::server(handshakes.acquire(), s.epoch);
        handshake::drive(stream, &mut hs, s.config.timeouts.timeout()).await?;
        s.peer_epoch = hs.peer_epoch();
        tracing::debug!(id = s.id, legacy = hs.is_legacy(), peer_epoch = s.peer_epoch, "handshake done");
    }
    d.fire(s, Event::HandshakeDone)?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut ping_enabled = s.config.timeouts.ping().is_some();
    let ping = tokio::time::sleep(s.config.timeouts.ping().unwrap_or(NEVER));
    tokio::pin!(ping);

    while !s.is_closed() {
        tokio::select! {
            r = stream.readable() => {
                r?;
                buf.reserve(READ_CHUNK);
                match stream.try_read_buf(&mut buf) {
                    Ok(0) => return Err(SessionError::PeerClosed),
                    Ok(n) => {
                        s.on_received(n)?;
                        receive(s, d, &mut buf)?;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            r = stream.writable(), if s.out.wants_write() => {
                r?;
                flush(stream, s)?;
            }

            () = &mut ping, if ping_enabled => {
                match s.ping_tick()? {
                    Some(next) => ping.as_mut().reset(Instant::now() + next),
                    None => ping_enabled = false,
                }
            }
        }
    }
    Ok(())
}

/// Dispatch every complete message in `buf`.
fn receive(s: &mut Session, d: &Dispatcher, buf: &mut BytesMut) -> Result<(), SessionError> {
    while let Some(msg) = s.demux.poll(buf)? {
        d.dispatch(s, &msg)?;
        if s.is_closed() {
            return Ok(());
        }
    }
    s.demux.finish_drain();
    Ok(())
}

fn flush(stream: &TcpStream, s: &mut Session) -> Result<(), SessionError> {
    let mut wrote = 0;
    let done = s.out.flush(|bytes| {
        let n = stream.try_write(bytes)?;
        wrote += n;
        Ok(n)
    })?;
    tracing::trace!(id = s.id, wrote, done, "flushed");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rtmp_core::RtmpConfig;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::dispatch::Outcome;
    use crate::session::HandshakeBuffer;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn counting(d: &mut Dispatcher, event: Event) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        d.on_event(event, move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Continue)
        });
        hits
    }

    #[tokio::test]
    async fn peer_hangup_during_handshake_finalizes_once() {
        let (server, client) = pair().await;
        drop(client);

        let mut d = Dispatcher::new();
        let done = counting(&mut d, Event::HandshakeDone);
        let gone = counting(&mut d, Event::Disconnect);

        let addr = server.peer_addr().unwrap();
        let s = Session::new(1, addr, Arc::new(RtmpConfig::default()));
        run(server, s, &d, &HandshakePool::new()).await;

        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(gone.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handshake_then_hangup() {
        let (server, client) = pair().await;

        let mut d = Dispatcher::new();
        let done = counting(&mut d, Event::HandshakeDone);
        let gone = counting(&mut d, Event::Disconnect);

        let peer = async move {
            let mut hs = Handshake::client(HandshakeBuffer::unpooled(), 0);
            handshake::drive(&client, &mut hs, Duration::from_secs(5)).await.unwrap();
            let mut client = client;
            client.shutdown().await.unwrap();
        };

        let addr = server.peer_addr().unwrap();
        let pool = HandshakePool::new();
        let s = Session::new(2, addr, Arc::new(RtmpConfig::default()));
        tokio::join!(run(server, s, &d, &pool), peer);

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(gone.load(Ordering::SeqCst), 1);
        assert_eq!(pool.free_buffers(), 1, "handshake buffer returned");
    }

    #[test]
    fn close_is_idempotent() {
        let mut d = Dispatcher::new();
        let gone = counting(&mut d, Event::Disconnect);
        let mut s = Session::new(3, "127.0.0.1:1".parse().unwrap(), Arc::new(RtmpConfig::default()));
        close(&mut s, &d, "first");
        close(&mut s, &d, "second");
        assert_eq!(gone.load(Ordering::SeqCst), 1);
        assert_eq!(s.closed_reason(), Some("first"));
    }
}
