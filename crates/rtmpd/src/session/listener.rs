//! TCP listener and worker contexts.
//!
//! The accept loop runs on the caller's runtime and hands sockets round
//! robin to worker threads. Each worker is a single-threaded runtime with
//! a `LocalSet`, owning its buffer pools and every connection it was
//! given; nothing per-connection crosses threads after the handoff.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::LocalSet;

use rtmp_core::RtmpConfig;

use super::conn;
use super::handshake::HandshakePool;
use super::Session;
use crate::dispatch::Dispatcher;

const LISTEN_BACKLOG: i32 = 1024;

/// An accepted socket on its way to a worker.
struct Accepted {
    id: u64,
    stream: std::net::TcpStream,
    peer_addr: SocketAddr,
}

pub struct Server {
    listener: std::net::TcpListener,
    config: Arc<RtmpConfig>,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Bind `config.server.listen`.
    pub fn bind(config: Arc<RtmpConfig>, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let addr = config.server.listen;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("failed to create listen socket")?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind {addr}"))?;
        socket.listen(LISTEN_BACKLOG)?;

        Ok(Self { listener: socket.into(), config, dispatcher })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires. Workers exit once the accept loop
    /// stops feeding them.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::from_std(self.listener)?;
        let workers = self.config.server.workers.max(1);
        tracing::info!(addr = %listener.local_addr()?, workers, "listening");

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let config = self.config.clone();
            let dispatcher = self.dispatcher.clone();
            let handle = thread::Builder::new()
                .name(format!("rtmpd-worker-{n}"))
                .spawn(move || worker(n, rx, config, dispatcher))
                .context("failed to spawn worker")?;
            senders.push(tx);
            handles.push(handle);
        }

        let next_id = AtomicU64::new(1);
        let mut next_worker = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer_addr, error = %e, "set_nodelay failed");
                    }
                    let stream = match stream.into_std() {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(%peer_addr, error = %e, "failed to detach socket");
                            continue;
                        }
                    };

                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let accepted = Accepted { id, stream, peer_addr };
                    if senders[next_worker].send(accepted).is_err() {
                        anyhow::bail!("worker {next_worker} exited");
                    }
                    next_worker = (next_worker + 1) % senders.len();
                }
            }
        }

        drop(senders);
        tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("worker panicked");
                }
            }
        })
        .await?;
        Ok(())
    }
}

fn worker(
    n: usize,
    rx: mpsc::UnboundedReceiver<Accepted>,
    config: Arc<RtmpConfig>,
    dispatcher: Arc<Dispatcher>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(worker = n, error = %e, "failed to build worker runtime");
            return;
        }
    };
    let local = LocalSet::new();
    local.block_on(&rt, worker_loop(n, rx, config, dispatcher));
    tracing::debug!(worker = n, "worker stopped");
}

async fn worker_loop(
    n: usize,
    mut rx: mpsc::UnboundedReceiver<Accepted>,
    config: Arc<RtmpConfig>,
    dispatcher: Arc<Dispatcher>,
) {
    let handshakes = HandshakePool::new();
    while let Some(Accepted { id, stream, peer_addr }) = rx.recv().await {
        let stream = match TcpStream::from_std(stream) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(worker = n, %peer_addr, error = %e, "failed to register socket");
                continue;
            }
        };
        tracing::trace!(worker = n, id, %peer_addr, "connection assigned");

        let session = Session::new(id, peer_addr, config.clone());
        let dispatcher = dispatcher.clone();
        let handshakes = handshakes.clone();
        tokio::task::spawn_local(async move {
            conn::run(stream, session, &dispatcher, &handshakes).await;
        });
    }
}
