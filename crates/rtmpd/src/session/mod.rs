//! Sessions: one per accepted connection.
//!
//! A session starts with the handshake, then runs the connection loop
//! until it is finalized. Every fatal condition ends up as a
//! `SessionError` passed to `Session::finalize`.

pub mod conn;
pub mod handshake;
pub mod listener;
pub mod state;

pub use handshake::{Handshake, HandshakeBuffer, HandshakePool};
pub use state::{ConnectInfo, Session};

use rtmp_core::amf::AmfError;
use rtmp_core::crypto::HandshakeError;
use rtmp_core::wire::WireError;
use rtmp_core::{ChunkError, PoolError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("AMF: {0}")]
    Amf(#[from] AmfError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("ping unanswered")]
    PingTimeout,

    #[error("idle between pings")]
    Idle,

    #[error("duplicate connect")]
    DuplicateConnect,

    #[error("application not found: {0}")]
    UnknownApplication(String),
}
