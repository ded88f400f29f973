//! rtmpd: the connection side of the protocol engine.
//!
//! Chunk transport, sessions and the handler table live here; the wire
//! format, buffers and codec come from `rtmp-core`.

pub mod chunk;
pub mod dispatch;
pub mod handlers;
pub mod session;

pub use dispatch::{Dispatcher, Event, Outcome};
pub use session::listener::Server;
pub use session::{Session, SessionError};
