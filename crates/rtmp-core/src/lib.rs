//! rtmp-core: wire format, buffer pool, AMF codec, and handshake digests.
//! The daemon and any client tooling build on this crate.

pub mod amf;
pub mod config;
pub mod crypto;
pub mod message;
pub mod pool;
pub mod wire;

pub use config::RtmpConfig;
pub use pool::{Block, BufferPool, Chain, PoolError, SharedChain};
pub use wire::{ChunkError, Header, MessageType};
