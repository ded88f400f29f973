//! Chunk transport: the framing layer between the byte stream and
//! messages.
//!
//! Inbound bytes go through `receive::Demuxer`; outbound messages are
//! framed by `send::prepare_message` and wait in a `queue::OutQueue` until
//! the socket takes them.

pub mod queue;
pub mod receive;
pub mod send;

pub use queue::OutQueue;
pub use receive::{Demuxer, Message};
pub use send::{prepare_message, Sent};
