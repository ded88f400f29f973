//! Routes complete messages to handlers by message type, and command
//! messages on to handlers by command name.
//!
//! Tables are filled once at startup and shared read-only by every worker.
//! Handlers registered for the same key run in registration order until
//! one returns `Outcome::Handled` or an error.

use std::collections::HashMap;

use rtmp_core::amf::Cursor;
use rtmp_core::wire::MSG_MAX;
use rtmp_core::{Header, MessageType};

use crate::chunk::Message;
use crate::session::{Session, SessionError};

/// What a handler wants done with the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// Stop; later handlers for this message are skipped.
    Handled,
}

/// `Err` finalizes the session.
pub type HandlerResult = Result<Outcome, SessionError>;

pub type MessageHandler =
    Box<dyn Fn(&Dispatcher, &mut Session, &Message) -> HandlerResult + Send + Sync>;

/// Gets a cursor positioned just past the command name.
pub type CommandHandler = Box<
    dyn Fn(&Dispatcher, &mut Session, &Header, &mut Cursor<'_>) -> HandlerResult + Send + Sync,
>;

pub type EventHandler = Box<dyn Fn(&mut Session) -> HandlerResult + Send + Sync>;

/// Connection lifecycle points that run through the table like messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Connect,
    Disconnect,
    HandshakeDone,
}

impl Event {
    fn index(self) -> usize {
        match self {
            Self::Connect => 0,
            Self::Disconnect => 1,
            Self::HandshakeDone => 2,
        }
    }
}

pub struct Dispatcher {
    /// Indexed by message type, 0..=MSG_MAX.
    types: Vec<Vec<MessageHandler>>,
    /// Keyed by lowercased command name.
    commands: HashMap<String, Vec<CommandHandler>>,
    events: [Vec<EventHandler>; 3],
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// An empty table. See `handlers::register_defaults` for the built-ins.
    pub fn new() -> Self {
        Self {
            types: (0..=MSG_MAX).map(|_| Vec::new()).collect(),
            commands: HashMap::new(),
            events: Default::default(),
        }
    }

    // ── Registration ──────────────────────────────────────────────────────────

    pub fn register<F>(&mut self, msg_type: MessageType, handler: F)
    where
        F: Fn(&Dispatcher, &mut Session, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.types[msg_type as usize].push(Box::new(handler));
    }

    pub fn register_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Dispatcher, &mut Session, &Header, &mut Cursor<'_>) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.commands
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn on_event<F>(&mut self, event: Event, handler: F)
    where
        F: Fn(&mut Session) -> HandlerResult + Send + Sync + 'static,
    {
        self.events[event.index()].push(Box::new(handler));
    }

    pub fn handler_count(&self, msg_type: MessageType) -> usize {
        self.types[msg_type as usize].len()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_ascii_lowercase())
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Run the handler chain for one complete message.
    pub fn dispatch(&self, s: &mut Session, msg: &Message) -> Result<(), SessionError> {
        let h = &msg.header;
        tracing::trace!(
            id = s.id,
            csid = h.csid,
            msg_type = h.msg_type,
            mlen = h.mlen,
            timestamp = h.timestamp,
            msid = h.msid,
            "message received"
        );

        let Some(chain) = self.types.get(h.msg_type as usize) else {
            tracing::debug!(id = s.id, msg_type = h.msg_type, "unexpected message type, ignored");
            return Ok(());
        };
        for handler in chain {
            if handler(self, s, msg)? == Outcome::Handled {
                break;
            }
        }
        Ok(())
    }

    /// Run the handlers registered for command `name`. Each handler starts
    /// from the same position in `cur`. Returns `None` when no handler is
    /// registered under that name.
    pub fn dispatch_command(
        &self,
        s: &mut Session,
        h: &Header,
        name: &str,
        cur: &Cursor<'_>,
    ) -> Option<HandlerResult> {
        let chain = self.commands.get(&name.to_ascii_lowercase())?;
        for handler in chain {
            match handler(self, s, h, &mut cur.clone()) {
                Ok(Outcome::Continue) => {}
                done => return Some(done),
            }
        }
        Some(Ok(Outcome::Continue))
    }

    pub fn fire(&self, s: &mut Session, event: Event) -> Result<(), SessionError> {
        tracing::trace!(id = s.id, ?event, "event");
        for handler in &self.events[event.index()] {
            if handler(s)? == Outcome::Handled {
                break;
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rtmp_core::{BufferPool, RtmpConfig};

    fn session() -> Session {
        Session::new(1, "127.0.0.1:1".parse().unwrap(), Arc::new(RtmpConfig::default()))
    }

    fn message(msg_type: u8, body: &[u8]) -> Message {
        let pool = BufferPool::new(128);
        let payload = pool.chain_from(body).unwrap();
        let header = Header {
            csid: 3,
            timestamp: 0,
            mlen: body.len() as u32,
            msg_type,
            msid: 0,
        };
        Message { header, payload }
    }

    #[test]
    fn chain_runs_in_order_until_handled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut d = Dispatcher::new();
        for (i, outcome) in [Outcome::Continue, Outcome::Handled, Outcome::Continue]
            .into_iter()
            .enumerate()
        {
            let calls = calls.clone();
            d.register(MessageType::Audio, move |_, _, _| {
                assert_eq!(calls.fetch_add(1, Ordering::SeqCst), i);
                Ok(outcome)
            });
        }
        d.dispatch(&mut session(), &message(8, b"x")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_error_stops_chain() {
        let mut d = Dispatcher::new();
        d.register(MessageType::Video, |_, _, _| Err(SessionError::PeerClosed));
        d.register(MessageType::Video, |_, _, _| panic!("must not run"));
        assert!(matches!(
            d.dispatch(&mut session(), &message(9, b"x")),
            Err(SessionError::PeerClosed)
        ));
    }

    #[test]
    fn unknown_type_is_ignored() {
        let d = Dispatcher::new();
        d.dispatch(&mut session(), &message(200, b"")).unwrap();
        d.dispatch(&mut session(), &message(7, b"")).unwrap();
    }

    #[test]
    fn commands_match_case_insensitively() {
        let mut d = Dispatcher::new();
        d.register_command("createStream", |_, _, _, cur| {
            assert_eq!(cur.read_u8().unwrap(), 0xAA);
            Ok(Outcome::Continue)
        });
        d.register_command("CREATESTREAM", |_, _, _, cur| {
            assert_eq!(cur.read_u8().unwrap(), 0xAA, "cursor rewound per handler");
            Ok(Outcome::Handled)
        });
        assert!(d.has_command("createstream"));

        let h = Header::default();
        let cur = Cursor::from_slice(&[0xAA]);
        let mut s = session();
        assert!(matches!(
            d.dispatch_command(&mut s, &h, "CreateStream", &cur),
            Some(Ok(Outcome::Handled))
        ));
        assert!(d.dispatch_command(&mut s, &h, "play", &cur).is_none());
    }

    #[test]
    fn events_fire_their_own_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut d = Dispatcher::new();
        let h = hits.clone();
        d.on_event(Event::Disconnect, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Continue)
        });
        let mut s = session();
        d.fire(&mut s, Event::Connect).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        d.fire(&mut s, Event::Disconnect).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
