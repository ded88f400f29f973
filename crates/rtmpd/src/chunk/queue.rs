//! Outbound queue: bounded ring of framed messages with priority drop and
//! corking.
//!
//! Admission rule, with `depth` counting the message being pushed:
//!   drop when depth + priority * capacity / 4 >= capacity
//!
//! So priority 0 may use every slot but one, priority 3 only a quarter.
//! Low-priority pushes do not request a flush until `cork` messages are
//! waiting, which batches small media frames into fewer writes.

use std::collections::VecDeque;
use std::io;

use rtmp_core::SharedChain;

pub const MAX_PRIORITY: u8 = 3;

#[derive(Debug)]
pub struct OutQueue {
    queue: VecDeque<SharedChain>,
    capacity: usize,
    cork: usize,
    busy: bool,
    flush_requested: bool,
    /// Write progress into the front message.
    block: usize,
    offset: usize,
}

impl OutQueue {
    pub fn new(capacity: usize, cork: usize, busy: bool) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            cork,
            busy,
            flush_requested: false,
            block: 0,
            offset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a framed message. Returns false when it was dropped.
    pub fn push(&mut self, chain: SharedChain, priority: u8) -> bool {
        let priority = priority.min(MAX_PRIORITY) as usize;
        let depth = self.queue.len() + 1;
        if depth + priority * self.capacity / 4 >= self.capacity {
            tracing::debug!(depth, priority, "outbound queue full, message dropped");
            return false;
        }
        self.queue.push_back(chain);

        if priority > 0 && !self.busy && depth < self.cork {
            return true;
        }
        self.flush_requested = true;
        true
    }

    /// Whether the connection should wait for write readiness.
    pub fn wants_write(&self) -> bool {
        self.flush_requested && !self.queue.is_empty()
    }

    /// Write queued bytes until the queue drains or `write` stops
    /// accepting. Returns true once everything was written.
    ///
    /// A partially written message keeps its position; the next call
    /// resumes there. Fully written messages are released.
    pub fn flush<W>(&mut self, mut write: W) -> io::Result<bool>
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        loop {
            let Some(front) = self.queue.front() else {
                self.flush_requested = false;
                return Ok(true);
            };
            let Some(block) = front.blocks().get(self.block) else {
                self.queue.pop_front();
                self.block = 0;
                self.offset = 0;
                continue;
            };

            let pending = &block.bytes()[self.offset..];
            if pending.is_empty() {
                self.block += 1;
                self.offset = 0;
                continue;
            }

            match write(pending) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.offset += n;
                    if self.offset >= block.len() {
                        self.block += 1;
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
