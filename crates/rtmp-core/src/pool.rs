//! Shared buffer pool: fixed-capacity blocks recycled through a free list.
//!
//! Every block holds one chunk's worth of payload plus `MAX_CHUNK_HEADER`
//! bytes of headroom, so the send path can write a chunk header in front of
//! the payload without moving it. A pool belongs to exactly one execution
//! context; nothing here is `Send`, and no locks are taken.
//!
//! Ownership replaces manual reference counts:
//!   - `Block` is a uniquely owned, writable block.
//!   - `Chain` is an ordered run of blocks making up one message.
//!   - `SharedChain` is a frozen chain behind `Rc`. Cloning it is a retain,
//!     dropping it is a release, and the final release hands every block
//!     back to the free list it came from.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use crate::wire::MAX_CHUNK_HEADER;

// ── Pool ──────────────────────────────────────────────────────────────────────

struct PoolInner {
    chunk_size: usize,
    /// Upper bound on blocks alive at once. 0 = unbounded.
    max_blocks: usize,
    allocated: Cell<usize>,
    free: RefCell<Vec<Box<[u8]>>>,
}

impl PoolInner {
    fn block_capacity(&self) -> usize {
        self.chunk_size + MAX_CHUNK_HEADER
    }

    fn recycle(&self, data: Box<[u8]>) {
        if data.len() == self.block_capacity() {
            self.free.borrow_mut().push(data);
        } else {
            self.allocated.set(self.allocated.get().saturating_sub(1));
        }
    }
}

/// Per-context allocator for chunk-sized blocks.
///
/// Cloning the pool handle shares the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<PoolInner>,
}

impl BufferPool {
    /// A pool whose blocks carry `chunk_size` bytes of payload.
    pub fn new(chunk_size: usize) -> Self {
        Self::with_limit(chunk_size, 0)
    }

    /// A pool that refuses to hold more than `max_blocks` live blocks.
    pub fn with_limit(chunk_size: usize, max_blocks: usize) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                chunk_size: chunk_size.max(1),
                max_blocks,
                allocated: Cell::new(0),
                free: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Full block size: chunk payload plus header room.
    pub fn block_capacity(&self) -> usize {
        self.inner.block_capacity()
    }

    /// Blocks currently parked on the free list.
    pub fn free_blocks(&self) -> usize {
        self.inner.free.borrow().len()
    }

    /// Blocks ever allocated and not discarded (free or in use).
    pub fn allocated_blocks(&self) -> usize {
        self.inner.allocated.get()
    }

    /// Blocks held by chains right now.
    pub fn blocks_in_use(&self) -> usize {
        self.allocated_blocks() - self.free_blocks()
    }

    /// Take a block from the free list, or allocate one.
    ///
    /// The block starts empty with its read/write position just past the
    /// header room.
    pub fn acquire(&self) -> Result<Block, PoolError> {
        let recycled = self.inner.free.borrow_mut().pop();
        let data = match recycled {
            Some(data) => data,
            None => {
                let in_use = self.allocated_blocks();
                if self.inner.max_blocks != 0 && in_use >= self.inner.max_blocks {
                    return Err(PoolError::Exhausted(in_use));
                }
                let capacity = self.block_capacity();
                let mut v = Vec::new();
                v.try_reserve_exact(capacity)
                    .map_err(|_| PoolError::AllocFailed(capacity))?;
                v.resize(capacity, 0);
                self.inner.allocated.set(in_use + 1);
                v.into_boxed_slice()
            }
        };

        Ok(Block {
            data,
            pos: MAX_CHUNK_HEADER,
            last: MAX_CHUNK_HEADER,
            pool: Rc::downgrade(&self.inner),
        })
    }

    /// Copy `src` onto the end of `chain`, filling the tail block first and
    /// acquiring new blocks as needed.
    pub fn append(&self, chain: &mut Chain, mut src: &[u8]) -> Result<(), PoolError> {
        while !src.is_empty() {
            let room = chain.blocks.last().map_or(0, Block::spare);
            if room == 0 {
                chain.blocks.push(self.acquire()?);
                continue;
            }
            if let Some(tail) = chain.blocks.last_mut() {
                let n = tail.put_slice(src);
                src = &src[n..];
            }
        }
        Ok(())
    }

    /// Copy every byte of `src` onto the end of `chain`.
    pub fn append_chain(&self, chain: &mut Chain, src: &Chain) -> Result<(), PoolError> {
        for block in src.blocks() {
            self.append(chain, block.bytes())?;
        }
        Ok(())
    }

    /// Build a fresh chain holding a copy of `src`.
    pub fn chain_from(&self, src: &[u8]) -> Result<Chain, PoolError> {
        let mut chain = Chain::new();
        self.append(&mut chain, src)?;
        Ok(chain)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("chunk_size", &self.chunk_size())
            .field("allocated", &self.allocated_blocks())
            .field("free", &self.free_blocks())
            .finish()
    }
}

// ── Block ─────────────────────────────────────────────────────────────────────

/// One pool block. Readable bytes are `data[pos..last]`; bytes before `pos`
/// are header room, bytes after `last` are spare payload capacity.
pub struct Block {
    data: Box<[u8]>,
    pos: usize,
    last: usize,
    pool: Weak<PoolInner>,
}

impl Block {
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.pos..self.last]
    }

    pub fn len(&self) -> usize {
        self.last - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.last
    }

    /// Room left for payload.
    pub fn spare(&self) -> usize {
        self.data.len() - self.last
    }

    /// Room left in front of the readable bytes.
    pub fn headroom(&self) -> usize {
        self.pos
    }

    /// Copy as much of `src` as fits; returns the count copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.spare());
        self.data[self.last..self.last + n].copy_from_slice(&src[..n]);
        self.last += n;
        n
    }

    /// Write `header` directly in front of the readable bytes.
    /// Returns false when the header room is too small.
    pub fn prepend(&mut self, header: &[u8]) -> bool {
        if header.len() > self.pos {
            return false;
        }
        self.pos -= header.len();
        self.data[self.pos..self.pos + header.len()].copy_from_slice(header);
        true
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.len())
            .field("headroom", &self.pos)
            .field("spare", &self.spare())
            .finish()
    }
}

// ── Chain ─────────────────────────────────────────────────────────────────────

/// Ordered blocks forming one message payload.
#[derive(Debug, Default)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Chain {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    /// Total readable bytes.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Block::is_empty)
    }

    /// Readable slices in order.
    pub fn slices(&self) -> Vec<&[u8]> {
        self.blocks.iter().map(Block::bytes).collect()
    }

    /// Flatten into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for block in &self.blocks {
            out.extend_from_slice(block.bytes());
        }
        out
    }

    /// Freeze for sharing between queues.
    pub fn share(self) -> SharedChain {
        SharedChain(Rc::new(self))
    }
}

/// Read-only chain shared by every queue it was handed to.
///
/// `Clone` is the retain operation; `Drop` is the release.
#[derive(Debug, Clone)]
pub struct SharedChain(Rc<Chain>);

impl SharedChain {
    pub fn retain(&self) -> SharedChain {
        self.clone()
    }

    /// Number of live holders.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl Deref for SharedChain {
    type Target = Chain;

    fn deref(&self) -> &Chain {
        &self.0
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("buffer pool exhausted ({0} blocks in use)")]
    Exhausted(usize),

    #[error("failed to allocate {0} byte block")]
    AllocFailed(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_leaves_header_room() {
        let pool = BufferPool::new(128);
        let block = pool.acquire().unwrap();
        assert_eq!(pool.block_capacity(), 128 + MAX_CHUNK_HEADER);
        assert_eq!(block.headroom(), MAX_CHUNK_HEADER);
        assert_eq!(block.spare(), 128);
        assert!(block.is_empty());
    }

    #[test]
    fn dropped_block_returns_to_free_list() {
        let pool = BufferPool::new(64);
        let block = pool.acquire().unwrap();
        assert_eq!(pool.free_blocks(), 0);
        drop(block);
        assert_eq!(pool.free_blocks(), 1);

        let _again = pool.acquire().unwrap();
        assert_eq!(pool.free_blocks(), 0);
        assert_eq!(pool.allocated_blocks(), 1, "freed block should be reused");
    }

    #[test]
    fn shared_chain_released_only_by_last_holder() {
        let pool = BufferPool::new(16);
        let chain = pool.chain_from(&[7u8; 40]).unwrap();
        assert_eq!(chain.blocks().len(), 3);

        let first = chain.share();
        let second = first.retain();
        let third = second.clone();
        assert_eq!(first.ref_count(), 3);

        drop(first);
        drop(third);
        assert_eq!(pool.free_blocks(), 0, "blocks still held");
        assert_eq!(second.ref_count(), 1);
        assert_eq!(second.to_vec(), vec![7u8; 40]);

        drop(second);
        assert_eq!(pool.free_blocks(), 3);
        assert_eq!(pool.blocks_in_use(), 0);
    }

    #[test]
    fn free_list_tracks_net_holders() {
        // Interleave retains and releases across several chains and check
        // that a chain's blocks are free exactly when nobody holds it.
        let pool = BufferPool::new(8);
        let a = pool.chain_from(&[1u8; 8]).unwrap().share();
        let b = pool.chain_from(&[2u8; 16]).unwrap().share();

        let mut holders_a = vec![a.retain(), a.retain()];
        let holders_b = vec![b.retain()];
        drop(a);
        drop(b);
        assert_eq!(pool.free_blocks(), 0);

        drop(holders_b);
        assert_eq!(pool.free_blocks(), 2);

        holders_a.pop();
        assert_eq!(pool.free_blocks(), 2);
        holders_a.clear();
        assert_eq!(pool.free_blocks(), 3);
        assert_eq!(pool.blocks_in_use(), 0);
    }

    #[test]
    fn append_fills_tail_before_acquiring() {
        let pool = BufferPool::new(10);
        let mut chain = Chain::new();
        pool.append(&mut chain, b"hello").unwrap();
        pool.append(&mut chain, b"world!!").unwrap();
        assert_eq!(chain.blocks().len(), 2);
        assert_eq!(chain.blocks()[0].len(), 10);
        assert_eq!(chain.to_vec(), b"helloworld!!");

        let mut copy = Chain::new();
        pool.append_chain(&mut copy, &chain).unwrap();
        assert_eq!(copy.to_vec(), chain.to_vec());
    }

    #[test]
    fn limit_reports_exhaustion() {
        let pool = BufferPool::with_limit(8, 2);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), PoolError::Exhausted(2));
    }

    #[test]
    fn blocks_outliving_pool_are_simply_freed() {
        let pool = BufferPool::new(8);
        let chain = pool.chain_from(b"abc").unwrap();
        drop(pool);
        assert_eq!(chain.to_vec(), b"abc");
        drop(chain);
    }

    #[test]
    fn prepend_uses_header_room() {
        let pool = BufferPool::new(8);
        let mut block = pool.acquire().unwrap();
        block.put_slice(b"data");
        assert!(block.prepend(&[0xc3]));
        assert_eq!(block.bytes(), &[0xc3, b'd', b'a', b't', b'a']);
        assert!(!block.prepend(&[0u8; MAX_CHUNK_HEADER]));
    }
}
