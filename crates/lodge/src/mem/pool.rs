//! Fixed-size buffer pool shared by all generations of one repository.
//!
//! The pool is warmed up once at repository creation and blocks are only ever
//! recycled afterwards. Every block is owned by exactly one of the pool, the
//! active generation or the immutable generation; the repository lock guards
//! all hand-offs, and a not-empty condition (owned by the repository) wakes
//! writers waiting for a commit to return blocks.

use std::collections::VecDeque;

/// A fixed-capacity byte region used as slab storage for encoded rows.
///
/// Allocation is a bump of the write offset; the only supported rollback is
/// undoing the most recent allocation from the tail.
#[derive(Debug)]
pub struct BufBlock {
    data: Vec<u8>,
    offset: usize,
}

impl BufBlock {
    /// Creates a zeroed block of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            offset: 0,
        }
    }

    /// Remaining capacity in bytes.
    pub fn remain(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Current write offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Copies `bytes` into the block, advancing the write offset.
    ///
    /// Returns the offset the bytes were written at, or `None` if the
    /// remaining capacity is insufficient.
    pub fn append(&mut self, bytes: &[u8]) -> Option<usize> {
        if self.remain() < bytes.len() {
            return None;
        }
        let at = self.offset;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
        Some(at)
    }

    /// Rolls back the most recent allocation of `len` bytes from the tail.
    ///
    /// Only valid immediately after the matching [`append`](Self::append);
    /// this is an insertion-rollback hook, not a general deallocator.
    pub fn rollback(&mut self, len: usize) {
        assert!(len <= self.offset, "rollback past block start");
        self.offset -= len;
    }

    /// Borrows `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Clears the block for reuse by the pool.
    fn reset(&mut self) {
        self.offset = 0;
    }
}

/// Free list of reusable buffer blocks.
///
/// All mutation happens under the repository lock; the pool itself carries no
/// synchronization.
#[derive(Debug)]
pub struct BufPool {
    free: VecDeque<BufBlock>,
    block_size: usize,
    total_blocks: usize,
}

impl BufPool {
    /// Allocates `total_blocks` blocks of `block_size` bytes up front.
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        assert!(total_blocks >= 2, "pool needs at least two blocks");
        let free = (0..total_blocks).map(|_| BufBlock::new(block_size)).collect();
        Self {
            free,
            block_size,
            total_blocks,
        }
    }

    /// Removes and returns one free block, if any.
    pub fn try_acquire(&mut self) -> Option<BufBlock> {
        self.free.pop_front()
    }

    /// Clears a block and returns it to the free list.
    ///
    /// The caller signals the repository's not-empty condition afterwards.
    pub fn release(&mut self, mut block: BufBlock) {
        block.reset();
        self.free.push_back(block);
        assert!(self.free.len() <= self.total_blocks, "pool over-released");
    }

    /// Number of blocks currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Size in bytes of every block in this pool.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks owned by this pool and its generations.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_rollback() {
        let mut block = BufBlock::new(16);
        let at = block.append(&[1, 2, 3, 4]).unwrap();
        assert_eq!(at, 0);
        assert_eq!(block.remain(), 12);
        assert_eq!(block.bytes(0, 4), &[1, 2, 3, 4]);

        block.rollback(4);
        assert_eq!(block.offset(), 0);
        assert_eq!(block.remain(), 16);
    }

    #[test]
    fn test_append_rejects_overflow() {
        let mut block = BufBlock::new(4);
        assert!(block.append(&[0; 5]).is_none());
        assert!(block.append(&[0; 4]).is_some());
        assert!(block.append(&[0; 1]).is_none());
    }

    #[test]
    fn test_pool_recycles_blocks() {
        let mut pool = BufPool::new(2, 8);
        assert_eq!(pool.free_count(), 2);

        let mut a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert_eq!(pool.free_count(), 0);
        assert!(pool.try_acquire().is_none());

        a.append(&[9; 8]).unwrap();
        pool.release(a);
        assert_eq!(pool.free_count(), 1);

        // Recycled block comes back empty.
        let a = pool.try_acquire().unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.remain(), 8);
    }
}
