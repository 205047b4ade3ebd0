use super::block::Block;
use super::constants::MAX_POOLED_BLOCKS;
use super::error::AllocError;

use log::trace;
use parking_lot::Mutex;

/// What a caller wants done with a block it is giving back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the block around for reuse. Standard blocks only.
    Pool,
    /// Release the backing memory immediately. Oversize blocks are
    /// always unmapped, never pooled.
    Unmap,
}

/// The physical memory boundary. Implementations may be slow (they can
/// hit the OS), so the space calls them without its own lock held.
pub trait BlockSource: Send + Sync {
    fn allocate(&self, capacity: usize, align: usize) -> Result<Block, AllocError>;
    fn release(&self, block: Block, disposition: Disposition);
}

/// Default block source: a bounded free list of standard blocks in front
/// of the system allocator.
pub struct BlockStore {
    free: Mutex<Vec<Block>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(vec![]),
        }
    }

    pub fn pooled_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockSource for BlockStore {
    fn allocate(&self, capacity: usize, align: usize) -> Result<Block, AllocError> {
        let pooled = self.free.lock().pop();

        if let Some(block) = pooled {
            // the pool is homogeneous in practice; fall through to a
            // fresh allocation if the caller wants something else
            if block.capacity() == capacity && block.base() % align == 0 {
                trace!("reusing pooled block at {:#x}", block.base());
                return Ok(block);
            }

            self.free.lock().push(block);
        }

        trace!("allocating fresh block: capacity {capacity}");
        Block::new(capacity, align)
    }

    fn release(&self, mut block: Block, disposition: Disposition) {
        match disposition {
            Disposition::Pool => {
                block.reset();

                let mut free = self.free.lock();
                if free.len() < MAX_POOLED_BLOCKS {
                    free.push(block);
                } else {
                    drop(free);
                    drop(block);
                }
            }
            Disposition::Unmap => {
                trace!("unmapping block at {:#x}", block.base());
                drop(block);
            }
        }
    }
}
