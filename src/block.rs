use super::error::AllocError;

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// An owned, contiguous backing-store region. Standard blocks share one
/// capacity and live in the block store's pool; oversize blocks are sized
/// to exactly one payload and are unmapped as soon as they die.
///
/// The header state (capacity, used size, pinned flag) lives in this
/// struct rather than in-band, so the payload starts at offset zero and
/// the whole backing allocation is usable capacity.
pub struct Block {
    ptr: NonNull<u8>,
    capacity: usize,
    align: usize,
    size: usize,
    pinned: bool,
}

// The payload is exclusively owned by the block and only ever written by
// the thread currently holding it.
unsafe impl Send for Block {}

impl Block {
    /// Allocate a fresh block. `align` must be a power of two; standard
    /// blocks are aligned to their own capacity so payload addresses can
    /// be masked back to the block base.
    pub fn new(capacity: usize, align: usize) -> Result<Block, AllocError> {
        debug_assert!(capacity > 0);
        debug_assert!(align.is_power_of_two());

        let layout = Layout::from_size_align(capacity, align)
            .map_err(|_| AllocError::AllocOverflow)?;
        let raw = unsafe { alloc(layout) };

        match NonNull::new(raw) {
            Some(ptr) => Ok(Block {
                ptr,
                capacity,
                align,
                size: 0,
                pinned: false,
            }),
            None => Err(AllocError::OOM),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Authoritative used-byte count. Only meaningful while no bump
    /// allocator is bound to this block; the allocator holder records it
    /// back on unbind.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size <= self.capacity);
        self.size = size;
    }

    pub fn pinned(&self) -> bool {
        self.pinned
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base();
        base <= addr && addr < base + self.capacity
    }

    /// Zero [size, capacity) so no later scan reads uninitialized bytes
    /// as data. Must not be called while a bump allocator is still
    /// filling this block.
    pub fn zero_fill_wilderness(&mut self) {
        unsafe {
            let wilderness = self.ptr.as_ptr().add(self.size);
            std::ptr::write_bytes(wilderness, 0, self.capacity - self.size);
        }
    }

    /// Make a pooled block indistinguishable from a fresh one.
    pub fn reset(&mut self) {
        self.size = 0;
        self.pinned = false;
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, self.align);
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 4096;

    #[test]
    fn new_block_is_empty_and_aligned() {
        let block = Block::new(CAPACITY, CAPACITY).unwrap();

        assert_eq!(block.size(), 0);
        assert_eq!(block.capacity(), CAPACITY);
        assert!(!block.pinned());
        assert_eq!(block.base() % CAPACITY, 0);
    }

    #[test]
    fn contains_covers_exactly_the_payload() {
        let block = Block::new(CAPACITY, CAPACITY).unwrap();
        let base = block.base();

        assert!(block.contains(base));
        assert!(block.contains(base + CAPACITY - 1));
        assert!(!block.contains(base + CAPACITY));
        assert!(!block.contains(base.wrapping_sub(1)));
    }

    #[test]
    fn zero_fill_only_touches_the_wilderness() {
        let mut block = Block::new(CAPACITY, CAPACITY).unwrap();

        unsafe {
            std::ptr::write_bytes(block.as_ptr(), 0xAB, 64);
        }
        block.set_size(64);
        block.zero_fill_wilderness();

        unsafe {
            for i in 0..64 {
                assert_eq!(*block.as_ptr().add(i), 0xAB);
            }
            for i in 64..CAPACITY {
                assert_eq!(*block.as_ptr().add(i), 0);
            }
        }
    }

    #[test]
    fn reset_clears_size_and_pin() {
        let mut block = Block::new(CAPACITY, CAPACITY).unwrap();

        block.set_size(100);
        block.set_pinned(true);
        block.reset();

        assert_eq!(block.size(), 0);
        assert!(!block.pinned());
    }
}
