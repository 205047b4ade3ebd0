use super::block::Block;

/// A disposable, rebindable cursor allocator. One instance serves as the
/// mutator's allocator into the current to-space block; fresh instances
/// are spun up by evacuation workers to fill loaned blocks and by the
/// oversize path to fill a dedicated block exactly once.
///
/// The allocator never updates the bound block's own size field; the
/// holder records the value returned by `reset_current_block`.
pub struct BumpAllocator {
    start: *mut u8,
    cursor: *mut u8,
    limit: *mut u8,
}

// Holds raw cursors into a block owned by the same holder; never shared
// between threads while bound.
unsafe impl Send for BumpAllocator {}

impl Default for BumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BumpAllocator {
    pub fn new() -> Self {
        Self {
            start: std::ptr::null_mut(),
            cursor: std::ptr::null_mut(),
            limit: std::ptr::null_mut(),
        }
    }

    /// Bind to a block, resuming after any bytes the block already holds.
    pub fn set_current_block(&mut self, block: &Block) {
        debug_assert!(!self.is_bound());

        self.start = block.as_ptr();
        self.limit = unsafe { self.start.add(block.capacity()) };
        self.cursor = unsafe { self.start.add(block.size()) };
    }

    /// Unbind, returning the used-byte count the holder must record on
    /// the block.
    pub fn reset_current_block(&mut self) -> usize {
        let used = self.used();

        self.start = std::ptr::null_mut();
        self.cursor = std::ptr::null_mut();
        self.limit = std::ptr::null_mut();

        used
    }

    pub fn is_bound(&self) -> bool {
        !self.start.is_null()
    }

    pub fn used(&self) -> usize {
        self.cursor as usize - self.start as usize
    }

    pub fn remaining(&self) -> usize {
        self.limit as usize - self.cursor as usize
    }

    /// Capacity of the bound block, or zero when unbound.
    pub fn current_capacity(&self) -> usize {
        self.limit as usize - self.start as usize
    }

    /// Unconditional bump. The caller must already have verified that
    /// `bytes` fits in the remaining space.
    pub fn force_allocate(&mut self, bytes: usize) -> *mut u8 {
        debug_assert!(self.is_bound());
        debug_assert!(bytes <= self.remaining());

        let ptr = self.cursor;
        self.cursor = unsafe { self.cursor.add(bytes) };

        ptr
    }

    /// Bounds-checked bump; leaves the cursor untouched on failure.
    pub fn try_allocate(&mut self, bytes: usize) -> Option<*mut u8> {
        if self.is_bound() && bytes <= self.remaining() {
            Some(self.force_allocate(bytes))
        } else {
            None
        }
    }

    /// Grow the most recent allocation in place. Succeeds only if `ptr`
    /// is exactly the last allocation and the growth fits before the
    /// limit; memory is never moved.
    pub fn try_reallocate(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> bool {
        debug_assert!(new_size > old_size);

        if !self.is_bound() {
            return false;
        }

        let end = unsafe { ptr.add(old_size) };
        if end != self.cursor {
            return false;
        }

        let growth = new_size - old_size;
        if growth > self.remaining() {
            return false;
        }

        self.cursor = unsafe { self.cursor.add(growth) };

        true
    }
}
