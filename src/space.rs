use super::block::Block;
use super::block_set::BlockSet;
use super::block_store::{BlockSource, BlockStore, Disposition};
use super::bump_allocator::BumpAllocator;
use super::constants::{BLOCK_SIZE, OVERSIZE_THRESHOLD, PAGED_OUT_CHECK_INTERVAL, PAGE_SIZE};
use super::error::AllocError;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

/// Heap-accounting hook. The space reports block capacity (not live
/// bytes) through this, since capacity is what drives the collection
/// trigger heuristics one layer up. Must not fail.
pub trait HeapAccounting: Send + Sync {
    fn did_allocate(&self, bytes: usize);
}

struct NullAccounting;

impl HeapAccounting for NullAccounting {
    fn did_allocate(&self, _bytes: usize) {}
}

#[derive(Debug, Clone, Copy)]
pub struct SpaceConfig {
    /// Capacity of a standard block. Must be a power of two; membership
    /// tests mask payload addresses down to a block base.
    pub block_size: usize,
    /// Requests strictly above this get a dedicated block. Clamped to
    /// `block_size`, since a larger request cannot fit a standard block
    /// anyway.
    pub oversize_threshold: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            oversize_threshold: OVERSIZE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Copying,
}

struct Core {
    allocator: BumpAllocator,
    current: Option<Block>,
    to_space: Vec<Block>,
    from_space: Vec<Block>,
    oversize: Vec<Block>,
    blocks: BlockSet,
    phase: Phase,
}

/// The semi-space copying space for backing-store payloads.
///
/// Mutator side (single-threaded, phase Idle): `try_allocate` /
/// `try_reallocate` bump through the current to-space block, fetching
/// standard blocks from the block source and routing big requests to
/// individually backed oversize blocks.
///
/// Collector side: the cycle driver calls `start_copying` to flip the
/// semi-spaces, hands each evacuation worker blocks via `loan_block`,
/// and the workers fill them through private `BumpAllocator`s and give
/// them back with `done_filling_block`. `done_copying` waits for every
/// loan to come back, sweeps the vacated from-space (pinned blocks
/// survive in place), and rebinds the mutator allocator.
pub struct CopiedSpace {
    config: SpaceConfig,
    source: Arc<dyn BlockSource>,
    accounting: Arc<dyn HeapAccounting>,
    core: Mutex<Core>,
    loaned: Mutex<usize>,
    loan_returned: Condvar,
}

impl CopiedSpace {
    pub fn new(config: SpaceConfig) -> Self {
        Self::with_source(config, Arc::new(BlockStore::new()))
    }

    pub fn with_source(config: SpaceConfig, source: Arc<dyn BlockSource>) -> Self {
        assert!(config.block_size.is_power_of_two());
        assert!(config.oversize_threshold > 0);

        Self {
            config,
            source,
            accounting: Arc::new(NullAccounting),
            core: Mutex::new(Core {
                allocator: BumpAllocator::new(),
                current: None,
                to_space: vec![],
                from_space: vec![],
                oversize: vec![],
                blocks: BlockSet::new(),
                phase: Phase::Idle,
            }),
            loaned: Mutex::new(0),
            loan_returned: Condvar::new(),
        }
    }

    pub fn with_accounting(mut self, accounting: Arc<dyn HeapAccounting>) -> Self {
        self.accounting = accounting;
        self
    }

    fn is_oversize(&self, bytes: usize) -> bool {
        bytes > self.config.oversize_threshold.min(self.config.block_size)
    }

    fn block_base(&self, addr: usize) -> usize {
        addr & !(self.config.block_size - 1)
    }

    /// Allocate `bytes` of backing store. Fails with `OOM` when the
    /// block source cannot supply memory; there is no internal retry.
    pub fn try_allocate(&self, bytes: usize) -> Result<*mut u8, AllocError> {
        debug_assert!(bytes > 0);

        if self.is_oversize(bytes) {
            return self.try_allocate_oversize(bytes);
        }

        {
            let mut core = self.core.lock();
            debug_assert_eq!(core.phase, Phase::Idle);

            if let Some(ptr) = core.allocator.try_allocate(bytes) {
                return Ok(ptr);
            }
        }

        self.allocate_slow(bytes)
    }

    fn allocate_slow(&self, bytes: usize) -> Result<*mut u8, AllocError> {
        // the source may be slow; fetch before taking the core lock
        let fresh = self
            .source
            .allocate(self.config.block_size, self.config.block_size)?;

        let (ptr, retired_capacity) = {
            let mut core = self.core.lock();

            // report the retiring block's full capacity, not the bytes
            // actually bumped into it
            let retired_capacity = core.allocator.current_capacity();

            Self::retire_current(&mut core);
            core.blocks.insert(fresh.base());
            core.allocator.set_current_block(&fresh);
            core.current = Some(fresh);

            (core.allocator.force_allocate(bytes), retired_capacity)
        };

        self.accounting.did_allocate(retired_capacity);

        Ok(ptr)
    }

    fn retire_current(core: &mut Core) {
        if let Some(mut block) = core.current.take() {
            let used = core.allocator.reset_current_block();
            block.set_size(used);
            block.zero_fill_wilderness();
            core.to_space.push(block);
        }
    }

    fn try_allocate_oversize(&self, bytes: usize) -> Result<*mut u8, AllocError> {
        let capacity = bytes
            .checked_add(PAGE_SIZE - 1)
            .ok_or(AllocError::AllocOverflow)?
            & !(PAGE_SIZE - 1);

        let mut block = self.source.allocate(capacity, self.config.block_size)?;
        let footprint = block.capacity();

        // fill the whole block with its one and only allocation
        let mut bump = BumpAllocator::new();
        bump.set_current_block(&block);
        let ptr = bump.force_allocate(bytes);
        block.set_size(bump.reset_current_block());

        trace!("oversize allocation: {bytes} bytes in a {capacity} byte block");

        {
            let mut core = self.core.lock();
            core.blocks.insert(block.base());
            core.oversize.push(block);
        }

        self.accounting.did_allocate(footprint);

        Ok(ptr)
    }

    /// Grow (or trivially keep) an allocation. `new_size <= old_size` is
    /// a no-op success. Standard-class growth extends in place when the
    /// allocation is still the newest one, otherwise allocates and
    /// copies, leaving the old bytes as garbage for the next cycle. If
    /// either size is oversize-class the payload moves to a fresh
    /// oversize block, and an old oversize block is unmapped eagerly.
    pub fn try_reallocate(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<*mut u8, AllocError> {
        if new_size <= old_size {
            return Ok(ptr);
        }

        if !self.is_oversize(old_size) && !self.is_oversize(new_size) {
            {
                let mut core = self.core.lock();
                if core.allocator.try_reallocate(ptr, old_size, new_size) {
                    return Ok(ptr);
                }
            }

            let new_ptr = self.try_allocate(new_size)?;
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
            }

            return Ok(new_ptr);
        }

        // old_size < new_size, so oversize on either side means the new
        // allocation is oversize-class
        let new_ptr = self.try_allocate_oversize(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
        }

        if self.is_oversize(old_size) {
            let old_block = {
                let mut core = self.core.lock();
                let addr = ptr as usize;

                match core.oversize.iter().position(|b| b.contains(addr)) {
                    Some(index) => {
                        let block = core.oversize.swap_remove(index);
                        core.blocks.remove(block.base());
                        Some(block)
                    }
                    None => {
                        debug_assert!(false, "reallocated oversize payload not owned here");
                        None
                    }
                }
            };

            if let Some(block) = old_block {
                self.source.release(block, Disposition::Unmap);
            }
        }

        Ok(new_ptr)
    }

    /// Flip the semi-spaces: the old to-space (current block included)
    /// becomes from-space and a fresh, empty to-space begins. Called
    /// once per cycle by the driver, with the mutator quiesced, before
    /// any worker loans a block.
    pub fn start_copying(&self) {
        debug_assert_eq!(*self.loaned.lock(), 0);

        let mut core = self.core.lock();
        debug_assert_eq!(core.phase, Phase::Idle);
        debug_assert!(core.from_space.is_empty());

        Self::retire_current(&mut core);
        core.from_space = std::mem::take(&mut core.to_space);

        // rebuild the filter over the survivors; the exact set keeps
        // every member through the flip
        core.blocks.reset_filter();
        let Core {
            from_space,
            oversize,
            blocks,
            ..
        } = &mut *core;
        for block in from_space.iter().chain(oversize.iter()) {
            blocks.refresh(block.base());
        }

        core.phase = Phase::Copying;

        debug!(
            "copying started: {} from-space blocks, {} oversize, {} tracked",
            core.from_space.len(),
            core.oversize.len(),
            core.blocks.len()
        );
    }

    /// Hand out a fresh standard block for an evacuation worker to fill.
    /// The worker must eventually give it back through
    /// `done_filling_block`; there is no cancellation path.
    pub fn loan_block(&self) -> Result<Block, AllocError> {
        debug_assert_eq!(self.core.lock().phase, Phase::Copying);

        let block = self
            .source
            .allocate(self.config.block_size, self.config.block_size)?;

        let mut loaned = self.loaned.lock();
        *loaned += 1;
        trace!("block loaned, {} outstanding", *loaned);

        Ok(block)
    }

    /// Return one loaned block, its authoritative size already recorded
    /// by the worker. An empty block goes straight back to the source;
    /// a filled one has its wilderness zeroed before any other thread
    /// can see it, then joins to-space.
    pub fn done_filling_block(&self, mut block: Block) {
        if block.size() == 0 {
            trace!("loaned block came back empty, recycling");
            self.source.release(block, Disposition::Pool);
        } else {
            block.zero_fill_wilderness();

            let mut core = self.core.lock();
            debug_assert_eq!(core.phase, Phase::Copying);
            core.blocks.insert(block.base());
            core.to_space.push(block);
        }

        let mut loaned = self.loaned.lock();
        debug_assert!(*loaned > 0);
        *loaned -= 1;

        if *loaned == 0 {
            self.loan_returned.notify_all();
        }
    }

    /// Finish the cycle. Blocks until every loaned block has come back,
    /// then sweeps from-space and the oversize list: pinned blocks stay
    /// addressable for one more cycle (flag cleared, filter refreshed),
    /// unpinned standard blocks go back to the source's pool and
    /// unpinned oversize blocks are unmapped on the spot. Ends with the
    /// mutator allocator rebound to to-space, fetching a fresh block if
    /// the cycle produced none.
    pub fn done_copying(&self) -> Result<(), AllocError> {
        {
            let mut loaned = self.loaned.lock();
            while *loaned != 0 {
                self.loan_returned.wait(&mut loaned);
            }
        }

        let mut pooled = vec![];
        let mut unmapped = vec![];
        let needs_fresh_block = {
            let mut core = self.core.lock();
            debug_assert_eq!(core.phase, Phase::Copying);

            let Core {
                to_space,
                from_space,
                oversize,
                blocks,
                ..
            } = &mut *core;

            for mut block in from_space.drain(..) {
                if block.pinned() {
                    block.set_pinned(false);
                    blocks.refresh(block.base());
                    to_space.push(block);
                } else {
                    blocks.remove(block.base());
                    pooled.push(block);
                }
            }

            let mut kept = vec![];
            for mut block in oversize.drain(..) {
                if block.pinned() {
                    block.set_pinned(false);
                    blocks.refresh(block.base());
                    kept.push(block);
                } else {
                    blocks.remove(block.base());
                    unmapped.push(block);
                }
            }
            *oversize = kept;

            core.phase = Phase::Idle;

            match core.to_space.pop() {
                Some(block) => {
                    core.allocator.set_current_block(&block);
                    core.current = Some(block);
                    false
                }
                None => true,
            }
        };

        debug!(
            "copying done: {} blocks pooled, {} oversize unmapped",
            pooled.len(),
            unmapped.len()
        );

        // source calls may be slow; the lock is already gone
        for block in pooled {
            self.source.release(block, Disposition::Pool);
        }
        for block in unmapped {
            self.source.release(block, Disposition::Unmap);
        }

        if needs_fresh_block {
            let fresh = self
                .source
                .allocate(self.config.block_size, self.config.block_size)?;

            let mut core = self.core.lock();
            core.blocks.insert(fresh.base());
            core.allocator.set_current_block(&fresh);
            core.current = Some(fresh);
        }

        Ok(())
    }

    /// Pin the block holding `addr` for the rest of the current cycle,
    /// keeping it at its address through the sweep. Returns false when
    /// the address is not owned by this space.
    pub fn pin(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let mut core = self.core.lock();

        let Core {
            current,
            to_space,
            from_space,
            oversize,
            ..
        } = &mut *core;

        for block in current
            .iter_mut()
            .chain(to_space.iter_mut())
            .chain(from_space.iter_mut())
            .chain(oversize.iter_mut())
        {
            if block.contains(addr) {
                block.set_pinned(true);
                return true;
            }
        }

        false
    }

    /// Cheap-reject / exact-confirm membership test for an allocation
    /// start pointer.
    pub fn owns_address(&self, ptr: *const u8) -> bool {
        let base = self.block_base(ptr as usize);
        self.core.lock().blocks.contains(base)
    }

    /// Live bytes across every block. O(blocks); not a hot path.
    pub fn size(&self) -> usize {
        let core = self.core.lock();
        let mut total = core.allocator.used();

        for block in core
            .to_space
            .iter()
            .chain(core.from_space.iter())
            .chain(core.oversize.iter())
        {
            total += block.size();
        }

        total
    }

    /// Total backing-store footprint across every block. O(blocks).
    pub fn capacity(&self) -> usize {
        let core = self.core.lock();
        let mut total = core.current.as_ref().map_or(0, |b| b.capacity());

        for block in core
            .to_space
            .iter()
            .chain(core.from_space.iter())
            .chain(core.oversize.iter())
        {
            total += block.capacity();
        }

        total
    }

    /// Memory-pressure heuristic: touch every block's backing and report
    /// whether the walk blew past `deadline`. Paged-out blocks make the
    /// walk fault and stall, so a missed deadline is taken as evidence
    /// the space is partly in swap. Not correctness-critical.
    pub fn is_paged_out(&self, deadline: Instant) -> bool {
        let core = self.core.lock();
        let mut since_check = 0;

        for block in core
            .current
            .iter()
            .chain(core.to_space.iter())
            .chain(core.from_space.iter())
            .chain(core.oversize.iter())
        {
            unsafe {
                std::ptr::read_volatile(block.as_ptr() as *const u8);
            }

            since_check += 1;
            if since_check >= PAGED_OUT_CHECK_INTERVAL {
                since_check = 0;

                if Instant::now() > deadline {
                    return true;
                }
            }
        }

        false
    }
}

impl Drop for CopiedSpace {
    fn drop(&mut self) {
        debug_assert_eq!(*self.loaned.lock(), 0, "space dropped with loans outstanding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_config() -> SpaceConfig {
        SpaceConfig {
            block_size: 4096,
            oversize_threshold: 4096,
        }
    }

    #[test]
    fn allocations_bump_through_one_block() {
        let space = CopiedSpace::new(small_config());

        let p1 = space.try_allocate(10).unwrap();
        let p2 = space.try_allocate(10).unwrap();

        assert_eq!(p1 as usize % 4096, 0);
        assert_eq!(p2 as usize, p1 as usize + 10);
        assert_eq!(space.capacity(), 4096);
        assert_eq!(space.size(), 20);
    }

    #[test]
    fn full_block_triggers_a_fetch() {
        let space = CopiedSpace::new(small_config());

        space.try_allocate(4000).unwrap();
        space.try_allocate(4000).unwrap();

        assert_eq!(space.capacity(), 2 * 4096);
    }

    #[test]
    fn threshold_boundary_routes_consistently() {
        let config = SpaceConfig {
            block_size: 65536,
            oversize_threshold: 8192,
        };

        let at_threshold = CopiedSpace::new(config);
        at_threshold.try_allocate(8192).unwrap();
        assert_eq!(at_threshold.capacity(), 65536);

        let above_threshold = CopiedSpace::new(config);
        above_threshold.try_allocate(8193).unwrap();
        assert_eq!(above_threshold.capacity(), 12288);
    }

    #[test]
    fn oversize_footprint_is_page_rounded() {
        let config = SpaceConfig {
            block_size: 65536,
            oversize_threshold: 65536,
        };
        let space = CopiedSpace::new(config);

        let ptr = space.try_allocate(1024 * 1024).unwrap();

        assert_eq!(space.capacity(), 1024 * 1024);
        assert_eq!(space.size(), 1024 * 1024);
        assert!(space.owns_address(ptr));
    }

    #[test]
    fn owns_address_tracks_membership() {
        let space = CopiedSpace::new(small_config());

        let ptr = space.try_allocate(10).unwrap();
        let outside = [0u8; 16];

        assert!(space.owns_address(ptr));
        assert!(space.owns_address(unsafe { ptr.add(5) }));
        assert!(!space.owns_address(outside.as_ptr()));
    }

    #[test]
    fn shrinking_reallocate_is_a_no_op() {
        let space = CopiedSpace::new(small_config());

        let ptr = space.try_allocate(100).unwrap();

        assert_eq!(space.try_reallocate(ptr, 100, 50).unwrap(), ptr);
        assert_eq!(space.try_reallocate(ptr, 100, 100).unwrap(), ptr);
        assert_eq!(space.size(), 100);
    }

    struct CapacityRecorder {
        reported: AtomicUsize,
    }

    impl HeapAccounting for CapacityRecorder {
        fn did_allocate(&self, bytes: usize) {
            self.reported.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    #[test]
    fn block_fetch_reports_retired_capacity() {
        let recorder = Arc::new(CapacityRecorder {
            reported: AtomicUsize::new(0),
        });
        let space =
            CopiedSpace::new(small_config()).with_accounting(recorder.clone());

        // first fetch retires nothing
        space.try_allocate(4000).unwrap();
        assert_eq!(recorder.reported.load(Ordering::Relaxed), 0);

        // second fetch retires the first block, reporting its capacity
        space.try_allocate(4000).unwrap();
        assert_eq!(recorder.reported.load(Ordering::Relaxed), 4096);
    }

    #[test]
    fn oversize_reports_its_footprint() {
        let recorder = Arc::new(CapacityRecorder {
            reported: AtomicUsize::new(0),
        });
        let space =
            CopiedSpace::new(small_config()).with_accounting(recorder.clone());

        space.try_allocate(5000).unwrap();

        assert_eq!(recorder.reported.load(Ordering::Relaxed), 8192);
    }
}
