/// Default capacity of a standard (pooled) block. Must be a power of two:
/// block membership tests mask payload addresses down to a block base.
pub const BLOCK_SIZE: usize = 1024 * 32;

/// Default oversize threshold. Requests strictly above it get an
/// individually backed block instead of a slot in a standard block.
pub const OVERSIZE_THRESHOLD: usize = BLOCK_SIZE;

/// Oversize backing allocations are rounded up to this granule.
pub const PAGE_SIZE: usize = 4096;

/// Most free standard blocks the default block store keeps around.
pub const MAX_POOLED_BLOCKS: usize = 32;

/// How many blocks `is_paged_out` walks between deadline checks.
pub const PAGED_OUT_CHECK_INTERVAL: usize = 16;
