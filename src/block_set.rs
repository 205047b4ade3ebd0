use std::collections::HashSet;

const FILTER_BITS: usize = 1 << 12;
const FILTER_WORDS: usize = FILTER_BITS / 64;

/// Block-base membership: an insert-only bit filter for cheap rejection
/// in front of an exact hash set. The filter never supports deletion;
/// it is rebuilt from the exact set at each semi-space flip, so stale
/// bits from blocks released in earlier cycles wash out once per cycle.
pub struct BlockSet {
    filter: [u64; FILTER_WORDS],
    blocks: HashSet<usize>,
}

fn filter_slot(base: usize) -> (usize, u64) {
    // hash in u64 so the constant fits on 32-bit targets too
    let hash = (base as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let bit = (hash >> (64 - 12)) as usize;

    (bit / 64, 1u64 << (bit % 64))
}

impl BlockSet {
    pub fn new() -> Self {
        Self {
            filter: [0; FILTER_WORDS],
            blocks: HashSet::new(),
        }
    }

    pub fn insert(&mut self, base: usize) {
        let fresh = self.blocks.insert(base);
        debug_assert!(fresh, "block {base:#x} inserted twice");

        let (word, mask) = filter_slot(base);
        self.filter[word] |= mask;
    }

    /// Re-set the filter bit for a base the exact set already holds.
    /// Used after a filter rebuild for blocks that survive the flip.
    pub fn refresh(&mut self, base: usize) {
        debug_assert!(self.blocks.contains(&base));

        let (word, mask) = filter_slot(base);
        self.filter[word] |= mask;
    }

    pub fn remove(&mut self, base: usize) {
        let present = self.blocks.remove(&base);
        debug_assert!(present, "block {base:#x} removed twice");
    }

    pub fn reset_filter(&mut self) {
        self.filter = [0; FILTER_WORDS];
    }

    pub fn contains(&self, base: usize) -> bool {
        let (word, mask) = filter_slot(base);

        if self.filter[word] & mask == 0 {
            return false;
        }

        self.blocks.contains(&base)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for BlockSet {
    fn default() -> Self {
        Self::new()
    }
}
