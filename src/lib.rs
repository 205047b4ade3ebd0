//! A semi-space copying space for the backing stores of a managed heap.
//!
//! Payloads are bump-allocated into standard pooled blocks (or into
//! individually backed oversize blocks past a threshold). At collection
//! time the space flips: to-space becomes from-space, evacuation workers
//! loan fresh blocks, fill them with the live payloads through private
//! [`BumpAllocator`]s, and give them back; once every loan has returned,
//! [`CopiedSpace::done_copying`] reclaims the vacated from-space in bulk,
//! sparing any block pinned at its address for one more cycle.
//!
//! ```
//! use copyspace::{CopiedSpace, SpaceConfig};
//!
//! let space = CopiedSpace::new(SpaceConfig::default());
//! let ptr = space.try_allocate(64).unwrap();
//! assert!(space.owns_address(ptr));
//! ```

mod block;
mod block_set;
mod block_store;
mod bump_allocator;
mod constants;
mod error;
mod space;

pub use block::Block;
pub use block_store::{BlockSource, BlockStore, Disposition};
pub use bump_allocator::BumpAllocator;
pub use constants::{BLOCK_SIZE, OVERSIZE_THRESHOLD};
pub use error::AllocError;
pub use space::{CopiedSpace, HeapAccounting, SpaceConfig};
