//! ## eddy-core::alloc
//! **Page zones, slab caches and arenas**
//!
//! ### Expectations (Production):
//! - Steady request rates recycle slab objects without touching the zone
//! - Zone exhaustion degrades to heap allocation, never to failure
//! - Every byte handed out is charged against the allocator's `memlimit`
//!
//! ### Key Submodules:
//! - `page/`: Buddy allocator over one anonymous mapping
//! - `slab/`: Fixed-size object caches with partial/full/empty slab lists
//! - `pool/`: `Allocator` trait, slab-backed and heap-only implementations
//! - `arena/`: Reference-counted bump arenas returning handles
//! - `stats/`: Allocation counters

pub mod arena;
pub mod page;
pub mod pool;
pub mod slab;
pub mod stats;

pub use arena::{Arena, ArenaRef, LocalArena, DEFAULT_ALIGN, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
pub use page::{Page, Zone, DEFAULT_PAGE_SHIFT, MAX_ORDER};
pub use pool::{Allocator, Buffer, SlabAllocator, SystemAllocator, SLAB_MAX};
pub use slab::{SlabCache, SlabObject, SLAB_MIN};
pub use stats::{MemoryStats, StatsSnapshot};
