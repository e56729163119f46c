//! # eddy-core
//!
//! Foundation layer for the eddy network engine: memory management, index-linked
//! containers and fixed worker pools. Nothing in here touches a socket.
//!
//! ### Expectations (Production):
//! - No per-message heap churn on steady request rates (slab recycling)
//! - Allocation failures are reported, never fatal
//! - No ambient global allocator state; allocators are passed explicitly
//!
//! ### Key Submodules:
//! - `alloc`: Arenas, page zones, slab caches and the allocator facade
//! - `collections`: Index-linked lists and chained hash tables
//! - `thread`: Fixed-size worker pools addressed by index, hash or round-robin

pub mod alloc;
pub mod collections;
pub mod error;
pub mod thread;

pub mod prelude {
    pub use crate::alloc::{
        Allocator, Arena, ArenaRef, Buffer, LocalArena, MemoryStats, SlabAllocator, SlabCache,
        SystemAllocator, Zone,
    };
    pub use crate::collections::{hash_code, HashTable, Links, ListHead, StringTable};
    pub use crate::error::{AllocError, PoolError};
    pub use crate::thread::{TaskWorker, ThreadPool, Worker, WorkerContext};
}

pub use error::{AllocError, PoolError};
