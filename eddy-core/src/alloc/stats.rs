//! ## eddy-core::alloc::stats
//! **Allocation counters**
//!
//! One `MemoryStats` lives inside each allocator and is shared with every
//! arena drawing from it. All counters are relaxed atomics; read them
//! together through [`MemoryStats::snapshot`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[inline]
fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default)]
pub struct MemoryStats {
    pool_allocations: AtomicUsize,
    pool_deallocations: AtomicUsize,
    arena_allocations: AtomicUsize,
    arena_resets: AtomicUsize,
    fallbacks: AtomicUsize,
}

/// Point-in-time copy of a [`MemoryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub pool_allocations: usize,
    pub pool_deallocations: usize,
    pub arena_allocations: usize,
    pub arena_resets: usize,
    pub fallbacks: usize,
}

impl StatsSnapshot {
    /// Slab objects handed out and not yet returned.
    pub fn pool_outstanding(&self) -> usize {
        self.pool_allocations.saturating_sub(self.pool_deallocations)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool {}/{} (outstanding {}), arena allocs {}, resets {}, heap fallbacks {}",
            self.pool_allocations,
            self.pool_deallocations,
            self.pool_outstanding(),
            self.arena_allocations,
            self.arena_resets,
            self.fallbacks
        )
    }
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a buffer served from a slab cache.
    #[inline]
    pub fn increment_pool_allocations(&self) {
        bump(&self.pool_allocations);
    }

    #[inline]
    pub fn increment_pool_deallocations(&self) {
        bump(&self.pool_deallocations);
    }

    /// Counts one `alloc` on any arena backed by this allocator.
    #[inline]
    pub fn increment_arena_allocations(&self) {
        bump(&self.arena_allocations);
    }

    #[inline]
    pub fn increment_arena_resets(&self) {
        bump(&self.arena_resets);
    }

    /// Counts a request the slab path could not serve and the heap did.
    #[inline]
    pub fn increment_fallbacks(&self) {
        bump(&self.fallbacks);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            pool_allocations: load(&self.pool_allocations),
            pool_deallocations: load(&self.pool_deallocations),
            arena_allocations: load(&self.arena_allocations),
            arena_resets: load(&self.arena_resets),
            fallbacks: load(&self.fallbacks),
        }
    }

    pub fn pool_allocations(&self) -> usize {
        self.snapshot().pool_allocations
    }

    pub fn pool_deallocations(&self) -> usize {
        self.snapshot().pool_deallocations
    }

    pub fn arena_allocations(&self) -> usize {
        self.snapshot().arena_allocations
    }

    pub fn arena_resets(&self) -> usize {
        self.snapshot().arena_resets
    }

    pub fn fallbacks(&self) -> usize {
        self.snapshot().fallbacks
    }

    pub fn pool_outstanding(&self) -> usize {
        self.snapshot().pool_outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_every_counter() {
        let stats = MemoryStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());

        stats.increment_pool_allocations();
        stats.increment_arena_allocations();
        stats.increment_arena_resets();
        stats.increment_fallbacks();

        let snap = stats.snapshot();
        assert_eq!(snap.pool_allocations, 1);
        assert_eq!(snap.arena_allocations, 1);
        assert_eq!(snap.arena_resets, 1);
        assert_eq!(snap.fallbacks, 1);
        assert!(snap.to_string().contains("heap fallbacks 1"));
    }

    #[test]
    fn outstanding_tracks_balance() {
        let stats = MemoryStats::new();
        for _ in 0..100 {
            stats.increment_pool_allocations();
        }
        for _ in 0..40 {
            stats.increment_pool_deallocations();
        }
        assert_eq!(stats.pool_outstanding(), 60);
    }
}
