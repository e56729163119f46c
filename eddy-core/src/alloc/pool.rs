//! ## eddy-core::alloc::pool
//! **Allocator facade over slab caches**
//!
//! Components never reach for a global allocator. They hold an
//! `Arc<dyn Allocator>` and get owned [`Buffer`]s back, which return their
//! memory when dropped. [`SlabAllocator`] serves requests from power-of-two
//! slab caches and falls back to the heap when the zone is exhausted or the
//! request is larger than the biggest class. [`SystemAllocator`] is heap only.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use super::page::Zone;
use super::slab::{SlabCache, SlabObject, SLAB_MIN};
use super::stats::MemoryStats;
use crate::error::AllocError;

/// Largest slab object served by default.
pub const SLAB_MAX: usize = 128 * 1024;

/// Source of owned buffers with byte accounting.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Returns a buffer of exactly `size` usable bytes. Contents are
    /// unspecified.
    fn allocate(&self, size: usize) -> Result<Buffer, AllocError>;

    /// Bytes currently handed out.
    fn memtotal(&self) -> usize;

    /// Ceiling on `memtotal`; zero means unlimited.
    fn memlimit(&self) -> usize;

    fn set_memlimit(&self, limit: usize);

    fn stats(&self) -> &MemoryStats;
}

#[derive(Debug, Default)]
struct Ledger {
    total: AtomicUsize,
    limit: AtomicUsize,
    stats: MemoryStats,
}

impl Ledger {
    fn charge(&self, size: usize) -> Result<(), AllocError> {
        let limit = self.limit.load(Ordering::Relaxed);
        let mut total = self.total.load(Ordering::Relaxed);
        loop {
            let next = total
                .checked_add(size)
                .ok_or(AllocError::OutOfMemory { requested: size })?;
            if limit != 0 && next > limit {
                return Err(AllocError::LimitExceeded {
                    requested: size,
                    total,
                    limit,
                });
            }
            match self.total.compare_exchange_weak(
                total,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => total = current,
            }
        }
    }

    fn release(&self, size: usize) {
        self.total.fetch_sub(size, Ordering::AcqRel);
    }

    fn heap(self: &Arc<Self>, size: usize) -> Result<Buffer, AllocError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| AllocError::OutOfMemory { requested: size })?;
        data.resize(size, 0);
        Ok(Buffer {
            len: size,
            backing: Backing::Heap(data.into_boxed_slice()),
            ledger: Arc::clone(self),
        })
    }
}

enum Backing {
    Slab(SlabObject),
    Heap(Box<[u8]>),
    Released,
}

/// Owned bytes from an [`Allocator`]. Memory goes back on drop.
pub struct Buffer {
    len: usize,
    backing: Backing,
    ledger: Arc<Ledger>,
}

impl Buffer {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes actually reserved, which for slab buffers is the class size.
    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Slab(object) => object.size(),
            Backing::Heap(data) => data.len(),
            Backing::Released => 0,
        }
    }

    /// Whether this buffer came from a slab cache rather than the heap.
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Slab(_))
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            Backing::Slab(object) => &object.as_slice()[..self.len],
            Backing::Heap(data) => &data[..self.len],
            Backing::Released => &[],
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Slab(object) => &mut object.as_mut_slice()[..self.len],
            Backing::Heap(data) => &mut data[..self.len],
            Backing::Released => &mut [],
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.ledger.release(self.len);
        if let Backing::Slab(object) = std::mem::replace(&mut self.backing, Backing::Released) {
            drop(object);
            self.ledger.stats.increment_pool_deallocations();
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[derive(Debug)]
struct SlabShared {
    zone: Arc<Zone>,
    caches: Vec<SlabCache>,
    min_shift: u32,
    ledger: Arc<Ledger>,
}

/// Slab-backed allocator with heap fallback.
#[derive(Clone, Debug)]
pub struct SlabAllocator {
    shared: Arc<SlabShared>,
}

impl SlabAllocator {
    /// Builds one cache per power of two in `min_object..=max_object` that
    /// the zone can hold.
    pub fn new(
        zone: Arc<Zone>,
        min_object: usize,
        max_object: usize,
        free_limit: usize,
    ) -> Result<Self, AllocError> {
        if !min_object.is_power_of_two() || max_object < min_object {
            return Err(AllocError::InvalidLayout {
                size: max_object,
                align: min_object,
            });
        }
        let largest = zone.block_size(zone.max_order() - 1);

        let mut caches = Vec::new();
        let mut size = min_object;
        while size <= max_object && size <= largest {
            caches.push(SlabCache::new(
                caches.len() as u32,
                Arc::clone(&zone),
                size,
                free_limit,
            )?);
            size <<= 1;
        }
        debug!(
            classes = caches.len(),
            min_object,
            largest_class = caches.last().map(SlabCache::object_size),
            "Slab allocator ready"
        );

        Ok(Self {
            shared: Arc::new(SlabShared {
                zone,
                caches,
                min_shift: min_object.trailing_zeros(),
                ledger: Arc::new(Ledger::default()),
            }),
        })
    }

    /// Default classes, 512 B to 128 KiB.
    pub fn with_defaults(zone: Arc<Zone>) -> Result<Self, AllocError> {
        Self::new(zone, SLAB_MIN, SLAB_MAX, 1)
    }

    pub fn zone(&self) -> &Arc<Zone> {
        &self.shared.zone
    }

    /// Smallest cache whose objects hold `size` bytes.
    pub fn cache_for(&self, size: usize) -> Option<&SlabCache> {
        let class = size.max(1).checked_next_power_of_two()?;
        let index = class.trailing_zeros().saturating_sub(self.shared.min_shift);
        self.shared.caches.get(index as usize)
    }

    pub fn size_classes(&self) -> impl Iterator<Item = usize> + '_ {
        self.shared.caches.iter().map(SlabCache::object_size)
    }
}

impl Allocator for SlabAllocator {
    fn allocate(&self, size: usize) -> Result<Buffer, AllocError> {
        let ledger = &self.shared.ledger;
        ledger.charge(size)?;

        let Some(cache) = self.cache_for(size) else {
            ledger.stats.increment_fallbacks();
            trace!(size, "Oversize request served from the heap");
            return ledger.heap(size).inspect_err(|_| ledger.release(size));
        };

        match cache.alloc() {
            Ok(object) => {
                ledger.stats.increment_pool_allocations();
                Ok(Buffer {
                    len: size,
                    backing: Backing::Slab(object),
                    ledger: Arc::clone(ledger),
                })
            }
            Err(AllocError::ZoneExhausted { order }) => {
                ledger.stats.increment_fallbacks();
                debug!(size, order, "Zone exhausted, falling back to the heap");
                ledger.heap(size).inspect_err(|_| ledger.release(size))
            }
            Err(e) => {
                ledger.release(size);
                Err(e)
            }
        }
    }

    fn memtotal(&self) -> usize {
        self.shared.ledger.total.load(Ordering::Acquire)
    }

    fn memlimit(&self) -> usize {
        self.shared.ledger.limit.load(Ordering::Relaxed)
    }

    fn set_memlimit(&self, limit: usize) {
        self.shared.ledger.limit.store(limit, Ordering::Relaxed);
    }

    fn stats(&self) -> &MemoryStats {
        &self.shared.ledger.stats
    }
}

/// Heap-only allocator with the same accounting.
#[derive(Clone, Debug, Default)]
pub struct SystemAllocator {
    ledger: Arc<Ledger>,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        let allocator = Self::default();
        allocator.set_memlimit(limit);
        allocator
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<Buffer, AllocError> {
        self.ledger.charge(size)?;
        self.ledger
            .heap(size)
            .inspect_err(|_| self.ledger.release(size))
    }

    fn memtotal(&self) -> usize {
        self.ledger.total.load(Ordering::Acquire)
    }

    fn memlimit(&self) -> usize {
        self.ledger.limit.load(Ordering::Relaxed)
    }

    fn set_memlimit(&self, limit: usize) {
        self.ledger.limit.store(limit, Ordering::Relaxed);
    }

    fn stats(&self) -> &MemoryStats {
        &self.ledger.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab_allocator(pages: usize, max_order: u32) -> SlabAllocator {
        let zone = Arc::new(Zone::with_geometry(pages << 12, 12, max_order).unwrap());
        SlabAllocator::new(zone, 512, 16 * 1024, 1).unwrap()
    }

    #[test]
    fn cache_for_picks_smallest_fitting_class() {
        let allocator = slab_allocator(64, 4);
        assert_eq!(allocator.cache_for(1).unwrap().object_size(), 512);
        assert_eq!(allocator.cache_for(512).unwrap().object_size(), 512);
        assert_eq!(allocator.cache_for(513).unwrap().object_size(), 1024);
        assert_eq!(allocator.cache_for(16 * 1024).unwrap().object_size(), 16 * 1024);
        assert!(allocator.cache_for(16 * 1024 + 1).is_none());
        assert_eq!(
            allocator.size_classes().collect::<Vec<_>>(),
            vec![512, 1024, 2048, 4096, 8192, 16384]
        );
    }

    #[test]
    fn buffers_are_pooled_and_returned_on_drop() {
        let allocator = slab_allocator(64, 4);
        let mut buffer = allocator.allocate(100).unwrap();
        assert!(buffer.is_pooled());
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 512);
        buffer.fill(7);
        assert!(buffer.iter().all(|&b| b == 7));
        assert_eq!(allocator.memtotal(), 100);

        drop(buffer);
        assert_eq!(allocator.memtotal(), 0);
        assert_eq!(allocator.stats().pool_allocations(), 1);
        assert_eq!(allocator.stats().pool_deallocations(), 1);
    }

    #[test]
    fn buffers_outlive_their_allocator() {
        let allocator = slab_allocator(64, 4);
        let zone = Arc::clone(allocator.zone());
        let mut buffer = allocator.allocate(700).unwrap();
        drop(allocator);

        buffer.fill(3);
        assert!(buffer.iter().all(|&b| b == 3));
        drop(buffer);
        assert_eq!(zone.free_page_count(), 64);
    }

    #[test]
    fn memlimit_bounds_total() {
        let allocator = slab_allocator(64, 4);
        allocator.set_memlimit(1000);
        let first = allocator.allocate(600).unwrap();
        assert_eq!(
            allocator.allocate(600).unwrap_err(),
            AllocError::LimitExceeded {
                requested: 600,
                total: 600,
                limit: 1000
            }
        );
        drop(first);
        assert!(allocator.allocate(600).is_ok());
    }

    #[test]
    fn exhausted_zone_falls_back_to_heap() {
        let zone = Arc::new(Zone::with_geometry(4096, 12, 1).unwrap());
        let allocator = SlabAllocator::new(zone, 512, 4096, 0).unwrap();

        let pooled = allocator.allocate(4096).unwrap();
        assert!(pooled.is_pooled());
        let fallback = allocator.allocate(4096).unwrap();
        assert!(!fallback.is_pooled());
        assert_eq!(fallback.len(), 4096);
        assert_eq!(allocator.stats().fallbacks(), 1);

        let oversize = allocator.allocate(10_000).unwrap();
        assert!(!oversize.is_pooled());
        assert_eq!(allocator.stats().fallbacks(), 2);
        assert_eq!(allocator.memtotal(), 4096 * 2 + 10_000);
    }

    #[test]
    fn zero_sized_requests_succeed() {
        let allocator = SystemAllocator::new();
        let buffer = allocator.allocate(0).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn system_allocator_honours_limit() {
        let allocator = SystemAllocator::with_limit(64);
        let buffer = allocator.allocate(64).unwrap();
        assert!(matches!(
            allocator.allocate(1),
            Err(AllocError::LimitExceeded { .. })
        ));
        drop(buffer);
        assert_eq!(allocator.memtotal(), 0);
    }

    #[test]
    fn concurrent_churn_leaves_nothing_outstanding() {
        let allocator = slab_allocator(256, 5);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let allocator = &allocator;
                scope.spawn(move || {
                    for i in 0..500 {
                        let size = 64 + ((t * 997 + i * 131) % 8000);
                        let mut buffer = allocator.allocate(size).unwrap();
                        buffer[0] = t as u8;
                        assert_eq!(buffer[0], t as u8);
                    }
                });
            }
        });
        assert_eq!(allocator.memtotal(), 0);
        assert_eq!(allocator.stats().pool_outstanding(), 0);
    }
}
