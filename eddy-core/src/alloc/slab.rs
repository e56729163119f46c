//! ## eddy-core::alloc::slab
//! **Fixed-size object caches carved from zone pages**
//!
//! Each [`SlabCache`] serves one object size. A slab is one page run from the
//! zone split into equal slots, with a free-slot stack per slab. Slabs sit on
//! exactly one of three lists (partial, full, empty) threaded through a shared
//! [`Links`] table, so a cache with spare capacity never asks the zone for a
//! fresh page.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use super::page::{Page, Zone};
use crate::collections::{Links, ListHead};
use crate::error::AllocError;

/// Smallest object size served by default.
pub const SLAB_MIN: usize = 512;
const MIN_OBJECTS_PER_SLAB: usize = 8;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// One object handed out by a [`SlabCache`]. Owning it is owning its bytes.
///
/// The object keeps its cache's slabs mapped and goes back to that cache
/// when dropped, even if every [`SlabCache`] handle is gone by then.
pub struct SlabObject {
    owner: Arc<CacheShared>,
    slab: u32,
    slot: u16,
    ptr: NonNull<u8>,
}

// SAFETY: a slab object is a unique, disjoint region of the zone mapping and
// the mapping outlives it through `owner`.
unsafe impl Send for SlabObject {}
unsafe impl Sync for SlabObject {}

impl SlabObject {
    pub fn size(&self) -> usize {
        self.owner.object_size
    }

    /// Id of the cache this object returns to.
    pub fn cache_id(&self) -> u64 {
        self.owner.id
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+size belongs to this object alone and `owner`
        // keeps the slab page allocated.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size()) }
    }
}

impl Drop for SlabObject {
    fn drop(&mut self) {
        self.owner.release(self.slab, self.slot, self.ptr);
    }
}

impl std::fmt::Debug for SlabObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabObject")
            .field("cache", &self.owner.id)
            .field("slab", &self.slab)
            .field("slot", &self.slot)
            .field("size", &self.size())
            .finish()
    }
}

struct Slab {
    page: Page,
    base: NonNull<u8>,
    free: Vec<u16>,
    inuse: u16,
}

struct CacheState {
    slabs: Vec<Option<Slab>>,
    vacant: Vec<u32>,
    links: Links,
    partial: ListHead,
    full: ListHead,
    empty: ListHead,
    free_objects: usize,
}

/// State shared by a cache handle and every object it handed out. Slab pages
/// go back to the zone when the last of them is dropped.
struct CacheShared {
    id: u64,
    index: u32,
    object_size: usize,
    order: u32,
    per_slab: usize,
    free_limit: usize,
    zone: Arc<Zone>,
    state: Mutex<CacheState>,
}

// SAFETY: raw slab base pointers are only dereferenced through owned objects.
unsafe impl Send for CacheShared {}
unsafe impl Sync for CacheShared {}

impl CacheShared {
    fn grow(&self, state: &mut CacheState) -> Result<u32, AllocError> {
        let page = self.zone.alloc_pages(self.order)?;
        let base = self.zone.page_ptr(&page);
        let slab = Slab {
            page,
            base,
            free: (0..self.per_slab as u16).rev().collect(),
            inuse: 0,
        };
        let id = match state.vacant.pop() {
            Some(id) => {
                state.slabs[id as usize] = Some(slab);
                id
            }
            None => {
                state.slabs.push(Some(slab));
                state.links.grow(state.slabs.len());
                (state.slabs.len() - 1) as u32
            }
        };
        state.links.push_back(&mut state.partial, id);
        state.free_objects += self.per_slab;
        trace!(
            object_size = self.object_size,
            slab = id,
            "Slab cache grew by one slab"
        );
        Ok(id)
    }

    fn release(&self, id: u32, slot: u16, ptr: NonNull<u8>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(slab) = state.slabs.get_mut(id as usize).and_then(Option::as_mut) else {
            error!(cache = self.id, slab = id, "Object names a vacant slab, leaking it");
            return;
        };
        let expected = slab.base.as_ptr().wrapping_add(usize::from(slot) * self.object_size);
        if usize::from(slot) >= self.per_slab || expected != ptr.as_ptr() || slab.inuse == 0 {
            error!(cache = self.id, slab = id, slot, "Object outside its slab, leaking it");
            return;
        }

        let was_full = slab.free.is_empty();
        slab.free.push(slot);
        slab.inuse -= 1;
        let now_empty = slab.inuse == 0;
        state.free_objects += 1;

        if was_full {
            state.links.remove(&mut state.full, id);
            state.links.push_back(&mut state.partial, id);
        }
        if now_empty {
            state.links.remove(&mut state.partial, id);
            if state.empty.len() >= self.free_limit {
                if let Some(slab) = state.slabs[id as usize].take() {
                    state.vacant.push(id);
                    state.free_objects -= self.per_slab;
                    self.zone.free_pages(slab.page);
                }
            } else {
                state.links.push_back(&mut state.empty, id);
            }
        }
    }
}

impl Drop for CacheShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for slab in state.slabs.drain(..).flatten() {
            self.zone.free_pages(slab.page);
        }
    }
}

/// Cache of equal-size objects. The lock is scoped to this cache only.
pub struct SlabCache {
    shared: Arc<CacheShared>,
}

impl SlabCache {
    /// Creates a cache for `object_size` objects, keeping at most `free_limit`
    /// empty slabs before pages go back to the zone. `index` is the size
    /// class position within its allocator.
    pub fn new(
        index: u32,
        zone: Arc<Zone>,
        object_size: usize,
        free_limit: usize,
    ) -> Result<Self, AllocError> {
        let largest = zone.block_size(zone.max_order() - 1);
        if object_size == 0 || object_size > largest {
            return Err(AllocError::InvalidLayout {
                size: object_size,
                align: 1,
            });
        }

        let order = (0..zone.max_order())
            .find(|&o| zone.block_size(o) / object_size >= MIN_OBJECTS_PER_SLAB)
            .unwrap_or(zone.max_order() - 1);
        let per_slab = (zone.block_size(order) / object_size).min(u16::MAX as usize);

        Ok(Self {
            shared: Arc::new(CacheShared {
                id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                index,
                object_size,
                order,
                per_slab,
                free_limit,
                zone,
                state: Mutex::new(CacheState {
                    slabs: Vec::new(),
                    vacant: Vec::new(),
                    links: Links::default(),
                    partial: ListHead::new(),
                    full: ListHead::new(),
                    empty: ListHead::new(),
                    free_objects: 0,
                }),
            }),
        })
    }

    /// Process-unique id; objects carry it back on free.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn object_size(&self) -> usize {
        self.shared.object_size
    }

    /// Page order each slab of this cache occupies.
    pub fn order(&self) -> u32 {
        self.shared.order
    }

    pub fn objects_per_slab(&self) -> usize {
        self.shared.per_slab
    }

    pub fn free_objects(&self) -> usize {
        self.shared.state.lock().free_objects
    }

    /// Slab counts as `(partial, full, empty)`.
    pub fn slab_counts(&self) -> (usize, usize, usize) {
        let state = self.shared.state.lock();
        (state.partial.len(), state.full.len(), state.empty.len())
    }

    /// Takes one object, pulling a new page run from the zone only when no
    /// slab has a free slot.
    pub fn alloc(&self) -> Result<SlabObject, AllocError> {
        let shared = &self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        let id = match state.partial.front() {
            Some(id) => id,
            None => match state.links.pop_front(&mut state.empty) {
                Some(id) => {
                    state.links.push_back(&mut state.partial, id);
                    id
                }
                None => shared.grow(state)?,
            },
        };

        let Some(slab) = state.slabs[id as usize].as_mut() else {
            unreachable!("slab {id} listed but vacant");
        };
        let Some(slot) = slab.free.pop() else {
            unreachable!("slab {id} on partial list without free slots");
        };
        slab.inuse += 1;
        state.free_objects -= 1;

        let ptr = unsafe {
            // SAFETY: slot < per_slab, so the offset stays inside the run.
            NonNull::new_unchecked(
                slab.base
                    .as_ptr()
                    .add(usize::from(slot) * shared.object_size),
            )
        };
        if slab.free.is_empty() {
            state.links.remove(&mut state.partial, id);
            state.links.push_back(&mut state.full, id);
        }

        Ok(SlabObject {
            owner: Arc::clone(shared),
            slab: id,
            slot,
            ptr,
        })
    }

    /// Returns an object to its slab. Dropping the object does the same.
    ///
    /// # Panics
    /// If `object` belongs to another cache. The object still goes back to
    /// the cache that handed it out.
    pub fn free(&self, object: SlabObject) {
        assert_eq!(
            object.cache_id(),
            self.shared.id,
            "object returned to wrong cache"
        );
        drop(object);
    }
}

impl std::fmt::Debug for SlabCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabCache")
            .field("id", &self.shared.id)
            .field("object_size", &self.shared.object_size)
            .field("order", &self.shared.order)
            .field("per_slab", &self.shared.per_slab)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(pages: usize) -> Arc<Zone> {
        Arc::new(Zone::with_geometry(pages << 12, 12, 4).unwrap())
    }

    #[test]
    fn picks_order_holding_eight_objects() {
        let zone = zone(16);
        let cache = SlabCache::new(0, zone.clone(), 1024, 1).unwrap();
        assert_eq!(cache.order(), 1);
        assert_eq!(cache.objects_per_slab(), 8);

        let small = SlabCache::new(1, zone, 512, 1).unwrap();
        assert_eq!(small.order(), 0);
    }

    #[test]
    fn objects_are_distinct_and_recycled() {
        let zone = zone(16);
        let cache = SlabCache::new(0, zone.clone(), 512, 1).unwrap();
        let mut a = cache.alloc().unwrap();
        let mut b = cache.alloc().unwrap();
        a.as_mut_slice().fill(1);
        b.as_mut_slice().fill(2);
        assert!(a.as_slice().iter().all(|&x| x == 1));
        let a_ptr = a.as_slice().as_ptr();
        cache.free(a);
        let c = cache.alloc().unwrap();
        assert_eq!(c.as_slice().as_ptr(), a_ptr);
        cache.free(b);
        cache.free(c);
    }

    #[test]
    fn slabs_move_between_lists() {
        let zone = zone(16);
        let cache = SlabCache::new(0, zone.clone(), 512, 1).unwrap();
        let per = cache.objects_per_slab();

        let mut held: Vec<SlabObject> = (0..per).map(|_| cache.alloc().unwrap()).collect();
        assert_eq!(cache.slab_counts(), (0, 1, 0));
        assert_eq!(cache.free_objects(), 0);

        let extra = cache.alloc().unwrap();
        assert_eq!(cache.slab_counts(), (1, 1, 0));

        cache.free(held.pop().unwrap());
        assert_eq!(cache.slab_counts(), (2, 0, 0));

        cache.free(extra);
        assert_eq!(cache.slab_counts(), (1, 0, 1));
        for object in held {
            cache.free(object);
        }
        // free_limit of one: the second empty slab goes back to the zone.
        assert_eq!(cache.slab_counts(), (0, 0, 1));
        assert_eq!(zone.free_page_count(), 15);
    }

    #[test]
    fn zone_exhaustion_surfaces_from_alloc() {
        let zone = zone(1);
        let cache = SlabCache::new(0, zone, 512, 0).unwrap();
        let held: Vec<SlabObject> = (0..8).map(|_| cache.alloc().unwrap()).collect();
        assert!(matches!(
            cache.alloc(),
            Err(AllocError::ZoneExhausted { .. })
        ));
        drop(held);
    }

    #[test]
    fn drop_returns_pages() {
        let zone = zone(16);
        {
            let cache = SlabCache::new(0, zone.clone(), 2048, 4).unwrap();
            let object = cache.alloc().unwrap();
            assert!(zone.free_page_count() < 16);
            cache.free(object);
        }
        assert_eq!(zone.free_page_count(), 16);
    }

    #[test]
    fn objects_keep_their_slab_mapped_after_the_cache_is_dropped() {
        let zone = zone(16);
        let cache = SlabCache::new(0, zone.clone(), 512, 1).unwrap();
        let mut object = cache.alloc().unwrap();
        drop(cache);

        object.as_mut_slice().fill(9);
        assert_eq!(object.as_slice()[0], 9);
        assert!(zone.free_page_count() < 16);
        drop(object);
        assert_eq!(zone.free_page_count(), 16);
    }

    #[test]
    fn foreign_objects_never_enter_another_cache() {
        let zone = zone(16);
        let a = SlabCache::new(0, zone.clone(), 512, 1).unwrap();
        let b = SlabCache::new(0, zone.clone(), 512, 1).unwrap();
        assert_ne!(a.id(), b.id());

        let live_b = b.alloc().unwrap();
        let foreign = a.alloc().unwrap();
        let free_before = b.free_objects();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| b.free(foreign)));
        assert!(result.is_err());
        assert_eq!(b.free_objects(), free_before);
        assert_eq!(a.free_objects(), a.objects_per_slab());

        let next_b = b.alloc().unwrap();
        assert_ne!(next_b.as_slice().as_ptr(), live_b.as_slice().as_ptr());
    }
}
