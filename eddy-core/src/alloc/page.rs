//! ## eddy-core::alloc::page
//! **Buddy page zones over one anonymous mapping**
//!
//! A [`Zone`] maps `max_bytes` of anonymous memory once and hands it out in
//! power-of-two runs of pages ("orders"). Each order keeps a free list threaded
//! through a shared [`Links`] table, so allocation and release are O(1) apart
//! from the buddy split/merge walk, which is bounded by `max_order`.
//!
//! The zone never grows. When it runs dry the caller gets
//! [`AllocError::ZoneExhausted`] and is expected to fall back to the heap.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::debug;

use crate::collections::{Links, ListHead};
use crate::error::AllocError;

/// 64 KiB pages.
pub const DEFAULT_PAGE_SHIFT: u32 = 16;
/// Orders `0..MAX_ORDER`; the largest block is `2^11` pages (128 MiB at 64 KiB pages).
pub const MAX_ORDER: u32 = 12;

const FLAG_HEAD: u8 = 0x80;
const FLAG_FREE: u8 = 0x40;
const ORDER_MASK: u8 = 0x3f;

static NEXT_ZONE_ID: AtomicU64 = AtomicU64::new(1);

/// A run of `2^order` pages owned by the holder. Not `Clone`: returning it
/// to the zone consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Page {
    zone: u64,
    index: u32,
    order: u32,
}

impl Page {
    /// First page number of the run.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Number of pages in the run.
    pub fn pages(&self) -> usize {
        1 << self.order
    }
}

struct ZoneState {
    areas: Vec<ListHead>,
    links: Links,
    flags: Vec<u8>,
    free_pages: usize,
}

impl ZoneState {
    fn push_free(&mut self, index: u32, order: u32) {
        self.flags[index as usize] = FLAG_HEAD | FLAG_FREE | order as u8;
        self.links.push_back(&mut self.areas[order as usize], index);
    }

    fn pop_free(&mut self, order: u32) -> Option<u32> {
        let index = self.links.pop_front(&mut self.areas[order as usize])?;
        self.flags[index as usize] = 0;
        Some(index)
    }

    fn is_free_head(&self, index: u32, order: u32) -> bool {
        self.flags[index as usize] == FLAG_HEAD | FLAG_FREE | order as u8
    }
}

/// Contiguous mapped region carved into buddy-allocated page runs.
pub struct Zone {
    id: u64,
    base: NonNull<u8>,
    _map: MmapMut,
    page_shift: u32,
    page_count: u32,
    max_order: u32,
    state: Mutex<ZoneState>,
}

// SAFETY: the mapping is only reachable through `Page` handles, which are
// unique and disjoint; the bookkeeping is behind a mutex.
unsafe impl Send for Zone {}
unsafe impl Sync for Zone {}

impl Zone {
    /// Creates a zone of at most `max_bytes` with 64 KiB pages.
    pub fn create(max_bytes: usize) -> Result<Self, AllocError> {
        Self::with_geometry(max_bytes, DEFAULT_PAGE_SHIFT, MAX_ORDER)
    }

    pub fn with_geometry(
        max_bytes: usize,
        page_shift: u32,
        max_order: u32,
    ) -> Result<Self, AllocError> {
        if max_order == 0 || max_order > MAX_ORDER {
            return Err(AllocError::InvalidOrder {
                order: max_order,
                max_order: MAX_ORDER,
            });
        }
        let page_count = (max_bytes >> page_shift).min(u32::MAX as usize - 1);
        if page_count == 0 {
            return Err(AllocError::OutOfMemory {
                requested: max_bytes,
            });
        }
        let len = page_count << page_shift;
        let mut map = MmapMut::map_anon(len)
            .map_err(|_| AllocError::OutOfMemory { requested: len })?;
        let base =
            NonNull::new(map.as_mut_ptr()).ok_or(AllocError::OutOfMemory { requested: len })?;

        let page_count = page_count as u32;
        let mut state = ZoneState {
            areas: vec![ListHead::new(); max_order as usize],
            links: Links::with_capacity(page_count as usize),
            flags: vec![0; page_count as usize],
            free_pages: page_count as usize,
        };

        // Carve the region into the largest aligned blocks that fit.
        let mut index = 0u32;
        while index < page_count {
            let mut order = max_order - 1;
            while order > 0
                && (index % (1 << order) != 0
                    || u64::from(index) + (1 << order) > u64::from(page_count))
            {
                order -= 1;
            }
            state.push_free(index, order);
            index += 1 << order;
        }

        debug!(
            pages = page_count,
            page_size = 1usize << page_shift,
            max_order,
            "Zone created"
        );

        Ok(Self {
            id: NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed),
            base,
            _map: map,
            page_shift,
            page_count,
            max_order,
            state: Mutex::new(state),
        })
    }

    pub fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    pub fn page_count(&self) -> usize {
        self.page_count as usize
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Bytes in one block of `order`.
    pub fn block_size(&self, order: u32) -> usize {
        self.page_size() << order
    }

    pub fn free_page_count(&self) -> usize {
        self.state.lock().free_pages
    }

    /// Number of free blocks currently queued at `order`.
    pub fn nr_free(&self, order: u32) -> usize {
        self.state
            .lock()
            .areas
            .get(order as usize)
            .map_or(0, ListHead::len)
    }

    /// Allocates a run of `2^order` pages.
    pub fn alloc_pages(&self, order: u32) -> Result<Page, AllocError> {
        if order >= self.max_order {
            return Err(AllocError::InvalidOrder {
                order,
                max_order: self.max_order,
            });
        }

        let mut state = self.state.lock();
        let mut current = order;
        let index = loop {
            if current >= self.max_order {
                return Err(AllocError::ZoneExhausted { order });
            }
            if let Some(index) = state.pop_free(current) {
                break index;
            }
            current += 1;
        };

        // Split the surplus halves back onto the lower free lists.
        while current > order {
            current -= 1;
            state.push_free(index + (1 << current), current);
        }

        state.flags[index as usize] = FLAG_HEAD | order as u8;
        state.free_pages -= 1 << order;

        Ok(Page {
            zone: self.id,
            index,
            order,
        })
    }

    /// Returns a run to the zone, merging it with free buddies.
    ///
    /// # Panics
    /// If `page` came from another zone.
    pub fn free_pages(&self, page: Page) {
        assert_eq!(page.zone, self.id, "page returned to the wrong zone");

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (mut index, mut order) = (page.index, page.order);
        debug_assert_eq!(
            state.flags[index as usize] & (FLAG_HEAD | FLAG_FREE | ORDER_MASK),
            FLAG_HEAD | order as u8
        );
        state.flags[index as usize] = 0;
        state.free_pages += 1 << order;

        while order + 1 < self.max_order {
            let buddy = index ^ (1 << order);
            if buddy >= self.page_count || !state.is_free_head(buddy, order) {
                break;
            }
            state.links.remove(&mut state.areas[order as usize], buddy);
            state.flags[buddy as usize] = 0;
            index = index.min(buddy);
            order += 1;
        }

        state.push_free(index, order);
    }

    /// Byte view of an owned run.
    pub fn page_slice_mut<'a>(&'a self, page: &'a mut Page) -> &'a mut [u8] {
        let len = self.block_size(page.order);
        // SAFETY: `page` is the unique handle to this run and the run lies
        // inside the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.page_ptr(page).as_ptr(), len) }
    }

    /// Start address of an owned run.
    pub(crate) fn page_ptr(&self, page: &Page) -> NonNull<u8> {
        assert_eq!(page.zone, self.id, "page used with the wrong zone");
        let offset = (page.index as usize) << self.page_shift;
        // SAFETY: offset < mapping length by construction of `Page`.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("page_size", &self.page_size())
            .field("page_count", &self.page_count)
            .field("max_order", &self.max_order)
            .field("free_pages", &self.free_page_count())
            .finish()
    }
}
