//! ## eddy-core::alloc::arena
//! **Reference-counted bump arenas handing out handles**
//!
//! An arena owns a chain of fixed-size blocks plus a list of oversized
//! allocations, all drawn from an explicit [`Allocator`]. `alloc` returns an
//! [`ArenaRef`] handle (block, offset, length, epoch) instead of a raw
//! address; bytes are reached through the arena, so no reference can outlive
//! the memory it points into.
//!
//! Two flavours share one core:
//! - [`LocalArena`]: single owner, `!Send`, no locking.
//! - [`Arena`]: shared across threads, serialized by a mutex.
//!
//! Cleanup closures run once, newest first, when the last reference goes.
//! Closures and accessors must not re-enter the same arena.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;

use super::pool::{Allocator, Buffer};
use crate::error::AllocError;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Alignment of `alloc_bytes`.
pub const DEFAULT_ALIGN: usize = std::mem::size_of::<usize>();

const MIN_BLOCK_SIZE: usize = 64;
const LARGE: u32 = 1 << 31;
/// Largest block an arena accepts; handle offsets are 31 bits wide.
pub const MAX_BLOCK_SIZE: usize = LARGE as usize;

/// Handle to bytes inside one arena epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaRef {
    epoch: u32,
    slot: u32,
    offset: u32,
    len: u32,
}

impl ArenaRef {
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the bytes live in the oversized list rather than a block.
    pub fn is_large(&self) -> bool {
        self.slot & LARGE != 0
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct ArenaCore {
    allocator: Arc<dyn Allocator>,
    block_size: usize,
    blocks: Vec<Buffer>,
    current: usize,
    used: usize,
    large: Vec<Buffer>,
    epoch: u32,
    cleanups: Vec<Cleanup>,
}

/// Narrows a handle field, refusing values that would collide with the
/// oversized-slot bit.
fn handle_field(value: usize, invalid: &AllocError) -> Result<u32, AllocError> {
    u32::try_from(value)
        .ok()
        .filter(|v| v & LARGE == 0)
        .ok_or_else(|| invalid.clone())
}

fn align_offset(block: &[u8], from: usize, align: usize) -> usize {
    let base = block.as_ptr() as usize;
    ((base + from + align - 1) & !(align - 1)) - base
}

impl ArenaCore {
    fn new(allocator: Arc<dyn Allocator>, block_size: usize) -> Result<Self, AllocError> {
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        if block_size > MAX_BLOCK_SIZE {
            return Err(AllocError::InvalidLayout {
                size: block_size,
                align: 1,
            });
        }
        let first = allocator.allocate(block_size)?;
        Ok(Self {
            allocator,
            block_size,
            blocks: vec![first],
            current: 0,
            used: 0,
            large: Vec::new(),
            epoch: 0,
            cleanups: Vec::new(),
        })
    }

    fn alloc(&mut self, size: usize, align: usize) -> Result<ArenaRef, AllocError> {
        let invalid = AllocError::InvalidLayout { size, align };
        if !align.is_power_of_two() || size >= MAX_BLOCK_SIZE || align >= MAX_BLOCK_SIZE {
            return Err(invalid);
        }
        let padded = size.checked_add(align - 1).ok_or_else(|| invalid.clone())?;
        self.allocator.stats().increment_arena_allocations();

        if padded > self.block_size {
            return self.alloc_large(size, align);
        }

        let (saved_current, saved_used) = (self.current, self.used);
        loop {
            let block = &self.blocks[self.current];
            let start = align_offset(block, self.used, align);
            if start + size <= block.len() {
                let handle = ArenaRef {
                    epoch: self.epoch,
                    slot: handle_field(self.current, &invalid)?,
                    offset: handle_field(start, &invalid)?,
                    len: handle_field(size, &invalid)?,
                };
                self.used = start + size;
                return Ok(handle);
            }

            self.current += 1;
            self.used = 0;
            if self.current == self.blocks.len() {
                match self.allocator.allocate(self.block_size) {
                    Ok(block) => self.blocks.push(block),
                    Err(e) => {
                        self.current = saved_current;
                        self.used = saved_used;
                        return Err(e);
                    }
                }
            }
        }
    }

    fn alloc_large(&mut self, size: usize, align: usize) -> Result<ArenaRef, AllocError> {
        let invalid = AllocError::InvalidLayout { size, align };
        let slot = handle_field(self.large.len(), &invalid)? | LARGE;
        let len = handle_field(size, &invalid)?;
        let buffer = self.allocator.allocate(size + align - 1)?;
        let offset = handle_field(align_offset(&buffer, 0, align), &invalid)?;
        self.large.push(buffer);
        Ok(ArenaRef {
            epoch: self.epoch,
            slot,
            offset,
            len,
        })
    }

    fn buffer_index(&self, r: ArenaRef) -> (bool, usize) {
        assert_eq!(r.epoch, self.epoch, "arena handle used after clear");
        (r.slot & LARGE != 0, (r.slot & !LARGE) as usize)
    }

    fn bytes(&self, r: ArenaRef) -> &[u8] {
        let (large, index) = self.buffer_index(r);
        let buffer = if large {
            &self.large[index]
        } else {
            &self.blocks[index]
        };
        &buffer[r.offset as usize..r.offset as usize + r.len as usize]
    }

    fn bytes_mut(&mut self, r: ArenaRef) -> &mut [u8] {
        let (large, index) = self.buffer_index(r);
        let buffer = if large {
            &mut self.large[index]
        } else {
            &mut self.blocks[index]
        };
        &mut buffer[r.offset as usize..r.offset as usize + r.len as usize]
    }

    fn alloc_copy(&mut self, data: &[u8]) -> Result<ArenaRef, AllocError> {
        let r = self.alloc(data.len(), 1)?;
        self.bytes_mut(r).copy_from_slice(data);
        Ok(r)
    }

    fn calloc(&mut self, size: usize, align: usize) -> Result<ArenaRef, AllocError> {
        let r = self.alloc(size, align)?;
        self.bytes_mut(r).fill(0);
        Ok(r)
    }

    fn clear(&mut self) {
        self.large.clear();
        self.blocks.truncate(1);
        self.current = 0;
        self.used = 0;
        self.epoch = self.epoch.wrapping_add(1);
        self.allocator.stats().increment_arena_resets();
    }

    fn allocated_bytes(&self) -> usize {
        self.blocks.len() * self.block_size + self.large.iter().map(|b| b.len()).sum::<usize>()
    }
}

impl Drop for ArenaCore {
    fn drop(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }
}

/// Arena shared between threads. Cloning retains; dropping releases.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<Mutex<ArenaCore>>,
}

impl Arena {
    /// Creates an arena whose blocks hold `initial_size` bytes.
    pub fn acquire(allocator: Arc<dyn Allocator>, initial_size: usize) -> Result<Self, AllocError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(ArenaCore::new(allocator, initial_size)?)),
        })
    }

    pub fn alloc(&self, size: usize, align: usize) -> Result<ArenaRef, AllocError> {
        self.inner.lock().alloc(size, align)
    }

    pub fn alloc_bytes(&self, size: usize) -> Result<ArenaRef, AllocError> {
        self.alloc(size, DEFAULT_ALIGN)
    }

    /// Zero-filled allocation.
    pub fn calloc(&self, size: usize, align: usize) -> Result<ArenaRef, AllocError> {
        self.inner.lock().calloc(size, align)
    }

    /// Copies `data` into the arena.
    pub fn alloc_copy(&self, data: &[u8]) -> Result<ArenaRef, AllocError> {
        self.inner.lock().alloc_copy(data)
    }

    /// Runs `f` over the bytes behind `r`.
    ///
    /// # Panics
    /// If `r` predates the last `clear`.
    pub fn read<R>(&self, r: ArenaRef, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.inner.lock().bytes(r))
    }

    pub fn with_mut<R>(&self, r: ArenaRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(self.inner.lock().bytes_mut(r))
    }

    pub fn to_vec(&self, r: ArenaRef) -> Vec<u8> {
        self.read(r, <[u8]>::to_vec)
    }

    /// Takes another reference to the same arena.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Drops this reference; the last one runs cleanups and frees blocks.
    pub fn release(self) {}

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Registers `f` to run when the last reference is released.
    pub fn on_release(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.lock().cleanups.push(Box::new(f));
    }

    /// Drops every allocation but keeps the first block. Handles taken before
    /// the call panic on use.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().allocated_bytes()
    }

    pub fn block_size(&self) -> usize {
        self.inner.lock().block_size
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("refs", &self.ref_count())
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

/// Single-owner arena. Cloning retains within the owning thread.
#[derive(Clone)]
pub struct LocalArena {
    inner: Rc<RefCell<ArenaCore>>,
}

impl LocalArena {
    pub fn acquire(allocator: Arc<dyn Allocator>, initial_size: usize) -> Result<Self, AllocError> {
        Ok(Self {
            inner: Rc::new(RefCell::new(ArenaCore::new(allocator, initial_size)?)),
        })
    }

    pub fn alloc(&self, size: usize, align: usize) -> Result<ArenaRef, AllocError> {
        self.inner.borrow_mut().alloc(size, align)
    }

    pub fn alloc_bytes(&self, size: usize) -> Result<ArenaRef, AllocError> {
        self.alloc(size, DEFAULT_ALIGN)
    }

    pub fn calloc(&self, size: usize, align: usize) -> Result<ArenaRef, AllocError> {
        self.inner.borrow_mut().calloc(size, align)
    }

    pub fn alloc_copy(&self, data: &[u8]) -> Result<ArenaRef, AllocError> {
        self.inner.borrow_mut().alloc_copy(data)
    }

    pub fn read<R>(&self, r: ArenaRef, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.inner.borrow().bytes(r))
    }

    pub fn with_mut<R>(&self, r: ArenaRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(self.inner.borrow_mut().bytes_mut(r))
    }

    pub fn to_vec(&self, r: ArenaRef) -> Vec<u8> {
        self.read(r, <[u8]>::to_vec)
    }

    pub fn retain(&self) -> Self {
        self.clone()
    }

    pub fn release(self) {}

    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn on_release(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.borrow_mut().cleanups.push(Box::new(f));
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.inner.borrow().allocated_bytes()
    }

    /// Marks the arena shared. Fails, handing the arena back, while other
    /// local references exist.
    pub fn into_shared(self) -> Result<Arena, LocalArena> {
        match Rc::try_unwrap(self.inner) {
            Ok(core) => Ok(Arena {
                inner: Arc::new(Mutex::new(core.into_inner())),
            }),
            Err(inner) => Err(LocalArena { inner }),
        }
    }
}

impl fmt::Debug for LocalArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalArena")
            .field("refs", &self.ref_count())
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}
