//! ## eddy-core::collections::list
//! **Doubly linked lists over a shared link table**
//!
//! A [`Links`] table holds `prev`/`next` for every slot index of some owning
//! container. Any number of [`ListHead`]s can thread through the same table as
//! long as each index sits on at most one list at a time. Push, remove and pop
//! are all O(1).

/// Sentinel for "no index".
pub const NIL: u32 = u32::MAX;

/// Head of one list threaded through a [`Links`] table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListHead {
    head: u32,
    tail: u32,
    len: usize,
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn front(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    #[inline]
    pub fn back(&self) -> Option<u32> {
        (self.tail != NIL).then_some(self.tail)
    }
}

impl Default for ListHead {
    fn default() -> Self {
        Self::new()
    }
}

/// Link storage shared by every list over one index space.
#[derive(Clone, Debug, Default)]
pub struct Links {
    prev: Vec<u32>,
    next: Vec<u32>,
    linked: Vec<bool>,
}

impl Links {
    pub fn with_capacity(slots: usize) -> Self {
        let mut links = Self::default();
        links.grow(slots);
        links
    }

    /// Number of slot indices this table can link.
    pub fn slots(&self) -> usize {
        self.prev.len()
    }

    /// Extends the table so indices `0..slots` are linkable.
    pub fn grow(&mut self, slots: usize) {
        if slots > self.prev.len() {
            self.prev.resize(slots, NIL);
            self.next.resize(slots, NIL);
            self.linked.resize(slots, false);
        }
    }

    #[inline]
    pub fn is_linked(&self, idx: u32) -> bool {
        self.linked.get(idx as usize).copied().unwrap_or(false)
    }

    /// Appends `idx` to the tail of `list`.
    ///
    /// # Panics
    /// If `idx` is out of range or already on a list.
    pub fn push_back(&mut self, list: &mut ListHead, idx: u32) {
        let i = idx as usize;
        assert!(!self.linked[i], "index {idx} is already linked");
        self.prev[i] = list.tail;
        self.next[i] = NIL;
        if list.tail == NIL {
            list.head = idx;
        } else {
            self.next[list.tail as usize] = idx;
        }
        list.tail = idx;
        list.len += 1;
        self.linked[i] = true;
    }

    /// Prepends `idx` to the head of `list`.
    ///
    /// # Panics
    /// If `idx` is out of range or already on a list.
    pub fn push_front(&mut self, list: &mut ListHead, idx: u32) {
        let i = idx as usize;
        assert!(!self.linked[i], "index {idx} is already linked");
        self.next[i] = list.head;
        self.prev[i] = NIL;
        if list.head == NIL {
            list.tail = idx;
        } else {
            self.prev[list.head as usize] = idx;
        }
        list.head = idx;
        list.len += 1;
        self.linked[i] = true;
    }

    /// Unlinks `idx` from `list`. The caller guarantees `idx` is on `list`
    /// if it is linked at all. Returns `false` when `idx` was not linked.
    pub fn remove(&mut self, list: &mut ListHead, idx: u32) -> bool {
        if !self.is_linked(idx) {
            return false;
        }
        let i = idx as usize;
        let (prev, next) = (self.prev[i], self.next[i]);
        if prev == NIL {
            list.head = next;
        } else {
            self.next[prev as usize] = next;
        }
        if next == NIL {
            list.tail = prev;
        } else {
            self.prev[next as usize] = prev;
        }
        self.prev[i] = NIL;
        self.next[i] = NIL;
        self.linked[i] = false;
        list.len -= 1;
        true
    }

    pub fn pop_front(&mut self, list: &mut ListHead) -> Option<u32> {
        let idx = list.front()?;
        self.remove(list, idx);
        Some(idx)
    }

    #[inline]
    pub fn next(&self, idx: u32) -> Option<u32> {
        let next = *self.next.get(idx as usize)?;
        (next != NIL).then_some(next)
    }

    /// Iterates `list` front to back.
    pub fn iter<'a>(&'a self, list: &ListHead) -> Iter<'a> {
        Iter {
            links: self,
            cursor: list.head,
        }
    }
}

pub struct Iter<'a> {
    links: &'a Links,
    cursor: u32,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NIL {
            return None;
        }
        let current = self.cursor;
        self.cursor = self.links.next[current as usize];
        Some(current)
    }
}
