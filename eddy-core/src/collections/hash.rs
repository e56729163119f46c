//! ## eddy-core::collections::hash
//! **Chained hash tables with insertion-order iteration**
//!
//! Buckets hold the index of the newest entry in their chain; entries live in
//! a slot vector with a free-index stack, so inserting never moves existing
//! entries. Every entry is also threaded through an insertion-order list,
//! which gives the oldest-first sweeps that session timeouts need.

use super::list::{Links, ListHead, NIL};

const MURMUR_M: u64 = 0xc6a4_a793_5bd1_e995;
const MURMUR_R: u32 = 47;

/// MurmurHash64A over `data`.
pub fn hash_code(data: &[u8], seed: u64) -> u64 {
    let mut h = seed ^ (data.len() as u64).wrapping_mul(MURMUR_M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]);
        k = k.wrapping_mul(MURMUR_M);
        k ^= k >> MURMUR_R;
        k = k.wrapping_mul(MURMUR_M);
        h ^= k;
        h = h.wrapping_mul(MURMUR_M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, byte) in tail.iter().enumerate() {
            h ^= u64::from(*byte) << (8 * i);
        }
        h = h.wrapping_mul(MURMUR_M);
    }

    h ^= h >> MURMUR_R;
    h = h.wrapping_mul(MURMUR_M);
    h ^= h >> MURMUR_R;
    h
}

/// Finalizer from murmur3; spreads sequential ids across buckets.
#[inline]
fn mix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Stable handle to one entry; stale handles are rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

struct Entry<V> {
    key: u64,
    value: V,
    chain: u32,
}

/// Hash table keyed by `u64` with open chaining.
pub struct HashTable<V> {
    buckets: Box<[u32]>,
    mask: u64,
    entries: Vec<Option<Entry<V>>>,
    generations: Vec<u32>,
    vacant: Vec<u32>,
    order: Links,
    list: ListHead,
}

impl<V> HashTable<V> {
    /// Creates a table whose bucket count is `size` rounded up to a power of two.
    pub fn with_capacity(size: usize) -> Self {
        let buckets = size.max(1).next_power_of_two();
        Self {
            buckets: vec![NIL; buckets].into_boxed_slice(),
            mask: (buckets - 1) as u64,
            entries: Vec::new(),
            generations: Vec::new(),
            vacant: Vec::new(),
            order: Links::default(),
            list: ListHead::new(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    fn bucket(&self, key: u64) -> usize {
        (mix64(key) & self.mask) as usize
    }

    /// Adds an entry. Duplicate keys are allowed; lookups see the newest first.
    pub fn insert(&mut self, key: u64, value: V) -> EntryId {
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(None);
                self.generations.push(0);
                self.order.grow(self.entries.len());
                index
            }
        };
        let bucket = self.bucket(key);
        self.entries[index as usize] = Some(Entry {
            key,
            value,
            chain: self.buckets[bucket],
        });
        self.buckets[bucket] = index;
        self.order.push_back(&mut self.list, index);
        EntryId {
            index,
            generation: self.generations[index as usize],
        }
    }

    fn position(&self, key: u64, pred: impl Fn(&V) -> bool) -> Option<u32> {
        let mut cursor = self.buckets[self.bucket(key)];
        while cursor != NIL {
            let entry = self.entries[cursor as usize].as_ref()?;
            if entry.key == key && pred(&entry.value) {
                return Some(cursor);
            }
            cursor = entry.chain;
        }
        None
    }

    pub fn find(&self, key: u64) -> Option<&V> {
        self.find_by(key, |_| true)
    }

    /// Finds the newest entry under `key` whose value satisfies `pred`.
    pub fn find_by(&self, key: u64, pred: impl Fn(&V) -> bool) -> Option<&V> {
        let index = self.position(key, pred)?;
        self.entries[index as usize].as_ref().map(|e| &e.value)
    }

    pub fn find_mut(&mut self, key: u64) -> Option<&mut V> {
        let index = self.position(key, |_| true)?;
        self.entries[index as usize].as_mut().map(|e| &mut e.value)
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.position(key, |_| true).is_some()
    }

    pub fn get(&self, id: EntryId) -> Option<&V> {
        if self.generations.get(id.index as usize) != Some(&id.generation) {
            return None;
        }
        self.entries[id.index as usize].as_ref().map(|e| &e.value)
    }

    pub fn remove(&mut self, key: u64) -> Option<V> {
        self.remove_by(key, |_| true)
    }

    pub fn remove_by(&mut self, key: u64, pred: impl Fn(&V) -> bool) -> Option<V> {
        let index = self.position(key, pred)?;
        Some(self.unlink(index))
    }

    /// Removes the entry behind `id`; returns `None` if it is already gone.
    pub fn remove_entry(&mut self, id: EntryId) -> Option<V> {
        let live = self.generations.get(id.index as usize) == Some(&id.generation)
            && self.entries[id.index as usize].is_some();
        live.then(|| self.unlink(id.index))
    }

    fn unlink(&mut self, index: u32) -> V {
        let (key, chain) = match &self.entries[index as usize] {
            Some(entry) => (entry.key, entry.chain),
            None => unreachable!("unlink of vacant slot {index}"),
        };
        let bucket = self.bucket(key);
        if self.buckets[bucket] == index {
            self.buckets[bucket] = chain;
        } else {
            let mut cursor = self.buckets[bucket];
            while cursor != NIL {
                let Some(entry) = self.entries[cursor as usize].as_mut() else {
                    break;
                };
                if entry.chain == index {
                    entry.chain = chain;
                    break;
                }
                cursor = entry.chain;
            }
        }
        self.order.remove(&mut self.list, index);
        self.generations[index as usize] = self.generations[index as usize].wrapping_add(1);
        self.vacant.push(index);
        match self.entries[index as usize].take() {
            Some(entry) => entry.value,
            None => unreachable!("entry vanished during unlink"),
        }
    }

    /// Oldest surviving entry in insertion order.
    pub fn oldest(&self) -> Option<(u64, &V)> {
        let index = self.list.front()?;
        self.entries[index as usize]
            .as_ref()
            .map(|e| (e.key, &e.value))
    }

    pub fn pop_oldest(&mut self) -> Option<(u64, V)> {
        let index = self.list.front()?;
        let key = self.entries[index as usize].as_ref()?.key;
        Some((key, self.unlink(index)))
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> + '_ {
        self.order.iter(&self.list).filter_map(move |index| {
            self.entries[index as usize]
                .as_ref()
                .map(|e| (e.key, &e.value))
        })
    }

    /// Removes every entry for which `take` returns `true`, returning them
    /// in insertion order.
    pub fn extract_if(&mut self, mut take: impl FnMut(u64, &V) -> bool) -> Vec<(u64, V)> {
        let doomed: Vec<u32> = self
            .order
            .iter(&self.list)
            .filter(|index| {
                self.entries[*index as usize]
                    .as_ref()
                    .is_some_and(|e| take(e.key, &e.value))
            })
            .collect();
        doomed
            .into_iter()
            .map(|index| {
                let key = self.entries[index as usize].as_ref().map_or(0, |e| e.key);
                (key, self.unlink(index))
            })
            .collect()
    }

    /// Empties the table in insertion order.
    pub fn drain(&mut self) -> Vec<(u64, V)> {
        self.extract_if(|_, _| true)
    }
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

/// Name-keyed table for protocol and group lookups.
pub struct StringTable<V> {
    seed: u64,
    table: HashTable<(Box<str>, V)>,
}

impl<V> StringTable<V> {
    pub fn with_capacity(size: usize) -> Self {
        Self {
            seed: 0,
            table: HashTable::with_capacity(size),
        }
    }

    #[inline]
    fn key(&self, name: &str) -> u64 {
        hash_code(name.as_bytes(), self.seed)
    }

    /// Inserts or replaces `name`, returning the previous value.
    pub fn insert(&mut self, name: &str, value: V) -> Option<V> {
        let key = self.key(name);
        let previous = self
            .table
            .remove_by(key, |(existing, _)| &**existing == name)
            .map(|(_, v)| v);
        self.table.insert(key, (name.into(), value));
        previous
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.table
            .find_by(self.key(name), |(existing, _)| &**existing == name)
            .map(|(_, v)| v)
    }

    /// Hash `name` is stored under; `hash_code(name, 0)`.
    pub fn key_of(&self, name: &str) -> u64 {
        self.key(name)
    }

    /// Newest entry stored under a precomputed key.
    pub fn get_by_key(&self, key: u64) -> Option<(&str, &V)> {
        self.table.find(key).map(|(name, v)| (&**name, v))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        let key = self.key(name);
        let index = self.table.position(key, |(existing, _)| &**existing == name)?;
        self.table.entries[index as usize]
            .as_mut()
            .map(|e| &mut e.value.1)
    }

    pub fn remove(&mut self, name: &str) -> Option<V> {
        self.table
            .remove_by(self.key(name), |(existing, _)| &**existing == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> + '_ {
        self.table.iter().map(|(_, (name, v))| (&**name, v))
    }
}

impl<V> Default for StringTable<V> {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}
