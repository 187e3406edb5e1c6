//! Value cache with clock replacement.
//!
//! Each slot carries a reference bit set on access. When the cache is full
//! the clock hand sweeps the slots, clearing set bits, and evicts the first
//! slot whose bit is already clear. This approximates LRU without keeping
//! an ordered list.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

struct Slot {
    key: Bytes,
    value: Bytes,
    referenced: bool,
}

/// Fixed-capacity key → value cache.
///
/// Not internally synchronized; the engine keeps it behind a lock.
pub struct ValueCache {
    capacity: usize,
    slots: Vec<Option<Slot>>,
    index: HashMap<Bytes, usize>,
    hand: usize,
    hits: u64,
    misses: u64,
}

impl ValueCache {
    /// Creates a cache holding at most `capacity` values. Zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Looks up a value, marking it referenced.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        match self.index.get(key).copied() {
            Some(pos) => {
                let slot = self.slots[pos].as_mut()?;
                slot.referenced = true;
                self.hits += 1;
                Some(slot.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Inserts or replaces a value.
    pub fn insert(&mut self, key: Bytes, value: Bytes) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&pos) = self.index.get(&key) {
            if let Some(slot) = self.slots[pos].as_mut() {
                slot.value = value;
                slot.referenced = true;
                return;
            }
        }

        let pos = if self.slots.len() < self.capacity {
            self.slots.push(None);
            self.slots.len() - 1
        } else {
            self.find_free_slot().unwrap_or_else(|| self.find_victim())
        };

        if let Some(old) = self.slots[pos].take() {
            self.index.remove(&old.key);
        }
        self.index.insert(key.clone(), pos);
        self.slots[pos] = Some(Slot {
            key,
            value,
            referenced: false,
        });
    }

    /// Drops a cached value, if present.
    pub fn invalidate(&mut self, key: &[u8]) {
        if let Some(pos) = self.index.remove(key) {
            self.slots[pos] = None;
        }
    }

    /// Empties the cache.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.hand = 0;
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns (hits, misses).
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn find_free_slot(&self) -> Option<usize> {
        (0..self.slots.len())
            .map(|i| (self.hand + i) % self.slots.len())
            .find(|&pos| self.slots[pos].is_none())
    }

    // Two sweeps always find a victim: the first clears every bit.
    fn find_victim(&mut self) -> usize {
        let len = self.slots.len();
        for _ in 0..2 * len {
            let pos = self.hand;
            self.hand = (self.hand + 1) % len;
            if let Some(slot) = self.slots[pos].as_mut() {
                if slot.referenced {
                    slot.referenced = false;
                    continue;
                }
            }
            return pos;
        }
        self.hand
    }
}

impl fmt::Debug for ValueCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("hand", &self.hand)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}
