//! Pool of counter/validity register indices.

use std::collections::BTreeSet;

/// Hands out unique indices into the per-key counter and validity registers.
///
/// The lowest free index is handed out first; an index returns to the pool
/// only when its key is evicted.
#[derive(Debug)]
pub struct IdPool {
    free: BTreeSet<u32>,
    capacity: u32,
}

impl IdPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            free: (0..capacity).collect(),
            capacity,
        }
    }

    /// Take the lowest free id.
    pub fn allocate(&mut self) -> Option<u32> {
        self.free.pop_first()
    }

    /// Return an id. Returns false if it was not handed out.
    pub fn release(&mut self, id: u32) -> bool {
        if id >= self.capacity {
            return false;
        }
        self.free.insert(id)
    }

    pub fn in_use(&self) -> usize {
        self.capacity as usize - self.free.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
