//! First-fit slot allocator over the switch value tables.
//!
//! The memory pool is a flat array of lines. Each line is an 8-bit occupancy
//! bitmap with one bit per value table: bit `b` stands for value table
//! `slots_per_line - 1 - b`, so the highest bit is table 0. A key's value is
//! striped over several slots of a single line.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, error};

use crate::protocol::CacheKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Invalid value size {size} (must be 1..={max} bytes)")]
    InvalidSize { size: usize, max: usize },

    #[error("Key {0} is already allocated")]
    DuplicateKey(CacheKey),

    #[error("Out of switch memory: no line has {requested} free slots")]
    OutOfMemory { requested: usize },

    #[error("Bitmap {bitmap:#010b} is not allocated on line {line}")]
    BitmapNotAllocated { line: usize, bitmap: u8 },

    #[error("Line {0} out of range")]
    LineOutOfRange(usize),
}

/// Slots assigned to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Line index across the value tables.
    pub line: usize,

    /// Occupied slots on that line.
    pub bitmap: u8,
}

impl Allocation {
    /// Number of slots held.
    pub fn slots(&self) -> usize {
        self.bitmap.count_ones() as usize
    }
}

/// Bitmap allocator over the switch register arrays.
#[derive(Debug)]
pub struct SlotAllocator {
    /// Occupancy bitmap per line.
    lines: Vec<u8>,

    /// Value tables per line (1..=8).
    slots_per_line: usize,

    /// Bytes per slot.
    slot_width: usize,

    /// Live allocations by key.
    allocations: HashMap<CacheKey, Allocation>,
}

impl SlotAllocator {
    pub fn new(lines: usize, slots_per_line: usize, slot_width: usize) -> Self {
        debug_assert!((1..=8).contains(&slots_per_line));
        Self {
            lines: vec![0; lines],
            slots_per_line,
            slot_width,
            allocations: HashMap::new(),
        }
    }

    fn full_mask(&self) -> u8 {
        ((1u16 << self.slots_per_line) - 1) as u8
    }

    /// Largest value that fits in one line.
    pub fn max_value_size(&self) -> usize {
        self.slots_per_line * self.slot_width
    }

    /// Claim slots for `value_size` bytes on the first line that has room.
    pub fn allocate(
        &mut self,
        key: CacheKey,
        value_size: usize,
    ) -> Result<Allocation, AllocatorError> {
        if value_size == 0 || value_size > self.max_value_size() {
            return Err(AllocatorError::InvalidSize {
                size: value_size,
                max: self.max_value_size(),
            });
        }
        if self.allocations.contains_key(&key) {
            return Err(AllocatorError::DuplicateKey(key));
        }

        let needed = value_size.div_ceil(self.slot_width);
        let full = self.full_mask();

        let found = self
            .lines
            .iter()
            .position(|&bits| (full & !bits).count_ones() as usize >= needed);
        let Some(line) = found else {
            return Err(AllocatorError::OutOfMemory { requested: needed });
        };

        // Claim free bits from the highest-order bit downward.
        let free = full & !self.lines[line];
        let mut bitmap = 0u8;
        for bit in (0..self.slots_per_line).rev() {
            if bitmap.count_ones() as usize == needed {
                break;
            }
            if free & (1 << bit) != 0 {
                bitmap |= 1 << bit;
            }
        }

        self.lines[line] |= bitmap;
        let allocation = Allocation { line, bitmap };
        self.allocations.insert(key, allocation);

        debug!(%key, line, bitmap, slots = needed, "Allocated switch slots");
        Ok(allocation)
    }

    /// Clear `bitmap` out of a line. The bits must all be set.
    pub fn free(&mut self, line: usize, bitmap: u8) -> Result<(), AllocatorError> {
        let bits = self
            .lines
            .get_mut(line)
            .ok_or(AllocatorError::LineOutOfRange(line))?;
        if bitmap & !*bits != 0 {
            error!(line, bitmap, occupied = *bits, "Freeing slots that are not allocated");
            return Err(AllocatorError::BitmapNotAllocated { line, bitmap });
        }
        *bits ^= bitmap;
        debug!(line, bitmap, "Freed switch slots");
        Ok(())
    }

    /// Drop a key's allocation and free its slots.
    pub fn release(&mut self, key: &CacheKey) -> Result<Option<Allocation>, AllocatorError> {
        let Some(allocation) = self.allocations.remove(key) else {
            return Ok(None);
        };
        self.free(allocation.line, allocation.bitmap)?;
        Ok(Some(allocation))
    }

    /// Allocation held by a key.
    pub fn get(&self, key: &CacheKey) -> Option<Allocation> {
        self.allocations.get(key).copied()
    }

    /// Value tables covered by a bitmap, highest bit (table 0) first.
    pub fn value_tables(&self, bitmap: u8) -> Vec<usize> {
        (0..self.slots_per_line)
            .rev()
            .filter(|bit| bitmap & (1 << bit) != 0)
            .map(|bit| self.slots_per_line - 1 - bit)
            .collect()
    }

    /// Snapshot of every line's occupancy bitmap.
    pub fn lines(&self) -> &[u8] {
        &self.lines
    }

    pub fn slot_width(&self) -> usize {
        self.slot_width
    }

    pub fn slots_per_line(&self) -> usize {
        self.slots_per_line
    }

    /// Total slots in the pool.
    pub fn total_slots(&self) -> usize {
        self.lines.len() * self.slots_per_line
    }

    /// Slots currently unassigned.
    pub fn free_slots(&self) -> usize {
        let full = self.full_mask();
        self.lines
            .iter()
            .map(|&bits| (full & !bits).count_ones() as usize)
            .sum()
    }

    /// Lines with at least one slot assigned.
    pub fn lines_in_use(&self) -> usize {
        self.lines.iter().filter(|&&bits| bits != 0).count()
    }

    /// Fraction of slots assigned (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        let total = self.total_slots();
        if total == 0 {
            return 0.0;
        }
        (total - self.free_slots()) as f64 / total as f64
    }

    /// Number of keys holding slots.
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
