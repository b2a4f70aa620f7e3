//! Best-fit pool of free buffers keyed by capacity.

use std::collections::HashMap;

use crate::tensor::Buffer;

/// Maps `(capacity, slot)` onto a unique key (Cantor pairing).
fn pair(capacity: usize, slot: usize) -> u128 {
    let a = capacity as u128;
    let b = slot as u128;
    (a + b) * (a + b + 1) / 2 + b
}

/// Free buffers of one memory space.
///
/// Capacities are kept in a sorted list that may contain duplicates; a request
/// binary-searches the smallest capacity that fits. Buffers sharing a capacity
/// are told apart by a per-capacity slot counter paired with the capacity, and
/// the most recently released one is handed out first.
#[derive(Debug, Default)]
pub struct BufferPool {
    capacities: Vec<usize>,
    slots: HashMap<usize, usize>,
    buffers: HashMap<u128, Buffer>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the best-fitting free buffer, `None` when nothing fits.
    pub fn adopt(&mut self, capacity: usize) -> Option<Buffer> {
        let idx = self.capacities.partition_point(|&free| free < capacity);
        if idx == self.capacities.len() {
            return None;
        }
        let found = self.capacities.remove(idx);
        let slot = self.slots.get_mut(&found)?;
        *slot -= 1;
        let key = pair(found, *slot);
        if *slot == 0 {
            self.slots.remove(&found);
        }
        self.buffers.remove(&key)
    }

    /// Returns a buffer to the pool.
    pub fn release(&mut self, buffer: Buffer) {
        let capacity = buffer.capacity();
        let idx = self.capacities.partition_point(|&free| free <= capacity);
        self.capacities.insert(idx, capacity);
        let slot = self.slots.entry(capacity).or_insert(0);
        self.buffers.insert(pair(capacity, *slot), buffer);
        *slot += 1;
    }

    /// Number of free buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Sorted free capacities, duplicates included.
    pub fn free_capacities(&self) -> &[usize] {
        &self.capacities
    }

    /// Frees every pooled buffer.
    pub fn dispose(&mut self) {
        self.capacities.clear();
        self.slots.clear();
        self.buffers.clear();
    }
}
