use super::*;

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items backed by slabs so far.
    pub capacity: usize,
    /// Slab items currently handed out.
    pub in_use: usize,
    /// Slab items on the free stack.
    pub free: usize,
    /// Slabs allocated.
    pub slabs: usize,
    /// Fallback items currently handed out.
    pub heap_in_use: usize,
    /// Configured item ceiling.
    pub max_items: usize,
}

/// Read-only accessors for monitoring and tests.
impl SlabPool {
    /// Size of every item in bytes, already rounded to cache lines.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Items added per growth step.
    pub fn slab_items(&self) -> usize {
        self.slab_items
    }

    /// Ceiling on slab-backed items.
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Whether allocations past the ceiling fall back to the heap.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback
    }

    /// Takes the free-list lock briefly; not for the hot path.
    pub fn stats(&self) -> PoolStats {
        let list = self.free.lock();
        PoolStats {
            capacity: list.capacity,
            in_use: self.in_use.load(Ordering::Relaxed),
            free: list.stack.len(),
            slabs: list.slabs,
            heap_in_use: self.heap_in_use.load(Ordering::Relaxed),
            max_items: self.max_items,
        }
    }
}
