use std::fmt;
use std::sync::atomic::Ordering;
use crate::Core::slab::{Block, SlabPool};
use crate::Ring::Buffer::RingBuffer;

/// Debug function for SlabPool
///
/// Shows sizing and a locked snapshot of occupancy. Item memory is never
/// printed.
pub fn debug_slab_pool(pool: &SlabPool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let stats = pool.stats();
    f.debug_struct("SlabPool")
        .field("item_size", &pool.item_size())
        .field("slab_items", &pool.slab_items())
        .field("capacity", &stats.capacity)
        .field("max_items", &stats.max_items)
        .field("in_use", &stats.in_use)
        .field("heap_in_use", &stats.heap_in_use)
        .field("fallback", &pool.fallback_enabled())
        .finish()
}

/// Debug function for Block
///
/// Shows the handle, not the bytes
pub fn debug_block(block: &Block, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut s = f.debug_struct("Block");
    match block.index() {
        Some(idx) => s.field("index", &idx),
        None => s.field("index", &"<heap>"),
    };
    s.field("len", &block.len()).finish()
}

/// Debug function for RingBuffer
///
/// Cursor values are read with relaxed loads and may be slightly stale
pub fn debug_ring_buffer(ring: &RingBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RingBuffer")
        .field("capacity", &ring.capacity())
        .field("head", &ring.cursors.head.load(Ordering::Relaxed))
        .field("occupancy", &ring.occupancy())
        .field("sealed", &ring.is_sealed())
        .finish_non_exhaustive()
}
