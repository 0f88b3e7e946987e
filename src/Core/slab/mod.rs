use crate::metrics::EmitterCounters;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};
mod debug;
mod getters;

pub use getters::PoolStats;

/// Slab storage is aligned to a cache line so neighbouring items never share one.
const SLAB_ALIGN: usize = 64;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

/// One slab of contiguous, cache-line aligned items.
struct Chunk {
    base: NonNull<u8>,
    layout: Layout,
}

// The chunk only owns raw bytes; access is partitioned by block ownership.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Free-index stack plus growth bookkeeping. Guarded by the pool mutex.
struct FreeList {
    stack: Vec<u32>,
    slabs: usize,
    capacity: usize,
}

enum Storage {
    Slab { idx: u32, ptr: NonNull<u8>, cap: u32 },
    Heap(Box<[u8]>),
}

/// An owned pool item.
///
/// A `Block` cannot be cloned, so at most one owner can read or write the
/// item at a time. Hand it back with [`SlabPool::free`]; a block that is
/// simply dropped leaks its slab index.
pub struct Block {
    storage: Storage,
    pool_id: u32,
    len: u32,
}

// The pointer targets pool memory that only the owning `Block` may touch.
unsafe impl Send for Block {}

impl Block {
    /// Bytes of the item that carry data.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this item came from the general allocator.
    #[inline]
    pub fn is_fallback(&self) -> bool {
        matches!(self.storage, Storage::Heap(_))
    }

    /// Slab index, `None` for fallback items.
    pub fn index(&self) -> Option<u32> {
        match self.storage {
            Storage::Slab { idx, .. } => Some(idx),
            Storage::Heap(_) => None,
        }
    }

    fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Slab { cap, .. } => *cap as usize,
            Storage::Heap(buf) => buf.len(),
        }
    }
}

/// Fixed-size item pool with O(1) alloc/free.
///
/// Items are addressed by `u32` index into an arena of slabs. The arena
/// grows one slab at a time up to `max_items`; after that allocations are
/// served by the general allocator and counted, or refused if fallback is
/// disabled. The slab table is fixed at construction so readers never need
/// the lock: each entry is published once through a `OnceLock`.
pub struct SlabPool {
    id: u32,
    item_size: usize,
    slab_items: usize,
    max_items: usize,
    fallback: bool,
    chunks: Box<[OnceLock<Chunk>]>,
    free: Mutex<FreeList>,
    in_use: AtomicUsize,
    heap_in_use: AtomicUsize,
    counters: Arc<EmitterCounters>,
}

impl SlabPool {
    /// Create a pool and pre-allocate enough slabs for `initial_items`.
    ///
    /// `item_size` is rounded up to a whole number of cache lines.
    pub fn new(
        item_size: usize,
        initial_items: usize,
        slab_items: usize,
        max_items: usize,
        fallback: bool,
        counters: Arc<EmitterCounters>,
    ) -> Self {
        let item_size = (item_size.max(1) + SLAB_ALIGN - 1) & !(SLAB_ALIGN - 1);
        let slab_items = slab_items.max(1);
        let max_items = max_items.min(u32::MAX as usize);
        let max_slabs = max_items.div_ceil(slab_items);

        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            item_size,
            slab_items,
            max_items,
            fallback,
            chunks: (0..max_slabs).map(|_| OnceLock::new()).collect(),
            free: Mutex::new(FreeList {
                // Reserved up front so `free` never reallocates.
                stack: Vec::with_capacity(max_items),
                slabs: 0,
                capacity: 0,
            }),
            in_use: AtomicUsize::new(0),
            heap_in_use: AtomicUsize::new(0),
            counters,
        };

        {
            let mut list = pool.free.lock();
            while list.capacity < initial_items.min(max_items) {
                if !pool.grow(&mut list) {
                    break;
                }
            }
        }

        debug!(item_size, slab_items, max_items, "slab pool initialised");
        pool
    }

    /// Add one slab to the arena. Returns false at the item ceiling or when
    /// the system allocator refuses.
    fn grow(&self, list: &mut FreeList) -> bool {
        if list.capacity >= self.max_items || list.slabs >= self.chunks.len() {
            return false;
        }
        let items = self.slab_items.min(self.max_items - list.capacity);
        let layout = match Layout::from_size_align(items * self.item_size, SLAB_ALIGN) {
            Ok(layout) => layout,
            Err(_) => return false,
        };
        let base = match NonNull::new(unsafe { alloc::alloc_zeroed(layout) }) {
            Some(base) => base,
            None => {
                warn!(bytes = layout.size(), "slab allocation failed");
                return false;
            }
        };
        if self.chunks[list.slabs].set(Chunk { base, layout }).is_err() {
            // Only reachable if bookkeeping went wrong; the chunk was dropped.
            return false;
        }

        let first = list.slabs * self.slab_items;
        list.stack.extend((first..first + items).rev().map(|i| i as u32));
        list.slabs += 1;
        list.capacity += items;
        true
    }

    /// Take an item from the pool.
    ///
    /// Pops the free stack; grows by one slab if the stack is empty and the
    /// ceiling allows; otherwise falls back to the heap (counted) or
    /// returns `None` when fallback is disabled.
    pub fn alloc(&self) -> Option<Block> {
        let popped = {
            let mut list = self.free.lock();
            match list.stack.pop() {
                Some(idx) => Some(idx),
                None => {
                    if self.grow(&mut list) {
                        list.stack.pop()
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(idx) = popped {
            let ptr = self.item_ptr(idx)?;
            self.in_use.fetch_add(1, Ordering::Relaxed);
            return Some(Block {
                storage: Storage::Slab {
                    idx,
                    ptr,
                    cap: self.item_size as u32,
                },
                pool_id: self.id,
                len: 0,
            });
        }

        if !self.fallback {
            return None;
        }
        self.counters.record_pool_fallback();
        self.heap_in_use.fetch_add(1, Ordering::Relaxed);
        Some(Block {
            storage: Storage::Heap(vec![0u8; self.item_size].into_boxed_slice()),
            pool_id: self.id,
            len: 0,
        })
    }

    /// Return an item. O(1) and infallible.
    pub fn free(&self, block: Block) {
        debug_assert_eq!(block.pool_id, self.id, "block returned to a foreign pool");
        if block.pool_id != self.id {
            // Its index would alias a live item here; leave it in its own pool.
            warn!(pool = self.id, owner = block.pool_id, "ignoring block from a foreign pool");
            return;
        }
        match block.storage {
            Storage::Slab { idx, .. } => {
                self.free.lock().stack.push(idx);
                self.in_use.fetch_sub(1, Ordering::Relaxed);
            }
            Storage::Heap(_) => {
                self.heap_in_use.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Address of item `idx`. Chunks are published before their indices
    /// reach the free stack, so this only fails on a corrupted index.
    fn item_ptr(&self, idx: u32) -> Option<NonNull<u8>> {
        let idx = idx as usize;
        let chunk = self.chunks.get(idx / self.slab_items)?.get()?;
        NonNull::new(unsafe { chunk.base.as_ptr().add((idx % self.slab_items) * self.item_size) })
    }

    /// Whole item, writable. Call [`SlabPool::set_len`] once data is in place.
    #[inline]
    pub fn bytes_mut<'a>(&'a self, block: &'a mut Block) -> &'a mut [u8] {
        debug_assert_eq!(block.pool_id, self.id, "block used with a foreign pool");
        match &mut block.storage {
            // The unique `&mut Block` guarantees no other view of this item.
            Storage::Slab { ptr, cap, .. } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *cap as usize)
            },
            Storage::Heap(buf) => buf,
        }
    }

    /// Data bytes of the item.
    #[inline]
    pub fn bytes<'a>(&'a self, block: &'a Block) -> &'a [u8] {
        debug_assert_eq!(block.pool_id, self.id, "block used with a foreign pool");
        match &block.storage {
            Storage::Slab { ptr, .. } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), block.len as usize)
            },
            Storage::Heap(buf) => &buf[..block.len as usize],
        }
    }

    /// Record how many bytes of the item hold data.
    #[inline]
    pub fn set_len(&self, block: &mut Block, len: usize) {
        assert!(len <= block.capacity(), "length exceeds item size");
        block.len = len as u32;
    }
}
