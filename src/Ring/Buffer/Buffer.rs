// Event ring shared by share-validation threads (producers) and the flusher (consumer).

use super::layout::RingCursors;
use crate::metrics::EmitterCounters;
use crate::Core::slab::{Block, SlabPool};

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};
use std::sync::Arc;

/// How many times a producer re-reads the cursor after losing a race
/// before giving up and reporting a drop. A full ring never retries.
pub const MAX_CLAIM_ATTEMPTS: usize = 32;

/// Slot available to a producer.
pub const EMPTY: u8 = 0;
/// Claimed by a producer, record being stored.
pub const WRITING: u8 = 1;
/// Record complete, waiting for the flusher.
pub const READY: u8 = 2;

/// Observable state of one slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Writing,
    Ready,
}

impl SlotState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            WRITING => SlotState::Writing,
            READY => SlotState::Ready,
            _ => SlotState::Empty,
        }
    }
}

/// A single cell of the ring.
///
/// Aligned to a cache line so neighbouring producers do not contend.
#[repr(C, align(64))]
pub struct Slot {
    /// Lap sequence. A producer holding write sequence `s` may claim this
    /// slot only when `sequence == s`; the consumer publishes `s + capacity`
    /// after it has emptied the slot.
    pub(crate) sequence: AtomicU64,

    /// `EMPTY`, `WRITING` or `READY`. The `READY` store is the release point
    /// that makes the record visible to the consumer.
    pub(crate) state: AtomicU8,

    /// Pool item holding the encoded record. Owned by whoever holds the slot
    /// in its current state.
    pub(crate) record: UnsafeCell<Option<Block>>,
}

/// Bounded, lock-free, multi-producer single-consumer ring of event records.
///
/// ### Concurrency Design:
/// - **Producers (push)**: claim a sequence by CAS on `tail`, gated on the
///   slot's lap `sequence`. A slot whose lap is behind means the ring is
///   full and the push fails immediately.
/// - **Consumer (drain)**: a single `RingReader` scans `READY` slots from
///   `head`, hands them to the sink, then releases them for the next lap.
pub struct RingBuffer {
    pub(crate) cursors: RingCursors,

    pub(crate) slots: Box<[Slot]>,

    /// The capacity of the buffer (number of slots).
    pub(crate) capacity: usize,

    /// A bitmask used to wrap sequence numbers around the buffer.
    /// Calculated as `capacity - 1`.
    pub(crate) mask: usize,

    pub(crate) pool: Arc<SlabPool>,

    pub(crate) counters: Arc<EmitterCounters>,

    /// Only one `RingReader` may exist.
    pub(crate) reader_taken: AtomicBool,

    /// Set once shutdown has counted every unflushed record.
    pub(crate) accounted: AtomicBool,
}

// Slot contents are only touched by the thread that owns the slot state.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_ring_buffer(self, f)
    }
}
