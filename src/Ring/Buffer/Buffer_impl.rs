use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::Arc;
use std::time::Duration;

use super::layout::{RingCursors, SEALED};
use super::Buffer::{
    RingBuffer, Slot, SlotState, EMPTY, MAX_CLAIM_ATTEMPTS, READY, WRITING,
};
use crate::error::{ConfigError, EmitError};
use crate::metrics::EmitterCounters;
use crate::Core::futex;
use crate::Core::slab::{Block, SlabPool};

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};

impl RingBuffer {
    /// Create a ring of `capacity` slots, which must be a power of two.
    pub fn new(
        capacity: usize,
        pool: Arc<SlabPool>,
        counters: Arc<EmitterCounters>,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(ConfigError::RingCapacity(capacity));
        }

        // Slot k starts on lap 0, so its first valid write sequence is k.
        let slots = (0..capacity)
            .map(|k| Slot {
                sequence: AtomicU64::new(k as u64),
                state: AtomicU8::new(EMPTY),
                record: UnsafeCell::new(None),
            })
            .collect();

        Ok(Self {
            cursors: RingCursors::new(),
            slots,
            capacity,
            mask: capacity - 1,
            pool,
            counters,
            reader_taken: AtomicBool::new(false),
            accounted: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot {
        &self.slots[(seq as usize) & self.mask]
    }

    /// Pool the records live in.
    pub fn pool(&self) -> &Arc<SlabPool> {
        &self.pool
    }

    /// Push a record.
    ///
    /// Returns the slot index on success. On failure the block comes back
    /// to the caller untouched: the ring is full, sealed, or the claim kept
    /// losing races past `MAX_CLAIM_ATTEMPTS`. Never blocks.
    pub fn try_push(&self, block: Block) -> Result<usize, Block> {
        let tail_atomic = &self.cursors.tail;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let tail = tail_atomic.load(Relaxed);
            if tail & SEALED != 0 {
                return Err(block);
            }
            let slot = self.slot(tail);
            let seq = slot.sequence.load(Acquire);
            let dif = seq as i64 - tail as i64;

            if dif == 0 {
                if tail_atomic
                    .compare_exchange_weak(tail, tail + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    // We own this slot now
                    slot.state.store(WRITING, Relaxed);
                    unsafe {
                        let cell = &mut *slot.record.get();
                        debug_assert!(cell.is_none(), "claimed slot still holds a record");
                        *cell = Some(block);
                    }
                    // Publish
                    slot.state.store(READY, Release);
                    return Ok((tail as usize) & self.mask);
                }
            } else if dif < 0 {
                // full: the consumer has not freed this slot's previous lap
                return Err(block);
            }
            // another producer moved the cursor; re-read and retry
            std::hint::spin_loop();
        }
        Err(block)
    }

    /// Slots claimed by producers and not yet released by the consumer.
    pub fn occupancy(&self) -> usize {
        let tail = self.cursors.tail.load(Relaxed) & !SEALED;
        let head = self.cursors.head.load(Relaxed);
        tail.saturating_sub(head).min(self.capacity as u64) as usize
    }

    /// Cheap, racy check used to skip work before a push that would fail.
    #[inline]
    pub fn looks_full(&self) -> bool {
        let tail = self.cursors.tail.load(Relaxed);
        tail & SEALED != 0 || self.slot(tail).sequence.load(Relaxed) < tail
    }

    pub fn is_sealed(&self) -> bool {
        self.cursors.tail.load(Relaxed) & SEALED != 0
    }

    /// Wake the consumer if it is parked and at least `threshold` records
    /// are pending. Only does a syscall when both hold.
    #[inline]
    pub fn notify_consumer(&self, threshold: usize) {
        if self.cursors.parked.load(Relaxed) && self.occupancy() >= threshold {
            self.wake_consumer();
        }
    }

    /// Signal consumers that new data is available
    pub fn wake_consumer(&self) {
        self.cursors.signal.fetch_add(1, Release);
        futex::futex_wake(&self.cursors.signal);
    }

    /// Count slots per state. Walks the whole ring; monitoring and tests only.
    pub fn state_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for slot in self.slots.iter() {
            match SlotState::from_u8(slot.state.load(Acquire)) {
                SlotState::Empty => counts.0 += 1,
                SlotState::Writing => counts.1 += 1,
                SlotState::Ready => counts.2 += 1,
            }
        }
        counts
    }

    /// Hand out the single consumer handle.
    pub fn reader(self: &Arc<Self>) -> Result<RingReader, EmitError> {
        if self
            .reader_taken
            .compare_exchange(false, true, AcqRel, Relaxed)
            .is_err()
        {
            return Err(EmitError::ReaderTaken);
        }
        Ok(RingReader { ring: self.clone() })
    }

    /// Account for records left behind by a reader that went away without
    /// running its shutdown, such as a flusher thread that panicked.
    /// Does nothing while a reader is live or once the ring is accounted.
    /// Returns `(ready, writing)` like [`RingReader::abandon_until`].
    pub(crate) fn abandon_orphaned(self: &Arc<Self>) -> (u64, u64) {
        if self.accounted.load(Acquire) {
            return (0, 0);
        }
        match self.reader() {
            Ok(mut reader) => {
                let end = reader.seal();
                reader.abandon_until(end)
            }
            Err(_) => (0, 0),
        }
    }
}

/// The consumer side of a [`RingBuffer`]. There is at most one per ring.
pub struct RingReader {
    ring: Arc<RingBuffer>,
}

impl RingReader {
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Read cursor: the next sequence to flush.
    pub fn head(&self) -> u64 {
        self.ring.cursors.head.load(Relaxed)
    }

    /// Collect up to `max` consecutive `READY` slots starting at the read
    /// cursor. Stops at the first slot that is not `READY`.
    ///
    /// Nothing is released until [`Drain::commit`]; dropping the `Drain`
    /// leaves the records in place for the next attempt.
    pub fn drain(&mut self, max: usize) -> Drain<'_> {
        let ring = &*self.ring;
        let head = ring.cursors.head.load(Relaxed);
        let max = max.min(ring.capacity);
        let mut len = 0;
        while len < max {
            let slot = ring.slot(head + len as u64);
            if slot.state.load(Acquire) != READY {
                break;
            }
            len += 1;
        }
        Drain { ring, head, len }
    }

    /// Whether the slot at the read cursor is `READY`.
    pub fn has_ready(&self) -> bool {
        let head = self.head();
        self.ring.slot(head).state.load(Acquire) == READY
    }

    /// Park on the signal word until woken or `timeout` passes.
    pub fn park(&self, timeout: Duration) {
        let cursors = &self.ring.cursors;
        let seen = cursors.signal.load(Acquire);
        cursors.parked.store(true, SeqCst);
        if !self.has_ready() {
            futex::futex_wait(&cursors.signal, seen, Some(timeout));
        }
        cursors.parked.store(false, SeqCst);
    }

    /// Stop all further pushes. Returns the final write cursor: every
    /// sequence below it was claimed by some producer.
    pub fn seal(&self) -> u64 {
        self.ring.cursors.tail.fetch_or(SEALED, AcqRel) & !SEALED
    }

    /// Account for everything between the read cursor and `end` after the
    /// last flush. `READY` records are freed; claimed slots whose producer
    /// has not finished are left to the producer. Every one of them counts
    /// as abandoned. Returns `(ready, writing)`.
    pub fn abandon_until(&mut self, end: u64) -> (u64, u64) {
        let ring = &*self.ring;
        let head = ring.cursors.head.load(Relaxed);
        let (mut ready, mut writing) = (0u64, 0u64);

        for seq in head..end {
            let slot = ring.slot(seq);
            if slot.state.load(Acquire) == READY {
                let block = unsafe { (*slot.record.get()).take() };
                slot.state.store(EMPTY, Relaxed);
                if let Some(block) = block {
                    ring.pool.free(block);
                }
                ready += 1;
            } else {
                writing += 1;
            }
        }

        ring.counters.record_abandoned(ready + writing);
        ring.cursors.head.store(end.max(head), Release);
        ring.accounted.store(true, Release);
        (ready, writing)
    }
}

// Without a reader nothing can drain, so further pushes must fail fast.
impl Drop for RingReader {
    fn drop(&mut self) {
        self.seal();
        self.ring.reader_taken.store(false, Release);
    }
}

/// A run of `READY` records borrowed from the ring.
pub struct Drain<'r> {
    ring: &'r RingBuffer,
    head: u64,
    len: usize,
}

impl<'r> Drain<'r> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Encoded records in cursor order.
    pub fn records(&self) -> impl Iterator<Item = &'r [u8]> + '_ {
        let (ring, head) = (self.ring, self.head);
        (0..self.len as u64).filter_map(move |i| {
            let slot = ring.slot(head + i);
            // READY was observed with Acquire in `drain`; the producer is done.
            let record = unsafe { (*slot.record.get()).as_ref() };
            record.map(|block| ring.pool.bytes(block))
        })
    }

    /// Release every slot in this run for the next lap and return the pool
    /// items. Called after the sink accepted the batch or it was given up.
    pub fn commit(self) {
        let ring = self.ring;
        for i in 0..self.len as u64 {
            let seq = self.head + i;
            let slot = ring.slot(seq);
            let block = unsafe { (*slot.record.get()).take() };
            slot.state.store(EMPTY, Relaxed);
            slot.sequence.store(seq + ring.capacity as u64, Release);
            if let Some(block) = block {
                ring.pool.free(block);
            }
        }
        ring.cursors.head.store(self.head + self.len as u64, Release);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let already_counted = *self.accounted.get_mut();
        let mut leftover = 0;
        for slot in self.slots.iter_mut() {
            if let Some(block) = slot.record.get_mut().take() {
                self.pool.free(block);
                leftover += 1;
            }
        }
        if leftover > 0 && !already_counted {
            self.counters.record_abandoned(leftover);
            tracing::warn!(leftover, "ring dropped with unflushed records");
        }
    }
}
