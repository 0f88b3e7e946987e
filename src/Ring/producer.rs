// In src/Ring/producer.rs
use crate::metrics::{EmitterCollector, EmitterCounters, MetricsSnapshot};
use crate::Ring::Buffer::RingBuffer;
use crate::Ring::Structs::Event;
use std::sync::Arc;

/// Result of a single emit attempt.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The record is in the ring and will be flushed or counted as lost.
    Queued,
    /// The record was discarded and counted in `dropped`.
    Dropped,
}

impl EmitOutcome {
    pub fn is_queued(self) -> bool {
        self == EmitOutcome::Queued
    }
}

/// Handle used by share-validation threads to publish events.
///
/// Cheap to clone; every clone feeds the same ring. `try_emit` never blocks,
/// never does I/O and, while the slab pool has room, never touches the
/// general allocator.
#[derive(Clone)]
pub struct EventEmitter {
    ring: Arc<RingBuffer>,
    counters: Arc<EmitterCounters>,
    max_record_size: usize,
    wake_threshold: usize,
}

impl EventEmitter {
    pub(crate) fn new(
        ring: Arc<RingBuffer>,
        counters: Arc<EmitterCounters>,
        max_record_size: usize,
        wake_threshold: usize,
    ) -> Self {
        Self {
            ring,
            counters,
            max_record_size,
            wake_threshold: wake_threshold.max(1),
        }
    }

    /// Encode `event` into a pool item and push it onto the ring.
    ///
    /// Exactly one of `queued` / `dropped` is incremented per call. Callers
    /// must not retry a `Dropped` event synchronously.
    pub fn try_emit(&self, event: &Event<'_>) -> EmitOutcome {
        if self.ring.looks_full() {
            return self.drop_one();
        }

        let pool = self.ring.pool();
        let mut block = match pool.alloc() {
            Some(block) => block,
            None => return self.drop_one(),
        };

        let encoded = {
            let buf = pool.bytes_mut(&mut block);
            let limit = self.max_record_size.min(buf.len());
            event.encode_into(&mut buf[..limit])
        };
        match encoded {
            Ok(len) => pool.set_len(&mut block, len),
            Err(_) => {
                pool.free(block);
                return self.drop_one();
            }
        }

        match self.ring.try_push(block) {
            Ok(_) => {
                self.counters.record_queued();
                self.ring.notify_consumer(self.wake_threshold);
                EmitOutcome::Queued
            }
            Err(block) => {
                pool.free(block);
                self.drop_one()
            }
        }
    }

    #[inline]
    fn drop_one(&self) -> EmitOutcome {
        self.counters.record_dropped(1);
        EmitOutcome::Dropped
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }

    /// True once shutdown has sealed the ring. Every later emit is dropped.
    pub fn is_closed(&self) -> bool {
        self.ring.is_sealed()
    }

    /// Returns the largest record this emitter will queue
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    /// Ring slots claimed and not yet flushed.
    pub fn pending(&self) -> usize {
        self.ring.occupancy()
    }

    /// A Prometheus collector over this emitter's counters, ring and pool.
    pub fn collector(&self) -> prometheus::Result<EmitterCollector> {
        EmitterCollector::new(
            self.counters.clone(),
            self.ring.clone(),
            self.ring.pool().clone(),
        )
    }
}
