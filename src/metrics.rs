//! Process-lifetime counters for the emitter.
//!
//! Counters are monotonic and only ever incremented. They are created
//! explicitly by the builder and shared through an `Arc`; readers take a
//! [`MetricsSnapshot`] or scrape them through [`EmitterCollector`].

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntCounter, IntGauge, Opts};

use crate::Core::slab::SlabPool;
use crate::Ring::Buffer::RingBuffer;

/// Monotonic counters shared by producers and the flusher.
///
/// `queued` and `dropped` are hit by every producer, so each sits on its
/// own cache line.
#[derive(Debug, Default)]
pub struct EmitterCounters {
    queued: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    pool_fallbacks: CachePadded<AtomicU64>,
    sent: AtomicU64,
    batches: AtomicU64,
    sink_failures: AtomicU64,
    sink_retries: AtomicU64,
    abandoned: AtomicU64,
}

impl EmitterCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Relaxed);
    }

    #[inline]
    pub fn record_pool_fallback(&self) {
        self.pool_fallbacks.fetch_add(1, Relaxed);
    }

    /// One successful bulk write of `n` records.
    pub fn record_batch_sent(&self, n: u64) {
        self.sent.fetch_add(n, Relaxed);
        self.batches.fetch_add(1, Relaxed);
    }

    /// A batch of `n` records dropped after the retry budget ran out.
    pub fn record_sink_failure(&self, n: u64) {
        self.sink_failures.fetch_add(1, Relaxed);
        self.dropped.fetch_add(n, Relaxed);
    }

    pub fn record_sink_retry(&self) {
        self.sink_retries.fetch_add(1, Relaxed);
    }

    /// Events lost at shutdown. They also count as dropped.
    pub fn record_abandoned(&self, n: u64) {
        self.abandoned.fetch_add(n, Relaxed);
        self.dropped.fetch_add(n, Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queued: self.queued.load(Relaxed),
            sent: self.sent.load(Relaxed),
            dropped: self.dropped.load(Relaxed),
            batches: self.batches.load(Relaxed),
            pool_fallbacks: self.pool_fallbacks.load(Relaxed),
            sink_failures: self.sink_failures.load(Relaxed),
            sink_retries: self.sink_retries.load(Relaxed),
            abandoned: self.abandoned.load(Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub batches: u64,
    pub pool_fallbacks: u64,
    pub sink_failures: u64,
    pub sink_retries: u64,
    pub abandoned: u64,
}

impl MetricsSnapshot {
    /// Every emit call ends up either sent or dropped once the flusher has exited.
    pub fn accounted(&self) -> u64 {
        self.sent + self.dropped
    }
}

/// Prometheus collector that reads the emitter atomics at scrape time.
///
/// Counter values are brought up to date with `inc_by(delta)` on each
/// collect, so the exported series stay monotonic.
pub struct EmitterCollector {
    counters: Arc<EmitterCounters>,
    ring: Arc<RingBuffer>,
    pool: Arc<SlabPool>,
    queued: IntCounter,
    sent: IntCounter,
    dropped: IntCounter,
    batches: IntCounter,
    pool_fallbacks: IntCounter,
    sink_failures: IntCounter,
    abandoned: IntCounter,
    ring_occupancy: IntGauge,
    pool_in_use: IntGauge,
    descs: Vec<Desc>,
}

const NAMESPACE: &str = "share_emit";

impl EmitterCollector {
    pub(crate) fn new(
        counters: Arc<EmitterCounters>,
        ring: Arc<RingBuffer>,
        pool: Arc<SlabPool>,
    ) -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        };
        let gauge =
            |name: &str, help: &str| IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE));

        let queued = counter("events_queued_total", "Events accepted into the ring.")?;
        let sent = counter("events_sent_total", "Events written to the sink.")?;
        let dropped = counter("events_dropped_total", "Events lost for any reason.")?;
        let batches = counter("batches_total", "Successful bulk writes to the sink.")?;
        let pool_fallbacks = counter(
            "pool_fallbacks_total",
            "Allocations served by the general allocator.",
        )?;
        let sink_failures = counter(
            "sink_failures_total",
            "Batches dropped after exhausting sink retries.",
        )?;
        let abandoned = counter("events_abandoned_total", "Events lost at shutdown.")?;
        let ring_occupancy = gauge("ring_occupancy", "Ring slots claimed and not yet flushed.")?;
        let pool_in_use = gauge("pool_items_in_use", "Pool items currently handed out.")?;

        let descs = [
            &queued,
            &sent,
            &dropped,
            &batches,
            &pool_fallbacks,
            &sink_failures,
            &abandoned,
        ]
        .iter()
        .flat_map(|c| c.desc().into_iter().cloned())
        .chain(ring_occupancy.desc().into_iter().cloned())
        .chain(pool_in_use.desc().into_iter().cloned())
        .collect();

        Ok(Self {
            counters,
            ring,
            pool,
            queued,
            sent,
            dropped,
            batches,
            pool_fallbacks,
            sink_failures,
            abandoned,
            ring_occupancy,
            pool_in_use,
            descs,
        })
    }
}

fn catch_up(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl Collector for EmitterCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snap = self.counters.snapshot();
        catch_up(&self.queued, snap.queued);
        catch_up(&self.sent, snap.sent);
        catch_up(&self.dropped, snap.dropped);
        catch_up(&self.batches, snap.batches);
        catch_up(&self.pool_fallbacks, snap.pool_fallbacks);
        catch_up(&self.sink_failures, snap.sink_failures);
        catch_up(&self.abandoned, snap.abandoned);
        self.ring_occupancy.set(self.ring.occupancy() as i64);
        self.pool_in_use.set(self.pool.stats().in_use as i64);

        let mut families = Vec::with_capacity(9);
        for c in [
            &self.queued,
            &self.sent,
            &self.dropped,
            &self.batches,
            &self.pool_fallbacks,
            &self.sink_failures,
            &self.abandoned,
        ] {
            families.extend(c.collect());
        }
        families.extend(self.ring_occupancy.collect());
        families.extend(self.pool_in_use.collect());
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let c = EmitterCounters::new();
        c.record_queued();
        c.record_queued();
        c.record_dropped(1);
        c.record_batch_sent(2);
        c.record_pool_fallback();

        let snap = c.snapshot();
        assert_eq!(snap.queued, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.sent, 2);
        assert_eq!(snap.batches, 1);
        assert_eq!(snap.pool_fallbacks, 1);
        assert_eq!(snap.accounted(), 3);
    }

    #[test]
    fn test_sink_failure_and_abandon_count_as_dropped() {
        let c = EmitterCounters::new();
        c.record_sink_failure(5);
        c.record_abandoned(2);

        let snap = c.snapshot();
        assert_eq!(snap.sink_failures, 1);
        assert_eq!(snap.abandoned, 2);
        assert_eq!(snap.dropped, 7);
    }
}
