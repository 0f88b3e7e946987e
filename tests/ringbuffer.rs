use share_emit::metrics::EmitterCounters;
use share_emit::Core::slab::{Block, SlabPool};
use share_emit::Ring::Buffer::RingBuffer;
use share_emit::{EmitOutcome, EmitterBuilder, Event, EventKind, MemorySink};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn make_ring(capacity: usize) -> (Arc<RingBuffer>, Arc<EmitterCounters>) {
    let counters = Arc::new(EmitterCounters::new());
    let pool = Arc::new(SlabPool::new(64, capacity, 64, capacity * 4, true, counters.clone()));
    let ring = RingBuffer::new(capacity, pool, counters.clone()).unwrap();
    (Arc::new(ring), counters)
}

fn tagged_block(ring: &RingBuffer, producer: u8, seq: u32) -> Block {
    let pool = ring.pool();
    let mut b = pool.alloc().unwrap();
    let buf = pool.bytes_mut(&mut b);
    buf[0] = producer;
    buf[1..5].copy_from_slice(&seq.to_le_bytes());
    pool.set_len(&mut b, 5);
    b
}

#[test]
fn full_ring_drops_next_emit() {
    let capacity = 16;
    let sink = MemorySink::new();
    // Slots are released only after the sink call returns, so a slow sink
    // keeps the ring full for the rest of the test.
    sink.set_delay(Duration::from_millis(500));
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(capacity)
        .with_max_batch(capacity)
        .with_pool_items(capacity, capacity * 2)
        .build(sink.clone())
        .unwrap();

    let ev = Event::new(EventKind::ShareAccepted, 1, "rig-0");
    for _ in 0..capacity {
        assert_eq!(emitter.try_emit(&ev), EmitOutcome::Queued);
    }
    let before = emitter.metrics();
    assert_eq!(before.queued as usize, capacity);
    assert_eq!(before.dropped, 0);

    assert_eq!(emitter.try_emit(&ev), EmitOutcome::Dropped);
    let after = emitter.metrics();
    assert_eq!(after.dropped, before.dropped + 1);
    assert_eq!(after.queued, before.queued);

    flusher.shutdown().unwrap();
    let m = emitter.metrics();
    assert_eq!(m.accounted(), capacity as u64 + 1);
    assert_eq!(sink.record_count(), capacity);
}

#[test]
fn push_past_capacity_returns_block() {
    let (ring, _) = make_ring(8);
    for i in 0..8 {
        assert!(ring.try_push(tagged_block(&ring, 0, i)).is_ok());
    }
    let rejected = ring.try_push(tagged_block(&ring, 0, 8)).unwrap_err();
    assert_eq!(rejected.len(), 5);
    ring.pool().free(rejected);

    assert!(ring.looks_full());
    assert_eq!(ring.occupancy(), 8);
    assert_eq!(ring.state_counts(), (0, 0, 8));
}

#[test]
fn drain_respects_batch_limit_and_wraps() {
    let (ring, _) = make_ring(8);
    let mut reader = ring.reader().unwrap();

    let mut next = 0u32;
    let mut expected = 0u32;
    // Several laps around the ring.
    for _ in 0..5 {
        loop {
            match ring.try_push(tagged_block(&ring, 0, next)) {
                Ok(_) => next += 1,
                Err(b) => {
                    ring.pool().free(b);
                    break;
                }
            }
        }
        loop {
            let drain = reader.drain(3);
            if drain.is_empty() {
                break;
            }
            assert!(drain.len() <= 3);
            for rec in drain.records() {
                let seq = u32::from_le_bytes(rec[1..5].try_into().unwrap());
                assert_eq!(seq, expected);
                expected += 1;
            }
            drain.commit();
        }
    }
    assert_eq!(expected, next);
    assert_eq!(next, 40);
    assert_eq!(ring.pool().stats().in_use, 0);
}

#[test]
fn in_flight_never_exceeds_capacity() {
    let capacity = 32;
    let (ring, _) = make_ring(capacity);
    let mut reader = ring.reader().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let pushed = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4u8)
        .map(|p| {
            let ring = ring.clone();
            let stop = stop.clone();
            let pushed = pushed.clone();
            thread::spawn(move || {
                let mut seq = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    match ring.try_push(tagged_block(&ring, p, seq)) {
                        Ok(_) => {
                            pushed.fetch_add(1, Ordering::Relaxed);
                            seq += 1;
                        }
                        Err(b) => ring.pool().free(b),
                    }
                }
            })
        })
        .collect();

    let mut last_seen = [None::<u32>; 4];
    let mut consumed = 0;
    for round in 0..2_000 {
        let (_, writing, ready) = ring.state_counts();
        assert!(writing + ready <= capacity, "in flight {} > {capacity}", writing + ready);
        assert!(ring.occupancy() <= capacity);

        if round % 3 == 0 {
            let drain = reader.drain(8);
            assert!(drain.len() <= 8);
            for rec in drain.records() {
                let p = rec[0] as usize;
                let seq = u32::from_le_bytes(rec[1..5].try_into().unwrap());
                // Per-producer order survives.
                if let Some(prev) = last_seen[p] {
                    assert!(seq > prev);
                }
                last_seen[p] = Some(seq);
                consumed += 1;
            }
            drain.commit();
        }
    }

    stop.store(true, Ordering::Relaxed);
    for p in producers {
        p.join().unwrap();
    }
    assert!(consumed <= pushed.load(Ordering::Relaxed));
}

#[test]
fn seal_reports_final_cursor() {
    let (ring, counters) = make_ring(8);
    let mut reader = ring.reader().unwrap();
    for i in 0..5 {
        ring.try_push(tagged_block(&ring, 0, i)).unwrap();
    }
    let drain = reader.drain(2);
    drain.commit();

    let end = reader.seal();
    assert_eq!(end, 5);
    let late = ring.try_push(tagged_block(&ring, 0, 99)).unwrap_err();
    ring.pool().free(late);

    assert_eq!(reader.abandon_until(end), (3, 0));
    assert_eq!(counters.snapshot().abandoned, 3);
    assert_eq!(ring.occupancy(), 0);
}
