// Multi-producer stress through the full emitter: producers, ring, slab
// pool, flusher and a verifying sink.
use sha2::{Digest, Sha256};
use share_emit::Ring::Structs::{DecodedEvent, OwnedValue};
use share_emit::{
    EmitOutcome, EmitterBuilder, Event, EventKind, Field, FieldValue, Sink, SinkError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

fn digest(conn: u64, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conn.to_le_bytes());
    hasher.update(nonce.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checks every record's digest and remembers the nonces per connection.
#[derive(Clone, Default)]
struct CheckingSink {
    corrupt: Arc<AtomicU64>,
    seen: Arc<Mutex<HashMap<u64, Vec<u64>>>>,
}

impl Sink for CheckingSink {
    fn write_batch(&mut self, records: &[&[u8]], _: Duration) -> Result<(), SinkError> {
        let mut seen = self.seen.lock();
        for rec in records {
            let Ok(ev) = DecodedEvent::decode(rec) else {
                self.corrupt.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match (ev.field("nonce"), ev.field("digest")) {
                (Some(OwnedValue::U64(n)), Some(OwnedValue::Str(d)))
                    if *d == digest(ev.connection_id, *n) =>
                {
                    seen.entry(ev.connection_id).or_default().push(*n);
                }
                _ => {
                    self.corrupt.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

fn run_producers(
    producers: u64,
    per_producer: u64,
    emitter: &share_emit::EventEmitter,
) -> (u64, u64) {
    let barrier = Arc::new(Barrier::new(producers as usize));
    let handles: Vec<_> = (0..producers)
        .map(|conn| {
            let emitter = emitter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let digests: Vec<String> = (0..per_producer).map(|n| digest(conn, n)).collect();
                let worker = format!("rig-{conn}");
                barrier.wait();
                let (mut queued, mut dropped) = (0u64, 0u64);
                for (nonce, d) in digests.iter().enumerate() {
                    let fields = [
                        Field::new("nonce", FieldValue::U64(nonce as u64)),
                        Field::new("digest", FieldValue::Str(d)),
                        Field::new("stale", FieldValue::Bool(false)),
                    ];
                    let ev = Event::new(EventKind::ShareAccepted, conn, &worker).with_fields(&fields);
                    match emitter.try_emit(&ev) {
                        EmitOutcome::Queued => queued += 1,
                        EmitOutcome::Dropped => dropped += 1,
                    }
                }
                (queued, dropped)
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .fold((0, 0), |(q, d), (q2, d2)| (q + q2, d + d2))
}

#[test]
fn eight_producers_ten_thousand_events() {
    let sink = CheckingSink::default();
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(4096)
        .with_flush_interval(Duration::from_micros(100))
        .with_max_batch(64)
        .build(sink.clone())
        .unwrap();

    let (queued, dropped) = run_producers(8, 1250, &emitter);
    assert_eq!(queued + dropped, 10_000);

    let report = flusher.shutdown().unwrap();
    let m = emitter.metrics();

    println!("metrics: {m:?}\nreport: {report:?}");
    assert_eq!(sink.corrupt.load(Ordering::Relaxed), 0);
    assert_eq!(m.queued, queued);
    assert!(m.dropped <= 10_000);
    assert_eq!(m.sent + m.dropped, 10_000);

    // Each producer's surviving events arrive in its emit order.
    let seen = sink.seen.lock();
    let delivered: usize = seen.values().map(Vec::len).sum();
    assert_eq!(delivered as u64, m.sent);
    for nonces in seen.values() {
        assert!(nonces.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn tiny_ring_under_contention_keeps_accounting() {
    let sink = CheckingSink::default();
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(8)
        .with_max_batch(4)
        .with_max_record_size(256)
        .with_pool_items(8, 16)
        .with_slab_items(4)
        .build(sink.clone())
        .unwrap();

    let (queued, dropped) = run_producers(8, 2_000, &emitter);
    let report = flusher.shutdown().unwrap();
    let m = emitter.metrics();

    assert_eq!(sink.corrupt.load(Ordering::Relaxed), 0);
    assert_eq!(queued + dropped, 16_000);
    assert_eq!(m.accounted(), 16_000);
    assert_eq!(report.flushed, m.sent);
}
