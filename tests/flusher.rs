use share_emit::Ring::Structs::Event_Structs::split_records;
use share_emit::Ring::Structs::DecodedEvent;
use share_emit::{
    EmitError, EmitOutcome, EmitterBuilder, Event, EventKind, Field, FieldValue, MemorySink,
    Sink, SinkError, WriterSink,
};
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

fn share(conn: u64, nonce: u64, f: impl FnOnce(&Event<'_>)) {
    let fields = [Field::new("nonce", FieldValue::U64(nonce))];
    let ev = Event::new(EventKind::ShareAccepted, conn, "rig").with_fields(&fields);
    f(&ev)
}

fn nonce_of(rec: &[u8]) -> u64 {
    match DecodedEvent::decode(rec).unwrap().field("nonce") {
        Some(share_emit::Ring::Structs::OwnedValue::U64(n)) => *n,
        other => panic!("unexpected nonce field {other:?}"),
    }
}

#[test]
fn batches_never_exceed_max_batch() {
    let sink = MemorySink::new();
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(1024)
        .with_max_batch(16)
        .with_pool_items(1024, 1024)
        .build(sink.clone())
        .unwrap();

    for nonce in 0..1000 {
        share(1, nonce, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Queued));
    }
    let report = flusher.shutdown().unwrap();

    let sizes = sink.batch_sizes();
    assert!(!sizes.is_empty());
    assert!(sizes.iter().all(|&n| n > 0 && n <= 16), "batch sizes {sizes:?}");
    assert_eq!(sizes.iter().sum::<usize>(), 1000);
    assert_eq!(report.flushed, 1000);
    assert_eq!(report.cycles as usize, sizes.len());

    let m = emitter.metrics();
    assert_eq!(m.sent, 1000);
    assert_eq!(m.batches as usize, sizes.len());

    // Single producer: records arrive in emit order.
    let nonces: Vec<u64> = sink.records().iter().map(|r| nonce_of(r)).collect();
    assert_eq!(nonces, (0..1000).collect::<Vec<_>>());
}

#[test]
fn ready_events_flushed_at_shutdown() {
    let sink = MemorySink::new();
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(256)
        .with_max_batch(200)
        // Nothing drains on its own before shutdown.
        .with_flush_interval(Duration::from_secs(60))
        .with_shutdown_grace(Duration::from_secs(2))
        .with_pool_items(256, 256)
        .build(sink.clone())
        .unwrap();
    thread::sleep(Duration::from_millis(20));

    let k = 150;
    for nonce in 0..k {
        share(2, nonce, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Queued));
    }
    assert_eq!(sink.record_count(), 0);

    let start = Instant::now();
    let report = flusher.shutdown().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(report.flushed_at_shutdown, k);
    assert_eq!(report.abandoned, 0);
    assert_eq!(sink.record_count() as u64, k);

    let m = emitter.metrics();
    assert_eq!(m.sent, k);
    assert_eq!(m.dropped, 0);
    assert!(emitter.is_closed());
}

#[test]
fn emits_after_shutdown_are_dropped() {
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(64)
        .with_max_batch(8)
        .with_pool_items(64, 64)
        .build(MemorySink::new())
        .unwrap();
    flusher.shutdown().unwrap();

    share(3, 0, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Dropped));
    let m = emitter.metrics();
    assert_eq!(m.dropped, 1);
    assert_eq!(m.queued, 0);
}

#[test]
fn failing_sink_drops_batches_after_retries() {
    let sink = MemorySink::new();
    sink.fail_next(u32::MAX);
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(64)
        .with_max_batch(8)
        .with_pool_items(64, 64)
        .with_retry(2, Duration::from_micros(50), Duration::from_micros(200))
        .build(sink.clone())
        .unwrap();

    for nonce in 0..40 {
        share(4, nonce, |ev| {
            let _ = emitter.try_emit(ev);
        });
    }
    let report = flusher.shutdown().unwrap();
    let m = emitter.metrics();

    assert_eq!(m.sent, 0);
    assert_eq!(sink.record_count(), 0);
    assert!(m.sink_failures >= 1);
    // Each failed batch was tried once and retried twice.
    assert_eq!(m.sink_retries, m.sink_failures * 2);
    assert_eq!(report.failed + report.abandoned + (40 - m.queued), m.dropped);
    assert_eq!(m.accounted(), 40);
}

#[test]
fn transient_sink_failure_recovers() {
    let sink = MemorySink::new();
    sink.fail_next(2);
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(64)
        .with_max_batch(8)
        .with_pool_items(64, 64)
        .with_retry(3, Duration::from_micros(50), Duration::from_micros(200))
        .build(sink.clone())
        .unwrap();

    for nonce in 0..32 {
        share(5, nonce, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Queued));
    }
    flusher.shutdown().unwrap();

    let m = emitter.metrics();
    assert_eq!(m.sent, 32);
    assert_eq!(m.sink_failures, 0);
    assert_eq!(m.sink_retries, 2);
    assert_eq!(sink.record_count(), 32);
}

#[test]
fn slow_sink_past_grace_abandons_and_accounts() {
    let sink = MemorySink::new();
    sink.set_delay(Duration::from_millis(30));
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(512)
        .with_max_batch(16)
        .with_shutdown_grace(Duration::from_millis(100))
        .with_pool_items(512, 512)
        .build(sink.clone())
        .unwrap();

    let total = 300u64;
    for nonce in 0..total {
        share(6, nonce, |ev| {
            let _ = emitter.try_emit(ev);
        });
    }
    let report = flusher.shutdown().unwrap();
    let m = emitter.metrics();

    assert!(report.abandoned > 0);
    assert_eq!(m.abandoned, report.abandoned);
    // A write that lands just past its timeout is stored but counted failed.
    assert!(m.sent as usize <= sink.record_count());
    assert_eq!(m.accounted(), total);
}

#[test]
fn panicking_sink_drops_batches_and_keeps_accounting() {
    struct Boom;
    impl Sink for Boom {
        fn write_batch(&mut self, _: &[&[u8]], _: Duration) -> Result<(), SinkError> {
            panic!("sink exploded");
        }
    }

    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(64)
        .with_max_batch(4)
        .with_pool_items(64, 64)
        .build(Boom)
        .unwrap();
    for nonce in 0..10 {
        share(7, nonce, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Queued));
    }

    // The flusher survives the panics and shuts down normally.
    let report = flusher.shutdown().unwrap();
    let m = emitter.metrics();
    assert_eq!(m.queued, 10);
    assert_eq!(m.sent, 0);
    assert_eq!(report.failed + report.abandoned, 10);
    assert_eq!(m.accounted(), 10);

    assert!(emitter.is_closed());
    share(7, 10, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Dropped));
    assert_eq!(emitter.metrics().accounted(), 11);
}

#[test]
fn dead_flusher_surfaces_at_join_without_double_counting() {
    /// Accepts everything, then panics when the flusher thread drops it.
    struct LoudDrop(MemorySink);
    impl Sink for LoudDrop {
        fn write_batch(&mut self, records: &[&[u8]], timeout: Duration) -> Result<(), SinkError> {
            self.0.write_batch(records, timeout)
        }
    }
    impl Drop for LoudDrop {
        fn drop(&mut self) {
            panic!("collector handle poisoned");
        }
    }

    let sink = MemorySink::new();
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(64)
        .with_pool_items(64, 64)
        .build(LoudDrop(sink.clone()))
        .unwrap();
    for nonce in 0..5 {
        share(10, nonce, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Queued));
    }

    assert!(matches!(flusher.shutdown(), Err(EmitError::FlusherPanicked)));
    let m = emitter.metrics();
    assert_eq!(m.sent, 5);
    assert_eq!(m.dropped, 0);
    assert_eq!(sink.record_count(), 5);
    assert!(emitter.is_closed());
}

#[test]
fn slow_writer_is_cut_off_by_timeout_and_grace() {
    /// Takes far longer than the sink timeout for every write.
    struct Crawl;
    impl Write for Crawl {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(200));
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let grace = Duration::from_millis(50);
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(64)
        .with_pool_items(64, 64)
        .with_sink_timeout(Duration::from_millis(10))
        .with_retry(3, Duration::from_millis(1), Duration::from_millis(4))
        .with_shutdown_grace(grace)
        .build(WriterSink::new(Crawl))
        .unwrap();

    for nonce in 0..12 {
        share(9, nonce, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Queued));
    }
    let start = Instant::now();
    let report = flusher.shutdown().unwrap();
    let took = start.elapsed();

    // At most one write in flight overruns the grace window.
    assert!(took < Duration::from_secs(1), "shutdown took {took:?}");
    let m = emitter.metrics();
    assert_eq!(m.sent, 0);
    assert!(m.sink_failures >= 1);
    assert_eq!(report.failed + report.abandoned, 12);
    assert_eq!(m.accounted(), 12);
}

#[test]
fn tcp_sink_delivers_length_prefixed_records() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let collector = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        bytes
    });

    let sink = WriterSink::connect_tcp(addr, Duration::from_secs(2)).unwrap();
    let (emitter, flusher) = EmitterBuilder::new()
        .with_ring_capacity(128)
        .with_max_batch(32)
        .with_pool_items(128, 128)
        .build(sink)
        .unwrap();

    for nonce in 0..100 {
        share(8, nonce, |ev| assert_eq!(emitter.try_emit(ev), EmitOutcome::Queued));
    }
    flusher.shutdown().unwrap();

    // The socket closes when the flusher thread drops its sink.
    let bytes = collector.join().unwrap();
    let records = split_records(&bytes).unwrap();
    assert_eq!(records.len(), 100);
    for (i, rec) in records.iter().enumerate() {
        let ev = DecodedEvent::decode(rec).unwrap();
        assert_eq!(ev.connection_id, 8);
        assert_eq!(nonce_of(rec), i as u64);
    }
    assert_eq!(emitter.metrics().sent, 100);
}
