// src/Ring/consumer.rs

use crate::config::EmitterConfig;
use crate::error::{EmitError, SinkError};
use crate::metrics::EmitterCounters;
use crate::sink::Sink;
use crate::Ring::Buffer::{RingBuffer, RingReader};
use crossbeam_utils::Backoff;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const FLUSHER_THREAD_NAME: &str = "share-emit-flusher";

/// What the flusher did over its lifetime, returned by [`FlusherHandle::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Drain cycles that handed at least one record to the sink.
    pub cycles: u64,
    /// Records the sink accepted.
    pub flushed: u64,
    /// Records dropped after the retry budget ran out.
    pub failed: u64,
    /// Records flushed after shutdown was requested.
    pub flushed_at_shutdown: u64,
    /// Records still in the ring when the grace window closed.
    pub abandoned: u64,
    /// Of `abandoned`, slots whose producer had not finished writing.
    pub abandoned_writing: u64,
}

/// Sink call policy copied out of the config.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    timeout: Duration,
    limit: u32,
    backoff: Duration,
    backoff_max: Duration,
}

/// Stop request shared by the handle and the flusher thread. The grace
/// deadline is fixed when stop is requested, so retries of a batch that
/// was in flight end at the same deadline as the final drain.
#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    deadline: OnceLock<Instant>,
}

impl StopSignal {
    fn request(&self, grace: Duration) {
        let _ = self.deadline.set(Instant::now() + grace);
        self.requested.store(true, Ordering::Release);
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline.get().copied()
    }
}

/// The single consumer of the ring. Runs on its own thread.
pub(crate) struct Flusher<S: Sink> {
    reader: RingReader,
    sink: S,
    counters: Arc<EmitterCounters>,
    stop: Arc<StopSignal>,
    max_batch: usize,
    flush_interval: Duration,
    grace: Duration,
    policy: RetryPolicy,
    report: FlushReport,
}

impl<S: Sink + 'static> Flusher<S> {
    pub(crate) fn new(
        reader: RingReader,
        sink: S,
        counters: Arc<EmitterCounters>,
        config: &EmitterConfig,
    ) -> Self {
        Self {
            reader,
            sink,
            counters,
            stop: Arc::new(StopSignal::default()),
            max_batch: config.max_batch,
            flush_interval: config.flush_interval,
            grace: config.shutdown_grace,
            policy: RetryPolicy {
                timeout: config.sink_timeout,
                limit: config.sink_retry_limit,
                backoff: config.retry_backoff,
                backoff_max: config.retry_backoff_max,
            },
            report: FlushReport::default(),
        }
    }

    /// Start the flusher thread.
    pub(crate) fn spawn(self) -> Result<FlusherHandle, EmitError> {
        let stop = self.stop.clone();
        let ring = self.reader.ring().clone();
        let grace = self.grace;
        let thread = thread::Builder::new()
            .name(FLUSHER_THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(EmitError::Spawn)?;
        Ok(FlusherHandle {
            stop,
            ring,
            grace,
            thread: Some(thread),
        })
    }

    fn run(mut self) -> FlushReport {
        info!(
            sink = self.sink.name(),
            capacity = self.reader.ring().capacity(),
            max_batch = self.max_batch,
            interval = ?self.flush_interval,
            "flusher started"
        );

        while !self.stop.is_requested() {
            let n = self.flush_once();
            if n < self.max_batch {
                self.reader.park(self.flush_interval);
            }
        }

        self.finish()
    }

    /// Drain one batch and hand it to the sink. Returns the batch size.
    fn flush_once(&mut self) -> usize {
        let drain = self.reader.drain(self.max_batch);
        if drain.is_empty() {
            return 0;
        }
        let n = drain.len();
        let records: Vec<&[u8]> = drain.records().collect();
        let result = deliver(
            &mut self.sink,
            &records,
            self.policy,
            &self.counters,
            &self.stop,
        );
        drop(records);
        drain.commit();

        self.report.cycles += 1;
        match result {
            Ok(()) => {
                self.counters.record_batch_sent(n as u64);
                self.report.flushed += n as u64;
            }
            Err(err) => {
                self.counters.record_sink_failure(n as u64);
                self.report.failed += n as u64;
                warn!(
                    sink = self.sink.name(),
                    records = n,
                    error = %err,
                    "dropping batch after sink retries"
                );
            }
        }
        n
    }

    /// Seal the ring, flush what is left within the grace window, and
    /// account for anything that did not make it.
    fn finish(mut self) -> FlushReport {
        let end = self.reader.seal();
        let deadline = match self.stop.deadline() {
            Some(deadline) => deadline,
            None => Instant::now() + self.grace,
        };
        let before = self.report.flushed;
        let backoff = Backoff::new();

        while self.reader.head() < end && Instant::now() < deadline {
            if self.flush_once() > 0 {
                backoff.reset();
            } else {
                // The slot at the read cursor is still being written.
                backoff.snooze();
            }
        }

        let (ready, writing) = self.reader.abandon_until(end);
        self.report.flushed_at_shutdown = self.report.flushed - before;
        self.report.abandoned = ready + writing;
        self.report.abandoned_writing = writing;

        if self.report.abandoned > 0 {
            warn!(
                ready,
                writing,
                grace = ?self.grace,
                "shutdown grace elapsed with events still in the ring"
            );
        }
        let totals = self.counters.snapshot();
        info!(
            flushed = self.report.flushed,
            failed = self.report.failed,
            abandoned = self.report.abandoned,
            sent = totals.sent,
            dropped = totals.dropped,
            "flusher stopped"
        );
        self.report
    }
}

/// One sink call plus bounded retries with exponential backoff.
///
/// Each call gets `policy.timeout`, cut down to what is left of the grace
/// window once stop is requested. A call that returns `Ok` after its
/// timeout has passed still counts as a timeout, and a panicking sink
/// fails the batch without retries.
fn deliver<S: Sink>(
    sink: &mut S,
    records: &[&[u8]],
    policy: RetryPolicy,
    counters: &EmitterCounters,
    stop: &StopSignal,
) -> Result<(), SinkError> {
    let mut backoff = policy.backoff;
    let mut attempt = 0u32;
    loop {
        let timeout = match stop.deadline() {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(SinkError::Timeout(left));
                }
                policy.timeout.min(left)
            }
            None => policy.timeout,
        };

        let started = Instant::now();
        let err = match panic::catch_unwind(AssertUnwindSafe(|| {
            sink.write_batch(records, timeout)
        })) {
            Ok(Ok(())) if started.elapsed() <= timeout => return Ok(()),
            Ok(Ok(())) => SinkError::Timeout(timeout),
            Ok(Err(err)) => err,
            Err(payload) => return Err(SinkError::Panicked(panic_message(payload.as_ref()))),
        };
        if attempt >= policy.limit {
            return Err(err);
        }
        if let Some(deadline) = stop.deadline() {
            if Instant::now() + backoff >= deadline {
                return Err(err);
            }
        }

        attempt += 1;
        counters.record_sink_retry();
        debug!(
            sink = sink.name(),
            attempt,
            backoff = ?backoff,
            error = %err,
            "sink write failed, retrying"
        );
        thread::sleep(backoff);
        backoff = backoff.saturating_mul(2).min(policy.backoff_max);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Cancellation token and join point for the flusher thread.
///
/// Dropping the handle without calling [`FlusherHandle::shutdown`] still
/// stops and joins the thread, discarding the report.
pub struct FlusherHandle {
    stop: Arc<StopSignal>,
    ring: Arc<RingBuffer>,
    grace: Duration,
    thread: Option<JoinHandle<FlushReport>>,
}

impl FlusherHandle {
    /// Stop the flusher and wait for it. Every event emitted before this
    /// call is either sent or counted dropped once it returns.
    pub fn shutdown(mut self) -> Result<FlushReport, EmitError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<FlushReport, EmitError> {
        self.stop.request(self.grace);
        self.ring.wake_consumer();
        let Some(thread) = self.thread.take() else {
            return Ok(FlushReport::default());
        };
        thread.join().map_err(|_| {
            // The reader went down with the thread; count what it left.
            let (ready, writing) = self.ring.abandon_orphaned();
            error!(ready, writing, "flusher thread panicked");
            EmitError::FlusherPanicked
        })
    }

    /// Whether the flusher thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(err) = self.stop_and_join() {
                warn!(error = %err, "flusher exited abnormally");
            }
        }
    }
}
