//! Downstream sinks for flushed batches.
//!
//! A sink receives an ordered list of encoded records and performs one bulk
//! write. Retry and drop policy belongs to the flusher; a sink only reports
//! whether the write succeeded.

use std::io::{self, IoSlice, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::SinkError;

/// Bulk-write boundary to the persistence/analytics collaborator.
pub trait Sink: Send {
    /// Write every record in `records`, in order, as one operation.
    ///
    /// `timeout` bounds the call. The flusher counts a call that returns
    /// after it as a timeout, even if the write went through.
    fn write_batch(&mut self, records: &[&[u8]], timeout: Duration) -> Result<(), SinkError>;

    /// Short label used in logs.
    fn name(&self) -> &str {
        "sink"
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write_batch(&mut self, records: &[&[u8]], timeout: Duration) -> Result<(), SinkError> {
        (**self).write_batch(records, timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Writes each batch as back-to-back records in one bulk write, then
/// flushes.
///
/// Records already start with their own length, so the byte stream can be
/// split again with `split_records`. Plain writers get the batch copied
/// into a reused buffer and written with one `write` call; writers with
/// real scatter/gather support (see [`WriterSink::with_vectored`]) get one
/// `write_vectored` call instead. The timeout is checked between calls, so
/// a writer that keeps making slow progress fails with
/// `SinkError::Timeout`.
pub struct WriterSink<W: Write + Send> {
    writer: W,
    name: String,
    vectored: bool,
    scratch: Vec<u8>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            name: "writer".to_string(),
            vectored: false,
            scratch: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Hand batches to `write_vectored` without copying. Only worth it
    /// when the writer overrides `write_vectored`; the default impl
    /// writes a single slice per call.
    pub fn with_vectored(mut self, vectored: bool) -> Self {
        self.vectored = vectored;
        self
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl WriterSink<TcpStream> {
    /// Connect to a TCP collector. The socket write timeout bounds each
    /// blocking write, so a stalled peer surfaces as `SinkError::Timeout`.
    pub fn connect_tcp<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(timeout))?;
        let name = match stream.peer_addr() {
            Ok(peer) => format!("tcp://{peer}"),
            Err(_) => "tcp".to_string(),
        };
        Ok(Self::new(stream).with_name(name).with_vectored(true))
    }
}

fn check_elapsed(started: Instant, timeout: Duration) -> io::Result<()> {
    if started.elapsed() > timeout {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "batch write exceeded sink timeout",
        ));
    }
    Ok(())
}

fn write_zero() -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, "failed to write whole batch")
}

/// `write_all` that gives up once `timeout` has passed since `started`.
fn write_all_timed<W: Write>(
    writer: &mut W,
    mut buf: &[u8],
    started: Instant,
    timeout: Duration,
) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(write_zero()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        check_elapsed(started, timeout)?;
    }
    Ok(())
}

/// `write_all` for a scatter/gather list, with the same timeout check.
fn write_all_vectored_timed<W: Write>(
    writer: &mut W,
    mut bufs: &mut [IoSlice<'_>],
    started: Instant,
    timeout: Duration,
) -> io::Result<()> {
    while !bufs.is_empty() {
        match writer.write_vectored(bufs) {
            Ok(0) => return Err(write_zero()),
            Ok(n) => IoSlice::advance_slices(&mut bufs, n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        check_elapsed(started, timeout)?;
    }
    Ok(())
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn write_batch(&mut self, records: &[&[u8]], timeout: Duration) -> Result<(), SinkError> {
        let started = Instant::now();
        let written = if self.vectored {
            let mut slices: Vec<IoSlice<'_>> = records.iter().map(|r| IoSlice::new(r)).collect();
            write_all_vectored_timed(&mut self.writer, &mut slices, started, timeout)
        } else {
            self.scratch.clear();
            for rec in records {
                self.scratch.extend_from_slice(rec);
            }
            write_all_timed(&mut self.writer, &self.scratch, started, timeout)
        };
        written
            .and_then(|_| self.writer.flush())
            .and_then(|_| check_elapsed(started, timeout))
            .map_err(|e| SinkError::from_io(e, timeout))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct MemoryInner {
    batches: Mutex<Vec<Vec<Vec<u8>>>>,
    fail_next: AtomicU32,
    delay: Mutex<Duration>,
}

/// Keeps every batch in memory. Cloned handles share the same storage, so
/// a test can hand one clone to the flusher and inspect the other.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<MemoryInner>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` writes.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Sleep this long inside every write.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = delay;
    }

    /// Batch sizes in write order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.batches.lock().iter().map(Vec::len).collect()
    }

    /// All accepted records, flattened in write order.
    pub fn records(&self) -> Vec<Vec<u8>> {
        self.inner.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.inner.batches.lock().iter().map(Vec::len).sum()
    }
}

impl Sink for MemorySink {
    fn write_batch(&mut self, records: &[&[u8]], timeout: Duration) -> Result<(), SinkError> {
        let delay = *self.inner.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay.min(timeout));
            if delay > timeout {
                return Err(SinkError::Timeout(timeout));
            }
        }

        let failed = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SinkError::Rejected("injected failure".to_string()));
        }

        let batch = records.iter().map(|r| r.to_vec()).collect();
        self.inner.batches.lock().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
